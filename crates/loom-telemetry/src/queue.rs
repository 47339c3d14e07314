// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded delivery queue with retry, backoff and offline buffering.
//!
//! Items are delivered oldest first by a single drainer. A transient failure
//! puts the item back at its original position with a backoff deadline;
//! newer items that are ready are sent in the meantime. Nothing here ever
//! returns an error to the application: data loss is logged and reported to
//! the error callback.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use loom_telemetry_core::{Clock, EventId, TelemetryEvent};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::{OverflowPolicy, RetryPolicy, TelemetryConfig};
use crate::store::QueueStore;

/// How long a blocking persist waits for an in-progress write to finish.
const PERSIST_LOCK_WAIT: Duration = Duration::from_secs(1);

/// A serialized event handed to a [`Sender`].
#[derive(Debug, Clone)]
pub struct Envelope {
	pub event_id: EventId,
	/// 1 for the first attempt.
	pub attempt: u32,
	/// JSON body of the event.
	pub body: Bytes,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
	Delivered,
	/// Worth retrying later (network error, 5xx, rate limiting).
	Transient(String),
	/// Will never succeed (rejected payload, bad credentials).
	Permanent(String),
}

/// Delivers envelopes to the collector.
#[async_trait::async_trait]
pub trait Sender: Send + Sync {
	async fn send(&self, envelope: &Envelope) -> SendOutcome;

	/// Whether the collector looks reachable.
	async fn is_online(&self) -> bool {
		true
	}
}

/// An event waiting for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
	pub event: TelemetryEvent,
	pub enqueued_at: DateTime<Utc>,
	/// Failed attempts so far.
	pub attempts: u32,
	pub next_attempt_at: DateTime<Utc>,
	/// Enqueue order. Reassigned when loaded from disk.
	#[serde(skip)]
	pub seq: u64,
}

impl QueueItem {
	pub fn new(event: TelemetryEvent, now: DateTime<Utc>, seq: u64) -> Self {
		Self {
			event,
			enqueued_at: now,
			attempts: 0,
			next_attempt_at: now,
			seq,
		}
	}

	fn age(&self, now: DateTime<Utc>) -> Duration {
		(now - self.enqueued_at).to_std().unwrap_or(Duration::ZERO)
	}
}

/// Why an event was given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
	/// The sender reported a permanent failure.
	Permanent(String),
	/// The item used up its attempts.
	RetriesExhausted,
	/// The item was queued longer than the maximum age.
	Expired,
	/// The queue was full and the item was the oldest.
	Evicted,
	/// The queue was full (or closed) and the new item was refused.
	Rejected,
}

/// Reported to the error callback whenever an event is lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
	pub event_id: EventId,
	pub attempts: u32,
	pub reason: DropReason,
}

pub type ErrorCallback = Arc<dyn Fn(&DeliveryFailure) + Send + Sync>;

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
	pub enqueued: u64,
	pub sent: u64,
	pub retried: u64,
	pub dropped: u64,
}

#[derive(Default)]
struct StatCounters {
	enqueued: AtomicU64,
	sent: AtomicU64,
	retried: AtomicU64,
	dropped: AtomicU64,
}

/// What a single [`DeliveryQueue::drain_once`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStep {
	/// Nothing buffered.
	Idle,
	/// Everything buffered is backing off; the earliest is ready after this long.
	Waiting(Duration),
	/// The sender is unreachable.
	Offline,
	Sent(EventId),
	Retrying {
		event_id: EventId,
		attempts: u32,
		delay: Duration,
	},
	Dropped(EventId),
}

/// Queue tuning, usually derived from [`TelemetryConfig`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
	pub capacity: usize,
	pub overflow: OverflowPolicy,
	pub retry: RetryPolicy,
	pub offline_poll_interval: Duration,
	/// Persist items here when set.
	pub store: Option<QueueStore>,
	pub debug: bool,
}

impl Default for QueueOptions {
	fn default() -> Self {
		Self::from_config(&TelemetryConfig::default().with_offline_queue(false))
	}
}

impl QueueOptions {
	pub fn from_config(config: &TelemetryConfig) -> Self {
		Self {
			capacity: config.max_offline_queue_size.max(1),
			overflow: config.overflow_policy,
			retry: config.retry.clone(),
			offline_poll_interval: config.offline_poll_interval,
			store: config.resolved_queue_path().map(QueueStore::new),
			debug: config.debug,
		}
	}
}

struct QueueState {
	/// Ordered by `seq`.
	items: VecDeque<QueueItem>,
	in_flight: Option<QueueItem>,
	next_seq: u64,
	/// Changed since last persisted.
	dirty: bool,
	online: bool,
}

impl QueueState {
	fn len(&self) -> usize {
		self.items.len() + usize::from(self.in_flight.is_some())
	}

	fn reinsert(&mut self, item: QueueItem) {
		let position = self.items.partition_point(|other| other.seq < item.seq);
		self.items.insert(position, item);
		self.dirty = true;
	}
}

/// The delivery queue and its drain logic.
pub struct DeliveryQueue {
	sender: Arc<dyn Sender>,
	clock: Arc<dyn Clock>,
	options: QueueOptions,
	on_error: Option<ErrorCallback>,
	state: Mutex<QueueState>,
	/// Signalled when the queue becomes empty.
	drained: Condvar,
	pending: watch::Sender<usize>,
	/// Something was enqueued.
	wake: Notify,
	/// Flush or shutdown wants the drainer to look again now.
	kick: Notify,
	send_lock: tokio::sync::Mutex<()>,
	persist_lock: tokio::sync::Mutex<()>,
	running: AtomicBool,
	shutdown: AtomicBool,
	stats: StatCounters,
}

impl DeliveryQueue {
	/// Creates a queue, loading any items persisted by a previous instance.
	pub fn new(
		sender: Arc<dyn Sender>,
		clock: Arc<dyn Clock>,
		options: QueueOptions,
		on_error: Option<ErrorCallback>,
	) -> Self {
		let now = clock.now();
		let mut items: VecDeque<QueueItem> = options
			.store
			.as_ref()
			.map(|store| store.load_or_empty())
			.unwrap_or_default()
			.into();

		if items.len() > options.capacity {
			let excess = items.len() - options.capacity;
			warn!(excess, capacity = options.capacity, "persisted queue exceeds capacity, dropping oldest");
			items.drain(..excess);
		}

		let mut next_seq = 0;
		for item in items.iter_mut() {
			item.seq = next_seq;
			item.next_attempt_at = now;
			next_seq += 1;
		}
		if !items.is_empty() {
			info!(count = items.len(), "restored persisted telemetry events");
		}

		let (pending, _) = watch::channel(items.len());
		Self {
			sender,
			clock,
			options,
			on_error,
			state: Mutex::new(QueueState {
				items,
				in_flight: None,
				next_seq,
				dirty: false,
				online: true,
			}),
			drained: Condvar::new(),
			pending,
			wake: Notify::new(),
			kick: Notify::new(),
			send_lock: tokio::sync::Mutex::new(()),
			persist_lock: tokio::sync::Mutex::new(()),
			running: AtomicBool::new(false),
			shutdown: AtomicBool::new(false),
			stats: StatCounters::default(),
		}
	}

	/// Buffered items, including one in flight.
	pub fn len(&self) -> usize {
		self.state.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn is_online(&self) -> bool {
		self.state.lock().online
	}

	pub fn is_shutdown(&self) -> bool {
		self.shutdown.load(Ordering::SeqCst)
	}

	pub fn capacity(&self) -> usize {
		self.options.capacity
	}

	pub fn stats(&self) -> QueueStats {
		QueueStats {
			enqueued: self.stats.enqueued.load(Ordering::Relaxed),
			sent: self.stats.sent.load(Ordering::Relaxed),
			retried: self.stats.retried.load(Ordering::Relaxed),
			dropped: self.stats.dropped.load(Ordering::Relaxed),
		}
	}

	/// Buffers an event without blocking. Returns whether it was accepted.
	pub fn enqueue(&self, event: TelemetryEvent) -> bool {
		let event_id = event.event_id;
		if self.is_shutdown() {
			warn!(event_id = %event_id, "telemetry queue is shut down, dropping event");
			self.report(DeliveryFailure {
				event_id,
				attempts: 0,
				reason: DropReason::Rejected,
			});
			return false;
		}

		let now = self.clock.now();
		let mut lost = None;
		let (accepted, count) = {
			let mut state = self.state.lock();
			let mut accepted = true;

			if state.len() >= self.options.capacity {
				match self.options.overflow {
					OverflowPolicy::DropOldest => match state.items.pop_front() {
						Some(oldest) => {
							lost = Some(DeliveryFailure {
								event_id: oldest.event.event_id,
								attempts: oldest.attempts,
								reason: DropReason::Evicted,
							});
						}
						None => accepted = false,
					},
					OverflowPolicy::RejectNew => accepted = false,
				}
				if !accepted {
					lost = Some(DeliveryFailure {
						event_id,
						attempts: 0,
						reason: DropReason::Rejected,
					});
				}
			}

			if accepted {
				let seq = state.next_seq;
				state.next_seq += 1;
				state.items.push_back(QueueItem::new(event, now, seq));
				state.dirty = true;
			}
			(accepted, state.len())
		};

		if let Some(failure) = lost {
			warn!(
				event_id = %failure.event_id,
				reason = ?failure.reason,
				capacity = self.options.capacity,
				"telemetry queue full, dropping event"
			);
			self.report(failure);
		}

		if accepted {
			self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
			if self.options.debug {
				debug!(event_id = %event_id, pending = count, "event queued");
			}
			self.publish(count);
			self.wake.notify_one();
		}
		accepted
	}

	/// Like [`enqueue`](Self::enqueue), but waits up to `wait` for room first.
	pub async fn enqueue_with_backpressure(&self, event: TelemetryEvent, wait: Duration) -> bool {
		let capacity = self.options.capacity;
		if self.len() >= capacity && !wait.is_zero() && !self.is_shutdown() {
			let mut pending = self.pending.subscribe();
			let _ = tokio::time::timeout(wait, pending.wait_for(|&n| n < capacity)).await;
		}
		self.enqueue(event)
	}

	/// Makes every backed-off item ready now.
	pub fn expedite(&self) {
		let now = self.clock.now();
		let mut state = self.state.lock();
		for item in state.items.iter_mut() {
			if item.next_attempt_at > now {
				item.next_attempt_at = now;
			}
		}
	}

	/// Performs at most one delivery attempt.
	pub async fn drain_once(&self) -> DrainStep {
		let _send = self.send_lock.lock().await;
		let now = self.clock.now();

		self.expire(now);

		if !self.is_online() {
			if !self.sender.is_online().await {
				return DrainStep::Offline;
			}
			self.state.lock().online = true;
			info!("telemetry collector reachable again, resuming delivery");
		}

		let item = {
			let mut state = self.state.lock();
			let ready = state.items.iter().position(|item| item.next_attempt_at <= now);
			match ready {
				Some(index) => {
					let item = state.items.remove(index);
					state.in_flight = item.clone();
					item
				}
				None => {
					return match state.items.iter().map(|i| i.next_attempt_at).min() {
						Some(next) => DrainStep::Waiting((next - now).to_std().unwrap_or(Duration::ZERO)),
						None => DrainStep::Idle,
					};
				}
			}
		};
		let Some(mut item) = item else {
			return DrainStep::Idle;
		};
		let mut in_flight = InFlight::new(self);

		let event_id = item.event.event_id;
		let attempt = item.attempts + 1;
		let body = match serde_json::to_vec(&item.event) {
			Ok(body) => Bytes::from(body),
			Err(e) => {
				in_flight.retire();
				error!(event_id = %event_id, error = %e, "failed to serialize event, dropping it");
				self.report(DeliveryFailure {
					event_id,
					attempts: item.attempts,
					reason: DropReason::Permanent(e.to_string()),
				});
				self.publish_len();
				return DrainStep::Dropped(event_id);
			}
		};

		let envelope = Envelope {
			event_id,
			attempt,
			body,
		};
		let outcome = self.sender.send(&envelope).await;
		item.attempts = attempt;

		match outcome {
			SendOutcome::Delivered => {
				in_flight.retire();
				self.stats.sent.fetch_add(1, Ordering::Relaxed);
				if self.options.debug {
					debug!(event_id = %event_id, attempts = attempt, "event delivered");
				}
				self.publish_len();
				DrainStep::Sent(event_id)
			}
			SendOutcome::Permanent(reason) => {
				in_flight.retire();
				error!(event_id = %event_id, attempts = attempt, reason = %reason, "event permanently rejected");
				self.report(DeliveryFailure {
					event_id,
					attempts: attempt,
					reason: DropReason::Permanent(reason),
				});
				self.publish_len();
				DrainStep::Dropped(event_id)
			}
			SendOutcome::Transient(reason) => {
				let now = self.clock.now();
				let give_up = if attempt >= self.options.retry.max_attempts {
					Some(DropReason::RetriesExhausted)
				} else if item.age(now) >= self.options.retry.max_age {
					Some(DropReason::Expired)
				} else {
					None
				};

				if let Some(reason_dropped) = give_up {
					in_flight.retire();
					warn!(
						event_id = %event_id,
						attempts = attempt,
						reason = %reason,
						"giving up on event after transient failures"
					);
					self.report(DeliveryFailure {
						event_id,
						attempts: attempt,
						reason: reason_dropped,
					});
					self.publish_len();
					return DrainStep::Dropped(event_id);
				}

				let delay = self.options.retry.delay_for(attempt);
				item.next_attempt_at = now
					+ chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
				in_flight.requeue(item);
				self.stats.retried.fetch_add(1, Ordering::Relaxed);
				debug!(
					event_id = %event_id,
					attempts = attempt,
					delay_ms = delay.as_millis() as u64,
					reason = %reason,
					"delivery failed, will retry"
				);

				if !self.sender.is_online().await {
					self.state.lock().online = false;
					warn!("telemetry collector unreachable, buffering events");
				}

				DrainStep::Retrying {
					event_id,
					attempts: attempt,
					delay,
				}
			}
		}
	}

	fn expire(&self, now: DateTime<Utc>) {
		let max_age = self.options.retry.max_age;
		let expired: VecDeque<QueueItem> = {
			let mut state = self.state.lock();
			let (keep, expired): (VecDeque<_>, VecDeque<_>) = state
				.items
				.drain(..)
				.partition(|item| item.age(now) < max_age);
			state.items = keep;
			if !expired.is_empty() {
				state.dirty = true;
			}
			expired
		};

		if expired.is_empty() {
			return;
		}
		for item in expired {
			warn!(event_id = %item.event.event_id, attempts = item.attempts, "event expired before delivery");
			self.report(DeliveryFailure {
				event_id: item.event.event_id,
				attempts: item.attempts,
				reason: DropReason::Expired,
			});
		}
		self.publish_len();
	}

	/// Background delivery loop. Only one may run per queue.
	pub async fn run(self: Arc<Self>) {
		if self.running.swap(true, Ordering::SeqCst) {
			warn!("telemetry drainer already running, not starting another");
			return;
		}
		info!(capacity = self.options.capacity, "telemetry drainer started");

		while !self.is_shutdown() {
			let step = self.drain_once().await;
			self.persist().await;

			match step {
				DrainStep::Sent(_) | DrainStep::Retrying { .. } | DrainStep::Dropped(_) => {}
				DrainStep::Idle => {
					tokio::select! {
						_ = self.wake.notified() => {}
						_ = self.kick.notified() => {}
					}
				}
				DrainStep::Waiting(delay) => {
					tokio::select! {
						_ = tokio::time::sleep(delay) => {}
						_ = self.wake.notified() => {}
						_ = self.kick.notified() => {}
					}
				}
				DrainStep::Offline => self.wait_offline().await,
			}
		}

		self.persist().await;
		self.running.store(false, Ordering::SeqCst);
		info!(pending = self.len(), "telemetry drainer stopped");
	}

	/// Waits out one offline poll interval. Events enqueued meanwhile are
	/// persisted as they arrive; the collector is not checked again until the
	/// interval ends or a flush asks for it.
	async fn wait_offline(&self) {
		let deadline = tokio::time::Instant::now() + self.options.offline_poll_interval;
		loop {
			tokio::select! {
				_ = tokio::time::sleep_until(deadline) => return,
				_ = self.kick.notified() => return,
				_ = self.wake.notified() => {
					if self.is_shutdown() {
						return;
					}
					self.persist().await;
				}
			}
		}
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	/// Waits until the queue is empty or `timeout` elapses.
	///
	/// Backed-off items are made ready first. Without a running drainer the
	/// caller drives delivery itself. Items left on timeout stay buffered.
	pub async fn flush(&self, timeout: Duration) -> bool {
		self.expedite();
		self.kick.notify_one();

		if self.is_running() {
			let mut pending = self.pending.subscribe();
			let _ = tokio::time::timeout(timeout, pending.wait_for(|&n| n == 0)).await;
		} else {
			let drive = async {
				loop {
					match self.drain_once().await {
						DrainStep::Idle => break,
						DrainStep::Waiting(delay) => tokio::time::sleep(delay).await,
						DrainStep::Offline => {
							tokio::time::sleep(self.options.offline_poll_interval).await
						}
						_ => {}
					}
				}
			};
			let _ = tokio::time::timeout(timeout, drive).await;
			self.persist().await;
		}

		let drained = self.is_empty();
		if !drained {
			warn!(pending = self.len(), "flush timed out with events still buffered");
		}
		drained
	}

	/// Blocking form of [`flush`](Self::flush) for code outside async
	/// contexts. Delivery happens on the drainer, so without one running on
	/// another thread this simply waits out the timeout.
	pub fn flush_blocking(&self, timeout: Duration) -> bool {
		self.expedite();
		self.kick.notify_one();

		let deadline = std::time::Instant::now() + timeout;
		let mut state = self.state.lock();
		while state.len() > 0 {
			if self.drained.wait_until(&mut state, deadline).timed_out() {
				break;
			}
		}
		state.len() == 0
	}

	/// Stops accepting events and tells the drainer to stop.
	pub fn shutdown(&self) {
		if !self.shutdown.swap(true, Ordering::SeqCst) {
			debug!("telemetry queue shutting down");
		}
		self.kick.notify_one();
		self.wake.notify_one();
	}

	/// Shuts down and persists whatever is still buffered.
	pub async fn close(&self) {
		self.shutdown();
		self.persist().await;
	}

	/// Writes buffered items to disk if anything changed.
	pub async fn persist(&self) {
		let Some(store) = &self.options.store else {
			return;
		};
		let _persist = self.persist_lock.lock().await;
		let Some(items) = self.take_dirty() else {
			return;
		};

		if let Err(e) = store.save(&items).await {
			warn!(path = %store.path().display(), error = %e, "failed to persist telemetry queue");
			self.state.lock().dirty = true;
		}
	}

	/// Blocking form of [`persist`](Self::persist) for shutdown outside async
	/// contexts.
	pub fn persist_blocking(&self) {
		let Some(store) = &self.options.store else {
			return;
		};
		let deadline = std::time::Instant::now() + PERSIST_LOCK_WAIT;
		let _persist = loop {
			match self.persist_lock.try_lock() {
				Ok(guard) => break guard,
				Err(_) if std::time::Instant::now() < deadline => {
					std::thread::sleep(Duration::from_millis(5));
				}
				Err(_) => {
					warn!(path = %store.path().display(), "telemetry queue busy persisting, skipping final write");
					return;
				}
			}
		};
		let Some(items) = self.take_dirty() else {
			return;
		};

		if let Err(e) = store.save_blocking(&items) {
			warn!(path = %store.path().display(), error = %e, "failed to persist telemetry queue");
			self.state.lock().dirty = true;
		}
	}

	/// Buffered items in enqueue order, if anything changed since the last write.
	fn take_dirty(&self) -> Option<Vec<QueueItem>> {
		let mut state = self.state.lock();
		if !state.dirty {
			return None;
		}
		state.dirty = false;
		let mut items: Vec<QueueItem> = state
			.in_flight
			.iter()
			.chain(state.items.iter())
			.cloned()
			.collect();
		items.sort_by_key(|item| item.seq);
		Some(items)
	}

	fn publish_len(&self) {
		let count = self.len();
		self.publish(count);
	}

	fn publish(&self, count: usize) {
		self.pending.send_replace(count);
		if count == 0 {
			self.drained.notify_all();
		}
	}

	fn report(&self, failure: DeliveryFailure) {
		self.stats.dropped.fetch_add(1, Ordering::Relaxed);
		if let Some(callback) = &self.on_error {
			if catch_unwind(AssertUnwindSafe(|| callback(&failure))).is_err() {
				warn!(event_id = %failure.event_id, "telemetry error callback panicked");
			}
		}
	}
}

/// Owns the in-flight slot for one attempt. If the attempt is abandoned
/// (the drain future is dropped mid-send) the item goes back in the queue.
struct InFlight<'a> {
	queue: &'a DeliveryQueue,
	armed: bool,
}

impl<'a> InFlight<'a> {
	fn new(queue: &'a DeliveryQueue) -> Self {
		Self { queue, armed: true }
	}

	fn retire(&mut self) {
		self.armed = false;
		let mut state = self.queue.state.lock();
		state.in_flight = None;
		state.dirty = true;
	}

	fn requeue(&mut self, item: QueueItem) {
		self.armed = false;
		let mut state = self.queue.state.lock();
		state.in_flight = None;
		state.reinsert(item);
	}
}

impl Drop for InFlight<'_> {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		let mut state = self.queue.state.lock();
		if let Some(item) = state.in_flight.take() {
			state.reinsert(item);
		}
	}
}
