// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The telemetry client: capture, context, journeys and delivery lifecycle.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use loom_telemetry_core::{
	Breadcrumb, BreadcrumbCategory, BreadcrumbRing, Clock, EventId, Journey, JourneyId,
	JourneyStatus, SeverityLevel, Step, StepId, StepStatus, SystemClock, TelemetryEvent,
	UserContext,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::builder::{Capture, EventBuilder};
use crate::config::TelemetryConfig;
use crate::context::{ContextEnterGuard, ContextFork, ContextSnapshot, ContextStore};
use crate::error::{Result, TelemetrySdkError};
use crate::filter::EventFilter;
use crate::journey::{JourneyGuard, JourneyTracker, StepGuard};
use crate::queue::{DeliveryFailure, DeliveryQueue, ErrorCallback, QueueOptions, QueueStats, Sender};
use crate::transport::HttpSender;

const DRAINER_THREAD_NAME: &str = "loom-telemetry-drain";

/// Builder for [`TelemetryClient`].
pub struct TelemetryClientBuilder {
	config: TelemetryConfig,
	sender: Option<Arc<dyn Sender>>,
	clock: Option<Arc<dyn Clock>>,
	on_error: Option<ErrorCallback>,
	sampler: Option<Arc<dyn Fn() -> f64 + Send + Sync>>,
	spawn_drainer: bool,
}

impl Default for TelemetryClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl TelemetryClientBuilder {
	pub fn new() -> Self {
		Self {
			config: TelemetryConfig::default(),
			sender: None,
			clock: None,
			on_error: None,
			sampler: None,
			spawn_drainer: true,
		}
	}

	pub fn config(mut self, config: TelemetryConfig) -> Self {
		self.config = config;
		self
	}

	/// Delivers through `sender` instead of the DSN's HTTP collector.
	pub fn sender(mut self, sender: Arc<dyn Sender>) -> Self {
		self.sender = Some(sender);
		self
	}

	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	/// Called whenever an event is lost (rejected, evicted, expired or
	/// permanently refused by the collector).
	pub fn on_error(mut self, callback: impl Fn(&DeliveryFailure) + Send + Sync + 'static) -> Self {
		self.on_error = Some(Arc::new(callback));
		self
	}

	/// Replaces the random source used for sampling.
	pub fn sampler(mut self, sampler: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
		self.sampler = Some(Arc::new(sampler));
		self
	}

	/// Whether to start the background drainer (default true). Without it,
	/// events are only delivered by [`TelemetryClient::flush`].
	pub fn spawn_drainer(mut self, spawn: bool) -> Self {
		self.spawn_drainer = spawn;
		self
	}

	pub fn build(self) -> Result<TelemetryClient> {
		let config = self.config.validated()?;

		let sender: Arc<dyn Sender> = match self.sender {
			Some(sender) => sender,
			None => {
				let dsn = config.dsn.as_ref().ok_or(TelemetrySdkError::MissingDsn)?;
				Arc::new(HttpSender::new(dsn, config.request_timeout)?)
			}
		};
		let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

		let store = ContextStore::new();
		let ring = BreadcrumbRing::new(config.max_breadcrumbs);
		let builder = EventBuilder::new(
			store.clone(),
			ring.clone(),
			Arc::clone(&clock),
			config.environment.clone(),
			config.app_version.clone(),
		);
		let mut filter =
			EventFilter::new(config.sample_rate, config.before_send.clone()).with_debug(config.debug);
		if let Some(sampler) = self.sampler {
			filter = filter.with_sampler(move || sampler());
		}
		let tracker = JourneyTracker::new(store.clone(), Arc::clone(&clock));
		let queue = Arc::new(DeliveryQueue::new(
			sender,
			Arc::clone(&clock),
			QueueOptions::from_config(&config),
			self.on_error,
		));

		let drainer_thread = if self.spawn_drainer {
			start_drainer(&queue)?
		} else {
			None
		};

		info!(
			environment = %config.environment,
			app_version = %config.app_version,
			sample_rate = config.sample_rate,
			offline_queue = config.enable_offline_queue,
			"telemetry client initialized"
		);

		Ok(TelemetryClient {
			inner: Arc::new(ClientInner {
				config,
				store,
				ring,
				builder,
				filter,
				tracker,
				queue,
				clock,
				drainer_thread: Mutex::new(drainer_thread),
				closed: AtomicBool::new(false),
			}),
		})
	}
}

/// Runs the drainer on the caller's tokio runtime, or on a dedicated thread
/// with its own runtime when there is none. Returns the thread, if one was
/// started.
fn start_drainer(queue: &Arc<DeliveryQueue>) -> Result<Option<std::thread::JoinHandle<()>>> {
	let run = Arc::clone(queue).run();
	match tokio::runtime::Handle::try_current() {
		Ok(handle) => {
			handle.spawn(run);
			Ok(None)
		}
		Err(_) => {
			let runtime = tokio::runtime::Builder::new_current_thread()
				.enable_all()
				.build()
				.map_err(|e| TelemetrySdkError::Runtime(e.to_string()))?;
			let thread = std::thread::Builder::new()
				.name(DRAINER_THREAD_NAME.to_string())
				.spawn(move || runtime.block_on(run))?;
			Ok(Some(thread))
		}
	}
}

struct ClientInner {
	config: TelemetryConfig,
	store: ContextStore,
	ring: BreadcrumbRing,
	builder: EventBuilder,
	filter: EventFilter,
	tracker: JourneyTracker,
	queue: Arc<DeliveryQueue>,
	clock: Arc<dyn Clock>,
	/// Set when the drainer runs on its own thread.
	drainer_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
	closed: AtomicBool,
}

/// Captures errors and messages and delivers them in the background.
///
/// Cheap to clone; clones share everything. Capture methods never panic and
/// never return errors: they hand back the event id when the event was
/// queued and `None` when it was sampled out, vetoed, or refused.
///
/// # Example
///
/// ```ignore
/// use loom_telemetry::{TelemetryClient, TelemetryConfig};
///
/// let client = TelemetryClient::builder()
///     .config(TelemetryConfig::new().with_dsn("https://pk_live_abc@telemetry.example.com")?)
///     .build()?;
///
/// client.set_tag("region", "eu-west");
/// let _journey = client.journey("checkout");
/// if let Err(e) = submit_order().await {
///     client.capture_error(&e);
/// }
/// client.shutdown(Duration::from_secs(5)).await;
/// ```
#[derive(Clone)]
pub struct TelemetryClient {
	inner: Arc<ClientInner>,
}

impl std::fmt::Debug for TelemetryClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TelemetryClient")
			.field("environment", &self.inner.config.environment)
			.field("queue_len", &self.queue_len())
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl TelemetryClient {
	pub fn builder() -> TelemetryClientBuilder {
		TelemetryClientBuilder::new()
	}

	pub fn config(&self) -> &TelemetryConfig {
		&self.inner.config
	}

	pub(crate) fn same_client(&self, other: &TelemetryClient) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}

	// Capture

	/// Captures an error and its `source()` chain.
	pub fn capture_error<E>(&self, error: &E) -> Option<EventId>
	where
		E: StdError + 'static,
	{
		self.capture(Capture::from_error(error))
	}

	/// Captures an exception described by type name and message.
	pub fn capture_exception(
		&self,
		exception_type: impl Into<String>,
		message: impl Into<String>,
	) -> Option<EventId> {
		self.capture(Capture::exception(exception_type, message))
	}

	pub fn capture_message(&self, message: impl Into<String>, level: SeverityLevel) -> Option<EventId> {
		self.capture(Capture::message(message, level))
	}

	pub fn capture(&self, capture: Capture) -> Option<EventId> {
		let event = self.prepare(capture)?;
		let event_id = event.event_id;
		self.inner.queue.enqueue(event).then_some(event_id)
	}

	/// Like [`capture_error`](Self::capture_error), but waits up to
	/// `enqueue_timeout` for room when the queue is full.
	pub async fn capture_error_async<E>(&self, error: &E) -> Option<EventId>
	where
		E: StdError + 'static,
	{
		let capture = Capture::from_error(error);
		self.capture_async(capture).await
	}

	pub async fn capture_message_async(
		&self,
		message: impl Into<String>,
		level: SeverityLevel,
	) -> Option<EventId> {
		self.capture_async(Capture::message(message, level)).await
	}

	pub async fn capture_async(&self, capture: Capture) -> Option<EventId> {
		let event = self.prepare(capture)?;
		let event_id = event.event_id;
		self.inner
			.queue
			.enqueue_with_backpressure(event, self.inner.config.enqueue_timeout)
			.await
			.then_some(event_id)
	}

	fn prepare(&self, capture: Capture) -> Option<TelemetryEvent> {
		if self.is_closed() {
			warn!("telemetry client is shut down, ignoring capture");
			return None;
		}
		let event = self.inner.builder.build(capture);
		if self.inner.config.debug {
			debug!(event_id = %event.event_id, kind = ?event.kind, level = %event.level, "event built");
		}
		self.inner.filter.process(event)
	}

	// Breadcrumbs

	pub fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
		self.inner.ring.add(breadcrumb);
	}

	pub fn breadcrumb(&self, message: impl Into<String>, category: BreadcrumbCategory) {
		let breadcrumb = Breadcrumb::new(message, category).with_timestamp(self.inner.clock.now());
		self.add_breadcrumb(breadcrumb);
	}

	pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
		self.inner.ring.snapshot()
	}

	pub fn clear_breadcrumbs(&self) {
		self.inner.ring.clear();
	}

	// Context

	pub fn current(&self) -> ContextSnapshot {
		self.inner.store.current()
	}

	pub fn set_user(&self, user: UserContext) {
		self.inner.store.set_user(user);
	}

	pub fn clear_user(&self) {
		self.inner.store.clear_user();
	}

	pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
		self.inner.store.set_tag(key, value);
	}

	pub fn remove_tag(&self, key: &str) {
		self.inner.store.remove_tag(key);
	}

	pub fn set_extra(&self, key: impl Into<String>, value: serde_json::Value) {
		self.inner.store.set_extra(key, value);
	}

	// Journeys and steps

	pub fn start_journey(&self, name: impl Into<String>) -> JourneyId {
		self.inner.tracker.start_journey(name)
	}

	pub fn end_journey(&self) -> Option<Journey> {
		self.inner.tracker.end_journey()
	}

	/// Overrides the user on events captured inside the innermost journey.
	pub fn set_journey_user(&self, user: UserContext) -> bool {
		self.inner.tracker.set_journey_user(user)
	}

	pub fn end_journey_with(&self, id: JourneyId, status: JourneyStatus) -> Option<Journey> {
		self.inner.tracker.end_journey_with(id, status)
	}

	/// Starts a journey that ends when the guard is dropped.
	pub fn journey(&self, name: impl Into<String>) -> JourneyGuard {
		self.inner.tracker.journey(name)
	}

	pub fn start_step(&self, name: impl Into<String>, category: Option<&str>) -> StepId {
		self.inner.tracker.start_step(name, category)
	}

	pub fn end_step(&self) -> Option<Step> {
		self.inner.tracker.end_step()
	}

	pub fn end_step_with(&self, id: StepId, status: StepStatus) -> Option<Step> {
		self.inner.tracker.end_step_with(id, status)
	}

	/// Starts a step that ends when the guard is dropped.
	pub fn step(&self, name: impl Into<String>, category: Option<&str>) -> StepGuard {
		self.inner.tracker.step(name, category)
	}

	pub fn track_step<T, E>(
		&self,
		name: impl Into<String>,
		category: Option<&str>,
		f: impl FnOnce() -> std::result::Result<T, E>,
	) -> std::result::Result<T, E> {
		self.inner.tracker.track_step(name, category, f)
	}

	pub async fn track_step_async<T, E, F>(
		&self,
		name: impl Into<String>,
		category: Option<&str>,
		fut: F,
	) -> std::result::Result<T, E>
	where
		F: Future<Output = std::result::Result<T, E>>,
	{
		self.inner.tracker.track_step_async(name, category, fut).await
	}

	// Context propagation

	/// Runs `fut` in a copy of the caller's context.
	pub fn scope<F>(&self, fut: F) -> impl Future<Output = F::Output>
	where
		F: Future,
	{
		self.inner.store.scope(fut)
	}

	/// Spawns `fut` on the tokio runtime in a copy of the caller's context.
	pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		self.inner.store.spawn(fut)
	}

	/// Starts an OS thread in a copy of the caller's context.
	pub fn spawn_thread<F, T>(&self, f: F) -> std::io::Result<std::thread::JoinHandle<T>>
	where
		F: FnOnce() -> T + Send + 'static,
		T: Send + 'static,
	{
		self.inner.store.spawn_thread(f)
	}

	pub fn fork_context(&self) -> ContextFork {
		self.inner.store.fork()
	}

	pub fn enter_context(&self, fork: ContextFork) -> ContextEnterGuard {
		self.inner.store.enter_thread(fork)
	}

	// Delivery lifecycle

	pub fn queue_len(&self) -> usize {
		self.inner.queue.len()
	}

	pub fn stats(&self) -> QueueStats {
		self.inner.queue.stats()
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	/// Waits until every buffered event is delivered or `timeout` elapses.
	pub async fn flush(&self, timeout: Duration) -> bool {
		self.inner.queue.flush(timeout).await
	}

	/// Blocking flush for code outside async contexts. Needs the drainer to
	/// run on another thread.
	pub fn flush_blocking(&self, timeout: Duration) -> bool {
		self.inner.queue.flush_blocking(timeout)
	}

	/// Stops accepting events, flushes for up to `timeout`, stops the drainer
	/// and persists whatever is left. Returns whether everything was delivered.
	pub async fn shutdown(&self, timeout: Duration) -> bool {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return self.inner.queue.is_empty();
		}
		let drained = self.inner.queue.flush(timeout).await;
		self.inner.queue.close().await;
		if drained {
			info!("telemetry client shut down");
		} else {
			error!(pending = self.queue_len(), "telemetry client shut down with undelivered events");
		}
		drained
	}

	/// Blocking form of [`shutdown`](Self::shutdown). Waits out the rest of
	/// `timeout` for a dedicated drainer thread to stop, then writes whatever
	/// is still buffered to disk before returning.
	pub fn shutdown_blocking(&self, timeout: Duration) -> bool {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return self.inner.queue.is_empty();
		}
		let deadline = Instant::now() + timeout;
		let drained = self.inner.queue.flush_blocking(timeout);
		self.inner.queue.shutdown();
		self.join_drainer_thread(deadline);
		self.inner.queue.persist_blocking();
		if !drained {
			warn!(pending = self.queue_len(), "telemetry client shut down with undelivered events");
		}
		drained
	}

	fn join_drainer_thread(&self, deadline: Instant) {
		let Some(thread) = self.inner.drainer_thread.lock().take() else {
			return;
		};
		while !thread.is_finished() && Instant::now() < deadline {
			std::thread::sleep(Duration::from_millis(5));
		}
		if !thread.is_finished() {
			debug!("telemetry drainer thread still busy at shutdown, detaching it");
			return;
		}
		if thread.join().is_err() {
			warn!("telemetry drainer thread panicked");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::queue::{Envelope, SendOutcome};
	use crate::store::QueueStore;
	use loom_telemetry_core::ManualClock;
	use parking_lot::Mutex;
	use serde_json::json;

	#[derive(Default)]
	struct Recorder {
		bodies: Mutex<Vec<serde_json::Value>>,
	}

	#[async_trait::async_trait]
	impl Sender for Recorder {
		async fn send(&self, envelope: &Envelope) -> SendOutcome {
			let body = serde_json::from_slice(&envelope.body).unwrap_or_default();
			self.bodies.lock().push(body);
			SendOutcome::Delivered
		}
	}

	fn client_with(config: TelemetryConfig) -> (TelemetryClient, Arc<Recorder>) {
		let recorder = Arc::new(Recorder::default());
		let client = TelemetryClient::builder()
			.config(config.with_offline_queue(false))
			.sender(recorder.clone())
			.clock(Arc::new(ManualClock::default()))
			.spawn_drainer(false)
			.build()
			.unwrap();
		(client, recorder)
	}

	#[test]
	fn missing_dsn_without_sender_is_an_error() {
		let result = TelemetryClient::builder()
			.config(TelemetryConfig::new().with_offline_queue(false))
			.spawn_drainer(false)
			.build();
		assert!(matches!(result, Err(TelemetrySdkError::MissingDsn)));
	}

	#[test]
	fn invalid_config_is_rejected() {
		let result = TelemetryClient::builder()
			.config(TelemetryConfig::new().with_max_breadcrumbs(0))
			.sender(Arc::new(Recorder::default()))
			.spawn_drainer(false)
			.build();
		assert!(matches!(result, Err(TelemetrySdkError::Config(_))));
	}

	#[tokio::test]
	async fn captured_event_carries_context_on_the_wire() {
		let (client, recorder) = client_with(TelemetryConfig::new().with_environment("staging"));
		client.set_user(UserContext::new("u-1"));
		client.set_tag("plan", "pro");
		client.set_extra("cart", json!({"items": 2}));
		client.breadcrumb("opened cart", BreadcrumbCategory::Navigation);
		client.start_journey("checkout");

		let id = client.capture_message("card declined", SeverityLevel::Warning).unwrap();
		assert!(client.flush(Duration::from_secs(1)).await);

		let bodies = recorder.bodies.lock();
		assert_eq!(bodies.len(), 1);
		let body = &bodies[0];
		assert_eq!(body["eventId"], json!(id.to_string()));
		assert_eq!(body["environment"], "staging");
		assert_eq!(body["level"], "warning");
		assert_eq!(body["user"]["id"], "u-1");
		assert_eq!(body["tags"]["plan"], "pro");
		assert_eq!(body["extra"]["cart"]["items"], 2);
		assert_eq!(body["journey"]["name"], "checkout");
		assert_eq!(body["breadcrumbs"][0]["message"], "opened cart");
	}

	#[tokio::test]
	async fn before_send_can_veto() {
		let config = TelemetryConfig::new().with_before_send(|event: TelemetryEvent| {
			(event.message.as_deref() != Some("noise")).then_some(event)
		});
		let (client, recorder) = client_with(config);

		assert!(client.capture_message("noise", SeverityLevel::Info).is_none());
		assert!(client.capture_message("signal", SeverityLevel::Info).is_some());
		client.flush(Duration::from_secs(1)).await;
		assert_eq!(recorder.bodies.lock().len(), 1);
	}

	#[tokio::test]
	async fn injected_sampler_drops_events() {
		let recorder = Arc::new(Recorder::default());
		let client = TelemetryClient::builder()
			.config(TelemetryConfig::new().with_sample_rate(0.5).with_offline_queue(false))
			.sender(recorder.clone())
			.sampler(|| 0.9)
			.spawn_drainer(false)
			.build()
			.unwrap();

		assert!(client.capture_exception("Timeout", "slow").is_none());
		assert_eq!(client.queue_len(), 0);
	}

	#[tokio::test]
	async fn shutdown_rejects_further_captures() {
		let (client, _recorder) = client_with(TelemetryConfig::new());
		client.capture_message("before", SeverityLevel::Info);
		assert!(client.shutdown(Duration::from_secs(1)).await);
		assert!(client.is_closed());
		assert!(client.capture_message("after", SeverityLevel::Info).is_none());
	}

	#[tokio::test]
	async fn async_capture_enqueues() {
		let (client, recorder) = client_with(TelemetryConfig::new());
		assert!(client
			.capture_message_async("hello", SeverityLevel::Debug)
			.await
			.is_some());
		client.flush(Duration::from_secs(1)).await;
		assert_eq!(recorder.bodies.lock().len(), 1);
	}

	#[tokio::test]
	async fn spawned_drainer_delivers_without_flush() {
		let recorder = Arc::new(Recorder::default());
		let client = TelemetryClient::builder()
			.config(TelemetryConfig::new().with_offline_queue(false))
			.sender(recorder.clone())
			.build()
			.unwrap();

		client.capture_message("background", SeverityLevel::Info);
		for _ in 0..100 {
			if !recorder.bodies.lock().is_empty() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(recorder.bodies.lock().len(), 1);
		client.shutdown(Duration::from_secs(1)).await;
	}

	#[test]
	fn drainer_thread_is_used_outside_a_runtime() {
		let recorder = Arc::new(Recorder::default());
		let client = TelemetryClient::builder()
			.config(TelemetryConfig::new().with_offline_queue(false))
			.sender(recorder.clone())
			.build()
			.unwrap();

		client.capture_message("from sync code", SeverityLevel::Info);
		assert!(client.flush_blocking(Duration::from_secs(5)));
		assert_eq!(recorder.bodies.lock().len(), 1);
		assert!(client.shutdown_blocking(Duration::from_secs(1)));
	}

	struct Unreachable;

	#[async_trait::async_trait]
	impl Sender for Unreachable {
		async fn send(&self, _envelope: &Envelope) -> SendOutcome {
			SendOutcome::Transient("connection refused".into())
		}

		async fn is_online(&self) -> bool {
			false
		}
	}

	#[test]
	fn blocking_shutdown_leaves_undelivered_events_on_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("queue.json");
		let client = TelemetryClient::builder()
			.config(
				TelemetryConfig::new()
					.with_queue_path(&path)
					.with_offline_poll_interval(Duration::from_secs(60)),
			)
			.sender(Arc::new(Unreachable))
			.build()
			.unwrap();

		for i in 0..3 {
			client.capture_message(format!("offline {i}"), SeverityLevel::Info);
		}
		assert!(!client.shutdown_blocking(Duration::from_millis(200)));

		let mut messages: Vec<String> = QueueStore::new(&path)
			.load()
			.unwrap()
			.into_iter()
			.filter_map(|item| item.event.message)
			.collect();
		messages.sort();
		assert_eq!(messages, ["offline 0", "offline 1", "offline 2"]);
	}

	#[tokio::test]
	async fn breadcrumbs_are_stamped_by_the_client_clock() {
		let clock = Arc::new(ManualClock::default());
		let client = TelemetryClient::builder()
			.config(TelemetryConfig::new().with_offline_queue(false))
			.sender(Arc::new(Recorder::default()))
			.clock(clock.clone())
			.spawn_drainer(false)
			.build()
			.unwrap();

		clock.advance(chrono::Duration::seconds(90));
		client.breadcrumb("opened settings", BreadcrumbCategory::Navigation);

		let crumbs = client.breadcrumbs();
		assert_eq!(crumbs.len(), 1);
		assert_eq!(crumbs[0].timestamp, clock.now());
	}
}
