// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Sampling and the `before_send` hook.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use loom_telemetry_core::TelemetryEvent;
use tracing::{debug, warn};

/// Last chance to modify or drop an event before it is queued.
///
/// Returning `None` drops the event. Implemented for any
/// `Fn(TelemetryEvent) -> Option<TelemetryEvent>`.
pub trait BeforeSend: Send + Sync {
	fn before_send(&self, event: TelemetryEvent) -> Option<TelemetryEvent>;
}

impl<F> BeforeSend for F
where
	F: Fn(TelemetryEvent) -> Option<TelemetryEvent> + Send + Sync,
{
	fn before_send(&self, event: TelemetryEvent) -> Option<TelemetryEvent> {
		self(event)
	}
}

/// Uniform draw in `[0, 1)`.
pub type Sampler = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Decides which events reach the queue.
#[derive(Clone)]
pub struct EventFilter {
	sample_rate: f64,
	before_send: Option<Arc<dyn BeforeSend>>,
	sampler: Sampler,
	debug: bool,
}

impl EventFilter {
	pub fn new(sample_rate: f64, before_send: Option<Arc<dyn BeforeSend>>) -> Self {
		Self {
			sample_rate: sample_rate.clamp(0.0, 1.0),
			before_send,
			sampler: Arc::new(fastrand::f64),
			debug: false,
		}
	}

	/// Replaces the random source.
	pub fn with_sampler(mut self, sampler: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
		self.sampler = Arc::new(sampler);
		self
	}

	pub fn with_debug(mut self, debug: bool) -> Self {
		self.debug = debug;
		self
	}

	/// Samples, then runs the hook. `None` means the event is dropped.
	pub fn process(&self, event: TelemetryEvent) -> Option<TelemetryEvent> {
		if !self.sampled_in() {
			if self.debug {
				debug!(event_id = %event.event_id, sample_rate = self.sample_rate, "event sampled out");
			}
			return None;
		}

		let Some(hook) = &self.before_send else {
			return Some(event);
		};

		let event_id = event.event_id;
		let fallback = event.clone();
		match catch_unwind(AssertUnwindSafe(|| hook.before_send(event))) {
			Ok(Some(event)) => Some(event),
			Ok(None) => {
				if self.debug {
					debug!(event_id = %event_id, "event dropped by before_send");
				}
				None
			}
			Err(_) => {
				warn!(event_id = %event_id, "before_send panicked, sending the original event");
				Some(fallback)
			}
		}
	}

	fn sampled_in(&self) -> bool {
		(self.sampler)() < self.sample_rate
	}
}
