// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Journey and step tracking on top of the context store.
//!
//! Each context holds a stack of open journeys. Starting a journey while
//! another is open suspends the outer one until the inner one closes. A step
//! started with no journey open gets an implicit journey that closes with its
//! last step.

use std::future::Future;
use std::sync::Arc;

use loom_telemetry_core::{
	Clock, Journey, JourneyContext, JourneyId, JourneyStatus, Step, StepId, StepStatus,
	UserContext,
};
use tracing::{debug, warn};

use crate::context::{ContextHandle, ContextState, ContextStore, JourneyPhase};

/// A journey on a context's stack.
#[derive(Debug, Clone)]
pub(crate) struct OpenJourney {
	pub(crate) journey: Journey,
	/// Indices into `journey.steps` of steps still open, innermost last.
	pub(crate) open_steps: Vec<usize>,
	pub(crate) implicit: bool,
}

impl OpenJourney {
	fn innermost_step(&self) -> Option<&Step> {
		self.open_steps.last().map(|&i| &self.journey.steps[i])
	}

	fn close(mut self, status: JourneyStatus, now: chrono::DateTime<chrono::Utc>) -> Journey {
		let step_status = StepStatus::from(status);
		while let Some(index) = self.open_steps.pop() {
			let step = &mut self.journey.steps[index];
			debug!(step = %step.name, journey = %self.journey.name, "closing step with its journey");
			step.close(step_status, now);
		}
		self.journey.status = status;
		self.journey.ended_at = Some(now);
		self.journey
	}
}

impl ContextState {
	pub(crate) fn phase(&self) -> JourneyPhase {
		match self.journeys.last() {
			None => JourneyPhase::Idle,
			Some(open) if open.open_steps.is_empty() => JourneyPhase::JourneyOpen,
			Some(_) => JourneyPhase::StepOpen,
		}
	}

	pub(crate) fn journey_context(&self) -> Option<JourneyContext> {
		let open = self.journeys.last()?;
		let step = open.innermost_step();
		let journey = &open.journey;
		Some(JourneyContext {
			journey_id: (!open.implicit).then_some(journey.id),
			name: journey.name.clone(),
			correlation_id: (!open.implicit).then_some(journey.correlation_id),
			step_id: step.map(|s| s.id),
			current_step: step.map(|s| s.name.clone()),
			started_at: journey.started_at,
			metadata: journey.metadata.clone(),
		})
	}

	pub(crate) fn start_journey(
		&mut self,
		name: impl Into<String>,
		now: chrono::DateTime<chrono::Utc>,
	) -> JourneyId {
		let parent = self
			.journeys
			.iter()
			.rev()
			.find(|o| !o.implicit)
			.map(|o| &o.journey);
		let journey = Journey::new(name, parent, now);
		let id = journey.id;
		self.journeys.push(OpenJourney {
			journey,
			open_steps: Vec::new(),
			implicit: false,
		});
		id
	}

	/// Closes the given journey, or the innermost explicit one.
	pub(crate) fn end_journey(
		&mut self,
		id: Option<JourneyId>,
		status: JourneyStatus,
		now: chrono::DateTime<chrono::Utc>,
	) -> Option<Journey> {
		let target = match id {
			Some(id) => self.journeys.iter().rposition(|o| o.journey.id == id),
			None => self.journeys.iter().rposition(|o| !o.implicit),
		};
		let Some(index) = target else {
			warn!(journey_id = ?id, "end_journey called with no matching open journey");
			return None;
		};

		while self.journeys.len() > index + 1 {
			if let Some(above) = self.journeys.pop() {
				warn!(journey = %above.journey.name, "closing journey left open above the one being ended");
				above.close(status, now);
			}
		}
		let open = self.journeys.pop()?;
		Some(open.close(status, now))
	}

	pub(crate) fn start_step(
		&mut self,
		name: impl Into<String>,
		category: Option<String>,
		now: chrono::DateTime<chrono::Utc>,
	) -> StepId {
		let name = name.into();
		if self.journeys.is_empty() {
			self.journeys.push(OpenJourney {
				journey: Journey::new(name.clone(), None, now),
				open_steps: Vec::new(),
				implicit: true,
			});
		}

		let len = self.journeys.len();
		let open = &mut self.journeys[len - 1];
		let parent_step_id = open.innermost_step().map(|s| s.id);
		let journey_id = (!open.implicit).then_some(open.journey.id);
		let step = Step::new(name, category, journey_id, parent_step_id, now);
		let id = step.id;
		open.journey.steps.push(step);
		open.open_steps.push(open.journey.steps.len() - 1);
		id
	}

	/// Closes the given step, or the innermost open step of the active journey.
	pub(crate) fn end_step(
		&mut self,
		id: Option<StepId>,
		status: StepStatus,
		now: chrono::DateTime<chrono::Utc>,
	) -> Option<Step> {
		let location = match id {
			Some(id) => self.journeys.iter().enumerate().rev().find_map(|(j, o)| {
				o.open_steps
					.iter()
					.position(|&s| o.journey.steps[s].id == id)
					.map(|pos| (j, pos))
			}),
			None => self.journeys.last().and_then(|o| {
				o.open_steps
					.len()
					.checked_sub(1)
					.map(|pos| (self.journeys.len() - 1, pos))
			}),
		};
		let Some((journey_index, position)) = location else {
			warn!(step_id = ?id, "end_step called with no matching open step");
			return None;
		};

		let open = &mut self.journeys[journey_index];
		while open.open_steps.len() > position + 1 {
			if let Some(index) = open.open_steps.pop() {
				let step = &mut open.journey.steps[index];
				warn!(step = %step.name, "closing step left open above the one being ended");
				step.close(status, now);
			}
		}
		let index = open.open_steps.pop()?;
		let step = &mut open.journey.steps[index];
		step.close(status, now);
		let closed = step.clone();

		if open.implicit && open.open_steps.is_empty() {
			let implicit = self.journeys.remove(journey_index);
			implicit.close(JourneyStatus::from(status), now);
		}
		Some(closed)
	}

	fn innermost_explicit_journey_mut(&mut self) -> Option<&mut Journey> {
		self.journeys
			.iter_mut()
			.rev()
			.find(|o| !o.implicit)
			.map(|o| &mut o.journey)
	}

	fn journey_mut(&mut self, id: JourneyId) -> Option<&mut Journey> {
		self.journeys
			.iter_mut()
			.rev()
			.map(|o| &mut o.journey)
			.find(|j| j.id == id)
	}

	fn open_step_mut(&mut self, id: StepId) -> Option<&mut Step> {
		for open in self.journeys.iter_mut().rev() {
			let found = open
				.open_steps
				.iter()
				.copied()
				.find(|&i| open.journey.steps[i].id == id);
			if let Some(index) = found {
				return Some(&mut open.journey.steps[index]);
			}
		}
		None
	}
}

/// Opens and closes journeys and steps in the caller's context.
#[derive(Clone)]
pub struct JourneyTracker {
	store: ContextStore,
	clock: Arc<dyn Clock>,
}

impl JourneyTracker {
	pub fn new(store: ContextStore, clock: Arc<dyn Clock>) -> Self {
		Self { store, clock }
	}

	pub fn store(&self) -> &ContextStore {
		&self.store
	}

	/// Starts a journey, suspending any journey already open.
	pub fn start_journey(&self, name: impl Into<String>) -> JourneyId {
		let now = self.clock.now();
		self.store.with_state(|state| state.start_journey(name, now))
	}

	/// Completes the innermost explicit journey.
	pub fn end_journey(&self) -> Option<Journey> {
		let now = self.clock.now();
		self.store
			.with_state(|state| state.end_journey(None, JourneyStatus::Completed, now))
	}

	pub fn end_journey_with(&self, id: JourneyId, status: JourneyStatus) -> Option<Journey> {
		let now = self.clock.now();
		self.store
			.with_state(|state| state.end_journey(Some(id), status, now))
	}

	/// Attributes events captured inside the innermost explicit journey to
	/// `user`, overriding the context's user until that journey ends.
	/// Returns `false` when no journey is open.
	pub fn set_journey_user(&self, user: UserContext) -> bool {
		let set = self.store.with_state(|state| match state.innermost_explicit_journey_mut() {
			Some(journey) => {
				journey.user = Some(user);
				true
			}
			None => false,
		});
		if !set {
			warn!("set_journey_user called with no journey open, ignoring");
		}
		set
	}

	pub fn start_step(&self, name: impl Into<String>, category: Option<&str>) -> StepId {
		let now = self.clock.now();
		let category = category.map(str::to_string);
		self.store
			.with_state(|state| state.start_step(name, category, now))
	}

	/// Marks the innermost open step ok.
	pub fn end_step(&self) -> Option<Step> {
		let now = self.clock.now();
		self.store
			.with_state(|state| state.end_step(None, StepStatus::Ok, now))
	}

	pub fn end_step_with(&self, id: StepId, status: StepStatus) -> Option<Step> {
		let now = self.clock.now();
		self.store
			.with_state(|state| state.end_step(Some(id), status, now))
	}

	/// Starts a journey that closes when the guard is dropped.
	pub fn journey(&self, name: impl Into<String>) -> JourneyGuard {
		let handle = self.store.handle();
		let id = handle.lock().start_journey(name, self.clock.now());
		JourneyGuard {
			handle,
			id,
			clock: Arc::clone(&self.clock),
			failed: false,
			closed: false,
		}
	}

	/// Starts a step that closes when the guard is dropped.
	pub fn step(&self, name: impl Into<String>, category: Option<&str>) -> StepGuard {
		let handle = self.store.handle();
		let id = handle
			.lock()
			.start_step(name, category.map(str::to_string), self.clock.now());
		StepGuard {
			handle,
			id,
			clock: Arc::clone(&self.clock),
			failed: false,
			closed: false,
		}
	}

	/// Runs `f` inside a step. An `Err` or a panic marks the step failed.
	pub fn track_step<T, E>(
		&self,
		name: impl Into<String>,
		category: Option<&str>,
		f: impl FnOnce() -> Result<T, E>,
	) -> Result<T, E> {
		let mut guard = self.step(name, category);
		let result = f();
		if result.is_err() {
			guard.fail();
		}
		result
	}

	/// Async form of [`track_step`](Self::track_step).
	pub async fn track_step_async<T, E, F>(
		&self,
		name: impl Into<String>,
		category: Option<&str>,
		fut: F,
	) -> Result<T, E>
	where
		F: Future<Output = Result<T, E>>,
	{
		let mut guard = self.step(name, category);
		let result = fut.await;
		if result.is_err() {
			guard.fail();
		}
		result
	}
}

fn ends_failed(failed: bool) -> bool {
	failed || std::thread::panicking()
}

/// Closes its journey when dropped.
///
/// The journey ends failed if [`fail`](Self::fail) was called or the guard is
/// dropped while unwinding, and completed otherwise.
#[must_use = "the journey ends as soon as the guard is dropped"]
pub struct JourneyGuard {
	handle: ContextHandle,
	id: JourneyId,
	clock: Arc<dyn Clock>,
	failed: bool,
	closed: bool,
}

impl JourneyGuard {
	pub fn id(&self) -> JourneyId {
		self.id
	}

	pub fn fail(&mut self) {
		self.failed = true;
	}

	pub fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
		if let Some(journey) = self.handle.lock().journey_mut(self.id) {
			journey.metadata.insert(key.into(), value);
		}
	}

	/// Attributes events captured while this journey is open to `user`.
	pub fn set_user(&self, user: UserContext) {
		if let Some(journey) = self.handle.lock().journey_mut(self.id) {
			journey.user = Some(user);
		}
	}

	/// Closes the journey now and returns the closed record.
	pub fn complete(mut self) -> Option<Journey> {
		self.close()
	}

	fn close(&mut self) -> Option<Journey> {
		if self.closed {
			return None;
		}
		self.closed = true;
		let status = if ends_failed(self.failed) {
			JourneyStatus::Failed
		} else {
			JourneyStatus::Completed
		};
		self.handle
			.lock()
			.end_journey(Some(self.id), status, self.clock.now())
	}
}

impl Drop for JourneyGuard {
	fn drop(&mut self) {
		self.close();
	}
}

/// Closes its step when dropped, with the same failure rules as
/// [`JourneyGuard`].
#[must_use = "the step ends as soon as the guard is dropped"]
pub struct StepGuard {
	handle: ContextHandle,
	id: StepId,
	clock: Arc<dyn Clock>,
	failed: bool,
	closed: bool,
}

impl StepGuard {
	pub fn id(&self) -> StepId {
		self.id
	}

	pub fn fail(&mut self) {
		self.failed = true;
	}

	pub fn set_data(&self, key: impl Into<String>, value: serde_json::Value) {
		if let Some(step) = self.handle.lock().open_step_mut(self.id) {
			step.data.insert(key.into(), value);
		}
	}

	pub fn complete(mut self) -> Option<Step> {
		self.close()
	}

	fn close(&mut self) -> Option<Step> {
		if self.closed {
			return None;
		}
		self.closed = true;
		let status = if ends_failed(self.failed) {
			StepStatus::Failed
		} else {
			StepStatus::Ok
		};
		self.handle
			.lock()
			.end_step(Some(self.id), status, self.clock.now())
	}
}

impl Drop for StepGuard {
	fn drop(&mut self) {
		self.close();
	}
}
