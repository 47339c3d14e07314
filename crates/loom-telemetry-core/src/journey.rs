// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Journey and step records.
//!
//! A journey is a named user flow (checkout, signup, ...) and a step is a
//! named phase inside it. Both are opened and closed by the journey tracker in
//! `loom-telemetry`; these types only describe their state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{JourneyId, StepId, UserContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
	Open,
	Completed,
	Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
	InProgress,
	Ok,
	Failed,
}

impl From<JourneyStatus> for StepStatus {
	fn from(status: JourneyStatus) -> Self {
		match status {
			JourneyStatus::Open => StepStatus::InProgress,
			JourneyStatus::Completed => StepStatus::Ok,
			JourneyStatus::Failed => StepStatus::Failed,
		}
	}
}

impl From<StepStatus> for JourneyStatus {
	fn from(status: StepStatus) -> Self {
		match status {
			StepStatus::InProgress => JourneyStatus::Open,
			StepStatus::Ok => JourneyStatus::Completed,
			StepStatus::Failed => JourneyStatus::Failed,
		}
	}
}

/// A named user flow and the steps recorded under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Journey {
	pub id: JourneyId,
	pub name: String,
	/// Shared by a journey and every journey nested inside it.
	pub correlation_id: JourneyId,
	/// The journey this one suspended when it started, if any.
	pub parent_id: Option<JourneyId>,
	pub started_at: DateTime<Utc>,
	pub ended_at: Option<DateTime<Utc>>,
	pub status: JourneyStatus,
	/// In start order.
	pub steps: Vec<Step>,
	#[serde(default)]
	pub metadata: HashMap<String, serde_json::Value>,
	/// Overrides the context's user on events captured inside this journey.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<UserContext>,
}

impl Journey {
	pub fn new(name: impl Into<String>, parent: Option<&Journey>, now: DateTime<Utc>) -> Self {
		let id = JourneyId::new();
		Self {
			id,
			name: name.into(),
			correlation_id: parent.map_or(id, |p| p.correlation_id),
			parent_id: parent.map(|p| p.id),
			started_at: now,
			ended_at: None,
			status: JourneyStatus::Open,
			steps: Vec::new(),
			metadata: HashMap::new(),
			user: None,
		}
	}

	pub fn is_open(&self) -> bool {
		self.status == JourneyStatus::Open
	}

	pub fn step(&self, id: StepId) -> Option<&Step> {
		self.steps.iter().find(|s| s.id == id)
	}
}

/// A named phase within a journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
	pub id: StepId,
	pub name: String,
	pub category: Option<String>,
	/// `None` for a step started while no journey was open.
	pub journey_id: Option<JourneyId>,
	pub parent_step_id: Option<StepId>,
	pub started_at: DateTime<Utc>,
	pub ended_at: Option<DateTime<Utc>>,
	pub status: StepStatus,
	#[serde(default)]
	pub data: HashMap<String, serde_json::Value>,
}

impl Step {
	pub fn new(
		name: impl Into<String>,
		category: Option<String>,
		journey_id: Option<JourneyId>,
		parent_step_id: Option<StepId>,
		now: DateTime<Utc>,
	) -> Self {
		Self {
			id: StepId::new(),
			name: name.into(),
			category,
			journey_id,
			parent_step_id,
			started_at: now,
			ended_at: None,
			status: StepStatus::InProgress,
			data: HashMap::new(),
		}
	}

	pub fn is_open(&self) -> bool {
		self.status == StepStatus::InProgress
	}

	/// Closes the step. A step that is already closed keeps its first status.
	pub fn close(&mut self, status: StepStatus, now: DateTime<Utc>) {
		if self.is_open() {
			self.status = status;
			self.ended_at = Some(now);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn top_level_journey_correlates_with_itself() {
		let journey = Journey::new("checkout", None, Utc::now());
		assert_eq!(journey.correlation_id, journey.id);
		assert!(journey.parent_id.is_none());
		assert!(journey.is_open());
	}

	#[test]
	fn nested_journey_inherits_correlation() {
		let outer = Journey::new("checkout", None, Utc::now());
		let inner = Journey::new("payment", Some(&outer), Utc::now());

		assert_eq!(inner.correlation_id, outer.id);
		assert_eq!(inner.parent_id, Some(outer.id));
		assert_ne!(inner.id, outer.id);
	}

	#[test]
	fn closing_a_step_twice_keeps_first_status() {
		let mut step = Step::new("validate", None, None, None, Utc::now());
		step.close(StepStatus::Failed, Utc::now());
		step.close(StepStatus::Ok, Utc::now());
		assert_eq!(step.status, StepStatus::Failed);
		assert!(step.ended_at.is_some());
	}
}
