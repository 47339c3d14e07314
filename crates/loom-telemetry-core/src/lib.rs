// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom telemetry SDK.
//!
//! This crate holds the data model shared by the capture pipeline in
//! `loom-telemetry`: breadcrumbs and the bounded breadcrumb ring, telemetry
//! events, journeys and steps, and the clock abstraction used for timestamps
//! and retry scheduling.
//!
//! Nothing here performs I/O or depends on an async runtime.

pub mod breadcrumb;
pub mod clock;
pub mod error;
pub mod event;
pub mod journey;
pub mod ring;

pub use breadcrumb::{Breadcrumb, BreadcrumbCategory, SeverityLevel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, TelemetryError};
pub use event::{
	EventKind, ExceptionInfo, Frame, JourneyContext, PlatformInfo, TelemetryEvent, UserContext,
};
pub use journey::{Journey, JourneyStatus, Step, StepStatus};
pub use ring::{BreadcrumbRing, DEFAULT_MAX_BREADCRUMBS};

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for EventId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for EventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for EventId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// Identifier of a journey (also used as its correlation id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct JourneyId(pub Uuid);

impl JourneyId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for JourneyId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for JourneyId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for JourneyId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// Identifier of a step within a journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StepId(pub Uuid);

impl StepId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for StepId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for StepId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for StepId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn event_id_roundtrip(uuid_bytes in any::<[u8; 16]>()) {
			let id = EventId(Uuid::from_bytes(uuid_bytes));
			let parsed: EventId = id.to_string().parse().unwrap();
			prop_assert_eq!(id, parsed);
		}

		#[test]
		fn journey_id_roundtrip(uuid_bytes in any::<[u8; 16]>()) {
			let id = JourneyId(Uuid::from_bytes(uuid_bytes));
			let parsed: JourneyId = id.to_string().parse().unwrap();
			prop_assert_eq!(id, parsed);
		}

		#[test]
		fn step_id_roundtrip(uuid_bytes in any::<[u8; 16]>()) {
			let id = StepId(Uuid::from_bytes(uuid_bytes));
			let parsed: StepId = id.to_string().parse().unwrap();
			prop_assert_eq!(id, parsed);
		}
	}

	#[test]
	fn new_ids_are_unique() {
		assert_ne!(EventId::new(), EventId::new());
		assert_ne!(JourneyId::new(), JourneyId::new());
	}
}
