// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Telemetry event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error as StdError;

use crate::breadcrumb::{Breadcrumb, SeverityLevel};
use crate::{EventId, JourneyId, StepId};

/// What was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Exception,
	Message,
}

/// A normalized error/message record ready for delivery.
///
/// Events are immutable once built; the `before_send` hook receives an owned
/// copy and hands back the one to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
	pub event_id: EventId,
	pub timestamp: DateTime<Utc>,
	pub kind: EventKind,
	pub level: SeverityLevel,
	pub message: Option<String>,
	/// Outermost error first, then each underlying cause.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub exception: Vec<ExceptionInfo>,
	pub environment: String,
	pub app_version: String,
	pub platform: PlatformInfo,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<UserContext>,
	#[serde(default)]
	pub tags: HashMap<String, String>,
	#[serde(default)]
	pub extra: HashMap<String, serde_json::Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub journey: Option<JourneyContext>,
	#[serde(default)]
	pub breadcrumbs: Vec<Breadcrumb>,
}

impl TelemetryEvent {
	pub fn is_exception(&self) -> bool {
		self.kind == EventKind::Exception
	}
}

/// One link of an exception chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
	#[serde(rename = "type")]
	pub exception_type: String,
	pub message: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub frames: Vec<Frame>,
}

impl ExceptionInfo {
	pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			exception_type: exception_type.into(),
			message: message.into(),
			frames: Vec::new(),
		}
	}

	pub fn with_frames(mut self, frames: Vec<Frame>) -> Self {
		self.frames = frames;
		self
	}

	/// Builds a chain from an error and its `source()` causes.
	///
	/// The outermost error is named after its Rust type. Sources are only
	/// reachable as trait objects, so they are named after the leading
	/// identifier of their `Debug` output.
	pub fn chain_from_error<E>(error: &E) -> Vec<Self>
	where
		E: StdError + 'static,
	{
		let mut chain = vec![Self::new(std::any::type_name::<E>(), error.to_string())];
		let mut source = error.source();
		while let Some(cause) = source {
			chain.push(Self::new(debug_type_name(cause), cause.to_string()));
			source = cause.source();
		}
		chain
	}
}

fn debug_type_name(error: &dyn StdError) -> String {
	let debug = format!("{error:?}");
	let name: String = debug
		.chars()
		.take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
		.collect();
	if name.is_empty() {
		"Error".to_string()
	} else {
		name
	}
}

/// A single stack frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub module: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filename: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub lineno: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub colno: Option<u32>,
	/// User code vs dependency
	#[serde(default)]
	pub in_app: bool,
}

/// Identity of the user at capture time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
	pub id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub email: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub data: HashMap<String, serde_json::Value>,
}

impl UserContext {
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			..Default::default()
		}
	}

	pub fn with_email(mut self, email: impl Into<String>) -> Self {
		self.email = Some(email.into());
		self
	}

	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}
}

/// Journey/step correlation attached to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JourneyContext {
	/// Absent when the active step was started outside any journey.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub journey_id: Option<JourneyId>,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub correlation_id: Option<JourneyId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub step_id: Option<StepId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub current_step: Option<String>,
	pub started_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub metadata: HashMap<String, serde_json::Value>,
}

/// Runtime the event came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformInfo {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub os: Option<String>,
}

impl PlatformInfo {
	/// Describes the current Rust process.
	pub fn rust(sdk_version: &str) -> Self {
		Self {
			name: "rust".to_string(),
			version: Some(sdk_version.to_string()),
			os: Some(std::env::consts::OS.to_string()),
		}
	}
}
