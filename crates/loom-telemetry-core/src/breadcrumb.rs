// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Breadcrumb types (the diagnostic trail leading up to an event).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TelemetryError;

/// A timestamped trail entry recorded before an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadcrumb {
	pub timestamp: DateTime<Utc>,
	pub message: String,
	pub category: BreadcrumbCategory,
	pub level: SeverityLevel,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<serde_json::Value>,
}

impl Breadcrumb {
	/// Creates a breadcrumb stamped with the current wall-clock time.
	pub fn new(message: impl Into<String>, category: BreadcrumbCategory) -> Self {
		Self {
			timestamp: Utc::now(),
			message: message.into(),
			category,
			level: SeverityLevel::Info,
			data: None,
		}
	}

	pub fn with_level(mut self, level: SeverityLevel) -> Self {
		self.level = level;
		self
	}

	pub fn with_data(mut self, data: serde_json::Value) -> Self {
		self.data = Some(data);
		self
	}

	pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
		self.timestamp = timestamp;
		self
	}
}

impl Default for Breadcrumb {
	fn default() -> Self {
		Self::new(String::new(), BreadcrumbCategory::Custom)
	}
}

/// Category of a breadcrumb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreadcrumbCategory {
	Ui,
	Http,
	Navigation,
	Console,
	Auth,
	Business,
	Notification,
	#[default]
	Custom,
}

impl fmt::Display for BreadcrumbCategory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ui => write!(f, "ui"),
			Self::Http => write!(f, "http"),
			Self::Navigation => write!(f, "navigation"),
			Self::Console => write!(f, "console"),
			Self::Auth => write!(f, "auth"),
			Self::Business => write!(f, "business"),
			Self::Notification => write!(f, "notification"),
			Self::Custom => write!(f, "custom"),
		}
	}
}

impl FromStr for BreadcrumbCategory {
	type Err = TelemetryError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ui" => Ok(Self::Ui),
			"http" => Ok(Self::Http),
			"navigation" => Ok(Self::Navigation),
			"console" => Ok(Self::Console),
			"auth" => Ok(Self::Auth),
			"business" => Ok(Self::Business),
			"notification" => Ok(Self::Notification),
			"custom" => Ok(Self::Custom),
			_ => Err(TelemetryError::InvalidCategory(s.to_string())),
		}
	}
}

/// Severity of an event or breadcrumb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
	Debug,
	#[default]
	Info,
	Warning,
	Error,
	Fatal,
}

impl fmt::Display for SeverityLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Debug => write!(f, "debug"),
			Self::Info => write!(f, "info"),
			Self::Warning => write!(f, "warning"),
			Self::Error => write!(f, "error"),
			Self::Fatal => write!(f, "fatal"),
		}
	}
}

impl FromStr for SeverityLevel {
	type Err = TelemetryError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"debug" => Ok(Self::Debug),
			"info" => Ok(Self::Info),
			"warning" => Ok(Self::Warning),
			"error" => Ok(Self::Error),
			"fatal" => Ok(Self::Fatal),
			_ => Err(TelemetryError::InvalidLevel(s.to_string())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn severity_level_roundtrip(level in prop_oneof![
			Just(SeverityLevel::Debug),
			Just(SeverityLevel::Info),
			Just(SeverityLevel::Warning),
			Just(SeverityLevel::Error),
			Just(SeverityLevel::Fatal),
		]) {
			let parsed: SeverityLevel = level.to_string().parse().unwrap();
			prop_assert_eq!(level, parsed);
		}

		#[test]
		fn category_roundtrip(category in prop_oneof![
			Just(BreadcrumbCategory::Ui),
			Just(BreadcrumbCategory::Http),
			Just(BreadcrumbCategory::Navigation),
			Just(BreadcrumbCategory::Console),
			Just(BreadcrumbCategory::Auth),
			Just(BreadcrumbCategory::Business),
			Just(BreadcrumbCategory::Notification),
			Just(BreadcrumbCategory::Custom),
		]) {
			let parsed: BreadcrumbCategory = category.to_string().parse().unwrap();
			prop_assert_eq!(category, parsed);
		}
	}

	#[test]
	fn unknown_level_is_rejected() {
		assert!(matches!(
			"critical".parse::<SeverityLevel>(),
			Err(TelemetryError::InvalidLevel(_))
		));
	}

	#[test]
	fn breadcrumb_serializes_without_empty_data() {
		let crumb = Breadcrumb::new("GET /api/users", BreadcrumbCategory::Http);
		let json = serde_json::to_value(&crumb).unwrap();
		assert_eq!(json["category"], "http");
		assert_eq!(json["level"], "info");
		assert!(json.get("data").is_none());
	}
}
