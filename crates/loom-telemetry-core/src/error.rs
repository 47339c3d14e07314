// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for telemetry core types.

use thiserror::Error;

/// Errors produced while parsing or validating telemetry values.
#[derive(Debug, Error)]
pub enum TelemetryError {
	#[error("invalid DSN: {0}")]
	InvalidDsn(String),

	#[error("invalid value for {field}: {reason}")]
	InvalidConfig { field: String, reason: String },

	#[error("invalid severity level: {0}")]
	InvalidLevel(String),

	#[error("invalid breadcrumb category: {0}")]
	InvalidCategory(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl TelemetryError {
	pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::InvalidConfig {
			field: field.into(),
			reason: reason.into(),
		}
	}
}

/// Result type for telemetry core operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;
