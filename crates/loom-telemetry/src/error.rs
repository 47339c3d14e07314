// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the telemetry SDK.
//!
//! Only construction and configuration return these. Capture, breadcrumb and
//! context APIs never surface errors to the application.

use loom_telemetry_core::TelemetryError;
use thiserror::Error;

/// Result type alias for telemetry SDK operations.
pub type Result<T> = std::result::Result<T, TelemetrySdkError>;

/// Errors that can occur while setting up the telemetry SDK.
#[derive(Debug, Error)]
pub enum TelemetrySdkError {
	/// Invalid configuration or DSN.
	#[error(transparent)]
	Config(#[from] TelemetryError),

	/// No DSN was configured and no custom sender was supplied.
	#[error("a DSN is required when no sender is configured")]
	MissingDsn,

	/// Building the HTTP client failed.
	#[error("HTTP client error: {0}")]
	Http(#[from] reqwest::Error),

	/// The background drainer could not be started.
	#[error("failed to start delivery drainer: {0}")]
	Runtime(String),

	/// I/O failure (queue persistence, thread spawn).
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}
