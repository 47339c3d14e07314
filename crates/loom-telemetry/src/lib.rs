// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error and message telemetry SDK for Rust applications.
//!
//! Captures errors and messages, enriches them with the caller's context
//! (user, tags, extras, breadcrumbs and the journey/step in progress),
//! samples and filters them, and delivers them to the collector from a
//! background drainer with retry, backoff and an offline buffer.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use loom_telemetry::{TelemetryClient, TelemetryConfig, SeverityLevel, UserContext};
//!
//! let client = TelemetryClient::builder()
//!     .config(
//!         TelemetryConfig::new()
//!             .with_dsn("https://pk_live_abc@telemetry.example.com")?
//!             .with_environment("production")
//!             .with_app_version(env!("CARGO_PKG_VERSION")),
//!     )
//!     .build()?;
//!
//! client.set_user(UserContext::new("user-42"));
//! client.track_step("load-cart", Some("business"), || load_cart())?;
//! client.capture_message("checkout started", SeverityLevel::Info);
//!
//! client.shutdown(Duration::from_secs(5)).await;
//! ```
//!
//! Context follows the caller: use [`TelemetryClient::scope`],
//! [`TelemetryClient::spawn`] or [`TelemetryClient::spawn_thread`] to hand a
//! copy of it to other tasks and threads.

pub mod backtrace;
pub mod builder;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod global;
pub mod journey;
pub mod queue;
pub mod store;
pub mod transport;

/// SDK version reported in events and the user agent.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use builder::{Capture, EventBuilder};
pub use client::{TelemetryClient, TelemetryClientBuilder};
pub use config::{Dsn, OverflowPolicy, RetryPolicy, TelemetryConfig, DEFAULT_MAX_QUEUE_SIZE};
pub use context::{ContextEnterGuard, ContextFork, ContextSnapshot, ContextStore, JourneyPhase};
pub use error::{Result, TelemetrySdkError};
pub use filter::{BeforeSend, EventFilter};
pub use global::{
	add_breadcrumb, capture_error, capture_message, client, flush, init, install, set_extra,
	set_tag, set_user, start_journey, start_step, uninstall, ShutdownGuard,
};
pub use journey::{JourneyGuard, JourneyTracker, StepGuard};
pub use queue::{
	DeliveryFailure, DeliveryQueue, DrainStep, DropReason, Envelope, QueueItem, QueueOptions,
	QueueStats, SendOutcome, Sender,
};
pub use store::QueueStore;
pub use transport::HttpSender;

pub use loom_telemetry_core::{
	Breadcrumb, BreadcrumbCategory, BreadcrumbRing, Clock, EventId, EventKind, ExceptionInfo,
	Frame, Journey, JourneyContext, JourneyId, JourneyStatus, ManualClock, PlatformInfo,
	SeverityLevel, Step, StepId, StepStatus, SystemClock, TelemetryError, TelemetryEvent,
	UserContext,
};
