// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turns a capture request into a fully enriched event.

use std::error::Error as StdError;
use std::sync::Arc;

use loom_telemetry_core::{
	BreadcrumbRing, Clock, EventId, EventKind, ExceptionInfo, PlatformInfo, SeverityLevel,
	TelemetryEvent,
};

use crate::backtrace::capture_frames;
use crate::context::ContextStore;

/// What the application asked to capture.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
	/// An error chain, outermost first.
	Exception {
		chain: Vec<ExceptionInfo>,
		level: SeverityLevel,
	},
	Message {
		message: String,
		level: SeverityLevel,
	},
}

impl Capture {
	/// Captures an error and its `source()` chain at level error.
	///
	/// The outermost link gets the frames of the caller's stack when
	/// backtraces are enabled.
	pub fn from_error<E>(error: &E) -> Self
	where
		E: StdError + 'static,
	{
		let mut chain = ExceptionInfo::chain_from_error(error);
		if let Some(first) = chain.first_mut() {
			first.frames = capture_frames();
		}
		Capture::Exception {
			chain,
			level: SeverityLevel::Error,
		}
	}

	pub fn exception(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
		Capture::Exception {
			chain: vec![ExceptionInfo::new(exception_type, message)],
			level: SeverityLevel::Error,
		}
	}

	pub fn message(message: impl Into<String>, level: SeverityLevel) -> Self {
		Capture::Message {
			message: message.into(),
			level,
		}
	}

	pub fn with_level(mut self, new_level: SeverityLevel) -> Self {
		match &mut self {
			Capture::Exception { level, .. } | Capture::Message { level, .. } => *level = new_level,
		}
		self
	}
}

/// Assembles events from the caller's context and the breadcrumb trail.
#[derive(Clone)]
pub struct EventBuilder {
	store: ContextStore,
	ring: BreadcrumbRing,
	clock: Arc<dyn Clock>,
	environment: String,
	app_version: String,
	platform: PlatformInfo,
}

impl EventBuilder {
	pub fn new(
		store: ContextStore,
		ring: BreadcrumbRing,
		clock: Arc<dyn Clock>,
		environment: impl Into<String>,
		app_version: impl Into<String>,
	) -> Self {
		Self {
			store,
			ring,
			clock,
			environment: environment.into(),
			app_version: app_version.into(),
			platform: PlatformInfo::rust(crate::SDK_VERSION),
		}
	}

	/// Builds an event. Never fails; missing context leaves fields empty.
	pub fn build(&self, capture: Capture) -> TelemetryEvent {
		let context = self.store.current();
		let user = context.event_user().cloned();

		let (kind, level, message, exception) = match capture {
			Capture::Exception { chain, level } => {
				let message = chain.first().map(|e| e.message.clone());
				(EventKind::Exception, level, message, chain)
			}
			Capture::Message { message, level } => {
				(EventKind::Message, level, Some(message), Vec::new())
			}
		};

		TelemetryEvent {
			event_id: EventId::new(),
			timestamp: self.clock.now(),
			kind,
			level,
			message,
			exception,
			environment: self.environment.clone(),
			app_version: self.app_version.clone(),
			platform: self.platform.clone(),
			user,
			tags: context.tags,
			extra: context.extras,
			journey: context.journey,
			breadcrumbs: self.ring.snapshot(),
		}
	}
}
