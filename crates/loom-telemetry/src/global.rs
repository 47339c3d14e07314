// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Process-wide client installed explicitly by the application.
//!
//! ```ignore
//! let _telemetry = loom_telemetry::init(TelemetryConfig::new().from_env()?)?;
//! loom_telemetry::capture_message("started", SeverityLevel::Info);
//! // dropping the guard flushes and uninstalls the client
//! ```

use std::error::Error as StdError;
use std::time::Duration;

use loom_telemetry_core::{
	Breadcrumb, EventId, JourneyId, SeverityLevel, StepId, UserContext,
};
use parking_lot::{const_rwlock, RwLock};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{info, warn};

use crate::client::TelemetryClient;
use crate::config::TelemetryConfig;
use crate::error::Result;

static CLIENT: RwLock<Option<TelemetryClient>> = const_rwlock(None);

/// Builds a client from `config` and installs it.
pub fn init(config: TelemetryConfig) -> Result<ShutdownGuard> {
	let client = TelemetryClient::builder().config(config).build()?;
	install(client.clone());
	Ok(ShutdownGuard {
		client: Some(client),
	})
}

/// Installs a prebuilt client, returning the one it replaces.
pub fn install(client: TelemetryClient) -> Option<TelemetryClient> {
	let previous = CLIENT.write().replace(client);
	if previous.is_some() {
		warn!("replacing an already installed telemetry client");
	}
	previous
}

/// Removes the installed client.
pub fn uninstall() -> Option<TelemetryClient> {
	CLIENT.write().take()
}

/// The installed client, if any.
pub fn client() -> Option<TelemetryClient> {
	CLIENT.read().clone()
}

fn with_client<R>(operation: &str, f: impl FnOnce(&TelemetryClient) -> R) -> Option<R> {
	match client() {
		Some(client) => Some(f(&client)),
		None => {
			warn!(operation, "no telemetry client installed");
			None
		}
	}
}

pub fn capture_error<E>(error: &E) -> Option<EventId>
where
	E: StdError + 'static,
{
	with_client("capture_error", |c| c.capture_error(error)).flatten()
}

pub fn capture_message(message: impl Into<String>, level: SeverityLevel) -> Option<EventId> {
	with_client("capture_message", |c| c.capture_message(message, level)).flatten()
}

pub fn add_breadcrumb(breadcrumb: Breadcrumb) {
	with_client("add_breadcrumb", |c| c.add_breadcrumb(breadcrumb));
}

pub fn set_user(user: UserContext) {
	with_client("set_user", |c| c.set_user(user));
}

pub fn set_tag(key: impl Into<String>, value: impl Into<String>) {
	with_client("set_tag", |c| c.set_tag(key, value));
}

pub fn set_extra(key: impl Into<String>, value: serde_json::Value) {
	with_client("set_extra", |c| c.set_extra(key, value));
}

pub fn start_journey(name: impl Into<String>) -> Option<JourneyId> {
	with_client("start_journey", |c| c.start_journey(name))
}

pub fn start_step(name: impl Into<String>, category: Option<&str>) -> Option<StepId> {
	with_client("start_step", |c| c.start_step(name, category))
}

/// Flushes the installed client. `false` when none is installed.
pub async fn flush(timeout: Duration) -> bool {
	match client() {
		Some(client) => client.flush(timeout).await,
		None => {
			warn!(operation = "flush", "no telemetry client installed");
			false
		}
	}
}

/// Flushes and uninstalls the client when dropped.
///
/// Dropping inside a current-thread tokio runtime cannot block on delivery;
/// call [`ShutdownGuard::shutdown`] there instead.
#[must_use = "dropping the guard immediately shuts telemetry down"]
pub struct ShutdownGuard {
	client: Option<TelemetryClient>,
}

impl ShutdownGuard {
	pub fn client(&self) -> Option<&TelemetryClient> {
		self.client.as_ref()
	}

	/// Async shutdown. Returns whether everything was delivered.
	pub async fn shutdown(mut self) -> bool {
		let Some(client) = self.release() else {
			return true;
		};
		client.shutdown(client.config().shutdown_timeout).await
	}

	fn release(&mut self) -> Option<TelemetryClient> {
		let client = self.client.take()?;
		let mut installed = CLIENT.write();
		if installed.as_ref().is_some_and(|c| c.same_client(&client)) {
			installed.take();
		}
		Some(client)
	}
}

impl Drop for ShutdownGuard {
	fn drop(&mut self) {
		let Some(client) = self.release() else {
			return;
		};
		let timeout = client.config().shutdown_timeout;

		let drained = match Handle::try_current() {
			Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
				tokio::task::block_in_place(|| handle.block_on(client.shutdown(timeout)))
			}
			Ok(_) => {
				warn!("telemetry guard dropped on a current-thread runtime, skipping flush");
				let queue_len = client.queue_len();
				client.shutdown_blocking(Duration::ZERO);
				queue_len == 0
			}
			Err(_) => client.shutdown_blocking(timeout),
		};
		info!(drained, "telemetry shut down");
	}
}
