// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Default [`Sender`]: JSON over HTTP to the collector.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::Dsn;
use crate::error::Result;
use crate::queue::{Envelope, SendOutcome, Sender};

const SDK_NAME: &str = "loom-telemetry-rust";
const EVENTS_PATH: &str = "/api/v1/events";
const HEALTH_PATH: &str = "/api/v1/health";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

const RETRYABLE_STATUSES: [StatusCode; 6] = [
	StatusCode::REQUEST_TIMEOUT,
	StatusCode::TOO_MANY_REQUESTS,
	StatusCode::INTERNAL_SERVER_ERROR,
	StatusCode::BAD_GATEWAY,
	StatusCode::SERVICE_UNAVAILABLE,
	StatusCode::GATEWAY_TIMEOUT,
];

/// Posts events to `{api_base_url}/api/v1/events`.
#[derive(Debug, Clone)]
pub struct HttpSender {
	client: Client,
	events_url: String,
	health_url: String,
	public_key: String,
}

impl HttpSender {
	pub fn new(dsn: &Dsn, request_timeout: Duration) -> Result<Self> {
		let client = Client::builder()
			.user_agent(user_agent())
			.timeout(request_timeout)
			.build()?;
		Ok(Self::with_client(client, dsn))
	}

	/// Uses a preconfigured client (proxies, custom TLS).
	pub fn with_client(client: Client, dsn: &Dsn) -> Self {
		let base = dsn.api_base_url.trim_end_matches('/');
		Self {
			client,
			events_url: format!("{base}{EVENTS_PATH}"),
			health_url: format!("{base}{HEALTH_PATH}"),
			public_key: dsn.public_key.clone(),
		}
	}
}

/// `loom-telemetry-rust/{version}`
pub fn user_agent() -> String {
	format!("{SDK_NAME}/{}", crate::SDK_VERSION)
}

fn classify(status: StatusCode) -> SendOutcome {
	if status.is_success() {
		SendOutcome::Delivered
	} else if RETRYABLE_STATUSES.contains(&status) {
		SendOutcome::Transient(format!("collector returned {status}"))
	} else {
		SendOutcome::Permanent(format!("collector returned {status}"))
	}
}

fn classify_error(error: &reqwest::Error) -> SendOutcome {
	if error.is_timeout() || error.is_connect() || error.is_request() {
		SendOutcome::Transient(error.to_string())
	} else if let Some(status) = error.status() {
		classify(status)
	} else {
		SendOutcome::Permanent(error.to_string())
	}
}

#[async_trait::async_trait]
impl Sender for HttpSender {
	async fn send(&self, envelope: &Envelope) -> SendOutcome {
		let response = self
			.client
			.post(&self.events_url)
			.header(reqwest::header::CONTENT_TYPE, "application/json")
			.header("X-Public-Key", &self.public_key)
			.body(envelope.body.clone())
			.send()
			.await;

		match response {
			Ok(response) => {
				let status = response.status();
				debug!(event_id = %envelope.event_id, attempt = envelope.attempt, status = status.as_u16(), "collector responded");
				classify(status)
			}
			Err(e) => classify_error(&e),
		}
	}

	async fn is_online(&self) -> bool {
		match self
			.client
			.get(&self.health_url)
			.timeout(HEALTH_TIMEOUT)
			.send()
			.await
		{
			Ok(response) => response.status() == StatusCode::OK,
			Err(e) => {
				debug!(error = %e, "collector health check failed");
				false
			}
		}
	}
}
