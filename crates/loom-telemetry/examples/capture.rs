// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Example: Capture errors and messages inside a journey.
//!
//! Run with:
//!   LOOM_TELEMETRY_DSN=https://pk_test_123@localhost:8080 \
//!   RUST_LOG=loom_telemetry=debug cargo run --example capture -p loom-telemetry

use loom_telemetry::{BreadcrumbCategory, SeverityLevel, TelemetryConfig, UserContext};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
#[error("payment provider declined the card")]
struct Declined {
	#[source]
	source: std::io::Error,
}

fn charge(amount_cents: u64) -> Result<(), Declined> {
	if amount_cents > 10_000 {
		return Err(Declined {
			source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "limit exceeded"),
		});
	}
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.init();

	let config = TelemetryConfig::new()
		.with_environment("development")
		.with_app_version("0.1.0-example")
		.with_debug(true)
		.from_env()?;

	let guard = loom_telemetry::init(config)?;
	let Some(client) = loom_telemetry::client() else {
		return Ok(());
	};

	client.set_user(UserContext::new("user_example_123").with_email("example@example.com"));
	client.set_tag("example", "true");
	client.breadcrumb("application started", BreadcrumbCategory::Navigation);

	let journey = client.journey("checkout");
	client.track_step("validate-cart", Some("business"), || Ok::<_, Declined>(()))?;

	if let Err(e) = client.track_step("charge", Some("payment"), || charge(25_000)) {
		match client.capture_error(&e) {
			Some(event_id) => println!("captured error as {event_id}"),
			None => println!("error was sampled out"),
		}
	}
	drop(journey);

	let background = client.spawn({
		let client = client.clone();
		async move {
			client.set_tag("worker", "receipts");
			client.capture_message("receipt email queued", SeverityLevel::Info)
		}
	});
	background.await?;

	println!("pending before shutdown: {}", client.queue_len());
	let drained = guard.shutdown().await;
	println!("shutdown complete, all delivered: {drained}");

	Ok(())
}
