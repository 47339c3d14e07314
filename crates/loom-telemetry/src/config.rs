// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SDK configuration, DSN parsing and retry policy.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use loom_telemetry_core::{TelemetryError, DEFAULT_MAX_BREADCRUMBS};
use reqwest::Url;
use tracing::{trace, warn};

use crate::filter::BeforeSend;

/// Default in-memory queue capacity.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 500;

const ENV_PREFIX: &str = "LOOM_TELEMETRY_";

/// Parsed collector DSN, e.g. `https://pk_live_abc@telemetry.example.com`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
	pub public_key: String,
	/// `scheme://host[:port]`, without trailing slash.
	pub api_base_url: String,
}

impl FromStr for Dsn {
	type Err = TelemetryError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let url = Url::parse(s).map_err(|e| TelemetryError::InvalidDsn(format!("{s}: {e}")))?;

		let public_key = url.username();
		if !public_key.starts_with("pk_") {
			return Err(TelemetryError::InvalidDsn(
				"DSN must contain a public key starting with pk_".to_string(),
			));
		}

		let host = url
			.host_str()
			.ok_or_else(|| TelemetryError::InvalidDsn(format!("{s}: missing host")))?;
		let api_base_url = match url.port() {
			Some(port) => format!("{}://{host}:{port}", url.scheme()),
			None => format!("{}://{host}", url.scheme()),
		};

		Ok(Self {
			public_key: public_key.to_string(),
			api_base_url,
		})
	}
}

/// What to do with a new event when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
	/// Evict the oldest buffered event to admit the new one.
	#[default]
	DropOldest,
	/// Keep the buffer as is and drop the new event.
	RejectNew,
}

/// Backoff schedule and give-up ceilings for transient delivery failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub backoff_factor: f64,
	/// Fraction of the delay to randomize in either direction (0.2 = ±20%).
	pub jitter: f64,
	/// An item is dropped once it has been attempted this many times.
	pub max_attempts: u32,
	/// An item is dropped once it has been queued this long.
	pub max_age: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(300),
			backoff_factor: 2.0,
			jitter: 0.2,
			max_attempts: 10,
			max_age: Duration::from_secs(24 * 60 * 60),
		}
	}
}

impl RetryPolicy {
	/// Delay before the next attempt, given how many attempts already failed.
	pub fn delay_for(&self, failed_attempts: u32) -> Duration {
		let exponent = failed_attempts.saturating_sub(1).min(63) as i32;
		let exponential_delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
		let capped_delay = exponential_delay.min(self.max_delay.as_secs_f64());

		let final_delay = if self.jitter > 0.0 {
			let jitter_factor = 1.0 + self.jitter * (2.0 * fastrand::f64() - 1.0);
			capped_delay * jitter_factor
		} else {
			capped_delay
		};

		Duration::try_from_secs_f64(final_delay.max(0.0)).unwrap_or(self.max_delay)
	}
}

/// Configuration for the telemetry client.
#[derive(Clone)]
pub struct TelemetryConfig {
	/// Collector DSN. Required unless a custom sender is supplied.
	pub dsn: Option<Dsn>,
	pub environment: String,
	pub app_version: String,
	/// Fraction of events kept, in `[0, 1]`.
	pub sample_rate: f64,
	pub max_breadcrumbs: usize,
	/// Persist buffered events to disk so they survive restarts.
	pub enable_offline_queue: bool,
	pub max_offline_queue_size: usize,
	pub overflow_policy: OverflowPolicy,
	/// Where the offline queue is persisted. Defaults to the local data dir.
	pub queue_path: Option<PathBuf>,
	pub retry: RetryPolicy,
	/// How often connectivity is re-checked while the sender is offline.
	pub offline_poll_interval: Duration,
	pub request_timeout: Duration,
	/// How long async captures wait for room in a full queue.
	pub enqueue_timeout: Duration,
	/// How long the shutdown guard waits for the queue to drain.
	pub shutdown_timeout: Duration,
	pub before_send: Option<Arc<dyn BeforeSend>>,
	/// Emit per-event diagnostic logs.
	pub debug: bool,
}

impl Default for TelemetryConfig {
	fn default() -> Self {
		Self {
			dsn: None,
			environment: "production".to_string(),
			app_version: "0.0.0".to_string(),
			sample_rate: 1.0,
			max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
			enable_offline_queue: true,
			max_offline_queue_size: DEFAULT_MAX_QUEUE_SIZE,
			overflow_policy: OverflowPolicy::default(),
			queue_path: None,
			retry: RetryPolicy::default(),
			offline_poll_interval: Duration::from_secs(5),
			request_timeout: Duration::from_secs(30),
			enqueue_timeout: Duration::from_secs(1),
			shutdown_timeout: Duration::from_secs(5),
			before_send: None,
			debug: false,
		}
	}
}

impl fmt::Debug for TelemetryConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TelemetryConfig")
			.field("dsn", &self.dsn.as_ref().map(|d| &d.api_base_url))
			.field("environment", &self.environment)
			.field("app_version", &self.app_version)
			.field("sample_rate", &self.sample_rate)
			.field("max_breadcrumbs", &self.max_breadcrumbs)
			.field("enable_offline_queue", &self.enable_offline_queue)
			.field("max_offline_queue_size", &self.max_offline_queue_size)
			.field("overflow_policy", &self.overflow_policy)
			.field("queue_path", &self.queue_path)
			.field("retry", &self.retry)
			.field("before_send", &self.before_send.is_some())
			.field("debug", &self.debug)
			.finish_non_exhaustive()
	}
}

impl TelemetryConfig {
	pub fn new() -> Self {
		Self::default()
	}

	/// Parses and sets the DSN.
	pub fn with_dsn(mut self, dsn: &str) -> Result<Self, TelemetryError> {
		self.dsn = Some(dsn.parse()?);
		Ok(self)
	}

	pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
		self.environment = environment.into();
		self
	}

	pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
		self.app_version = version.into();
		self
	}

	pub fn with_sample_rate(mut self, rate: f64) -> Self {
		self.sample_rate = rate;
		self
	}

	pub fn with_max_breadcrumbs(mut self, max: usize) -> Self {
		self.max_breadcrumbs = max;
		self
	}

	pub fn with_offline_queue(mut self, enabled: bool) -> Self {
		self.enable_offline_queue = enabled;
		self
	}

	pub fn with_max_queue_size(mut self, size: usize) -> Self {
		self.max_offline_queue_size = size;
		self
	}

	pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
		self.overflow_policy = policy;
		self
	}

	pub fn with_queue_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.queue_path = Some(path.into());
		self
	}

	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	pub fn with_offline_poll_interval(mut self, interval: Duration) -> Self {
		self.offline_poll_interval = interval;
		self
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = timeout;
		self
	}

	pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
		self.enqueue_timeout = timeout;
		self
	}

	pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
		self.shutdown_timeout = timeout;
		self
	}

	/// Sets the hook that may modify or drop each event before it is queued.
	pub fn with_before_send(mut self, hook: impl BeforeSend + 'static) -> Self {
		self.before_send = Some(Arc::new(hook));
		self
	}

	pub fn with_debug(mut self, debug: bool) -> Self {
		self.debug = debug;
		self
	}

	/// Overlays `LOOM_TELEMETRY_*` environment variables onto this config.
	pub fn from_env(self) -> Result<Self, TelemetryError> {
		self.merge_vars(std::env::vars())
	}

	fn merge_vars(
		mut self,
		vars: impl IntoIterator<Item = (String, String)>,
	) -> Result<Self, TelemetryError> {
		for (key, value) in vars {
			let Some(name) = key.strip_prefix(ENV_PREFIX) else {
				continue;
			};
			trace!(key = %key, "processing env var");

			match name {
				"DSN" => self.dsn = Some(value.parse()?),
				"ENVIRONMENT" => self.environment = value,
				"RELEASE" => self.app_version = value,
				"SAMPLE_RATE" => self.sample_rate = parse_env(&key, &value)?,
				"DEBUG" => self.debug = parse_bool(&key, &value)?,
				"OFFLINE_QUEUE" => self.enable_offline_queue = parse_bool(&key, &value)?,
				"QUEUE_SIZE" => self.max_offline_queue_size = parse_env(&key, &value)?,
				"QUEUE_PATH" => self.queue_path = Some(PathBuf::from(value)),
				_ => {}
			}
		}
		Ok(self)
	}

	/// Normalizes the config and rejects values the pipeline cannot run with.
	///
	/// An out-of-range sample rate is clamped to `[0, 1]` with a warning.
	pub fn validated(mut self) -> Result<Self, TelemetryError> {
		if self.sample_rate.is_nan() {
			return Err(TelemetryError::invalid_config(
				"sample_rate",
				"must be a number between 0 and 1",
			));
		}
		if !(0.0..=1.0).contains(&self.sample_rate) {
			warn!(sample_rate = self.sample_rate, "sample_rate out of range, clamping");
			self.sample_rate = self.sample_rate.clamp(0.0, 1.0);
		}
		if self.max_breadcrumbs == 0 {
			return Err(TelemetryError::invalid_config(
				"max_breadcrumbs",
				"must be at least 1",
			));
		}
		if self.max_offline_queue_size == 0 {
			return Err(TelemetryError::invalid_config(
				"max_offline_queue_size",
				"must be at least 1",
			));
		}
		if self.retry.max_attempts == 0 {
			return Err(TelemetryError::invalid_config(
				"retry.max_attempts",
				"must be at least 1",
			));
		}
		if !(0.0..1.0).contains(&self.retry.jitter) {
			return Err(TelemetryError::invalid_config(
				"retry.jitter",
				"must be in [0, 1)",
			));
		}
		Ok(self)
	}

	/// Resolved location of the persisted queue, if persistence is on.
	pub fn resolved_queue_path(&self) -> Option<PathBuf> {
		if !self.enable_offline_queue {
			return None;
		}
		self
			.queue_path
			.clone()
			.or_else(crate::store::QueueStore::default_path)
	}
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, TelemetryError>
where
	T::Err: fmt::Display,
{
	value
		.trim()
		.parse()
		.map_err(|e: T::Err| TelemetryError::invalid_config(key, e.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, TelemetryError> {
	match value.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		other => Err(TelemetryError::invalid_config(
			key,
			format!("expected a boolean, got {other:?}"),
		)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
	}

	#[test]
	fn parses_dsn() {
		let dsn: Dsn = "https://pk_live_abc@telemetry.example.com".parse().unwrap();
		assert_eq!(dsn.public_key, "pk_live_abc");
		assert_eq!(dsn.api_base_url, "https://telemetry.example.com");
	}

	#[test]
	fn dsn_keeps_explicit_port() {
		let dsn: Dsn = "http://pk_test_1@localhost:8080".parse().unwrap();
		assert_eq!(dsn.api_base_url, "http://localhost:8080");
	}

	#[test]
	fn dsn_requires_public_key() {
		assert!(matches!(
			"https://sk_live_abc@telemetry.example.com".parse::<Dsn>(),
			Err(TelemetryError::InvalidDsn(_))
		));
		assert!(matches!(
			"not a url".parse::<Dsn>(),
			Err(TelemetryError::InvalidDsn(_))
		));
	}

	#[test]
	fn defaults_match_documented_values() {
		let config = TelemetryConfig::default();
		assert_eq!(config.sample_rate, 1.0);
		assert_eq!(config.max_breadcrumbs, 100);
		assert_eq!(config.max_offline_queue_size, 500);
		assert!(config.enable_offline_queue);
		assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
		assert_eq!(config.environment, "production");
	}

	#[test]
	fn validation_clamps_sample_rate() {
		let config = TelemetryConfig::new().with_sample_rate(3.5).validated().unwrap();
		assert_eq!(config.sample_rate, 1.0);

		let config = TelemetryConfig::new().with_sample_rate(-1.0).validated().unwrap();
		assert_eq!(config.sample_rate, 0.0);
	}

	#[test]
	fn validation_rejects_zero_capacities() {
		assert!(TelemetryConfig::new().with_max_breadcrumbs(0).validated().is_err());
		assert!(TelemetryConfig::new().with_max_queue_size(0).validated().is_err());
		assert!(TelemetryConfig::new().with_sample_rate(f64::NAN).validated().is_err());
	}

	#[test]
	fn env_vars_override_defaults() {
		let config = TelemetryConfig::new()
			.merge_vars(vars(&[
				("LOOM_TELEMETRY_DSN", "https://pk_env@collector.local"),
				("LOOM_TELEMETRY_ENVIRONMENT", "staging"),
				("LOOM_TELEMETRY_RELEASE", "2.1.0"),
				("LOOM_TELEMETRY_SAMPLE_RATE", "0.25"),
				("LOOM_TELEMETRY_DEBUG", "true"),
				("LOOM_TELEMETRY_OFFLINE_QUEUE", "off"),
				("LOOM_TELEMETRY_QUEUE_SIZE", "42"),
				("UNRELATED", "ignored"),
			]))
			.unwrap();

		assert_eq!(config.dsn.unwrap().public_key, "pk_env");
		assert_eq!(config.environment, "staging");
		assert_eq!(config.app_version, "2.1.0");
		assert_eq!(config.sample_rate, 0.25);
		assert!(config.debug);
		assert!(!config.enable_offline_queue);
		assert_eq!(config.max_offline_queue_size, 42);
	}

	#[test]
	fn bad_env_value_names_the_variable() {
		let err = TelemetryConfig::new()
			.merge_vars(vars(&[("LOOM_TELEMETRY_SAMPLE_RATE", "lots")]))
			.unwrap_err();
		assert!(err.to_string().contains("LOOM_TELEMETRY_SAMPLE_RATE"));
	}

	#[test]
	fn disabled_offline_queue_has_no_path() {
		let config = TelemetryConfig::new()
			.with_queue_path("/tmp/queue.json")
			.with_offline_queue(false);
		assert!(config.resolved_queue_path().is_none());
	}

	#[test]
	fn delay_grows_exponentially_without_jitter() {
		let policy = RetryPolicy {
			jitter: 0.0,
			..RetryPolicy::default()
		};
		assert_eq!(policy.delay_for(1), Duration::from_secs(1));
		assert_eq!(policy.delay_for(2), Duration::from_secs(2));
		assert_eq!(policy.delay_for(4), Duration::from_secs(8));
	}

	#[test]
	fn delay_respects_max_delay() {
		let policy = RetryPolicy {
			jitter: 0.0,
			max_delay: Duration::from_secs(5),
			..RetryPolicy::default()
		};
		for attempt in 1..100 {
			assert!(policy.delay_for(attempt) <= Duration::from_secs(5));
		}
	}

	#[test]
	fn unbounded_delay_saturates_instead_of_panicking() {
		let policy = RetryPolicy {
			base_delay: Duration::from_secs(u64::MAX / 2),
			max_delay: Duration::MAX,
			backoff_factor: 10.0,
			..RetryPolicy::default()
		};
		for attempt in [1, 2, 10, 64, u32::MAX] {
			assert!(policy.delay_for(attempt) >= Duration::from_secs(u64::MAX / 4));
		}
	}

	#[test]
	fn jitter_stays_within_twenty_percent() {
		let policy = RetryPolicy::default();
		for _ in 0..200 {
			let delay = policy.delay_for(3).as_secs_f64();
			assert!((3.2..=4.8).contains(&delay), "delay {delay} outside ±20% of 4s");
		}
	}
}
