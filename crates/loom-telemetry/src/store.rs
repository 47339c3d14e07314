// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! On-disk persistence for the delivery queue.

use std::path::{Path, PathBuf};

use loom_telemetry_core::TelemetryError;
use tracing::{debug, warn};

use crate::queue::QueueItem;

/// JSON file holding the queue's buffered items.
#[derive(Debug, Clone)]
pub struct QueueStore {
	path: PathBuf,
}

impl QueueStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// `<data_local_dir>/loom/telemetry/queue.json`
	pub fn default_path() -> Option<PathBuf> {
		dirs::data_local_dir().map(|dir| dir.join("loom").join("telemetry").join("queue.json"))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Reads persisted items. A missing file is an empty queue.
	pub fn load(&self) -> Result<Vec<QueueItem>, TelemetryError> {
		let bytes = match std::fs::read(&self.path) {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(e.into()),
		};
		if bytes.is_empty() {
			return Ok(Vec::new());
		}
		let items: Vec<QueueItem> = serde_json::from_slice(&bytes)?;
		debug!(path = %self.path.display(), count = items.len(), "loaded persisted queue");
		Ok(items)
	}

	/// Like [`load`](Self::load), but logs failures and starts empty.
	pub fn load_or_empty(&self) -> Vec<QueueItem> {
		self.load().unwrap_or_else(|e| {
			warn!(path = %self.path.display(), error = %e, "discarding unreadable persisted queue");
			Vec::new()
		})
	}

	/// Replaces the file contents: write to a temp file, then rename.
	pub async fn save(&self, items: &[QueueItem]) -> Result<(), TelemetryError> {
		let json = serde_json::to_vec(items)?;

		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let tmp = self.path.with_extension("json.tmp");
		tokio::fs::write(&tmp, &json).await?;
		tokio::fs::rename(&tmp, &self.path).await?;

		debug!(path = %self.path.display(), count = items.len(), "persisted queue");
		Ok(())
	}

	/// Blocking form of [`save`](Self::save).
	pub fn save_blocking(&self, items: &[QueueItem]) -> Result<(), TelemetryError> {
		let json = serde_json::to_vec(items)?;

		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let tmp = self.path.with_extension("json.tmp");
		std::fs::write(&tmp, &json)?;
		std::fs::rename(&tmp, &self.path)?;

		debug!(path = %self.path.display(), count = items.len(), "persisted queue");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use loom_telemetry_core::{EventId, EventKind, PlatformInfo, SeverityLevel, TelemetryEvent};
	use std::collections::HashMap;
	use tempfile::tempdir;

	fn item(seq: u64) -> QueueItem {
		let event = TelemetryEvent {
			event_id: EventId::new(),
			timestamp: Utc::now(),
			kind: EventKind::Message,
			level: SeverityLevel::Info,
			message: Some(format!("event {seq}")),
			exception: Vec::new(),
			environment: "test".to_string(),
			app_version: "0.0.0".to_string(),
			platform: PlatformInfo::rust("0.1.0"),
			user: None,
			tags: HashMap::new(),
			extra: HashMap::new(),
			journey: None,
			breadcrumbs: Vec::new(),
		};
		QueueItem::new(event, Utc::now(), seq)
	}

	#[test]
	fn missing_file_loads_empty() {
		let dir = tempdir().unwrap();
		let store = QueueStore::new(dir.path().join("nope.json"));
		assert!(store.load().unwrap().is_empty());
	}

	#[tokio::test]
	async fn save_then_load_preserves_order() {
		let dir = tempdir().unwrap();
		let store = QueueStore::new(dir.path().join("nested").join("queue.json"));
		let items = vec![item(0), item(1), item(2)];

		store.save(&items).await.unwrap();
		let loaded = store.load().unwrap();

		assert_eq!(loaded.len(), 3);
		for (saved, loaded) in items.iter().zip(&loaded) {
			assert_eq!(saved.event.event_id, loaded.event.event_id);
		}
		assert!(!store.path().with_extension("json.tmp").exists());
	}

	#[test]
	fn blocking_save_replaces_previous_contents() {
		let dir = tempdir().unwrap();
		let store = QueueStore::new(dir.path().join("queue.json"));

		store.save_blocking(&[item(0), item(1), item(2)]).unwrap();
		store.save_blocking(&[item(3)]).unwrap();

		let loaded = store.load().unwrap();
		assert_eq!(loaded.len(), 1);
		assert_eq!(loaded[0].event.message.as_deref(), Some("event 3"));
	}

	#[test]
	fn corrupt_file_is_an_error_but_load_or_empty_recovers() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("queue.json");
		std::fs::write(&path, b"{not json").unwrap();
		let store = QueueStore::new(&path);

		assert!(matches!(store.load(), Err(TelemetryError::Serialization(_))));
		assert!(store.load_or_empty().is_empty());
	}

	#[test]
	fn default_path_ends_with_queue_file() {
		if let Some(path) = QueueStore::default_path() {
			assert!(path.ends_with("loom/telemetry/queue.json"));
		}
	}
}
