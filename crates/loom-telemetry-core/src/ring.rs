// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Thread-safe bounded ring of breadcrumbs.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::breadcrumb::Breadcrumb;

/// Default ring capacity.
pub const DEFAULT_MAX_BREADCRUMBS: usize = 100;

/// A bounded, ordered trail of recent breadcrumbs.
///
/// When the ring is full the oldest breadcrumb is evicted to make room.
/// Clones share the same underlying trail.
#[derive(Clone)]
pub struct BreadcrumbRing {
	inner: Arc<BreadcrumbRingInner>,
}

struct BreadcrumbRingInner {
	entries: RwLock<VecDeque<Breadcrumb>>,
	capacity: usize,
}

impl BreadcrumbRing {
	/// Creates a ring holding at most `capacity` breadcrumbs (at least one).
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			inner: Arc::new(BreadcrumbRingInner {
				entries: RwLock::new(VecDeque::with_capacity(capacity)),
				capacity,
			}),
		}
	}

	/// Appends a breadcrumb, evicting the oldest one if the ring is full.
	pub fn add(&self, breadcrumb: Breadcrumb) {
		let mut entries = self.inner.entries.write();
		if entries.len() >= self.inner.capacity {
			entries.pop_front();
		}
		entries.push_back(breadcrumb);
	}

	/// Returns a copy of the trail, oldest first.
	pub fn snapshot(&self) -> Vec<Breadcrumb> {
		self.inner.entries.read().iter().cloned().collect()
	}

	pub fn clear(&self) {
		self.inner.entries.write().clear();
	}

	pub fn len(&self) -> usize {
		self.inner.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.entries.read().is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.inner.capacity
	}
}

impl Default for BreadcrumbRing {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_BREADCRUMBS)
	}
}

impl std::fmt::Debug for BreadcrumbRing {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BreadcrumbRing")
			.field("len", &self.len())
			.field("capacity", &self.inner.capacity)
			.finish()
	}
}
