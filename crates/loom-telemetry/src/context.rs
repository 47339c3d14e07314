// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-execution-context state: user, tags, extras and the journey stack.
//!
//! The caller's context is resolved in this order:
//!
//! 1. a context bound to the running future by [`ContextStore::scope`],
//!    [`ContextStore::bind`] or [`ContextStore::spawn`], which follows it
//!    across `.await` points and worker threads;
//! 2. a context entered on the current thread with
//!    [`ContextStore::enter_thread`];
//! 3. for a tokio task spawned without a bound context, a context of its
//!    own keyed by task id, created empty on first write;
//! 4. otherwise the thread's own context, created empty on first write.
//!
//! Child contexts start as a copy of their parent and diverge afterwards.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use loom_telemetry_core::{Journey, JourneyContext, UserContext};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::journey::OpenJourney;

pub(crate) type ContextHandle = Arc<Mutex<ContextState>>;

/// Upper bound on contexts kept for tasks spawned without a bound context.
pub(crate) const MAX_UNSCOPED_TASK_CONTEXTS: usize = 4096;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Finished tasks cannot be observed, so entries leave only by eviction.
static UNSCOPED_TASKS: Mutex<Option<UnscopedTasks>> = parking_lot::const_mutex(None);
static EVICTION_WARNED: AtomicBool = AtomicBool::new(false);

tokio::task_local! {
	static TASK_CONTEXTS: Vec<BoundContext>;
}

thread_local! {
	static ENTERED_CONTEXTS: RefCell<HashMap<u64, ContextHandle>> = RefCell::new(HashMap::new());
	static THREAD_CONTEXTS: RefCell<HashMap<u64, ContextHandle>> = RefCell::new(HashMap::new());
}

type TaskKey = (u64, tokio::task::Id);

#[derive(Default)]
struct UnscopedTasks {
	contexts: HashMap<TaskKey, ContextHandle>,
	/// Insertion order, oldest first.
	order: VecDeque<TaskKey>,
}

impl UnscopedTasks {
	fn get_or_create(&mut self, key: TaskKey) -> ContextHandle {
		if let Some(handle) = self.contexts.get(&key) {
			return Arc::clone(handle);
		}
		while self.contexts.len() >= MAX_UNSCOPED_TASK_CONTEXTS {
			let Some(oldest) = self.order.pop_front() else {
				break;
			};
			self.contexts.remove(&oldest);
			if !EVICTION_WARNED.swap(true, Ordering::Relaxed) {
				warn!(
					limit = MAX_UNSCOPED_TASK_CONTEXTS,
					"too many tokio tasks with their own telemetry context, evicting the oldest; \
					 spawn tasks through the client's scope or spawn to bind a context instead"
				);
			}
		}
		let handle = Arc::new(Mutex::new(ContextState::default()));
		self.contexts.insert(key, Arc::clone(&handle));
		self.order.push_back(key);
		handle
	}
}

#[derive(Clone)]
struct BoundContext {
	store_id: u64,
	handle: ContextHandle,
}

/// Mutable state of one execution context.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContextState {
	pub(crate) user: Option<UserContext>,
	pub(crate) tags: HashMap<String, String>,
	pub(crate) extras: HashMap<String, serde_json::Value>,
	/// Innermost journey last.
	pub(crate) journeys: Vec<OpenJourney>,
}

impl ContextState {
	pub(crate) fn snapshot(&self) -> ContextSnapshot {
		ContextSnapshot {
			user: self.user.clone(),
			tags: self.tags.clone(),
			extras: self.extras.clone(),
			journeys: self.journeys.iter().map(|o| o.journey.clone()).collect(),
			journey: self.journey_context(),
			phase: self.phase(),
		}
	}
}

/// Where the active context is in the journey lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JourneyPhase {
	#[default]
	Idle,
	JourneyOpen,
	StepOpen,
}

/// Value copy of a context at one point in time.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
	pub user: Option<UserContext>,
	pub tags: HashMap<String, String>,
	pub extras: HashMap<String, serde_json::Value>,
	/// Open journeys, outermost first. Includes implicit journeys.
	pub journeys: Vec<Journey>,
	/// What an event captured now would carry.
	pub journey: Option<JourneyContext>,
	phase: JourneyPhase,
}

impl ContextSnapshot {
	pub fn phase(&self) -> JourneyPhase {
		self.phase
	}

	/// The innermost open journey.
	pub fn active_journey(&self) -> Option<&Journey> {
		self.journeys.last()
	}

	/// The user an event captured now is attributed to: the innermost open
	/// journey's user if one was set, else the context's.
	pub fn event_user(&self) -> Option<&UserContext> {
		self.journeys
			.iter()
			.rev()
			.find_map(|journey| journey.user.as_ref())
			.or(self.user.as_ref())
	}
}

/// A copy of a context, ready to be bound to another task or thread.
pub struct ContextFork {
	store_id: u64,
	handle: ContextHandle,
}

/// Restores the thread's previous context when dropped.
#[must_use = "the context is only entered while the guard is alive"]
pub struct ContextEnterGuard {
	store_id: u64,
	previous: Option<ContextHandle>,
	_not_send: PhantomData<*const ()>,
}

impl Drop for ContextEnterGuard {
	fn drop(&mut self) {
		let store_id = self.store_id;
		let previous = self.previous.take();
		let _ = ENTERED_CONTEXTS.try_with(|contexts| {
			let mut contexts = contexts.borrow_mut();
			match previous {
				Some(handle) => {
					contexts.insert(store_id, handle);
				}
				None => {
					contexts.remove(&store_id);
				}
			}
		});
	}
}

/// Resolves and propagates execution contexts for one client.
///
/// Clones share the same id and therefore the same contexts. Two separate
/// stores never see each other's state.
#[derive(Debug, Clone)]
pub struct ContextStore {
	id: u64,
}

impl Default for ContextStore {
	fn default() -> Self {
		Self::new()
	}
}

impl ContextStore {
	pub fn new() -> Self {
		Self {
			id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
		}
	}

	fn bound(&self) -> Option<ContextHandle> {
		let bound = TASK_CONTEXTS
			.try_with(|bindings| {
				bindings
					.iter()
					.find(|b| b.store_id == self.id)
					.map(|b| Arc::clone(&b.handle))
			})
			.ok()
			.flatten();
		bound.or_else(|| {
			ENTERED_CONTEXTS
				.try_with(|contexts| contexts.borrow().get(&self.id).cloned())
				.ok()
				.flatten()
		})
	}

	/// Handle to the caller's context if one exists yet. Never creates one.
	fn lookup(&self) -> Option<ContextHandle> {
		if let Some(handle) = self.bound() {
			return Some(handle);
		}
		if let Some(task) = tokio::task::try_id() {
			let tasks = UNSCOPED_TASKS.lock();
			return tasks
				.as_ref()
				.and_then(|tasks| tasks.contexts.get(&(self.id, task)).cloned());
		}
		THREAD_CONTEXTS
			.try_with(|contexts| contexts.borrow().get(&self.id).cloned())
			.ok()
			.flatten()
	}

	/// Handle to the context of the caller, created on first use.
	pub(crate) fn handle(&self) -> ContextHandle {
		if let Some(handle) = self.bound() {
			return handle;
		}
		if let Some(task) = tokio::task::try_id() {
			return UNSCOPED_TASKS
				.lock()
				.get_or_insert_with(UnscopedTasks::default)
				.get_or_create((self.id, task));
		}

		THREAD_CONTEXTS
			.try_with(|contexts| {
				Arc::clone(
					contexts
						.borrow_mut()
						.entry(self.id)
						.or_insert_with(|| Arc::new(Mutex::new(ContextState::default()))),
				)
			})
			// Thread-local storage is gone during thread teardown.
			.unwrap_or_else(|_| Arc::new(Mutex::new(ContextState::default())))
	}

	pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> R {
		let handle = self.handle();
		let mut state = handle.lock();
		f(&mut state)
	}

	pub fn current(&self) -> ContextSnapshot {
		match self.lookup() {
			Some(handle) => handle.lock().snapshot(),
			None => ContextSnapshot::default(),
		}
	}

	pub fn set_user(&self, user: UserContext) {
		self.with_state(|state| state.user = Some(user));
	}

	pub fn clear_user(&self) {
		self.with_state(|state| state.user = None);
	}

	pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
		let (key, value) = (key.into(), value.into());
		self.with_state(|state| {
			state.tags.insert(key, value);
		});
	}

	pub fn remove_tag(&self, key: &str) {
		self.with_state(|state| {
			state.tags.remove(key);
		});
	}

	pub fn set_extra(&self, key: impl Into<String>, value: serde_json::Value) {
		let key = key.into();
		self.with_state(|state| {
			state.extras.insert(key, value);
		});
	}

	/// Copies the caller's context for use elsewhere.
	pub fn fork(&self) -> ContextFork {
		let state = self
			.lookup()
			.map(|handle| handle.lock().clone())
			.unwrap_or_default();
		ContextFork {
			store_id: self.id,
			handle: Arc::new(Mutex::new(state)),
		}
	}

	/// Runs `fut` with a fork of the caller's context bound to it.
	pub fn scope<F>(&self, fut: F) -> impl Future<Output = F::Output>
	where
		F: Future,
	{
		self.bind(self.fork(), fut)
	}

	/// Runs `fut` with the given fork bound to it.
	pub fn bind<F>(&self, fork: ContextFork, fut: F) -> impl Future<Output = F::Output>
	where
		F: Future,
	{
		let mut bindings = TASK_CONTEXTS
			.try_with(|bindings| bindings.clone())
			.unwrap_or_default();
		bindings.retain(|b| b.store_id != fork.store_id);
		bindings.push(BoundContext {
			store_id: fork.store_id,
			handle: fork.handle,
		});
		TASK_CONTEXTS.scope(bindings, fut)
	}

	/// `tokio::spawn` of a future scoped to a fork of the caller's context.
	pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		tokio::spawn(self.scope(fut))
	}

	/// Makes `fork` the current thread's context until the guard is dropped.
	pub fn enter_thread(&self, fork: ContextFork) -> ContextEnterGuard {
		let store_id = fork.store_id;
		let previous = ENTERED_CONTEXTS
			.try_with(|contexts| contexts.borrow_mut().insert(store_id, fork.handle))
			.ok()
			.flatten();
		ContextEnterGuard {
			store_id,
			previous,
			_not_send: PhantomData,
		}
	}

	/// Starts an OS thread whose context is a fork of the caller's.
	pub fn spawn_thread<F, T>(&self, f: F) -> std::io::Result<std::thread::JoinHandle<T>>
	where
		F: FnOnce() -> T + Send + 'static,
		T: Send + 'static,
	{
		let fork = self.fork();
		let store = self.clone();
		std::thread::Builder::new().spawn(move || {
			let _entered = store.enter_thread(fork);
			f()
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::time::Duration;

	#[test]
	fn thread_context_starts_empty() {
		let store = ContextStore::new();
		let snapshot = store.current();
		assert!(snapshot.user.is_none());
		assert!(snapshot.tags.is_empty());
		assert_eq!(snapshot.phase(), JourneyPhase::Idle);
	}

	#[test]
	fn stores_are_isolated() {
		let a = ContextStore::new();
		let b = ContextStore::new();
		a.set_tag("plan", "pro");
		assert!(b.current().tags.is_empty());
		assert_eq!(a.current().tags.get("plan").map(String::as_str), Some("pro"));
	}

	#[test]
	fn setters_mutate_current_context() {
		let store = ContextStore::new();
		store.set_user(UserContext::new("u1").with_email("u1@example.com"));
		store.set_tag("region", "eu");
		store.set_extra("cart_size", json!(3));
		store.remove_tag("missing");

		let snapshot = store.current();
		assert_eq!(snapshot.user.as_ref().map(|u| u.id.as_str()), Some("u1"));
		assert_eq!(snapshot.extras["cart_size"], json!(3));

		store.clear_user();
		store.remove_tag("region");
		let snapshot = store.current();
		assert!(snapshot.user.is_none());
		assert!(snapshot.tags.is_empty());
	}

	#[test]
	fn spawned_thread_inherits_a_copy() {
		let store = ContextStore::new();
		store.set_tag("origin", "parent");

		let child_store = store.clone();
		let seen = store
			.spawn_thread(move || {
				let inherited = child_store.current().tags.get("origin").cloned();
				child_store.set_tag("origin", "child");
				inherited
			})
			.unwrap()
			.join()
			.unwrap();

		assert_eq!(seen.as_deref(), Some("parent"));
		assert_eq!(
			store.current().tags.get("origin").map(String::as_str),
			Some("parent")
		);
	}

	#[test]
	fn enter_guard_restores_previous_context() {
		let store = ContextStore::new();
		store.set_tag("who", "outer");
		let fork = store.fork();
		store.set_tag("who", "changed");

		{
			let _guard = store.enter_thread(fork);
			assert_eq!(store.current().tags["who"], "outer");
			store.set_tag("who", "inside");
		}

		assert_eq!(store.current().tags["who"], "changed");
	}

	#[tokio::test]
	async fn scoped_future_keeps_its_context_across_awaits() {
		let store = ContextStore::new();
		store.set_tag("req", "1");

		let inner = store.clone();
		store
			.scope(async move {
				inner.set_tag("req", "2");
				tokio::task::yield_now().await;
				assert_eq!(inner.current().tags["req"], "2");
			})
			.await;

		assert_eq!(store.current().tags["req"], "1");
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn concurrent_tasks_never_see_each_other() {
		let store = ContextStore::new();
		let mut handles = Vec::new();
		for i in 0..16 {
			let store = store.clone();
			let task_store = store.clone();
			handles.push(store.spawn(async move {
				let id = format!("user-{i}");
				task_store.set_user(UserContext::new(id.clone()));
				task_store.set_tag("worker", id.clone());
				for _ in 0..10 {
					tokio::task::yield_now().await;
					let snapshot = task_store.current();
					assert_eq!(snapshot.user.unwrap().id, id);
					assert_eq!(snapshot.tags["worker"], id);
				}
			}));
		}
		for handle in handles {
			handle.await.unwrap();
		}
	}

	async fn set_then_read_user(store: ContextStore, id: &'static str, hold: Duration) -> Option<String> {
		store.set_user(UserContext::new(id));
		tokio::time::sleep(hold).await;
		store.current().user.map(|u| u.id)
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn plain_spawned_tasks_get_their_own_context() {
		let store = ContextStore::new();
		let alice = tokio::spawn(set_then_read_user(store.clone(), "alice", Duration::from_millis(20)));
		tokio::time::sleep(Duration::from_millis(5)).await;
		let bob = tokio::spawn(set_then_read_user(store.clone(), "bob", Duration::ZERO));

		assert_eq!(bob.await.unwrap().as_deref(), Some("bob"));
		assert_eq!(alice.await.unwrap().as_deref(), Some("alice"));
		assert!(store.current().user.is_none());
	}

	#[tokio::test]
	async fn plain_spawned_tasks_on_one_thread_do_not_share() {
		let store = ContextStore::new();
		let alice = tokio::spawn(set_then_read_user(store.clone(), "alice", Duration::from_millis(20)));
		let bob = tokio::spawn(set_then_read_user(store.clone(), "bob", Duration::from_millis(5)));

		assert_eq!(alice.await.unwrap().as_deref(), Some("alice"));
		assert_eq!(bob.await.unwrap().as_deref(), Some("bob"));
	}

	#[tokio::test]
	async fn plain_spawned_task_starts_empty_and_reads_do_not_allocate() {
		let store = ContextStore::new();
		store.set_tag("owner", "test body");

		let task_store = store.clone();
		let seen = tokio::spawn(async move {
			let before = task_store.current();
			let fork = task_store.fork();
			let exists = task_store.lookup().is_some();
			drop(fork);
			(before.tags.is_empty(), exists)
		})
		.await
		.unwrap();

		assert_eq!(seen, (true, false));
		assert_eq!(store.current().tags["owner"], "test body");
	}

	#[tokio::test]
	async fn entered_context_wins_inside_blocking_tasks() {
		let store = ContextStore::new();
		store.set_tag("who", "caller");
		let fork = store.fork();

		let task_store = store.clone();
		let seen = tokio::task::spawn_blocking(move || {
			let _entered = task_store.enter_thread(fork);
			task_store.set_tag("step", "blocking");
			let snapshot = task_store.current();
			(snapshot.tags["who"].clone(), snapshot.tags["step"].clone())
		})
		.await
		.unwrap();

		assert_eq!(seen, ("caller".to_string(), "blocking".to_string()));
		assert!(!store.current().tags.contains_key("step"));
	}

	#[tokio::test]
	async fn nested_scopes_for_different_stores_coexist() {
		let a = ContextStore::new();
		let b = ContextStore::new();
		a.set_tag("store", "a");

		let (a2, b2) = (a.clone(), b.clone());
		a.scope(async move {
			let (a3, b3) = (a2.clone(), b2.clone());
			b2.scope(async move {
				b3.set_tag("store", "b");
				assert_eq!(a3.current().tags["store"], "a");
				assert_eq!(b3.current().tags["store"], "b");
			})
			.await;
		})
		.await;
	}
}
