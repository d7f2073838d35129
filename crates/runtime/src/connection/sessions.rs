//! Registry of attached sessions.
//!
//! Uses [`DashMap`] for lock-free concurrent access. Detached sessions stay
//! in the map as tombstones so that their ids are never used to scope another
//! request and late frames for them can be recognised and dropped.
//! Tombstones live as long as the registry unless
//! [`SessionRegistry::purge_detached`] is called, so a long-lived connection
//! that attaches and detaches many targets grows by one small entry per
//! session.
//! Per-target [`Notify`] waiters let callers wait for auto-attached sessions;
//! [`SessionRegistry::wait_for_target`] registers its waiter before checking
//! to prevent lost wakeups.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use cdp_protocol::{SessionId, TargetId};
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// A logical channel to one attached target.
#[derive(Debug)]
pub struct Session {
	id: SessionId,
	target_id: TargetId,
	attached_at: SystemTime,
	detached: AtomicBool,
}

impl Session {
	pub fn id(&self) -> &SessionId {
		&self.id
	}

	pub fn target_id(&self) -> &TargetId {
		&self.target_id
	}

	pub fn attached_at(&self) -> SystemTime {
		self.attached_at
	}

	pub fn is_detached(&self) -> bool {
		self.detached.load(Ordering::Acquire)
	}

	/// Returns true if this call performed the transition.
	fn mark_detached(&self) -> bool {
		!self.detached.swap(true, Ordering::AcqRel)
	}
}

/// Thread-safe registry of sessions by id.
pub struct SessionRegistry {
	sessions: DashMap<SessionId, Arc<Session>>,
	waiters: DashMap<TargetId, Arc<Notify>>,
}

impl Default for SessionRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self {
			sessions: DashMap::new(),
			waiters: DashMap::new(),
		}
	}

	/// Records an attached session and wakes waiters for its target.
	///
	/// Registering an id twice returns the existing entry. A detached id is
	/// never revived; the tombstone is returned so the caller can see it.
	pub fn register(&self, id: SessionId, target_id: TargetId) -> Arc<Session> {
		let session = self
			.sessions
			.entry(id.clone())
			.or_insert_with(|| {
				Arc::new(Session {
					id: id.clone(),
					target_id: target_id.clone(),
					attached_at: SystemTime::now(),
					detached: AtomicBool::new(false),
				})
			})
			.clone();

		if session.is_detached() {
			tracing::warn!(session = %id, "ignoring attach for an already detached session id");
			return session;
		}

		if let Some((_, notify)) = self.waiters.remove(&target_id) {
			notify.notify_waiters();
		}
		tracing::debug!(session = %id, target = %target_id, "session attached");
		session
	}

	/// Resolves the session an outgoing request should be scoped to.
	///
	/// # Errors
	///
	/// [`Error::SessionNotFound`] for unknown and detached ids alike.
	pub fn scope_for(&self, id: &SessionId) -> Result<Arc<Session>> {
		match self.sessions.get(id) {
			Some(session) if !session.is_detached() => Ok(session.value().clone()),
			_ => Err(Error::SessionNotFound(id.clone())),
		}
	}

	pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
		self.sessions.get(id).map(|s| s.value().clone())
	}

	/// Marks a session detached. Returns the session if this call detached it,
	/// `None` if it was unknown or already detached.
	pub fn mark_detached(&self, id: &SessionId) -> Option<Arc<Session>> {
		let session = self.sessions.get(id)?.value().clone();
		if session.mark_detached() {
			tracing::debug!(session = %id, "session detached");
			Some(session)
		} else {
			None
		}
	}

	/// True only for ids that were attached and have since detached.
	pub fn is_detached(&self, id: &SessionId) -> bool {
		self.sessions.get(id).is_some_and(|s| s.is_detached())
	}

	/// Detaches every session. Returns how many were still attached.
	pub fn detach_all(&self) -> usize {
		let count = self
			.sessions
			.iter()
			.filter(|entry| entry.value().mark_detached())
			.count();
		for entry in self.waiters.iter() {
			entry.value().notify_waiters();
		}
		count
	}

	/// Attached (not detached) sessions.
	pub fn active(&self) -> Vec<Arc<Session>> {
		self.sessions
			.iter()
			.filter(|entry| !entry.value().is_detached())
			.map(|entry| entry.value().clone())
			.collect()
	}

	fn find_by_target(&self, target_id: &TargetId) -> Option<Arc<Session>> {
		self.sessions
			.iter()
			.find(|entry| entry.value().target_id() == target_id && !entry.value().is_detached())
			.map(|entry| entry.value().clone())
	}

	/// Waits until a session attached to `target_id` is registered.
	///
	/// Registers the waiter before checking to prevent lost wakeups. The
	/// waiter entry is released on every exit, including when this future is
	/// dropped mid-wait.
	pub async fn wait_for_target(&self, target_id: &TargetId, timeout: Duration) -> Result<Arc<Session>> {
		let deadline = tokio::time::Instant::now() + timeout;

		loop {
			let waiter = WaiterGuard {
				registry: self,
				target_id,
				notify: self
					.waiters
					.entry(target_id.clone())
					.or_insert_with(|| Arc::new(Notify::new()))
					.clone(),
			};
			let notified = waiter.notify.notified();

			if let Some(session) = self.find_by_target(target_id) {
				return Ok(session);
			}

			let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
			if remaining.is_zero() {
				return Err(Error::Timeout(timeout));
			}

			tokio::select! {
				biased;
				_ = notified => {}
				_ = tokio::time::sleep(remaining) => {
					return Err(Error::Timeout(timeout));
				}
			}
		}
	}

	/// Removes detached tombstones and returns how many were dropped.
	///
	/// After a purge a detached id is unknown rather than detached: late
	/// events carrying it are routed instead of dropped, and a new attach may
	/// reuse it.
	pub fn purge_detached(&self) -> usize {
		let mut purged = 0;
		self.sessions.retain(|_, session| {
			let keep = !session.is_detached();
			purged += usize::from(!keep);
			keep
		});
		purged
	}

	/// Number of sessions held, tombstones included.
	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}
}

/// Releases a target's waiter entry when the last waiter holding it leaves.
struct WaiterGuard<'a> {
	registry: &'a SessionRegistry,
	target_id: &'a TargetId,
	notify: Arc<Notify>,
}

impl Drop for WaiterGuard<'_> {
	fn drop(&mut self) {
		// The map and this guard account for two references; more means a
		// concurrent waiter. `remove_if` holds the shard lock, so no waiter can
		// clone the entry while the count is read.
		self.registry.waiters.remove_if(self.target_id, |_, entry| {
			Arc::ptr_eq(entry, &self.notify) && Arc::strong_count(entry) == 2
		});
	}
}
