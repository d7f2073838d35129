//! Correlation of outgoing requests with their responses.
//!
//! Every request gets a fresh id from a per-connection counter and a
//! [`PendingCall`] registered *before* the frame is written, so a response
//! can never arrive for an id the registry has not seen yet. Each entry is
//! removed exactly once: by its response, by connection shutdown, by its
//! session detaching, or by the caller giving up.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use cdp_protocol::{Response, SessionId};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

type Outcome = Result<Response>;

struct Entry {
	tx: oneshot::Sender<Outcome>,
	method: Arc<str>,
	session: Option<SessionId>,
}

#[derive(Default)]
struct Inner {
	pending: HashMap<u64, Entry>,
	closed: bool,
}

/// Map of in-flight request ids to their waiting callers.
pub struct CallRegistry {
	next_id: AtomicU64,
	inner: Mutex<Inner>,
}

impl Default for CallRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl CallRegistry {
	pub fn new() -> Self {
		Self {
			next_id: AtomicU64::new(1),
			inner: Mutex::new(Inner::default()),
		}
	}

	/// Allocates the next correlation id. Ids start at 1 and are never reused.
	pub fn next_id(&self) -> u64 {
		self.next_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Registers a call before its request is written.
	///
	/// # Errors
	///
	/// Returns [`Error::ConnectionClosed`] once the registry has been shut down.
	pub fn register(
		self: &Arc<Self>,
		id: u64,
		method: &str,
		session: Option<SessionId>,
	) -> Result<PendingCall> {
		let (tx, rx) = oneshot::channel();
		let method: Arc<str> = Arc::from(method);

		let mut inner = self.inner.lock();
		if inner.closed {
			return Err(Error::ConnectionClosed);
		}
		inner.pending.insert(
			id,
			Entry {
				tx,
				method: Arc::clone(&method),
				session,
			},
		);
		drop(inner);

		Ok(PendingCall {
			id,
			method,
			created_at: Instant::now(),
			rx,
			guard: CancelGuard {
				id,
				calls: Arc::clone(self),
				completed: false,
			},
		})
	}

	/// Hands a response to its caller.
	///
	/// Returns `false` if no call with that id is pending (never issued,
	/// already resolved, or cancelled); the response is dropped.
	pub fn resolve(&self, id: u64, response: Response) -> bool {
		let Some(entry) = self.inner.lock().pending.remove(&id) else {
			return false;
		};
		tracing::trace!(id, method = %entry.method, "resolved pending call");
		let _ = entry.tx.send(Ok(response));
		true
	}

	/// Removes a call without resolving it. Returns `false` if it was not pending.
	pub fn cancel(&self, id: u64) -> bool {
		self.inner.lock().pending.remove(&id).is_some()
	}

	/// Fails every pending call with [`Error::ConnectionClosed`] and refuses new ones.
	///
	/// Returns the number of calls failed.
	pub fn fail_all(&self) -> usize {
		let drained: Vec<Entry> = {
			let mut inner = self.inner.lock();
			inner.closed = true;
			inner.pending.drain().map(|(_, entry)| entry).collect()
		};
		let count = drained.len();
		for entry in drained {
			let _ = entry.tx.send(Err(Error::ConnectionClosed));
		}
		count
	}

	/// Fails the calls scoped to `session` with [`Error::SessionDetached`].
	pub fn fail_session(&self, session: &SessionId) -> usize {
		let drained: Vec<Entry> = {
			let mut inner = self.inner.lock();
			let ids: Vec<u64> = inner
				.pending
				.iter()
				.filter(|(_, entry)| entry.session.as_ref() == Some(session))
				.map(|(id, _)| *id)
				.collect();
			ids.into_iter()
				.filter_map(|id| inner.pending.remove(&id))
				.collect()
		};
		let count = drained.len();
		for entry in drained {
			let _ = entry.tx.send(Err(Error::SessionDetached(session.clone())));
		}
		count
	}

	pub fn pending_count(&self) -> usize {
		self.inner.lock().pending.len()
	}

	pub fn is_pending(&self, id: u64) -> bool {
		self.inner.lock().pending.contains_key(&id)
	}
}

/// Removes the registry entry when a [`PendingCall`] is dropped unresolved.
struct CancelGuard {
	id: u64,
	calls: Arc<CallRegistry>,
	completed: bool,
}

impl CancelGuard {
	fn complete(&mut self) {
		self.completed = true;
	}
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}
		if self.calls.cancel(self.id) {
			tracing::debug!(id = self.id, "CancelGuard: removed abandoned call");
		}
	}
}

/// Handle to an in-flight request.
///
/// Awaiting it directly yields the response without any cancellation source
/// other than connection shutdown; [`wait`](Self::wait) and
/// [`wait_timeout`](Self::wait_timeout) race the response against a token or
/// a deadline. Dropping the handle unregisters the call, and a response
/// arriving afterwards is discarded.
///
/// A protocol-level `error` envelope is *not* an `Err` here: it is returned
/// inside the [`Response`] so callers of the raw handle can inspect it.
pub struct PendingCall {
	id: u64,
	method: Arc<str>,
	created_at: Instant,
	rx: oneshot::Receiver<Outcome>,
	guard: CancelGuard,
}

impl PendingCall {
	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn method(&self) -> &str {
		&self.method
	}

	/// Time since the call was registered.
	pub fn elapsed(&self) -> Duration {
		self.created_at.elapsed()
	}

	/// Waits for the response, connection shutdown, or `cancel`, whichever comes first.
	///
	/// # Errors
	///
	/// - [`Error::Cancelled`] if `cancel` fires first; the call is unregistered
	/// - [`Error::ConnectionClosed`] / [`Error::SessionDetached`] if the call was failed
	pub async fn wait(mut self, cancel: &CancellationToken) -> Result<Response> {
		tokio::select! {
			biased;
			outcome = &mut self => outcome,
			_ = cancel.cancelled() => {
				tracing::debug!(id = self.id, method = %self.method, "call cancelled by caller");
				Err(Error::Cancelled)
			}
		}
	}

	/// Waits for the response for at most `timeout`.
	pub async fn wait_timeout(self, timeout: Duration) -> Result<Response> {
		tokio::time::timeout(timeout, self)
			.await
			.map_err(|_| Error::Timeout(timeout))?
	}
}

impl Future for PendingCall {
	type Output = Result<Response>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(outcome) => {
				self.guard.complete();
				Poll::Ready(outcome.map_err(|_| Error::ConnectionClosed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

impl std::fmt::Debug for PendingCall {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PendingCall")
			.field("id", &self.id)
			.field("method", &self.method)
			.field("elapsed", &self.created_at.elapsed())
			.finish()
	}
}
