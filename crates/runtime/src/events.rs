//! Event fan-out.
//!
//! Incoming frames without a correlation id are handed to the
//! [`EventRouter`], which delivers them to every subscriber whose
//! [`EventFilter`] matches. Each subscriber owns a bounded buffer:
//!
//! - Delivery uses `try_send`, so the connection's reader never waits on a
//!   slow consumer. When a buffer is full the event is dropped *for that
//!   subscriber only* and its lag counter is bumped.
//! - A subscriber sees events in the order the reader decoded them.
//!
//! Two consumption patterns are supported:
//!
//! 1. **Streams**: [`EventStream`], pulled with `recv` or as a [`Stream`]
//! 2. **Callbacks**: a spawned task draining a stream, owned by a [`Subscription`]
//!
//! Both unregister when dropped. When the connection closes every stream
//! ends (returns `None`) exactly once, after its buffered events.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use cdp_protocol::{Event, EventType, SessionId};
use futures_util::Stream;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// Unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Which methods a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodFilter {
	Any,
	/// Exact method, e.g. `"Page.loadEventFired"`.
	Exact(String),
	/// Every event of a domain, e.g. `"Network"`.
	Domain(String),
}

/// Which session scope a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFilter {
	Any,
	/// Only browser-level events (no `sessionId`).
	Browser,
	/// Only events scoped to this session.
	Session(SessionId),
}

/// Subscription criteria; both parts must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
	pub method: MethodFilter,
	pub session: SessionFilter,
}

impl EventFilter {
	/// Everything, from every scope.
	pub fn any() -> Self {
		Self {
			method: MethodFilter::Any,
			session: SessionFilter::Any,
		}
	}

	pub fn method(method: impl Into<String>) -> Self {
		Self {
			method: MethodFilter::Exact(method.into()),
			session: SessionFilter::Any,
		}
	}

	pub fn domain(domain: impl Into<String>) -> Self {
		Self {
			method: MethodFilter::Domain(domain.into()),
			session: SessionFilter::Any,
		}
	}

	/// Filter for a typed event binding.
	pub fn of<E: EventType>() -> Self {
		Self::method(E::METHOD)
	}

	pub fn in_session(mut self, session: SessionId) -> Self {
		self.session = SessionFilter::Session(session);
		self
	}

	pub fn browser_only(mut self) -> Self {
		self.session = SessionFilter::Browser;
		self
	}

	pub fn matches(&self, event: &Event) -> bool {
		let method = match &self.method {
			MethodFilter::Any => true,
			MethodFilter::Exact(method) => event.method == *method,
			MethodFilter::Domain(domain) => event.domain() == domain,
		};
		method
			&& match &self.session {
				SessionFilter::Any => true,
				SessionFilter::Browser => event.session_id.is_none(),
				SessionFilter::Session(id) => event.session_id.as_ref() == Some(id),
			}
	}
}

struct Subscriber {
	filter: EventFilter,
	tx: mpsc::Sender<Arc<Event>>,
	lagged: Arc<AtomicU64>,
}

type SubscriberMap = Arc<RwLock<IndexMap<SubscriptionId, Subscriber>>>;

/// Delivers events to matching subscribers without blocking the reader.
pub struct EventRouter {
	subscribers: SubscriberMap,
	next_id: AtomicU64,
	capacity: usize,
	closed: AtomicBool,
	lagged_total: AtomicU64,
}

impl EventRouter {
	/// Creates a router whose subscribers buffer up to `capacity` events each.
	pub fn new(capacity: usize) -> Self {
		Self {
			subscribers: Arc::new(RwLock::new(IndexMap::new())),
			next_id: AtomicU64::new(1),
			capacity: capacity.max(1),
			closed: AtomicBool::new(false),
			lagged_total: AtomicU64::new(0),
		}
	}

	/// Registers a subscriber. Subscribing after [`close`](Self::close)
	/// yields a stream that is already finished.
	pub fn subscribe(&self, filter: EventFilter) -> EventStream {
		let (tx, rx) = mpsc::channel(self.capacity);
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let lagged = Arc::new(AtomicU64::new(0));

		{
			let mut subscribers = self.subscribers.write();
			if !self.closed.load(Ordering::Acquire) {
				subscribers.insert(
					id,
					Subscriber {
						filter,
						tx,
						lagged: Arc::clone(&lagged),
					},
				);
			}
		}

		EventStream {
			id,
			rx,
			lagged,
			subscribers: Arc::downgrade(&self.subscribers),
		}
	}

	/// Delivers `event` to every matching subscriber.
	///
	/// Returns the number of subscribers that received it.
	pub fn dispatch(&self, event: Event) -> usize {
		let event = Arc::new(event);
		let mut delivered = 0;
		let mut gone = Vec::new();

		{
			let subscribers = self.subscribers.read();
			for (id, subscriber) in subscribers.iter() {
				if !subscriber.filter.matches(&event) {
					continue;
				}
				match subscriber.tx.try_send(Arc::clone(&event)) {
					Ok(()) => delivered += 1,
					Err(TrySendError::Full(_)) => {
						let dropped = subscriber.lagged.fetch_add(1, Ordering::Relaxed) + 1;
						self.lagged_total.fetch_add(1, Ordering::Relaxed);
						tracing::warn!(
							subscription = id,
							method = %event.method,
							dropped,
							"Subscriber buffer full, dropping event"
						);
					}
					Err(TrySendError::Closed(_)) => gone.push(*id),
				}
			}
		}

		if !gone.is_empty() {
			let mut subscribers = self.subscribers.write();
			for id in gone {
				subscribers.shift_remove(&id);
			}
		}

		delivered
	}

	/// Ends every stream. Idempotent; returns the number of streams closed.
	pub fn close(&self) -> usize {
		if self.closed.swap(true, Ordering::AcqRel) {
			return 0;
		}
		let drained = std::mem::take(&mut *self.subscribers.write());
		drained.len()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.read().len()
	}

	/// Events dropped across all subscribers because their buffers were full.
	pub fn lagged_total(&self) -> u64 {
		self.lagged_total.load(Ordering::Relaxed)
	}
}

/// Receiving end of a subscription.
///
/// Dropping the stream unregisters it.
pub struct EventStream {
	id: SubscriptionId,
	rx: mpsc::Receiver<Arc<Event>>,
	lagged: Arc<AtomicU64>,
	subscribers: Weak<RwLock<IndexMap<SubscriptionId, Subscriber>>>,
}

impl EventStream {
	pub fn id(&self) -> SubscriptionId {
		self.id
	}

	/// Receives the next event, or `None` once the connection has closed.
	pub async fn recv(&mut self) -> Option<Arc<Event>> {
		self.rx.recv().await
	}

	/// Returns a buffered event without waiting.
	pub fn try_recv(&mut self) -> Option<Arc<Event>> {
		self.rx.try_recv().ok()
	}

	/// Waits for the next event for at most `timeout`.
	///
	/// # Errors
	///
	/// - [`Error::Timeout`] if nothing arrives in time
	/// - [`Error::ConnectionClosed`] if the stream ends first
	pub async fn next_within(&mut self, timeout: Duration) -> Result<Arc<Event>> {
		tokio::time::timeout(timeout, self.rx.recv())
			.await
			.map_err(|_| Error::Timeout(timeout))?
			.ok_or(Error::ConnectionClosed)
	}

	/// Number of events dropped for this subscriber because its buffer was full.
	pub fn lagged(&self) -> u64 {
		self.lagged.load(Ordering::Relaxed)
	}

	/// Explicitly unsubscribes. Equivalent to dropping.
	pub fn unsubscribe(self) {}
}

impl Stream for EventStream {
	type Item = Arc<Event>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.rx.poll_recv(cx)
	}
}

impl Drop for EventStream {
	fn drop(&mut self) {
		if let Some(map) = self.subscribers.upgrade() {
			map.write().shift_remove(&self.id);
		}
	}
}

impl std::fmt::Debug for EventStream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventStream")
			.field("id", &self.id)
			.field("lagged", &self.lagged())
			.finish()
	}
}

/// RAII handle that cancels a callback subscription when dropped.
///
/// Returned by [`Connection::on`](crate::Connection::on). The background task
/// invoking the handler stops when this handle is dropped, when
/// [`unsubscribe`](Self::unsubscribe) is called, or when the connection closes.
pub struct Subscription {
	id: SubscriptionId,
	cancel_tx: Option<oneshot::Sender<()>>,
}

impl Subscription {
	/// Spawns a task feeding each event from `stream` to `handler`, one at a time.
	pub(crate) fn spawn<F, Fut>(mut stream: EventStream, handler: F) -> Self
	where
		F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
		let id = stream.id();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					biased;
					_ = &mut cancel_rx => break,
					event = stream.recv() => {
						let Some(event) = event else { break };
						let method = event.method.clone();
						if let Err(e) = handler(event).await {
							tracing::warn!(subscription = id, %method, error = %e, "Event handler failed");
						}
					}
				}
			}
			tracing::trace!(subscription = id, "event handler task finished");
		});

		Self {
			id,
			cancel_tx: Some(cancel_tx),
		}
	}

	pub fn id(&self) -> SubscriptionId {
		self.id
	}

	/// Explicitly cancels the subscription, equivalent to dropping it.
	pub fn unsubscribe(mut self) {
		if let Some(tx) = self.cancel_tx.take() {
			let _ = tx.send(());
		}
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(tx) = self.cancel_tx.take() {
			let _ = tx.send(());
		}
	}
}

impl std::fmt::Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription")
			.field("id", &self.id)
			.field("active", &self.cancel_tx.is_some())
			.finish()
	}
}
