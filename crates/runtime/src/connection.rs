//! Connection - request/response correlation, event routing, and session
//! multiplexing over one transport.
//!
//! A [`Connection`] owns two background tasks:
//!
//! - the **reader**, the only consumer of the transport's receiving half. It
//!   decodes each frame and hands responses to the [`CallRegistry`] and events
//!   to the [`EventRouter`]. It never blocks on a consumer.
//! - the **writer**, the only user of the sending half. Frames are queued
//!   FIFO with an acknowledgement so callers observe write errors, and a
//!   caller that gives up never leaves a half-written frame behind.
//!
//! Shutdown happens exactly once, whichever of [`Connection::close`], read
//! EOF, a read error, or a write error gets there first. It fails every
//! pending call with [`Error::ConnectionClosed`], ends every event stream,
//! and detaches every session.

mod calls;
mod sessions;

#[cfg(test)]
mod tests;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use cdp_protocol::target::{
	AttachToTarget, AttachToTargetResponse, AttachedToTarget, DetachFromTarget, DetachedFromTarget,
};
use cdp_protocol::{
	Command, Event, EventType, Message, RawValue, Request, Response, SessionId, TargetId,
	encode_request, params_to_raw,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use calls::{CallRegistry, PendingCall};
pub use sessions::{Session, SessionRegistry};

use crate::channel::Channel;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::events::{EventFilter, EventRouter, EventStream, Subscription};
use crate::transport::{
	PipeTransport, Transport, TransportParts, TransportReceiver, WebSocketTransport,
};

/// Why a connection shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
	/// [`Connection::close`] was called or the last handle was dropped.
	Local,
	/// The remote side ended the stream cleanly.
	RemoteHangup,
	ReadFailed(String),
	WriteFailed(String),
}

impl fmt::Display for CloseReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CloseReason::Local => f.write_str("closed locally"),
			CloseReason::RemoteHangup => f.write_str("remote hung up"),
			CloseReason::ReadFailed(e) => write!(f, "read failed: {e}"),
			CloseReason::WriteFailed(e) => write!(f, "write failed: {e}"),
		}
	}
}

/// Routing anomalies. None of these are returned to callers.
#[derive(Debug, Default)]
struct ConnectionStats {
	orphaned_responses: AtomicU64,
	malformed_frames: AtomicU64,
	unrouted_events: AtomicU64,
	detached_session_frames: AtomicU64,
	unexpected_requests: AtomicU64,
}

fn bump(counter: &AtomicU64) {
	counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of a connection's anomaly counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
	/// Responses whose id matched no pending call (late, cancelled, or bogus).
	pub orphaned_responses: u64,
	/// Frames that failed to decode.
	pub malformed_frames: u64,
	/// Events no subscriber matched.
	pub unrouted_events: u64,
	/// Events dropped because a subscriber's buffer was full.
	pub lagged_events: u64,
	/// Events scoped to a session that had already detached.
	pub detached_session_frames: u64,
	/// Request-shaped frames sent by the remote.
	pub unexpected_requests: u64,
}

struct Outbound {
	frame: Vec<u8>,
	ack: oneshot::Sender<Result<()>>,
}

/// One live duplex channel to a DevTools endpoint.
///
/// Always handled through an `Arc`. Dropping the last handle shuts the
/// connection down as if [`close`](Self::close) had been called, without
/// waiting for the background tasks.
pub struct Connection {
	config: ConnectionConfig,
	calls: Arc<CallRegistry>,
	sessions: SessionRegistry,
	router: EventRouter,
	outbound_tx: mpsc::UnboundedSender<Outbound>,
	shutting_down: AtomicBool,
	close_reason: OnceLock<CloseReason>,
	/// Stops the reader and writer.
	shutdown: CancellationToken,
	/// Fires once teardown has run.
	closed: CancellationToken,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	stats: ConnectionStats,
}

impl Connection {
	/// Dials a `ws://` or `wss://` endpoint.
	///
	/// # Errors
	///
	/// [`Error::ConnectionFailed`] if the handshake fails or does not finish
	/// within the configured connect timeout.
	pub async fn connect(url: &str, config: ConnectionConfig) -> Result<Arc<Self>> {
		let parts = WebSocketTransport::connect(url, config.connect_timeout()).await?;
		info!(url, "connected to DevTools endpoint");
		Ok(Self::open(parts, config))
	}

	/// Speaks NUL-delimited frames over a writer/reader pair, e.g. the pipes of
	/// a browser started with `--remote-debugging-pipe`.
	pub fn from_pipes<W, R>(writer: W, reader: R, config: ConnectionConfig) -> Arc<Self>
	where
		W: AsyncWrite + Unpin + Send + 'static,
		R: AsyncRead + Unpin + Send + 'static,
	{
		let parts = PipeTransport::new(writer, reader)
			.with_max_frame_bytes(config.max_frame_bytes)
			.into_transport_parts();
		Self::open(parts, config)
	}

	/// Starts the reader and writer tasks on an established transport.
	///
	/// Must be called from within a Tokio runtime.
	pub fn open(parts: TransportParts, config: ConnectionConfig) -> Arc<Self> {
		let TransportParts { sender, receiver } = parts;
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

		let connection = Arc::new(Self {
			router: EventRouter::new(config.event_buffer()),
			config,
			calls: Arc::new(CallRegistry::new()),
			sessions: SessionRegistry::new(),
			outbound_tx,
			shutting_down: AtomicBool::new(false),
			close_reason: OnceLock::new(),
			shutdown: CancellationToken::new(),
			closed: CancellationToken::new(),
			tasks: Mutex::new(Vec::with_capacity(2)),
			stats: ConnectionStats::default(),
		});

		let reader = tokio::spawn(read_loop(
			Arc::downgrade(&connection),
			receiver,
			connection.shutdown.clone(),
		));
		let writer = tokio::spawn(write_loop(
			Arc::downgrade(&connection),
			sender,
			outbound_rx,
			connection.shutdown.clone(),
		));
		connection.tasks.lock().extend([reader, writer]);

		connection
	}

	pub fn config(&self) -> &ConnectionConfig {
		&self.config
	}

	/// Issues a request and returns its handle once the frame is written.
	///
	/// `scope` routes the request to an attached session; `None` addresses
	/// the browser.
	///
	/// # Errors
	///
	/// - [`Error::ConnectionClosed`] if the connection is shut down
	/// - [`Error::SessionNotFound`] if `scope` is unknown or detached; nothing is written
	/// - [`Error::Codec`] if `params` cannot be serialized
	/// - [`Error::Transport`] if the write fails
	pub async fn send<P>(&self, method: &str, params: &P, scope: Option<&SessionId>) -> Result<PendingCall>
	where
		P: Serialize + ?Sized,
	{
		if self.is_closed() {
			return Err(Error::ConnectionClosed);
		}
		if method.is_empty() {
			return Err(Error::InvalidArgument("method must not be empty".to_string()));
		}
		if let Some(session) = scope {
			self.sessions.scope_for(session)?;
		}

		let id = self.calls.next_id();
		let request = Request {
			id,
			method: method.to_string(),
			params: params_to_raw(params)?,
			session_id: scope.cloned(),
		};
		let frame = encode_request(&request)?;

		// Registered before the write so the response can never outrun it.
		let pending = self.calls.register(id, method, scope.cloned())?;
		// A detach marks the session before sweeping its calls, so either the
		// sweep sees this entry or this check sees the mark.
		if let Some(session) = scope {
			self.sessions.scope_for(session)?;
		}
		debug!(id, method, session = ?scope, "sending request");
		self.write_frame(frame).await?;
		Ok(pending)
	}

	/// Issues a request and waits for its result.
	///
	/// Waiting stops at whichever comes first: the response, connection
	/// shutdown, `cancel`, or the configured request timeout. Giving up only
	/// abandons the local wait; a response arriving later is discarded.
	///
	/// # Errors
	///
	/// Everything [`send`](Self::send) returns, plus [`Error::Protocol`] for
	/// an error reply, [`Error::Cancelled`], [`Error::Timeout`], and
	/// [`Error::SessionDetached`].
	pub async fn send_and_wait<P>(
		&self,
		cancel: &CancellationToken,
		method: &str,
		params: &P,
		scope: Option<&SessionId>,
	) -> Result<Box<RawValue>>
	where
		P: Serialize + ?Sized,
	{
		if cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		let pending = tokio::select! {
			biased;
			_ = cancel.cancelled() => return Err(Error::Cancelled),
			pending = self.send(method, params, scope) => pending?,
		};

		let response = match self.config.request_timeout() {
			Some(timeout) => tokio::time::timeout(timeout, pending.wait(cancel))
				.await
				.map_err(|_| Error::Timeout(timeout))??,
			None => pending.wait(cancel).await?,
		};

		response.into_result().map_err(Error::from)
	}

	/// Typed form of [`send_and_wait`](Self::send_and_wait).
	pub async fn execute<C: Command>(
		&self,
		cancel: &CancellationToken,
		command: &C,
		scope: Option<&SessionId>,
	) -> Result<C::Response> {
		let raw = self.send_and_wait(cancel, C::METHOD, command, scope).await?;
		Ok(serde_json::from_str(raw.get())?)
	}

	/// Attaches to a target in flattened mode and registers the new session.
	pub async fn attach(&self, target_id: &TargetId, cancel: &CancellationToken) -> Result<Arc<Session>> {
		let command = AttachToTarget::flattened(target_id.clone());
		let AttachToTargetResponse { session_id } = self.execute(cancel, &command, None).await?;

		let session = self.sessions.register(session_id, target_id.clone());
		if session.is_detached() {
			return Err(Error::SessionDetached(session.id().clone()));
		}
		info!(session = %session.id(), target = %target_id, "attached to target");
		Ok(session)
	}

	/// Detaches a session.
	///
	/// The session is marked detached and its pending calls failed *before*
	/// the remote is told, so no further request can be scoped to it. A
	/// remote failure is returned but the local state stays detached.
	/// Detaching an already detached session is a no-op.
	///
	/// # Errors
	///
	/// [`Error::SessionNotFound`] if the id was never attached.
	pub async fn detach(&self, session_id: &SessionId, cancel: &CancellationToken) -> Result<()> {
		if self.sessions.get(session_id).is_none() {
			return Err(Error::SessionNotFound(session_id.clone()));
		}
		if !self.detach_locally(session_id) {
			return Ok(());
		}

		let command = DetachFromTarget {
			session_id: session_id.clone(),
		};
		self.execute(cancel, &command, None).await.map(|_| ())
	}

	/// Returns true if this call performed the transition.
	fn detach_locally(&self, session_id: &SessionId) -> bool {
		if self.sessions.mark_detached(session_id).is_none() {
			return false;
		}
		let failed = self.calls.fail_session(session_id);
		info!(session = %session_id, failed_calls = failed, "session detached");
		true
	}

	pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
		self.sessions.get(id)
	}

	/// Currently attached sessions.
	pub fn sessions(&self) -> Vec<Arc<Session>> {
		self.sessions.active()
	}

	/// Forgets detached sessions. See [`SessionRegistry::purge_detached`].
	pub fn purge_detached_sessions(&self) -> usize {
		let purged = self.sessions.purge_detached();
		debug!(purged, "purged detached sessions");
		purged
	}

	/// Waits for a session on `target_id` to attach, typically through
	/// auto-attach.
	///
	/// # Errors
	///
	/// [`Error::Timeout`], or [`Error::ConnectionClosed`] if the connection
	/// shuts down first.
	pub async fn wait_for_target(&self, target_id: &TargetId, timeout: Duration) -> Result<Arc<Session>> {
		tokio::select! {
			biased;
			_ = self.closed.cancelled() => Err(Error::ConnectionClosed),
			session = self.sessions.wait_for_target(target_id, timeout) => session,
		}
	}

	/// Subscribes to events matching `filter`.
	pub fn subscribe(&self, filter: EventFilter) -> EventStream {
		self.router.subscribe(filter)
	}

	/// Invokes `handler` for each matching event until the returned
	/// [`Subscription`] is dropped or the connection closes.
	///
	/// Events are handled one at a time, in arrival order.
	pub fn on<F, Fut>(&self, filter: EventFilter, handler: F) -> Subscription
	where
		F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		Subscription::spawn(self.router.subscribe(filter), handler)
	}

	/// Waits for the first event matching `filter` that arrives after this call.
	pub async fn wait_for_event(&self, filter: EventFilter, timeout: Duration) -> Result<Arc<Event>> {
		self.router.subscribe(filter).next_within(timeout).await
	}

	/// A typed channel addressing the browser.
	pub fn channel(self: &Arc<Self>) -> Channel {
		Channel::new(Arc::clone(self), None)
	}

	/// A typed channel addressing one session.
	pub fn session_channel(self: &Arc<Self>, session: SessionId) -> Channel {
		Channel::new(Arc::clone(self), Some(session))
	}

	pub fn is_closed(&self) -> bool {
		self.shutting_down.load(Ordering::Acquire)
	}

	/// Why the connection shut down, once it has.
	pub fn close_reason(&self) -> Option<CloseReason> {
		self.close_reason.get().cloned()
	}

	/// Completes once the connection has shut down, for any reason.
	pub async fn closed(&self) {
		self.closed.cancelled().await;
	}

	/// Shuts the connection down and waits for the background tasks to exit.
	///
	/// Idempotent and safe to call concurrently.
	pub async fn close(&self) {
		self.shutdown(CloseReason::Local);
		let tasks = std::mem::take(&mut *self.tasks.lock());
		for task in tasks {
			let _ = task.await;
		}
	}

	pub fn pending_calls(&self) -> usize {
		self.calls.pending_count()
	}

	pub fn stats(&self) -> StatsSnapshot {
		let s = &self.stats;
		StatsSnapshot {
			orphaned_responses: s.orphaned_responses.load(Ordering::Relaxed),
			malformed_frames: s.malformed_frames.load(Ordering::Relaxed),
			unrouted_events: s.unrouted_events.load(Ordering::Relaxed),
			lagged_events: self.router.lagged_total(),
			detached_session_frames: s.detached_session_frames.load(Ordering::Relaxed),
			unexpected_requests: s.unexpected_requests.load(Ordering::Relaxed),
		}
	}

	/// Queues a frame and waits until the writer has flushed it.
	async fn write_frame(&self, frame: Vec<u8>) -> Result<()> {
		let (ack, done) = oneshot::channel();
		self.outbound_tx
			.send(Outbound { frame, ack })
			.map_err(|_| Error::ConnectionClosed)?;
		done.await.map_err(|_| Error::ConnectionClosed)?
	}

	/// Tears everything down. Runs at most once; returns whether this call did it.
	fn shutdown(&self, reason: CloseReason) -> bool {
		if self.shutting_down.swap(true, Ordering::AcqRel) {
			return false;
		}
		match &reason {
			CloseReason::Local | CloseReason::RemoteHangup => info!(%reason, "connection closing"),
			_ => warn!(%reason, "connection closing"),
		}
		let _ = self.close_reason.set(reason);

		self.shutdown.cancel();
		let failed_calls = self.calls.fail_all();
		let closed_streams = self.router.close();
		let detached_sessions = self.sessions.detach_all();
		debug!(failed_calls, closed_streams, detached_sessions, "connection torn down");

		self.closed.cancel();
		true
	}

	fn handle_frame(&self, frame: &[u8]) {
		match cdp_protocol::decode(frame) {
			Ok(Message::Response(response)) => self.route_response(response),
			Ok(Message::Event(event)) => self.route_event(event),
			Ok(Message::Request(request)) => {
				bump(&self.stats.unexpected_requests);
				warn!(id = request.id, method = %request.method, "ignoring request sent by remote");
			}
			Err(e) => {
				bump(&self.stats.malformed_frames);
				warn!(error = %e, bytes = frame.len(), "dropping malformed frame");
			}
		}
	}

	fn route_response(&self, response: Response) {
		let id = response.id;
		if !self.calls.resolve(id, response) {
			bump(&self.stats.orphaned_responses);
			debug!(id, "response matches no pending call");
		}
	}

	fn route_event(&self, event: Event) {
		if let Some(session) = &event.session_id {
			if self.sessions.is_detached(session) {
				bump(&self.stats.detached_session_frames);
				debug!(session = %session, method = %event.method, "dropping event for detached session");
				return;
			}
		}

		if event.method == AttachedToTarget::METHOD {
			match event.params_as::<AttachedToTarget>() {
				Ok(attached) => {
					self.sessions
						.register(attached.session_id, attached.target_info.target_id);
				}
				Err(e) => warn!(error = %e, "malformed Target.attachedToTarget params"),
			}
		} else if event.method == DetachedFromTarget::METHOD {
			match event.params_as::<DetachedFromTarget>() {
				Ok(detached) => {
					self.detach_locally(&detached.session_id);
				}
				Err(e) => warn!(error = %e, "malformed Target.detachedFromTarget params"),
			}
		}

		let method = event.method.clone();
		if self.router.dispatch(event) == 0 {
			bump(&self.stats.unrouted_events);
			trace!(%method, "event matched no subscriber");
		}
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.shutdown(CloseReason::Local);
	}
}

impl fmt::Debug for Connection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Connection")
			.field("closed", &self.is_closed())
			.field("pending_calls", &self.calls.pending_count())
			.field("subscribers", &self.router.subscriber_count())
			.finish()
	}
}

async fn read_loop(
	connection: Weak<Connection>,
	mut receiver: Box<dyn TransportReceiver>,
	shutdown: CancellationToken,
) {
	loop {
		let next = tokio::select! {
			biased;
			_ = shutdown.cancelled() => break,
			next = receiver.recv() => next,
		};
		let Some(connection) = connection.upgrade() else {
			break;
		};
		match next {
			Ok(Some(frame)) => {
				trace!(bytes = frame.len(), "frame received");
				connection.handle_frame(&frame);
			}
			Ok(None) => {
				connection.shutdown(CloseReason::RemoteHangup);
				break;
			}
			Err(e) => {
				connection.shutdown(CloseReason::ReadFailed(e.to_string()));
				break;
			}
		}
	}
	trace!("reader task finished");
}

async fn write_loop(
	connection: Weak<Connection>,
	mut sender: Box<dyn Transport>,
	mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
	shutdown: CancellationToken,
) {
	loop {
		let outbound = tokio::select! {
			biased;
			_ = shutdown.cancelled() => break,
			next = outbound_rx.recv() => match next {
				Some(outbound) => outbound,
				None => break,
			},
		};

		let result = tokio::select! {
			biased;
			result = sender.send(outbound.frame) => result,
			_ = shutdown.cancelled() => Err(Error::ConnectionClosed),
		};
		let failure = result.as_ref().err().map(ToString::to_string);
		let _ = outbound.ack.send(result);

		if let Some(reason) = failure {
			if let Some(connection) = connection.upgrade() {
				connection.shutdown(CloseReason::WriteFailed(reason));
			}
			break;
		}
	}

	outbound_rx.close();
	while let Ok(outbound) = outbound_rx.try_recv() {
		let _ = outbound.ack.send(Err(Error::ConnectionClosed));
	}
	if let Err(e) = sender.close().await {
		debug!(error = %e, "transport close failed");
	}
	trace!("writer task finished");
}
