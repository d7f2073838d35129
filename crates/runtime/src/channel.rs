//! Channel - typed request proxy bound to one scope.
//!
//! A [`Channel`] pairs a [`Connection`] with an optional session and a
//! cancellation token, so typed bindings can issue commands without
//! threading the scope through every call.

use std::sync::Arc;

use cdp_protocol::{Command, Empty, SessionId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::Result;

/// Sends requests to the browser or to one attached session.
#[derive(Clone)]
pub struct Channel {
	connection: Arc<Connection>,
	session: Option<SessionId>,
	cancel: CancellationToken,
}

impl Channel {
	/// Creates a channel; `None` addresses the browser itself.
	pub fn new(connection: Arc<Connection>, session: Option<SessionId>) -> Self {
		Self {
			connection,
			session,
			cancel: CancellationToken::new(),
		}
	}

	/// Returns a copy whose requests are abandoned when `cancel` fires.
	pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
		self.cancel = cancel;
		self
	}

	/// Sends a method call and deserializes its result.
	pub async fn send<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
		let raw = self
			.connection
			.send_and_wait(&self.cancel, method, &params, self.session.as_ref())
			.await?;
		serde_json::from_str(raw.get()).map_err(Into::into)
	}

	/// Sends a method call with no parameters.
	pub async fn send_no_params<R: DeserializeOwned>(&self, method: &str) -> Result<R> {
		self.send(method, ()).await
	}

	/// Sends a method call whose result is ignored.
	pub async fn send_no_result<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
		let _: serde_json::Value = self.send(method, params).await?;
		Ok(())
	}

	/// Sends a typed command.
	pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Response> {
		self.connection
			.execute(&self.cancel, command, self.session.as_ref())
			.await
	}

	/// Sends a typed command whose response carries no fields.
	pub async fn execute_void<C>(&self, command: &C) -> Result<()>
	where
		C: Command<Response = Empty>,
	{
		self.execute(command).await.map(|_| ())
	}

	pub fn session(&self) -> Option<&SessionId> {
		self.session.as_ref()
	}

	pub fn connection(&self) -> &Arc<Connection> {
		&self.connection
	}
}

impl std::fmt::Debug for Channel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Channel")
			.field("session", &self.session)
			.field("cancelled", &self.cancel.is_cancelled())
			.finish()
	}
}
