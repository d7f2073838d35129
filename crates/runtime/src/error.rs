//! Error types for the protocol runtime.

use std::time::Duration;

use cdp_protocol::{CodecError, ErrorPayload, SessionId};
use serde_json::Value;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse category of an [`Error`].
///
/// Callers usually only need to know whether the remote side rejected a
/// command, the channel failed underneath it, or they stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// The channel could not be opened, a write failed, or it closed mid-call.
	Transport,
	/// The remote side answered with an `error` envelope.
	Protocol,
	/// The caller's cancellation token fired or its timeout elapsed.
	Cancelled,
	/// Rejected locally before anything was written.
	Local,
}

/// Errors that can occur in the protocol runtime.
#[derive(Debug, Error)]
pub enum Error {
	/// Failed to establish the connection.
	#[error("Failed to connect to {endpoint}: {reason}")]
	ConnectionFailed { endpoint: String, reason: String },

	/// Transport-level read or write failure.
	#[error("Transport error: {0}")]
	Transport(String),

	/// The connection closed before the call was resolved.
	#[error("Connection closed")]
	ConnectionClosed,

	/// The session a pending call was scoped to detached before it resolved.
	#[error("Session {0} detached while the call was pending")]
	SessionDetached(SessionId),

	/// The remote side returned an error for this command.
	#[error("Protocol error {code}: {message}")]
	Protocol {
		code: i64,
		message: String,
		data: Option<Value>,
	},

	/// The caller cancelled before a response arrived.
	#[error("Call cancelled")]
	Cancelled,

	/// No response arrived within the allotted time.
	#[error("Timed out after {0:?}")]
	Timeout(Duration),

	/// The session is unknown or has been detached.
	#[error("Session not found: {0}")]
	SessionNotFound(SessionId),

	/// Invalid argument provided to method.
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	/// A frame could not be encoded.
	#[error("Codec error: {0}")]
	Codec(#[from] CodecError),

	/// A result payload did not match the expected shape.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl From<ErrorPayload> for Error {
	fn from(payload: ErrorPayload) -> Self {
		Error::Protocol {
			code: payload.code,
			message: payload.message,
			data: payload.data,
		}
	}
}

impl Error {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::ConnectionFailed { .. }
			| Error::Transport(_)
			| Error::ConnectionClosed
			| Error::SessionDetached(_)
			| Error::Io(_) => ErrorKind::Transport,
			Error::Protocol { .. } => ErrorKind::Protocol,
			Error::Cancelled | Error::Timeout(_) => ErrorKind::Cancelled,
			Error::SessionNotFound(_)
			| Error::InvalidArgument(_)
			| Error::Codec(_)
			| Error::Json(_) => ErrorKind::Local,
		}
	}

	/// Returns true if the caller gave up waiting (cancellation or timeout).
	pub fn is_cancelled(&self) -> bool {
		self.kind() == ErrorKind::Cancelled
	}

	pub fn is_transport(&self) -> bool {
		self.kind() == ErrorKind::Transport
	}

	/// Returns the remote error code if this is a protocol error.
	pub fn protocol_code(&self) -> Option<i64> {
		match self {
			Error::Protocol { code, .. } => Some(*code),
			_ => None,
		}
	}
}
