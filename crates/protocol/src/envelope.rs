//! The three shapes of a wire frame.
//!
//! Every frame is a JSON object. Requests and responses carry a correlation
//! `id`; events never do. Any shape may carry a `sessionId` when it is scoped
//! to an attached session rather than to the browser itself.
//!
//! Payloads (`params`, `result`) stay as [`RawValue`] so that the transport
//! core never has to understand a domain's schema.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

use crate::types::SessionId;

/// Outgoing command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	/// Correlation id, non-zero and unique per connection.
	pub id: u64,
	/// `Domain.command` name.
	pub method: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub params: Option<Box<RawValue>>,
	#[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<SessionId>,
}

/// Reply to a [`Request`] with the same `id`.
///
/// Exactly one of `result` and `error` is set on frames produced by
/// [`decode`](crate::codec::decode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub id: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Box<RawValue>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorPayload>,
	#[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<SessionId>,
}

impl Response {
	pub fn is_error(&self) -> bool {
		self.error.is_some()
	}

	/// Splits the response into its result payload or the remote error.
	///
	/// A response without either field yields an empty object.
	pub fn into_result(self) -> Result<Box<RawValue>, ErrorPayload> {
		match (self.result, self.error) {
			(_, Some(error)) => Err(error),
			(Some(result), None) => Ok(result),
			(None, None) => Ok(empty_object()),
		}
	}
}

/// Error object returned by the remote side in place of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub code: i64,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

impl fmt::Display for ErrorPayload {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} (code {})", self.message, self.code)?;
		if let Some(data) = &self.data {
			write!(f, ": {data}")?;
		}
		Ok(())
	}
}

/// Unsolicited notification pushed by the remote side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
	/// `Domain.event` name.
	pub method: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub params: Option<Box<RawValue>>,
	#[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<SessionId>,
}

impl Event {
	/// Returns the domain part of the method name (`"Page"` for `"Page.loadEventFired"`).
	pub fn domain(&self) -> &str {
		self.method
			.split_once('.')
			.map_or(self.method.as_str(), |(domain, _)| domain)
	}

	/// Deserializes the event parameters, treating missing params as `{}`.
	pub fn params_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
		match &self.params {
			Some(raw) => serde_json::from_str(raw.get()),
			None => serde_json::from_str("{}"),
		}
	}
}

/// Discriminated union of wire frames.
///
/// Classification is done by [`decode`](crate::codec::decode): the presence of
/// a non-zero `id` is the only thing separating replies from events.
#[derive(Debug, Clone)]
pub enum Message {
	Request(Request),
	Response(Response),
	Event(Event),
}

impl Message {
	/// Correlation id, absent for events.
	pub fn id(&self) -> Option<u64> {
		match self {
			Message::Request(request) => Some(request.id),
			Message::Response(response) => Some(response.id),
			Message::Event(_) => None,
		}
	}

	pub fn session_id(&self) -> Option<&SessionId> {
		match self {
			Message::Request(request) => request.session_id.as_ref(),
			Message::Response(response) => response.session_id.as_ref(),
			Message::Event(event) => event.session_id.as_ref(),
		}
	}

	/// Method name, absent for responses.
	pub fn method(&self) -> Option<&str> {
		match self {
			Message::Request(request) => Some(&request.method),
			Message::Response(_) => None,
			Message::Event(event) => Some(&event.method),
		}
	}
}

pub(crate) fn empty_object() -> Box<RawValue> {
	RawValue::from_string("{}".to_string()).expect("literal is valid JSON")
}
