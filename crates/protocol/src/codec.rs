//! Frame codec.
//!
//! Encoding is plain `serde_json`. Decoding goes through a permissive
//! intermediate shape and then classifies the frame:
//!
//! | `id`     | `method` | shape                  |
//! |----------|----------|------------------------|
//! | non-zero | present  | [`Message::Request`]   |
//! | non-zero | absent   | [`Message::Response`]  |
//! | absent/0 | present  | [`Message::Event`]     |
//! | absent/0 | absent   | [`CodecError::Unclassifiable`] |

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::envelope::{ErrorPayload, Event, Message, Request, Response, empty_object};
use crate::types::SessionId;

/// Failure to encode or decode a single frame.
#[derive(Debug, Error)]
pub enum CodecError {
	#[error("invalid JSON frame: {0}")]
	Json(#[from] serde_json::Error),

	#[error("response {0} carries both a result and an error")]
	AmbiguousResponse(u64),

	#[error("frame has neither a correlation id nor a method")]
	Unclassifiable,
}

#[derive(Deserialize)]
struct RawFrame {
	#[serde(default)]
	id: Option<u64>,
	#[serde(default)]
	method: Option<String>,
	#[serde(default)]
	params: Option<Box<RawValue>>,
	#[serde(default)]
	result: Option<Box<RawValue>>,
	#[serde(default)]
	error: Option<ErrorPayload>,
	#[serde(rename = "sessionId", default)]
	session_id: Option<SessionId>,
}

/// Serializes an outgoing request into one frame.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, CodecError> {
	Ok(serde_json::to_vec(request)?)
}

/// Serializes any frame shape, including the responses and events only the
/// remote end sends.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
	let bytes = match message {
		Message::Request(request) => serde_json::to_vec(request)?,
		Message::Response(response) => serde_json::to_vec(response)?,
		Message::Event(event) => serde_json::to_vec(event)?,
	};
	Ok(bytes)
}

/// Parses and classifies one incoming frame.
pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
	let RawFrame {
		id,
		method,
		params,
		result,
		error,
		session_id,
	} = serde_json::from_slice(frame)?;

	match (id.filter(|id| *id != 0), method) {
		(Some(id), Some(method)) => Ok(Message::Request(Request {
			id,
			method,
			params,
			session_id,
		})),
		(Some(id), None) => {
			let result = match (result, &error) {
				(Some(_), Some(_)) => return Err(CodecError::AmbiguousResponse(id)),
				(None, None) => Some(empty_object()),
				(result, _) => result,
			};
			Ok(Message::Response(Response {
				id,
				result,
				error,
				session_id,
			}))
		}
		(None, Some(method)) => Ok(Message::Event(Event {
			method,
			params,
			session_id,
		})),
		(None, None) => Err(CodecError::Unclassifiable),
	}
}

/// Serializes command parameters into an opaque payload.
///
/// Parameters that serialize to `null` (unit, `None`) are omitted from the
/// frame entirely, since the remote side rejects `"params": null`.
pub fn params_to_raw<P: Serialize + ?Sized>(
	params: &P,
) -> Result<Option<Box<RawValue>>, CodecError> {
	let raw = serde_json::value::to_raw_value(params)?;
	if raw.get() == "null" {
		return Ok(None);
	}
	Ok(Some(raw))
}
