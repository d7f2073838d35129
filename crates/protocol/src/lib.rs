//! Wire types for the DevTools protocol.
//!
//! This crate holds the serde-serializable shapes that cross the wire and the
//! codec that turns raw frames into them:
//!
//! - [`Message`] - the request/response/event envelope
//! - [`codec`] - frame encoding and id-based classification
//! - [`Command`] / [`EventType`] - traits implemented by typed bindings
//! - [`target`] - the `Target` domain subset that session management needs
//!
//! Types here are pure data. Correlation, routing, and session bookkeeping
//! live in `cdp-runtime`.

pub mod codec;
pub mod command;
pub mod envelope;
pub mod target;
pub mod types;

pub use codec::{CodecError, decode, encode, encode_request, params_to_raw};
pub use command::{Command, Empty, EventType};
pub use envelope::{ErrorPayload, Event, Message, Request, Response};
pub use types::{SessionId, TargetId};

/// Re-exported so bindings can name the opaque payload type.
pub use serde_json::value::RawValue;
