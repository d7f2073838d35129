//! Traits implemented by typed protocol bindings.
//!
//! A binding is a serializable params struct that knows its method name and
//! the shape of its result. The transport core only ever sees the method
//! string and the serialized params; these traits let callers keep static
//! types on both ends.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A command that can be sent to the remote side.
pub trait Command: Serialize {
	/// Fully qualified method, e.g. `"Target.attachToTarget"`.
	const METHOD: &'static str;

	/// Shape of the `result` object.
	type Response: DeserializeOwned;
}

/// An event the remote side may push.
pub trait EventType: DeserializeOwned {
	/// Fully qualified method, e.g. `"Target.detachedFromTarget"`.
	const METHOD: &'static str;
}

/// Result of commands that return an empty object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}
