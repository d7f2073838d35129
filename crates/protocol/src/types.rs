//! Identifier types shared across the wire.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an attached session, carried as `sessionId` on scoped frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// Identifier of a remote target (page, worker, iframe, browser).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

macro_rules! string_id {
	($ty:ident) => {
		impl $ty {
			pub fn new(id: impl Into<String>) -> Self {
				Self(id.into())
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_inner(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $ty {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl From<&str> for $ty {
			fn from(id: &str) -> Self {
				Self(id.to_string())
			}
		}

		impl From<String> for $ty {
			fn from(id: String) -> Self {
				Self(id)
			}
		}

		impl AsRef<str> for $ty {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}

		impl Borrow<str> for $ty {
			fn borrow(&self) -> &str {
				&self.0
			}
		}
	};
}

string_id!(SessionId);
string_id!(TargetId);
