//! Connection tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default per-subscriber event buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 256;
/// Default time allowed for dialing an endpoint.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Default upper bound on a single pipe frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Fully owned connection configuration.
///
/// Deserializable so it can be embedded in a host application's config
/// file; every field falls back to its default when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
	/// Events buffered per subscriber before new events are dropped for it.
	pub event_buffer: usize,
	/// Upper bound for `send_and_wait`, on top of the caller's cancellation.
	pub request_timeout_ms: Option<u64>,
	/// Time allowed for dialing and the WebSocket handshake.
	pub connect_timeout_ms: u64,
	/// Largest frame accepted from a pipe transport.
	pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			event_buffer: DEFAULT_EVENT_BUFFER,
			request_timeout_ms: None,
			connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
			max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
		}
	}
}

impl ConnectionConfig {
	/// Builds a config from defaults overridden by environment variables.
	///
	/// - `CDP_EVENT_BUFFER`
	/// - `CDP_REQUEST_TIMEOUT_MS`
	/// - `CDP_CONNECT_TIMEOUT_MS`
	/// - `CDP_MAX_FRAME_BYTES`
	///
	/// Unparseable values are logged and ignored.
	pub fn from_env() -> Self {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
		let mut config = Self::default();
		if let Some(v) = parse_var(&lookup, "CDP_EVENT_BUFFER") {
			config.event_buffer = v;
		}
		if let Some(v) = parse_var(&lookup, "CDP_REQUEST_TIMEOUT_MS") {
			config.request_timeout_ms = Some(v);
		}
		if let Some(v) = parse_var(&lookup, "CDP_CONNECT_TIMEOUT_MS") {
			config.connect_timeout_ms = v;
		}
		if let Some(v) = parse_var(&lookup, "CDP_MAX_FRAME_BYTES") {
			config.max_frame_bytes = v;
		}
		config
	}

	pub fn with_event_buffer(mut self, capacity: usize) -> Self {
		self.event_buffer = capacity;
		self
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout_ms = Some(timeout.as_millis() as u64);
		self
	}

	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout_ms = timeout.as_millis() as u64;
		self
	}

	pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
		self.max_frame_bytes = bytes;
		self
	}

	/// Event buffer, never zero (bounded channels reject a zero capacity).
	pub fn event_buffer(&self) -> usize {
		self.event_buffer.max(1)
	}

	pub fn request_timeout(&self) -> Option<Duration> {
		self.request_timeout_ms.map(Duration::from_millis)
	}

	pub fn connect_timeout(&self) -> Duration {
		Duration::from_millis(self.connect_timeout_ms)
	}
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
	let raw = lookup(key)?;
	match raw.trim().parse() {
		Ok(value) => Some(value),
		Err(_) => {
			warn!(key, value = %raw, "ignoring unparseable environment override");
			None
		}
	}
}
