//! DevTools Runtime - connection, correlation, event routing, and sessions
//!
//! This crate provides the transport core for talking to a browser over the
//! DevTools protocol:
//!
//! - **Transport**: whole frames over WebSocket or NUL-delimited pipes
//! - **Connection**: one reader task, one writer queue, request/response correlation by id
//! - **Event routing**: filtered fan-out with a bounded buffer per subscriber
//! - **Sessions**: many attached targets multiplexed over one connection
//!
//! # Architecture
//!
//! ```text
//!  callers ──send/send_and_wait──┐          ┌── EventStream / Subscription
//!                                │          │
//! ┌──────────────────────────────▼──────────┴───────────┐
//! │ Connection                                          │
//! │  ┌──────────────┐ ┌─────────────┐ ┌───────────────┐ │
//! │  │ CallRegistry │ │ EventRouter │ │SessionRegistry│ │
//! │  └──────▲───────┘ └──────▲──────┘ └───────▲───────┘ │
//! │         └─── reader task ┴────────────────┘         │
//! │  writer task ◄── FIFO queue                         │
//! └───────┬────────────────────────────────▲────────────┘
//!         │ Transport                      │ TransportReceiver
//!         ▼                                │
//!              WebSocket  /  pipe
//! ```
//!
//! # Cancellation
//!
//! Every waiting operation takes a [`CancellationToken`]. Cancelling only
//! abandons the local wait: the request may still execute remotely, and its
//! late response is dropped and counted in [`Connection::stats`].
//!
//! The library never installs a `tracing` subscriber; hosts decide where logs go.

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod transport;

pub use channel::Channel;
pub use config::ConnectionConfig;
pub use connection::{
	CallRegistry, CloseReason, Connection, PendingCall, Session, SessionRegistry, StatsSnapshot,
};
pub use error::{Error, ErrorKind, Result};
pub use events::{
	EventFilter, EventRouter, EventStream, MethodFilter, SessionFilter, Subscription,
	SubscriptionId,
};
pub use tokio_util::sync::CancellationToken;
pub use transport::{
	PipeTransport, PipeTransportReceiver, PipeTransportSender, Transport, TransportParts,
	TransportReceiver, WebSocketReceiver, WebSocketSender, WebSocketTransport,
};
