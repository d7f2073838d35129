//! Frame transports.
//!
//! A transport moves whole frames; it knows nothing about ids or methods.
//! Each transport is split into a sending half, owned by the connection's
//! writer task, and a receiving half, owned by its reader task.
//!
//! Two transports ship with the runtime:
//!
//! - [`PipeTransport`]: NUL-terminated JSON over a pair of byte streams, the
//!   framing browsers use for `--remote-debugging-pipe`
//! - [`WebSocketTransport`]: one text message per frame

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::config::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{Error, Result};

mod websocket;

pub use websocket::{WebSocketReceiver, WebSocketSender, WebSocketTransport};

/// Sending half of a transport.
pub trait Transport: Send {
	/// Writes one complete frame.
	fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>>;

	/// Releases the underlying channel.
	fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Receiving half of a transport.
pub trait TransportReceiver: Send {
	/// Reads the next frame, or `None` once the remote side has hung up.
	fn recv(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;
}

/// Both halves of an established transport, ready for a connection.
pub struct TransportParts {
	pub sender: Box<dyn Transport>,
	pub receiver: Box<dyn TransportReceiver>,
}

/// NUL-delimited frames over a writer/reader pair (child process stdio, duplex pipes).
pub struct PipeTransport<W, R> {
	writer: W,
	reader: R,
	max_frame_bytes: usize,
}

impl<W, R> PipeTransport<W, R>
where
	W: AsyncWrite + Unpin + Send + 'static,
	R: AsyncRead + Unpin + Send + 'static,
{
	pub fn new(writer: W, reader: R) -> Self {
		Self {
			writer,
			reader,
			max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
		}
	}

	/// Caps the size of a single incoming frame.
	pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
		self.max_frame_bytes = max_frame_bytes;
		self
	}

	pub fn into_parts(self) -> (PipeTransportSender<W>, PipeTransportReceiver<R>) {
		(
			PipeTransportSender {
				writer: self.writer,
			},
			PipeTransportReceiver {
				reader: BufReader::new(self.reader),
				max_frame_bytes: self.max_frame_bytes,
			},
		)
	}

	pub fn into_transport_parts(self) -> TransportParts {
		let (sender, receiver) = self.into_parts();
		TransportParts {
			sender: Box::new(sender),
			receiver: Box::new(receiver),
		}
	}
}

pub struct PipeTransportSender<W> {
	writer: W,
}

impl<W: AsyncWrite + Unpin + Send> PipeTransportSender<W> {
	async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
		self.writer
			.write_all(frame)
			.await
			.map_err(|e| Error::Transport(format!("Failed to write frame: {e}")))?;
		self.writer
			.write_all(&[0])
			.await
			.map_err(|e| Error::Transport(format!("Failed to write frame delimiter: {e}")))?;
		self.writer
			.flush()
			.await
			.map_err(|e| Error::Transport(format!("Failed to flush: {e}")))
	}
}

impl<W: AsyncWrite + Unpin + Send> Transport for PipeTransportSender<W> {
	fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move { self.write_frame(&frame).await })
	}

	fn close(&mut self) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move { self.writer.shutdown().await.map_err(Error::from) })
	}
}

pub struct PipeTransportReceiver<R> {
	reader: BufReader<R>,
	max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin + Send> PipeTransportReceiver<R> {
	async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
		let limit = self.max_frame_bytes as u64 + 1;
		loop {
			let mut frame = Vec::new();
			let n = (&mut self.reader)
				.take(limit)
				.read_until(0, &mut frame)
				.await
				.map_err(|e| Error::Transport(format!("Failed to read frame: {e}")))?;

			if n == 0 {
				return Ok(None);
			}

			if frame.last() == Some(&0) {
				frame.pop();
				if frame.is_empty() {
					continue;
				}
				return Ok(Some(frame));
			}

			if frame.len() as u64 >= limit {
				return Err(Error::Transport(format!(
					"Frame exceeds {} bytes",
					self.max_frame_bytes
				)));
			}

			return Err(Error::Transport(format!(
				"Failed to read frame: stream ended after {} bytes without a delimiter",
				frame.len()
			)));
		}
	}
}

impl<R: AsyncRead + Unpin + Send> TransportReceiver for PipeTransportReceiver<R> {
	fn recv(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
		Box::pin(self.read_frame())
	}
}
