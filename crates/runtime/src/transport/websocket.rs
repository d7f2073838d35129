//! WebSocket transport using `tokio-tungstenite`.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use super::{Transport, TransportParts, TransportReceiver};
use crate::error::{Error, Result};

/// Dials `ws://` / `wss://` DevTools endpoints.
pub struct WebSocketTransport;

impl WebSocketTransport {
	/// Connects and completes the handshake, failing fast after `timeout`.
	pub async fn connect(url: &str, timeout: Duration) -> Result<TransportParts> {
		let handshake = tokio_tungstenite::connect_async(url);
		let (ws, response) = match tokio::time::timeout(timeout, handshake).await {
			Ok(Ok(pair)) => pair,
			Ok(Err(e)) => {
				return Err(Error::ConnectionFailed {
					endpoint: url.to_string(),
					reason: e.to_string(),
				});
			}
			Err(_) => {
				return Err(Error::ConnectionFailed {
					endpoint: url.to_string(),
					reason: format!("handshake did not complete within {timeout:?}"),
				});
			}
		};

		debug!(url, status = %response.status(), "WebSocket handshake complete");
		Ok(Self::from_stream(ws))
	}

	/// Wraps an already-established stream, client or server side.
	pub fn from_stream<S>(ws: WebSocketStream<S>) -> TransportParts
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let (sink, stream) = ws.split();
		TransportParts {
			sender: Box::new(WebSocketSender { sink }),
			receiver: Box::new(WebSocketReceiver { stream }),
		}
	}
}

pub struct WebSocketSender<S> {
	sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> Transport for WebSocketSender<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			let text = String::from_utf8(frame)
				.map_err(|e| Error::Transport(format!("Frame is not valid UTF-8: {e}")))?;
			self.sink
				.send(Message::Text(text))
				.await
				.map_err(|e| Error::Transport(format!("Failed to send WebSocket message: {e}")))
		})
	}

	fn close(&mut self) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			match self.sink.close().await {
				Ok(()) => Ok(()),
				Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
				Err(e) => Err(Error::Transport(format!("Failed to close WebSocket: {e}"))),
			}
		})
	}
}

pub struct WebSocketReceiver<S> {
	stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WebSocketReceiver<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
		loop {
			match self.stream.next().await {
				Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
				Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
				Some(Ok(Message::Close(frame))) => {
					debug!(?frame, "WebSocket closed by remote");
					return Ok(None);
				}
				Some(Ok(_)) => continue, // ping/pong/raw frame
				Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
				| None => return Ok(None),
				Some(Err(e)) => {
					return Err(Error::Transport(format!("WebSocket read failed: {e}")));
				}
			}
		}
	}
}

impl<S> TransportReceiver for WebSocketReceiver<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	fn recv(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
		Box::pin(self.next_frame())
	}
}
