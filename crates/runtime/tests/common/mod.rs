// Shared helpers for runtime integration tests.

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

/// Routes runtime logs through the test harness. Set `RUST_LOG` to override.
pub fn init_logging() {
	let env_filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new("warn,cdp_runtime=debug"));

	let _ = tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_test_writer()
		.with_target(true)
		.compact()
		.try_init();
}

/// Minimal DevTools-like WebSocket endpoint for one client.
///
/// - `Echo` answers with its own params
/// - `Fail` answers with a protocol error
/// - `Emit` pushes a `Test.emitted` event before answering
/// - `Hangup` closes the socket without answering
pub struct FakeBrowser {
	url: String,
}

impl FakeBrowser {
	pub async fn start() -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

			while let Some(Ok(message)) = ws.next().await {
				let Message::Text(text) = message else { continue };
				let request: Value = serde_json::from_str(&text).unwrap();
				let id = request["id"].clone();

				let reply = match request["method"].as_str().unwrap_or_default() {
					"Echo" => json!({"id": id, "result": request.get("params").cloned().unwrap_or(json!({}))}),
					"Fail" => json!({"id": id, "error": {"code": -32000, "message": "requested failure"}}),
					"Emit" => {
						let event = json!({"method": "Test.emitted", "params": {"for": id}});
						ws.send(Message::Text(event.to_string())).await.unwrap();
						json!({"id": id, "result": {}})
					}
					"Hangup" => {
						let _ = ws.close(None).await;
						break;
					}
					other => json!({"id": id, "error": {"code": -32601, "message": format!("'{other}' wasn't found")}}),
				};
				ws.send(Message::Text(reply.to_string())).await.unwrap();
			}
		});

		Self {
			url: format!("ws://{addr}"),
		}
	}

	pub fn url(&self) -> &str {
		&self.url
	}
}
