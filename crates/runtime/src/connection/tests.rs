use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cdp_protocol::target::GetTargets;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};

use super::*;
use crate::error::ErrorKind;

/// The browser end of a pipe connection.
struct FakeRemote {
	reader: BufReader<DuplexStream>,
	writer: DuplexStream,
}

impl FakeRemote {
	async fn next_request(&mut self) -> Value {
		let mut frame = Vec::new();
		let n = self.reader.read_until(0, &mut frame).await.unwrap();
		assert!(n > 0, "connection hung up");
		assert_eq!(frame.pop(), Some(0));
		serde_json::from_slice(&frame).unwrap()
	}

	async fn send(&mut self, frame: Value) {
		let mut bytes = serde_json::to_vec(&frame).unwrap();
		bytes.push(0);
		self.send_raw(&bytes).await;
	}

	async fn send_raw(&mut self, bytes: &[u8]) {
		self.writer.write_all(bytes).await.unwrap();
		self.writer.flush().await.unwrap();
	}

	async fn reply(&mut self, request: &Value, result: Value) {
		self.send(json!({"id": request["id"], "result": result})).await;
	}
}

fn create_test_connection() -> (Arc<Connection>, FakeRemote) {
	create_test_connection_with(ConnectionConfig::default())
}

fn create_test_connection_with(config: ConnectionConfig) -> (Arc<Connection>, FakeRemote) {
	let (client_out, remote_in) = duplex(64 * 1024);
	let (remote_out, client_in) = duplex(64 * 1024);

	let connection = Connection::from_pipes(client_out, client_in, config);
	let remote = FakeRemote {
		reader: BufReader::new(remote_in),
		writer: remote_out,
	};
	(connection, remote)
}

/// Attaches `session` to `target` through an auto-attach event.
async fn auto_attach(connection: &Connection, remote: &mut FakeRemote, session: &str, target: &str) {
	remote
		.send(json!({
			"method": "Target.attachedToTarget",
			"params": {
				"sessionId": session,
				"targetInfo": {"targetId": target, "type": "page", "title": "", "url": "about:blank", "attached": true},
				"waitingForDebugger": false
			}
		}))
		.await;
	connection
		.wait_for_target(&TargetId::from(target), Duration::from_secs(5))
		.await
		.unwrap();
}

#[tokio::test]
async fn test_ping_boom_out_of_order() {
	let (connection, mut remote) = create_test_connection();

	let ping = connection.send("Ping", &json!({}), None).await.unwrap();
	let boom = connection.send("Boom", &json!({}), None).await.unwrap();
	assert_eq!((ping.id(), boom.id()), (1, 2));

	let first = remote.next_request().await;
	let second = remote.next_request().await;
	assert_eq!((first["id"].as_u64(), first["method"].as_str()), (Some(1), Some("Ping")));
	assert_eq!((second["id"].as_u64(), second["method"].as_str()), (Some(2), Some("Boom")));
	assert!(first.get("sessionId").is_none());

	remote
		.send(json!({"id": 2, "error": {"code": -1, "message": "boom"}}))
		.await;
	remote.reply(&first, json!({"pong": true})).await;

	let pong = ping.await.unwrap().into_result().unwrap();
	assert_eq!(pong.get(), r#"{"pong":true}"#);

	let error = boom.await.unwrap().into_result().unwrap_err();
	assert_eq!(error.code, -1);
	assert_eq!(error.message, "boom");
	assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_send_and_wait_maps_protocol_error() {
	let (connection, mut remote) = create_test_connection();

	let caller = {
		let connection = Arc::clone(&connection);
		tokio::spawn(async move {
			connection
				.send_and_wait(&CancellationToken::new(), "Boom", &json!({}), None)
				.await
		})
	};

	let request = remote.next_request().await;
	remote
		.send(json!({"id": request["id"], "error": {"code": -32601, "message": "'Boom' wasn't found"}}))
		.await;

	let err = caller.await.unwrap().unwrap_err();
	assert_eq!(err.protocol_code(), Some(-32601));
	assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_concurrent_callers_get_their_own_results() {
	let (connection, mut remote) = create_test_connection();

	let callers: Vec<_> = (0..20u64)
		.map(|n| {
			let connection = Arc::clone(&connection);
			tokio::spawn(async move {
				let raw = connection
					.send_and_wait(&CancellationToken::new(), "Echo", &json!({"n": n}), None)
					.await
					.unwrap();
				let echoed: Value = serde_json::from_str(raw.get()).unwrap();
				(n, echoed["n"].as_u64().unwrap())
			})
		})
		.collect();

	let mut requests = Vec::new();
	for _ in 0..20 {
		requests.push(remote.next_request().await);
	}
	let mut ids: Vec<u64> = requests.iter().map(|r| r["id"].as_u64().unwrap()).collect();
	ids.sort_unstable();
	ids.dedup();
	assert_eq!(ids.len(), 20);

	for request in requests.iter().rev() {
		remote.reply(request, json!({"n": request["params"]["n"]})).await;
	}

	for caller in callers {
		let (sent, echoed) = caller.await.unwrap();
		assert_eq!(sent, echoed);
	}
}

#[tokio::test]
async fn test_cancellation_then_late_response() {
	let (connection, mut remote) = create_test_connection();
	let cancel = CancellationToken::new();

	let caller = {
		let connection = Arc::clone(&connection);
		let cancel = cancel.clone();
		tokio::spawn(async move { connection.send_and_wait(&cancel, "Slow", &json!({}), None).await })
	};

	let slow = remote.next_request().await;
	cancel.cancel();
	assert!(matches!(caller.await.unwrap(), Err(Error::Cancelled)));
	assert_eq!(connection.pending_calls(), 0);

	// The late reply is dropped; the connection keeps working.
	remote.reply(&slow, json!({})).await;

	let ping = connection.send("Ping", &json!({}), None).await.unwrap();
	let request = remote.next_request().await;
	remote.reply(&request, json!({"pong": true})).await;
	ping.await.unwrap();

	assert_eq!(connection.stats().orphaned_responses, 1);
	assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_already_cancelled_token_writes_nothing() {
	let (connection, mut remote) = create_test_connection();
	let cancel = CancellationToken::new();
	cancel.cancel();

	let err = connection
		.send_and_wait(&cancel, "Never", &json!({}), None)
		.await
		.unwrap_err();
	assert!(err.is_cancelled());

	connection.send("Next", &json!({}), None).await.unwrap();
	assert_eq!(remote.next_request().await["method"], "Next");
}

#[tokio::test]
async fn test_request_timeout_from_config() {
	let config = ConnectionConfig::default().with_request_timeout(Duration::from_millis(20));
	let (connection, mut remote) = create_test_connection_with(config);

	let err = connection
		.send_and_wait(&CancellationToken::new(), "Slow", &json!({}), None)
		.await
		.unwrap_err();
	assert!(matches!(err, Error::Timeout(_)));
	assert_eq!(connection.pending_calls(), 0);
	assert_eq!(remote.next_request().await["method"], "Slow");
}

#[tokio::test]
async fn test_close_fails_pending_calls_and_ends_streams() {
	let (connection, mut remote) = create_test_connection();

	let mut pending = Vec::new();
	for method in ["A.one", "A.two", "A.three"] {
		pending.push(connection.send(method, &json!({}), None).await.unwrap());
	}
	for _ in 0..3 {
		remote.next_request().await;
	}
	let mut page = connection.subscribe(EventFilter::domain("Page"));
	let mut all = connection.subscribe(EventFilter::any());

	connection.close().await;
	connection.close().await;

	for call in pending {
		assert!(matches!(call.await, Err(Error::ConnectionClosed)));
	}
	assert!(page.recv().await.is_none());
	assert!(all.recv().await.is_none());
	assert!(all.recv().await.is_none());

	assert!(connection.is_closed());
	assert_eq!(connection.close_reason(), Some(CloseReason::Local));
	assert!(matches!(
		connection.send("Late", &json!({}), None).await,
		Err(Error::ConnectionClosed)
	));
}

#[tokio::test]
async fn test_concurrent_close_is_safe() {
	let (connection, _remote) = create_test_connection();
	let pending = connection.send("A", &json!({}), None).await.unwrap();

	let closers: Vec<_> = (0..4)
		.map(|_| {
			let connection = Arc::clone(&connection);
			tokio::spawn(async move { connection.close().await })
		})
		.collect();
	for closer in closers {
		closer.await.unwrap();
	}

	assert!(matches!(pending.await, Err(Error::ConnectionClosed)));
	connection.closed().await;
}

#[tokio::test]
async fn test_remote_hangup_closes_connection() {
	let (connection, remote) = create_test_connection();
	let pending = connection.send("A", &json!({}), None).await.unwrap();

	drop(remote);
	connection.closed().await;

	assert_eq!(connection.close_reason(), Some(CloseReason::RemoteHangup));
	assert!(matches!(pending.await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_write_failure_closes_connection() {
	let (client_out, remote_in) = duplex(1024);
	let (_remote_out, client_in) = duplex(1024);
	let connection = Connection::from_pipes(client_out, client_in, ConnectionConfig::default());
	drop(remote_in);

	let err = connection.send("A", &json!({}), None).await.unwrap_err();
	assert!(err.is_transport(), "{err}");

	connection.closed().await;
	assert!(matches!(connection.close_reason(), Some(CloseReason::WriteFailed(_))));
}

#[tokio::test]
async fn test_dropping_last_handle_fails_pending_calls() {
	let (connection, _remote) = create_test_connection();
	let pending = connection.send("A", &json!({}), None).await.unwrap();

	drop(connection);
	assert!(matches!(pending.await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_unmatched_event_does_not_disturb_subscribers() {
	let (connection, mut remote) = create_test_connection();
	let mut loads = connection.subscribe(EventFilter::method("Page.loadEventFired"));

	remote
		.send(json!({"method": "Network.requestWillBeSent", "params": {}}))
		.await;
	remote
		.send(json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.5}}))
		.await;

	let event = loads.recv().await.unwrap();
	assert_eq!(event.method, "Page.loadEventFired");
	assert!(loads.try_recv().is_none());
	assert_eq!(connection.stats().unrouted_events, 1);
}

#[tokio::test]
async fn test_malformed_frames_do_not_stop_reader() {
	let (connection, mut remote) = create_test_connection();
	let pending = connection.send("A", &json!({}), None).await.unwrap();
	let request = remote.next_request().await;

	remote.send_raw(b"not json\0").await;
	remote
		.send(json!({"id": 1, "result": {}, "error": {"code": 1, "message": "both"}}))
		.await;
	remote.send(json!({"params": {}})).await;
	remote
		.send(json!({"id": 77, "method": "Browser.unexpected"}))
		.await;
	remote.reply(&request, json!({"ok": true})).await;

	pending.await.unwrap();
	let stats = connection.stats();
	assert_eq!(stats.malformed_frames, 3);
	assert_eq!(stats.unexpected_requests, 1);
	assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_on_invokes_handler_until_dropped() {
	let (connection, mut remote) = create_test_connection();
	let seen = Arc::new(AtomicUsize::new(0));
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

	let subscription = {
		let seen = Arc::clone(&seen);
		connection.on(EventFilter::domain("Log"), move |event| {
			let seen = Arc::clone(&seen);
			let tx = tx.clone();
			async move {
				seen.fetch_add(1, Ordering::SeqCst);
				let _ = tx.send(event.method.clone());
				Ok(())
			}
		})
	};

	remote.send(json!({"method": "Log.entryAdded", "params": {}})).await;
	assert_eq!(rx.recv().await.unwrap(), "Log.entryAdded");

	drop(subscription);
	let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
	while connection.router.subscriber_count() > 0 {
		assert!(tokio::time::Instant::now() < deadline, "handler task kept its stream");
		tokio::time::sleep(Duration::from_millis(1)).await;
	}

	// A second event reaches a witness stream but not the dropped handler.
	let mut witness = connection.subscribe(EventFilter::domain("Log"));
	remote.send(json!({"method": "Log.entryAdded", "params": {}})).await;
	assert_eq!(witness.recv().await.unwrap().method, "Log.entryAdded");
	tokio::time::sleep(Duration::from_millis(20)).await;

	assert_eq!(seen.load(Ordering::SeqCst), 1);
	assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_wait_for_event() {
	let (connection, mut remote) = create_test_connection();

	let waiter = {
		let connection = Arc::clone(&connection);
		tokio::spawn(async move {
			connection
				.wait_for_event(EventFilter::method("Page.frameNavigated"), Duration::from_secs(5))
				.await
		})
	};
	// Give the waiter time to subscribe.
	tokio::time::sleep(Duration::from_millis(20)).await;
	remote
		.send(json!({"method": "Page.frameNavigated", "params": {"frame": {}}}))
		.await;

	let event = waiter.await.unwrap().unwrap();
	assert_eq!(event.method, "Page.frameNavigated");

	let err = connection
		.wait_for_event(EventFilter::method("Never.happens"), Duration::from_millis(10))
		.await
		.unwrap_err();
	assert!(matches!(err, Error::Timeout(_)));
}

#[tokio::test]
async fn test_auto_attach_registers_session() {
	let (connection, mut remote) = create_test_connection();
	auto_attach(&connection, &mut remote, "S1", "T1").await;

	let session = connection.session(&SessionId::from("S1")).unwrap();
	assert_eq!(session.target_id().as_str(), "T1");
	assert_eq!(connection.sessions().len(), 1);

	let pending = connection
		.send("Page.enable", &json!({}), Some(session.id()))
		.await
		.unwrap();
	let request = remote.next_request().await;
	assert_eq!(request["sessionId"], "S1");
	remote
		.send(json!({"id": request["id"], "result": {}, "sessionId": "S1"}))
		.await;
	pending.await.unwrap();
}

#[tokio::test]
async fn test_session_events_are_filtered_by_scope() {
	let (connection, mut remote) = create_test_connection();
	auto_attach(&connection, &mut remote, "S1", "T1").await;
	auto_attach(&connection, &mut remote, "S2", "T2").await;

	let mut s1 = connection.subscribe(EventFilter::domain("Page").in_session(SessionId::from("S1")));
	let mut browser = connection.subscribe(EventFilter::any().browser_only());

	remote
		.send(json!({"method": "Page.loadEventFired", "params": {}, "sessionId": "S2"}))
		.await;
	remote
		.send(json!({"method": "Page.loadEventFired", "params": {}, "sessionId": "S1"}))
		.await;
	remote
		.send(json!({"method": "Target.targetCreated", "params": {}}))
		.await;

	let event = s1.recv().await.unwrap();
	assert_eq!(event.session_id.as_ref().map(SessionId::as_str), Some("S1"));
	assert_eq!(browser.recv().await.unwrap().method, "Target.targetCreated");
	assert!(s1.try_recv().is_none());
}

#[tokio::test]
async fn test_request_after_remote_detach_is_rejected_without_writing() {
	let (connection, mut remote) = create_test_connection();
	auto_attach(&connection, &mut remote, "S1", "T1").await;
	let session = SessionId::from("S1");

	let mut detached = connection.subscribe(EventFilter::method("Target.detachedFromTarget"));
	remote
		.send(json!({"method": "Target.detachedFromTarget", "params": {"sessionId": "S1", "targetId": "T1"}}))
		.await;
	detached.recv().await.unwrap();

	let err = connection
		.send("Page.navigate", &json!({"url": "about:blank"}), Some(&session))
		.await
		.unwrap_err();
	assert!(matches!(err, Error::SessionNotFound(_)));

	// Late events for the detached session are dropped.
	remote
		.send(json!({"method": "Page.loadEventFired", "params": {}, "sessionId": "S1"}))
		.await;

	let version = connection.send("Browser.getVersion", &json!({}), None).await.unwrap();
	let next = remote.next_request().await;
	assert_eq!(next["method"], "Browser.getVersion");
	assert!(next.get("sessionId").is_none());

	remote.reply(&next, json!({})).await;
	version.await.unwrap();
	assert_eq!(connection.stats().detached_session_frames, 1);
}

#[tokio::test]
async fn test_purged_session_events_are_routed_again() {
	let (connection, mut remote) = create_test_connection();
	auto_attach(&connection, &mut remote, "S1", "T1").await;
	auto_attach(&connection, &mut remote, "S2", "T2").await;
	assert!(connection.detach_locally(&SessionId::from("S1")));

	assert_eq!(connection.purge_detached_sessions(), 1);
	assert_eq!(connection.purge_detached_sessions(), 0);
	assert!(connection.session(&SessionId::from("S1")).is_none());
	assert_eq!(connection.sessions().len(), 1);

	let mut events = connection.subscribe(EventFilter::any().in_session(SessionId::from("S1")));
	remote
		.send(json!({"method": "Page.loadEventFired", "params": {}, "sessionId": "S1"}))
		.await;
	assert_eq!(events.recv().await.unwrap().method, "Page.loadEventFired");
	assert_eq!(connection.stats().detached_session_frames, 0);
}

#[tokio::test]
async fn test_attach_and_detach_round_trip() {
	let (connection, mut remote) = create_test_connection();
	let cancel = CancellationToken::new();

	let attach = {
		let connection = Arc::clone(&connection);
		let cancel = cancel.clone();
		tokio::spawn(async move { connection.attach(&TargetId::from("T9"), &cancel).await })
	};
	let request = remote.next_request().await;
	assert_eq!(request["method"], "Target.attachToTarget");
	assert_eq!(request["params"], json!({"targetId": "T9", "flatten": true}));
	remote.reply(&request, json!({"sessionId": "S9"})).await;

	let session = attach.await.unwrap().unwrap();
	assert_eq!(session.id().as_str(), "S9");

	let scoped = connection
		.send("Runtime.evaluate", &json!({"expression": "1"}), Some(session.id()))
		.await
		.unwrap();
	remote.next_request().await;

	let detach = {
		let connection = Arc::clone(&connection);
		let id = session.id().clone();
		tokio::spawn(async move { connection.detach(&id, &cancel).await })
	};

	let request = remote.next_request().await;
	assert_eq!(request["method"], "Target.detachFromTarget");
	assert_eq!(request["params"]["sessionId"], "S9");
	assert!(matches!(scoped.await, Err(Error::SessionDetached(_))));
	assert!(session.is_detached());

	remote.reply(&request, json!({})).await;
	detach.await.unwrap().unwrap();

	// Scoping to the detached session fails locally.
	let err = connection
		.send("Runtime.evaluate", &json!({"expression": "2"}), Some(session.id()))
		.await
		.unwrap_err();
	assert!(matches!(err, Error::SessionNotFound(_)));

	// Detaching again is a no-op and writes nothing.
	connection.detach(session.id(), &CancellationToken::new()).await.unwrap();
	assert!(matches!(
		connection.detach(&SessionId::from("unknown"), &CancellationToken::new()).await,
		Err(Error::SessionNotFound(_))
	));

	let version = connection.send("Browser.getVersion", &json!({}), None).await.unwrap();
	let next = remote.next_request().await;
	assert_eq!(next["method"], "Browser.getVersion");
	assert!(next.get("sessionId").is_none());
	remote.reply(&next, json!({})).await;
	version.await.unwrap();
	assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_detach_racing_sends_leaves_no_live_call() {
	let (connection, mut remote) = create_test_connection();
	let ids: Vec<SessionId> = (0..8).map(|i| SessionId::from(format!("S{i}"))).collect();
	for (i, id) in ids.iter().enumerate() {
		auto_attach(&connection, &mut remote, id.as_str(), &format!("T{i}")).await;
	}

	// Drain writes so the pipe never fills; nothing is ever answered.
	let FakeRemote { mut reader, writer } = remote;
	let drain = tokio::spawn(async move {
		let mut frame = Vec::new();
		while reader.read_until(0, &mut frame).await.is_ok_and(|n| n > 0) {
			frame.clear();
		}
	});

	let mut senders = Vec::new();
	for id in &ids {
		let connection = Arc::clone(&connection);
		let id = id.clone();
		senders.push(tokio::spawn(async move {
			let mut accepted = Vec::new();
			for _ in 0..200 {
				match connection.send("Page.enable", &json!({}), Some(&id)).await {
					Ok(pending) => accepted.push(pending),
					Err(Error::SessionNotFound(_)) => break,
					Err(err) => panic!("unexpected send error: {err}"),
				}
				tokio::task::yield_now().await;
			}
			accepted
		}));
	}

	for id in &ids {
		tokio::task::yield_now().await;
		assert!(connection.detach_locally(id));
	}

	for sender in senders {
		for pending in sender.await.unwrap() {
			let outcome = tokio::time::timeout(Duration::from_secs(1), pending)
				.await
				.expect("scoped call left pending after detach");
			assert!(matches!(outcome, Err(Error::SessionDetached(_))));
		}
	}
	assert_eq!(connection.pending_calls(), 0);

	connection.close().await;
	drop(writer);
	drain.await.unwrap();
}

#[tokio::test]
async fn test_wait_for_target_ends_on_close() {
	let (connection, _remote) = create_test_connection();

	let waiter = {
		let connection = Arc::clone(&connection);
		tokio::spawn(async move {
			connection
				.wait_for_target(&TargetId::from("T1"), Duration::from_secs(30))
				.await
		})
	};
	tokio::time::sleep(Duration::from_millis(10)).await;
	connection.close().await;

	assert!(matches!(waiter.await.unwrap(), Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_channel_executes_typed_command_in_session() {
	let (connection, mut remote) = create_test_connection();
	auto_attach(&connection, &mut remote, "S1", "T1").await;

	let channel = connection.session_channel(SessionId::from("S1"));
	let call = tokio::spawn(async move { channel.execute(&GetTargets {}).await });

	let request = remote.next_request().await;
	assert_eq!(request["method"], "Target.getTargets");
	assert_eq!(request["sessionId"], "S1");
	remote
		.reply(
			&request,
			json!({"targetInfos": [{"targetId": "T1", "type": "page", "title": "t", "url": "about:blank", "attached": true}]}),
		)
		.await;

	let response = call.await.unwrap().unwrap();
	assert_eq!(response.target_infos.len(), 1);
	assert_eq!(response.target_infos[0].target_type, "page");
}

#[tokio::test]
async fn test_channel_send_no_params_omits_params() {
	let (connection, mut remote) = create_test_connection();
	let channel = connection.channel();

	let call = tokio::spawn(async move { channel.send_no_params::<Value>("Browser.getVersion").await });
	let request = remote.next_request().await;
	assert!(request.get("params").is_none());
	remote.reply(&request, json!({"product": "Chrome/120"})).await;

	assert_eq!(call.await.unwrap().unwrap()["product"], "Chrome/120");
}
