//! End-to-end broker tests over real Unix sockets.
//!
//! Raw socket peers (hand-rolled frames) exercise the wire contract;
//! [`RelayClient`] peers exercise the client runtime against the same
//! broker.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::client::{ClientConfig, ClientEvent, RelayClient};
use crate::config::RelayConfig;
use crate::protocol::envelope::{
    Body, ChannelPayload, Envelope, ErrorCode, HeartbeatPayload, HelloPayload, MessagePayload,
    SpawnPayload, SyncResponse, TopicPayload, WelcomePayload, BROADCAST,
};
use crate::protocol::framing::{encode, Decoded, FrameDecoder};

use super::{Broker, BrokerHandle};

const CAP: u32 = 1024 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_broker(config: RelayConfig) -> (BrokerHandle, PathBuf, tempfile::TempDir) {
    let tmp = tempfile::TempDir::new().unwrap();
    let socket = tmp.path().join("relay.sock");
    let mut config = config;
    config.socket_path = socket.clone();
    let handle = Broker::start(config).await.unwrap();
    (handle, socket, tmp)
}

async fn start_default_broker() -> (BrokerHandle, PathBuf, tempfile::TempDir) {
    start_broker(RelayConfig::default()).await
}

/// Raw frame-level peer for wire-contract tests.
struct TestPeer {
    stream: UnixStream,
    decoder: FrameDecoder,
    queued: Vec<Envelope>,
}

impl TestPeer {
    async fn connect(socket: &PathBuf) -> Self {
        let stream = UnixStream::connect(socket).await.unwrap();
        Self {
            stream,
            decoder: FrameDecoder::new(CAP),
            queued: Vec::new(),
        }
    }

    async fn send(&mut self, envelope: &Envelope) {
        self.stream
            .write_all(&encode(envelope, CAP).unwrap())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        if !self.queued.is_empty() {
            return self.queued.remove(0);
        }
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = tokio::time::timeout(RECV_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("recv timed out")
                .expect("read failed");
            assert!(n > 0, "broker closed the connection");
            for item in self.decoder.feed(&buf[..n]).unwrap() {
                if let Decoded::Envelope(envelope) = item {
                    self.queued.push(envelope);
                }
            }
            if !self.queued.is_empty() {
                return self.queued.remove(0);
            }
        }
    }

    /// Receive, skipping envelopes that do not match.
    async fn recv_where(&mut self, pred: impl Fn(&Envelope) -> bool) -> Envelope {
        loop {
            let envelope = self.recv().await;
            if pred(&envelope) {
                return envelope;
            }
        }
    }

    /// Assert no DELIVER arrives within the window.
    async fn expect_no_deliver(&mut self, window: Duration) {
        let mut buf = vec![0u8; 64 * 1024];
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await;
            match read {
                Err(_) => return, // window elapsed quietly
                Ok(Ok(0)) => return,
                Ok(Ok(n)) => {
                    for item in self.decoder.feed(&buf[..n]).unwrap() {
                        if let Decoded::Envelope(envelope) = item {
                            assert!(
                                !matches!(envelope.body, Body::Deliver(_)),
                                "unexpected DELIVER: {envelope:?}"
                            );
                        }
                    }
                }
                Ok(Err(e)) => panic!("read failed: {e}"),
            }
        }
    }

    async fn hello(&mut self, agent: &str) -> WelcomePayload {
        self.hello_with(HelloPayload::new(agent)).await
    }

    async fn hello_with(&mut self, hello: HelloPayload) -> WelcomePayload {
        self.send(&Envelope::new(Body::Hello(hello))).await;
        let envelope = self
            .recv_where(|e| matches!(e.body, Body::Welcome(_)))
            .await;
        match envelope.body {
            Body::Welcome(welcome) => welcome,
            _ => unreachable!(),
        }
    }

    async fn send_text(&mut self, id: &str, to: &str, body: &str) {
        let envelope = Envelope::new(Body::Send(MessagePayload::chat(body)))
            .with_id(id)
            .with_to(to);
        self.send(&envelope).await;
    }

    async fn ack(&mut self, deliver: &Envelope) {
        let seq = deliver.delivery.as_ref().map(|d| d.seq);
        let ack = Envelope::new(Body::Ack(crate::protocol::envelope::AckPayload::of(
            deliver.id.clone(),
            seq,
        )));
        self.send(&ack).await;
    }
}

// ─── Handshake & identity ──────────────────────────────────────────────────

#[tokio::test]
async fn test_two_peers_one_message() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut alice = TestPeer::connect(&socket).await;
    alice.hello("Alice").await;
    let mut bob = TestPeer::connect(&socket).await;
    bob.hello("Bob").await;

    alice.send_text("alice-1", "Bob", "hi").await;

    let deliver = bob
        .recv_where(|e| matches!(e.body, Body::Deliver(_)))
        .await;
    assert_eq!(deliver.from.as_deref(), Some("Alice"));
    assert_eq!(deliver.id, "alice-1");
    match &deliver.body {
        Body::Deliver(payload) => assert_eq!(payload.body, "hi"),
        _ => unreachable!(),
    }
    let delivery = deliver.delivery.as_ref().expect("delivery block");
    assert_eq!(delivery.seq, 1);
    assert!(delivery.original_to.is_none());
    bob.ack(&deliver).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_hello_is_fatal() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut peer = TestPeer::connect(&socket).await;
    peer.hello("Alice").await;
    peer.send(&Envelope::new(Body::Hello(HelloPayload::new("Alice"))))
        .await;

    let error = peer
        .recv_where(|e| matches!(e.body, Body::Error(_)))
        .await;
    match error.body {
        Body::Error(e) => {
            assert_eq!(e.code, ErrorCode::DuplicateHello);
            assert!(e.fatal);
        }
        _ => unreachable!(),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_name_in_use_rejected() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut first = TestPeer::connect(&socket).await;
    first.hello("Alice").await;

    let mut second = TestPeer::connect(&socket).await;
    second
        .send(&Envelope::new(Body::Hello(HelloPayload::new("Alice"))))
        .await;
    let error = second
        .recv_where(|e| matches!(e.body, Body::Error(_)))
        .await;
    match error.body {
        Body::Error(e) => {
            assert_eq!(e.code, ErrorCode::NameInUse);
            assert!(e.fatal);
        }
        _ => unreachable!(),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_send_before_hello_is_fatal() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut peer = TestPeer::connect(&socket).await;
    peer.send_text("m1", "Bob", "too early").await;

    let error = peer
        .recv_where(|e| matches!(e.body, Body::Error(_)))
        .await;
    match error.body {
        Body::Error(e) => {
            assert_eq!(e.code, ErrorCode::HandshakeRequired);
            assert!(e.fatal);
        }
        _ => unreachable!(),
    }

    handle.shutdown().await;
}

// ─── Routing ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_broadcast_excludes_sender() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut alice = TestPeer::connect(&socket).await;
    alice.hello("Alice").await;
    let mut bob = TestPeer::connect(&socket).await;
    bob.hello("Bob").await;
    let mut carol = TestPeer::connect(&socket).await;
    carol.hello("Carol").await;

    alice.send_text("alice-1", BROADCAST, "hello").await;

    for peer in [&mut bob, &mut carol] {
        let deliver = peer
            .recv_where(|e| matches!(e.body, Body::Deliver(_)))
            .await;
        assert_eq!(
            deliver.delivery.as_ref().unwrap().original_to.as_deref(),
            Some(BROADCAST)
        );
        let ack = deliver.clone();
        peer.ack(&ack).await;
    }

    alice.expect_no_deliver(Duration::from_millis(300)).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_channel_fanout_excludes_sender() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut alice = TestPeer::connect(&socket).await;
    alice.hello("Alice").await;
    let mut bob = TestPeer::connect(&socket).await;
    bob.hello("Bob").await;
    let mut carol = TestPeer::connect(&socket).await;
    carol.hello("Carol").await;

    for peer in [&mut alice, &mut bob] {
        peer.send(&Envelope::new(Body::ChannelJoin(ChannelPayload {
            channel: "#team".into(),
        })))
        .await;
    }
    // Joins are processed in arrival order; the SEND below lands after.

    let send = Envelope::new(Body::Send(MessagePayload::chat("go")))
        .with_id("carol-1")
        .with_topic("#team");
    carol.send(&send).await;

    for peer in [&mut alice, &mut bob] {
        let deliver = peer
            .recv_where(|e| matches!(e.body, Body::Deliver(_)))
            .await;
        assert_eq!(deliver.from.as_deref(), Some("Carol"));
        assert_eq!(deliver.topic.as_deref(), Some("#team"));
        let ack = deliver.clone();
        peer.ack(&ack).await;
    }

    carol.expect_no_deliver(Duration::from_millis(300)).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_destination_errors() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut alice = TestPeer::connect(&socket).await;
    alice.hello("Alice").await;
    alice.send_text("alice-1", "Nobody", "hello?").await;

    let error = alice
        .recv_where(|e| matches!(e.body, Body::Error(_)))
        .await;
    match error.body {
        Body::Error(e) => {
            assert_eq!(e.code, ErrorCode::UnknownDestination);
            assert!(!e.fatal);
            assert_eq!(e.ref_id.as_deref(), Some("alice-1"));
        }
        _ => unreachable!(),
    }

    handle.shutdown().await;
}

// ─── FIFO ordering ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sender_to_destination_fifo() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut alice = TestPeer::connect(&socket).await;
    alice.hello("Alice").await;
    let mut bob = TestPeer::connect(&socket).await;
    bob.hello("Bob").await;

    for i in 1..=5 {
        alice
            .send_text(&format!("alice-{i}"), "Bob", &format!("msg {i}"))
            .await;
    }

    let mut seqs = Vec::new();
    for i in 1..=5 {
        let deliver = bob
            .recv_where(|e| matches!(e.body, Body::Deliver(_)))
            .await;
        assert_eq!(deliver.id, format!("alice-{i}"), "FIFO order violated");
        seqs.push(deliver.delivery.as_ref().unwrap().seq);
        let ack = deliver.clone();
        bob.ack(&ack).await;
    }
    assert_eq!(seqs, vec![1, 2, 3, 4, 5], "session seq must be monotonic");

    handle.shutdown().await;
}

// ─── Resume ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_resume_replays_queued_delivery() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut agent1 = TestPeer::connect(&socket).await;
    let welcome = agent1.hello("Agent1").await;
    let session_id = welcome.session_id.clone();
    let token = welcome.resume_token.clone().expect("resume token");

    let mut peer = TestPeer::connect(&socket).await;
    peer.hello("Peer").await;

    // Kill Agent1's socket; the session goes dormant.
    drop(agent1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A send while Agent1 is away is queued, not errored.
    peer.send_text("peer-1", "Agent1", "missed you").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reconnect within the window presenting the token.
    let mut resumed = TestPeer::connect(&socket).await;
    let mut hello = HelloPayload::new("Agent1");
    hello.resume_token = Some(token);
    let welcome = resumed.hello_with(hello).await;
    assert_eq!(welcome.session_id, session_id, "same session on resume");
    assert!(welcome.resumed);

    let deliver = resumed
        .recv_where(|e| matches!(e.body, Body::Deliver(_)))
        .await;
    assert_eq!(deliver.id, "peer-1");
    match &deliver.body {
        Body::Deliver(payload) => assert_eq!(payload.body, "missed you"),
        _ => unreachable!(),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_stale_resume_token_gets_fresh_session_and_warning() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut peer = TestPeer::connect(&socket).await;
    let mut hello = HelloPayload::new("Agent1");
    hello.resume_token = Some("bogus-token".into());
    peer.send(&Envelope::new(Body::Hello(hello))).await;

    let mut got_welcome = false;
    let mut got_warning = false;
    for _ in 0..2 {
        let envelope = peer.recv().await;
        match envelope.body {
            Body::Welcome(w) => {
                assert!(!w.resumed);
                got_welcome = true;
            }
            Body::Error(e) => {
                assert_eq!(e.code, ErrorCode::ResumeTooOld);
                assert!(!e.fatal);
                got_warning = true;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(got_welcome && got_warning);

    handle.shutdown().await;
}

// ─── Heartbeat ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_heartbeat_miss_marks_dormant() {
    let mut config = RelayConfig::default();
    config.heartbeat = Duration::from_millis(200);
    let (handle, socket, _tmp) = start_broker(config).await;

    let mut peer = TestPeer::connect(&socket).await;
    peer.hello("Silent").await;

    // Receive the PING but never answer it; within 2H the broker must
    // close the socket (dormancy) rather than keep the peer live.
    let ping = peer.recv_where(|e| matches!(e.body, Body::Ping(_))).await;
    assert!(matches!(ping.body, Body::Ping(_)));

    let mut buf = [0u8; 1024];
    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match peer.stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "broker never closed the silent connection");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_pong_keeps_connection_alive() {
    let mut config = RelayConfig::default();
    config.heartbeat = Duration::from_millis(200);
    let (handle, socket, _tmp) = start_broker(config).await;

    let mut peer = TestPeer::connect(&socket).await;
    peer.hello("Responsive").await;

    // Answer pings for a full second; connection must stay open.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        let envelope = tokio::time::timeout(Duration::from_millis(400), peer.recv()).await;
        if let Ok(envelope) = envelope {
            if let Body::Ping(hb) = envelope.body {
                peer.send(&Envelope::new(Body::Pong(HeartbeatPayload {
                    nonce: hb.nonce,
                })))
                .await;
            }
        }
    }

    // Still handshaken: a send to ourselves-adjacent peer still works.
    let mut other = TestPeer::connect(&socket).await;
    other.hello("Other").await;
    peer.send_text("r-1", "Other", "still here").await;
    let deliver = other
        .recv_where(|e| matches!(e.body, Body::Deliver(_)))
        .await;
    assert_eq!(deliver.id, "r-1");

    handle.shutdown().await;
}

// ─── Framing faults ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_frame_skipped_without_desync() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let mut alice = TestPeer::connect(&socket).await;
    alice.hello("Alice").await;
    let mut bob = TestPeer::connect(&socket).await;
    bob.hello("Bob").await;

    // A complete frame of junk JSON, then a valid SEND.
    let junk = b"{\"garbage\": true}";
    let mut bytes = (junk.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(junk);
    alice.stream.write_all(&bytes).await.unwrap();
    alice.send_text("alice-1", "Bob", "after junk").await;

    let error = alice
        .recv_where(|e| matches!(e.body, Body::Error(_)))
        .await;
    match error.body {
        Body::Error(e) => {
            assert_eq!(e.code, ErrorCode::MalformedFrame);
            assert!(!e.fatal, "stream stays synchronized");
        }
        _ => unreachable!(),
    }

    let deliver = bob
        .recv_where(|e| matches!(e.body, Body::Deliver(_)))
        .await;
    assert_eq!(deliver.id, "alice-1");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_is_fatal() {
    let mut config = RelayConfig::default();
    config.max_frame_bytes = 1024;
    let (handle, socket, _tmp) = start_broker(config).await;

    let mut peer = TestPeer::connect(&socket).await;
    // Announce a frame one byte over the limit.
    peer.stream
        .write_all(&1025u32.to_be_bytes())
        .await
        .unwrap();

    // Broker answers FRAME_TOO_LARGE (fatal) and closes.
    let mut decoder = FrameDecoder::new(CAP);
    let mut buf = vec![0u8; 4096];
    let mut saw_fatal = false;
    loop {
        let n = match tokio::time::timeout(RECV_TIMEOUT, peer.stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break,
        };
        for item in decoder.feed(&buf[..n]).unwrap() {
            if let Decoded::Envelope(envelope) = item {
                if let Body::Error(e) = envelope.body {
                    assert_eq!(e.code, ErrorCode::FrameTooLarge);
                    assert!(e.fatal);
                    saw_fatal = true;
                }
            }
        }
    }
    assert!(saw_fatal, "expected a fatal FRAME_TOO_LARGE error");

    handle.shutdown().await;
}

// ─── Back-pressure ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_destination_queue_signals_busy() {
    let mut config = RelayConfig::default();
    config.max_queue_depth = 3;
    let (handle, socket, _tmp) = start_broker(config).await;

    let mut alice = TestPeer::connect(&socket).await;
    alice.hello("Alice").await;
    let mut bob = TestPeer::connect(&socket).await;
    bob.hello("Bob").await;

    // Bob never ACKs, so deliveries pile up inflight.
    for i in 1..=4 {
        alice
            .send_text(&format!("alice-{i}"), "Bob", "flood")
            .await;
    }

    let busy = alice
        .recv_where(|e| matches!(e.body, Body::Busy(_)))
        .await;
    assert!(matches!(busy.body, Body::Busy(_)));

    handle.shutdown().await;
}

// ─── Client runtime against the broker ─────────────────────────────────────

async fn next_message(client: &mut RelayClient) -> crate::client::IncomingMessage {
    loop {
        let event = tokio::time::timeout(RECV_TIMEOUT, client.recv())
            .await
            .expect("timed out")
            .expect("client stopped");
        if let ClientEvent::Message(message) = event {
            return message;
        }
    }
}

#[tokio::test]
async fn test_client_runtime_round_trip() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let alice = RelayClient::connect(ClientConfig::new(&socket, "Alice"))
        .await
        .unwrap();
    let mut bob = RelayClient::connect(ClientConfig::new(&socket, "Bob"))
        .await
        .unwrap();
    assert!(alice.session_id().is_some());

    let id = alice.send_text("Bob", "hello bob").unwrap();
    assert_eq!(id, "Alice-1");
    assert_eq!(alice.send_text("Bob", "again").unwrap(), "Alice-2");

    let first = next_message(&mut bob).await;
    assert_eq!(first.from.as_deref(), Some("Alice"));
    assert_eq!(first.payload.body, "hello bob");
    let second = next_message(&mut bob).await;
    assert_eq!(second.payload.body, "again");
    assert!(second.seq > first.seq);

    alice.disconnect();
    bob.disconnect();
    handle.shutdown().await;
}

#[tokio::test]
async fn test_client_dedup_suppresses_retransmit() {
    let (handle, socket, _tmp) = start_default_broker().await;

    // Raw sender, RelayClient receiver: the receiver ACKs instantly so
    // no retransmit should surface; verify a deliberate duplicate is
    // suppressed too.
    let mut raw = TestPeer::connect(&socket).await;
    raw.hello("Raw").await;
    let mut client = RelayClient::connect(ClientConfig::new(&socket, "Consumer"))
        .await
        .unwrap();

    raw.send_text("raw-1", "Consumer", "only once").await;
    let message = next_message(&mut client).await;
    assert_eq!(message.id, "raw-1");

    // The same message id again (broker dedups inbound SENDs too, so
    // replay at the wire level the client would otherwise surface).
    raw.send_text("raw-1", "Consumer", "only once").await;

    let extra = tokio::time::timeout(Duration::from_millis(400), client.recv()).await;
    match extra {
        Err(_) => {}
        Ok(Some(ClientEvent::Message(m))) => panic!("duplicate surfaced: {}", m.id),
        Ok(_) => {}
    }

    client.disconnect();
    handle.shutdown().await;
}

#[tokio::test]
async fn test_sync_send_round_trip() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let asker = RelayClient::connect(ClientConfig::new(&socket, "Asker"))
        .await
        .unwrap();
    let mut answerer = RelayClient::connect(ClientConfig::new(&socket, "Answerer"))
        .await
        .unwrap();

    let answer_task = tokio::spawn(async move {
        let message = next_message(&mut answerer).await;
        let correlation = message
            .meta
            .as_ref()
            .and_then(|m| m.sync.as_ref())
            .map(|s| s.correlation_id.clone())
            .expect("sync meta present");
        answerer
            .respond(
                &message.id,
                &correlation,
                SyncResponse::Ok,
                Some(serde_json::json!({"answer": 42})),
            )
            .unwrap();
        answerer
    });

    let ack = asker
        .send_sync(
            "Answerer",
            MessagePayload::chat("what is the answer?"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(ack.response, Some(SyncResponse::Ok));
    assert_eq!(ack.response_data.unwrap()["answer"], 42);

    let answerer = answer_task.await.unwrap();
    answerer.disconnect();
    asker.disconnect();
    handle.shutdown().await;
}

// ─── Supervisor control path ───────────────────────────────────────────────

#[tokio::test]
async fn test_spawn_and_release() {
    let (handle, socket, _tmp) = start_default_broker().await;

    let orchestrator = RelayClient::connect(ClientConfig::new(&socket, "Orchestrator"))
        .await
        .unwrap();

    let result = orchestrator
        .spawn_agent(SpawnPayload {
            name: "Worker1".into(),
            cli: "sleep 60".into(),
            task: String::new(),
            cwd: None,
            spawner: Some("Orchestrator".into()),
            interactive: false,
            shadow_of: None,
            shadow_speak_on: vec![],
        })
        .await
        .unwrap();
    assert!(result.success, "spawn failed: {:?}", result.error);
    assert_eq!(result.name, "Worker1");
    assert!(result.pid.unwrap() > 0);

    // Spawning the same name again fails with NAME_IN_USE.
    let again = orchestrator
        .spawn_agent(SpawnPayload {
            name: "Worker1".into(),
            cli: "sleep 60".into(),
            task: String::new(),
            cwd: None,
            spawner: None,
            interactive: false,
            shadow_of: None,
            shadow_speak_on: vec![],
        })
        .await
        .unwrap();
    assert!(!again.success);
    assert!(again.error.unwrap().contains("NAME_IN_USE"));

    let released = orchestrator.release_agent("Worker1", true).await.unwrap();
    assert!(released.success);

    // Idempotent: releasing again still succeeds.
    let released = orchestrator.release_agent("Worker1", true).await.unwrap();
    assert!(released.success);

    orchestrator.disconnect();
    handle.shutdown().await;
}

#[tokio::test]
async fn test_exit_marker_emits_agent_exited_event() {
    let (handle, socket, _tmp) = start_default_broker().await;

    // Subscribe to supervisor events before spawning.
    let mut watcher = TestPeer::connect(&socket).await;
    watcher.hello("Watcher").await;
    watcher
        .send(&Envelope::new(Body::Subscribe(TopicPayload {
            topic: super::TOPIC_EVENTS.into(),
        })))
        .await;

    let orchestrator = RelayClient::connect(ClientConfig::new(&socket, "Orchestrator"))
        .await
        .unwrap();
    let result = orchestrator
        .spawn_agent(SpawnPayload {
            name: "Finisher".into(),
            cli: "echo /exit".into(),
            task: String::new(),
            cwd: None,
            spawner: None,
            interactive: false,
            shadow_of: None,
            shadow_speak_on: vec![],
        })
        .await
        .unwrap();
    assert!(result.success);

    // The /exit marker (or the PTY EOF right after it) must surface an
    // agent_exited event on the events topic.
    let event = watcher
        .recv_where(|e| {
            matches!(&e.body, Body::Log(log) if log.agent == "Finisher"
                && log.chunk.contains("agent_exited"))
        })
        .await;
    assert!(matches!(event.body, Body::Log(_)));

    orchestrator.disconnect();
    handle.shutdown().await;
}

// ─── Durable backing ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_with_state_dir_restores_channels_and_resume() {
    let tmp = tempfile::TempDir::new().unwrap();
    let socket = tmp.path().join("relay.sock");
    let state_dir = tmp.path().join("state");

    let make_config = || {
        let mut config = RelayConfig::default();
        config.socket_path = socket.clone();
        config.state_dir = Some(state_dir.clone());
        config
    };

    // First broker run: Alice joins a channel and goes away.
    let handle = Broker::start(make_config()).await.unwrap();
    let mut alice = TestPeer::connect(&socket).await;
    let welcome = alice.hello("Alice").await;
    let session_id = welcome.session_id.clone();
    let token = welcome.resume_token.clone().unwrap();
    alice
        .send(&Envelope::new(Body::ChannelJoin(ChannelPayload {
            channel: "#team".into(),
        })))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(alice);
    handle.shutdown().await;

    // Second broker run over the same state dir.
    let handle = Broker::start(make_config()).await.unwrap();

    // Resume works across the restart thanks to the session journal.
    let mut resumed = TestPeer::connect(&socket).await;
    let mut hello = HelloPayload::new("Alice");
    hello.resume_token = Some(token);
    let welcome = resumed.hello_with(hello).await;
    assert!(welcome.resumed, "resume should survive a broker restart");
    assert_eq!(welcome.session_id, session_id);

    // Channel membership was replayed: a channel send reaches Alice.
    let mut sender = TestPeer::connect(&socket).await;
    sender.hello("Sender").await;
    let send = Envelope::new(Body::Send(MessagePayload::chat("still here")))
        .with_id("sender-1")
        .with_topic("#team");
    sender.send(&send).await;

    let deliver = resumed
        .recv_where(|e| matches!(e.body, Body::Deliver(_)))
        .await;
    assert_eq!(deliver.id, "sender-1");

    handle.shutdown().await;
}
