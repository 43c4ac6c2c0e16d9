//! Per-connection state for broker peers.
//!
//! Each accepted socket gets a [`ConnectionHandle`] that owns a read
//! task and a write task bridging between the Unix stream and the
//! broker event loop:
//!
//! - Read task: decodes frames → [`BrokerEvent`] variants. Reading can
//!   be paused for back-pressure; a paused peer's bytes stay in the
//!   socket buffer until the broker lifts the pause.
//! - Write task: drains the frame channel and writes everything
//!   available in one `write_all` per wakeup, so envelopes queued in the
//!   same scheduler tick coalesce into one syscall.
//!
//! The broker event loop is the only place connection state (handshake
//! progress, heartbeat bookkeeping, dedup window) is mutated.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::constants::WRITE_BUSY_THRESHOLD;
use crate::dedup::DedupWindow;
use crate::protocol::framing::{encode, Decoded, FrameDecoder};
use crate::protocol::Envelope;

use super::BrokerEvent;

/// Handshake progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket accepted; only HELLO is legal.
    Accepted,
    /// WELCOME written; any envelope except HELLO is legal.
    Ready,
    /// BYE seen or fatal error written; discard further frames.
    Closing,
}

/// Broker-side handle for one peer connection.
///
/// Owned by the broker event loop; the read/write tasks communicate
/// through channels and shared atomics only.
pub struct ConnectionHandle {
    /// Unique connection identifier.
    pub conn_id: String,
    /// Handshake progress.
    pub state: ConnState,
    /// Session bound by HELLO, once handshaken.
    pub session_id: Option<String>,
    /// Agent name bound by HELLO.
    pub agent: Option<String>,
    /// Nonce of the outstanding PING, if any.
    pub pending_ping: Option<u64>,
    /// Last time a PONG (or the handshake) arrived.
    pub last_pong: Instant,
    /// When the socket was accepted, for the handshake timeout.
    pub accepted_at: Instant,
    /// Inbound SEND dedup window.
    pub dedup: DedupWindow,
    /// True after BUSY was sent and reading was paused.
    pub flow_paused: bool,

    frame_tx: UnboundedSender<Vec<u8>>,
    depth: Arc<AtomicUsize>,
    pause_tx: watch::Sender<bool>,
    max_frame: u32,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("conn_id", &self.conn_id)
            .field("state", &self.state)
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Spawn read/write tasks for an accepted socket.
    pub(crate) fn spawn(
        stream: UnixStream,
        event_tx: UnboundedSender<BrokerEvent>,
        max_frame: u32,
        dedup_window: usize,
    ) -> Self {
        let conn_id = generate_conn_id();
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (pause_tx, pause_rx) = watch::channel(false);
        let depth = Arc::new(AtomicUsize::new(0));

        let read_handle = tokio::spawn(read_loop(
            conn_id.clone(),
            read_half,
            event_tx,
            max_frame,
            pause_rx,
        ));
        let write_handle = tokio::spawn(write_loop(
            conn_id.clone(),
            write_half,
            frame_rx,
            Arc::clone(&depth),
        ));

        Self {
            conn_id,
            state: ConnState::Accepted,
            session_id: None,
            agent: None,
            pending_ping: None,
            last_pong: Instant::now(),
            accepted_at: Instant::now(),
            dedup: DedupWindow::new(dedup_window),
            flow_paused: false,
            frame_tx,
            depth,
            pause_tx,
            max_frame,
            read_handle,
            write_handle,
        }
    }

    /// Encode and queue an envelope for this peer.
    ///
    /// Returns `false` when the peer is gone or the envelope does not
    /// fit the frame cap.
    pub fn send(&self, envelope: &Envelope) -> bool {
        match encode(envelope, self.max_frame) {
            Ok(bytes) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                self.frame_tx.send(bytes).is_ok()
            }
            Err(e) => {
                log::error!("[Conn {}] encode failed: {e}", self.conn_id);
                false
            }
        }
    }

    /// Current write-queue depth (frames queued but not yet written).
    pub fn write_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// True when the write queue is past the back-pressure threshold.
    pub fn is_backlogged(&self) -> bool {
        self.write_depth() >= WRITE_BUSY_THRESHOLD
    }

    /// Pause or resume the read task (SEND back-pressure).
    pub fn set_read_paused(&mut self, paused: bool) {
        self.flow_paused = paused;
        let _ = self.pause_tx.send(paused);
    }

    /// Tear the connection down, aborting both tasks.
    pub fn shutdown(self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

/// Read loop: bytes → frames → broker events.
async fn read_loop(
    conn_id: String,
    mut reader: tokio::net::unix::OwnedReadHalf,
    event_tx: UnboundedSender<BrokerEvent>,
    max_frame: u32,
    mut pause_rx: watch::Receiver<bool>,
) {
    let mut decoder = FrameDecoder::new(max_frame);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        // Honor back-pressure: stop pulling bytes while paused.
        if *pause_rx.borrow() {
            if pause_rx.changed().await.is_err() {
                break;
            }
            continue;
        }

        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[Conn {conn_id}] peer disconnected");
                let _ = event_tx.send(BrokerEvent::Disconnected {
                    conn_id: conn_id.clone(),
                });
                break;
            }
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(items) => {
                    for item in items {
                        let event = match item {
                            Decoded::Envelope(envelope) => BrokerEvent::Frame {
                                conn_id: conn_id.clone(),
                                envelope: Box::new(envelope),
                            },
                            Decoded::Malformed(error) => BrokerEvent::Malformed {
                                conn_id: conn_id.clone(),
                                error,
                            },
                        };
                        if event_tx.send(event).is_err() {
                            return; // broker gone
                        }
                    }
                }
                Err(e) => {
                    // Oversized or corrupt length prefix — unrecoverable.
                    log::warn!("[Conn {conn_id}] fatal frame error: {e}");
                    let _ = event_tx.send(BrokerEvent::FatalFrame {
                        conn_id: conn_id.clone(),
                        error: e.to_string(),
                    });
                    break;
                }
            },
            Err(e) => {
                log::warn!("[Conn {conn_id}] read error: {e}");
                let _ = event_tx.send(BrokerEvent::Disconnected {
                    conn_id: conn_id.clone(),
                });
                break;
            }
        }
    }
}

/// Write loop: drains every queued frame per wakeup into one syscall.
async fn write_loop(
    conn_id: String,
    mut writer: tokio::net::unix::OwnedWriteHalf,
    mut frame_rx: UnboundedReceiver<Vec<u8>>,
    depth: Arc<AtomicUsize>,
) {
    while let Some(first) = frame_rx.recv().await {
        let mut batch = first;
        let mut drained = 1usize;
        while let Ok(more) = frame_rx.try_recv() {
            batch.extend_from_slice(&more);
            drained += 1;
        }
        let result = writer.write_all(&batch).await;
        depth.fetch_sub(drained, Ordering::Relaxed);
        if let Err(e) = result {
            log::warn!("[Conn {conn_id}] write error: {e}");
            break;
        }
    }
}

/// Unique connection id: monotonic counter + random suffix.
fn generate_conn_id() -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("conn:{seq:x}{rand:04x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{Body, MessagePayload};

    async fn pair() -> (UnixStream, UnixStream) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("conn-test.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let client = UnixStream::connect(&path).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_frames_reach_event_loop() {
        let (server, mut client) = pair().await;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::spawn(server, event_tx, 1024 * 1024, 16);

        let env = Envelope::new(Body::Send(MessagePayload::chat("hi"))).with_id("m1");
        client
            .write_all(&encode(&env, 1024 * 1024).unwrap())
            .await
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), event_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match event {
            BrokerEvent::Frame { envelope, .. } => assert_eq!(envelope.id, "m1"),
            other => panic!("expected Frame, got {other:?}"),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_fires_event() {
        let (server, client) = pair().await;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::spawn(server, event_tx, 1024 * 1024, 16);

        drop(client);

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), event_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert!(matches!(event, BrokerEvent::Disconnected { .. }));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (server, mut client) = pair().await;
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::spawn(server, event_tx, 1024 * 1024, 16);

        let env = Envelope::new(Body::Send(MessagePayload::chat("out"))).with_id("m2");
        assert!(handle.send(&env));

        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            client.read(&mut buf),
        )
        .await
        .expect("timed out")
        .expect("read failed");

        let mut dec = FrameDecoder::new(1024 * 1024);
        let items = dec.feed(&buf[..n]).unwrap();
        assert_eq!(items.len(), 1);
        match &items[0] {
            Decoded::Envelope(e) => assert_eq!(e.id, "m2"),
            Decoded::Malformed(e) => panic!("malformed: {e}"),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (server, mut client) = pair().await;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::spawn(server, event_tx, 64, 16);

        // Length prefix of 65 > cap 64.
        client.write_all(&65u32.to_be_bytes()).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), event_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert!(matches!(event, BrokerEvent::FatalFrame { .. }));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_paused_connection_stops_reading() {
        let (server, mut client) = pair().await;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut handle = ConnectionHandle::spawn(server, event_tx, 1024 * 1024, 16);

        handle.set_read_paused(true);
        // Give the pause a moment to take effect in the read task.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let env = Envelope::new(Body::Send(MessagePayload::chat("late"))).with_id("m3");
        client
            .write_all(&encode(&env, 1024 * 1024).unwrap())
            .await
            .unwrap();

        // Nothing surfaces while paused.
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(200), event_rx.recv()).await;
        assert!(nothing.is_err(), "frame surfaced despite pause");

        handle.set_read_paused(false);
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), event_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert!(matches!(event, BrokerEvent::Frame { .. }));
        handle.shutdown();
    }
}
