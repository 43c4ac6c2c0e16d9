//! Client runtime: the peer mirror of the broker connection.
//!
//! [`RelayClient`] owns a background task that manages the socket,
//! handshake, and resume lifecycle. The application side sends through
//! cheap handle methods and consumes ordered, deduplicated messages
//! from [`RelayClient::recv`]. Every DELIVER is acknowledged before it
//! is surfaced; duplicates are re-acknowledged and suppressed.
//!
//! Control operations (SPAWN, RELEASE) and blocking sync sends are
//! request/response: the runtime keeps a correlation map of oneshot
//! channels resolved by SPAWN_RESULT / RELEASE_RESULT / correlated ACK
//! envelopes. Pending requests are rejected when the connection drops.
//!
//! Reconnects use capped exponential backoff with jitter and re-present
//! the resume token; on `RESUME_TOO_OLD` the token is discarded and the
//! session continues fresh.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};

use crate::constants::{
    CLIENT_DEDUP_WINDOW, MAX_FRAME_BYTES, RECONNECT_BASE, RECONNECT_CAP, RELEASE_TIMEOUT,
    RETRY_JITTER, SPAWN_TIMEOUT,
};
use crate::dedup::DedupWindow;
use crate::protocol::envelope::{
    AckPayload, Body, ByePayload, ChannelPayload, EntityType, Envelope, ErrorCode, ErrorPayload,
    HeartbeatPayload, HelloPayload, MessagePayload, PayloadMeta, ReleasePayload,
    ReleaseResultPayload, ShadowBindPayload, ShadowUnbindPayload, SpawnPayload,
    SpawnResultPayload, SyncMeta, SyncResponse, TopicPayload, WelcomePayload,
};
use crate::protocol::framing::{encode, Decoded, FrameDecoder};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker socket path.
    pub socket_path: PathBuf,
    /// Agent identity presented in HELLO.
    pub hello: HelloPayload,
    /// Reconnect automatically after a lost connection.
    pub reconnect: bool,
    /// Keep queued-but-unsent messages across reconnects.
    pub preserve_unsent: bool,
}

impl ClientConfig {
    /// Config for a plain agent with defaults.
    pub fn new(socket_path: impl Into<PathBuf>, agent: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            hello: HelloPayload::new(agent),
            reconnect: true,
            preserve_unsent: true,
        }
    }

    /// Mark this client as a human-driven user.
    pub fn as_user(mut self) -> Self {
        self.hello.entity = EntityType::User;
        self
    }
}

/// A message surfaced to the application.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Message id (already acknowledged).
    pub id: String,
    /// Sending agent.
    pub from: Option<String>,
    /// The message payload.
    pub payload: MessagePayload,
    /// Optional metadata.
    pub meta: Option<PayloadMeta>,
    /// Channel the message was addressed to, if any.
    pub topic: Option<String>,
    /// Original destination before broadcast/channel rewriting.
    pub original_to: Option<String>,
    /// True when this copy was mirrored to a shadow observer.
    pub shadow: bool,
    /// Destination-session sequence number.
    pub seq: u64,
}

/// Events surfaced by [`RelayClient::recv`].
#[derive(Debug)]
pub enum ClientEvent {
    /// A deliverable message (deduplicated, acknowledged).
    Message(IncomingMessage),
    /// A LOG envelope from a subscribed topic.
    Log {
        /// Topic it arrived on.
        topic: Option<String>,
        /// Log payload.
        payload: crate::protocol::envelope::LogPayload,
    },
    /// Broker-reported error.
    Error(ErrorPayload),
    /// Back-pressure signal; slow down sending.
    Busy(Option<String>),
    /// The connection was (re)established.
    Connected {
        /// Session id after this handshake.
        session_id: String,
        /// True when the previous session was resumed.
        resumed: bool,
    },
    /// The connection dropped (reconnect may follow).
    Disconnected,
}

enum PendingSlot {
    Sync(oneshot::Sender<AckPayload>),
    Spawn(oneshot::Sender<SpawnResultPayload>),
    Release(oneshot::Sender<ReleaseResultPayload>),
}

enum Command {
    Send(Envelope),
    Request {
        envelope: Envelope,
        key: String,
        slot: PendingSlot,
    },
    Disconnect,
}

/// Handle to the client runtime.
pub struct RelayClient {
    cmd_tx: UnboundedSender<Command>,
    event_rx: UnboundedReceiver<ClientEvent>,
    session_rx: watch::Receiver<Option<String>>,
    agent: String,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

impl RelayClient {
    /// Connect and handshake; returns once WELCOME arrives.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let agent = config.hello.agent.clone();
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .with_context(|| format!("connect to {}", config.socket_path.display()))?;

        let mut runtime = Runtime::new(config);
        let (stream, welcome) = runtime.handshake(stream).await?;
        runtime.apply_welcome(&welcome);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = watch::channel(Some(welcome.session_id.clone()));

        let _ = event_tx.send(ClientEvent::Connected {
            session_id: welcome.session_id.clone(),
            resumed: welcome.resumed,
        });

        let next_id = Arc::new(AtomicU64::new(1));
        tokio::spawn(runtime.run(stream, cmd_rx, event_tx, session_tx));

        Ok(Self {
            cmd_tx,
            event_rx,
            session_rx,
            agent,
            next_id,
        })
    }

    /// Current session id.
    pub fn session_id(&self) -> Option<String> {
        self.session_rx.borrow().clone()
    }

    /// Agent name this client registered.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Next per-sender monotonic message id.
    fn alloc_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.agent)
    }

    fn push(&self, command: Command) -> Result<()> {
        if self.cmd_tx.send(command).is_err() {
            bail!("client runtime has stopped");
        }
        Ok(())
    }

    /// Send a message to an agent, the broadcast token, or (via
    /// `topic`) a channel. Returns the assigned message id.
    pub fn send(
        &self,
        to: &str,
        payload: MessagePayload,
        meta: Option<PayloadMeta>,
    ) -> Result<String> {
        let id = self.alloc_id();
        let mut envelope = Envelope::new(Body::Send(payload))
            .with_id(id.clone())
            .with_from(self.agent.clone());
        if to.starts_with('#') {
            envelope = envelope.with_topic(to);
        } else {
            envelope = envelope.with_to(to);
        }
        if let Some(meta) = meta {
            envelope = envelope.with_meta(meta);
        }
        self.push(Command::Send(envelope))?;
        Ok(id)
    }

    /// Plain chat-kind send.
    pub fn send_text(&self, to: &str, body: impl Into<String>) -> Result<String> {
        self.send(to, MessagePayload::chat(body), None)
    }

    /// Blocking sync send: resolves with the correlated ACK, or fails
    /// on timeout / disconnect.
    pub async fn send_sync(
        &self,
        to: &str,
        payload: MessagePayload,
        timeout: Duration,
    ) -> Result<AckPayload> {
        let id = self.alloc_id();
        let correlation_id = format!("sync-{id}");
        let meta = PayloadMeta {
            sync: Some(SyncMeta {
                blocking: true,
                correlation_id: correlation_id.clone(),
            }),
            ..Default::default()
        };
        let envelope = Envelope::new(Body::Send(payload))
            .with_id(id)
            .with_from(self.agent.clone())
            .with_to(to)
            .with_meta(meta);

        let (tx, rx) = oneshot::channel();
        self.push(Command::Request {
            envelope,
            key: correlation_id,
            slot: PendingSlot::Sync(tx),
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => bail!("connection closed before the sync response arrived"),
            Err(_) => bail!("sync send timed out after {timeout:?}"),
        }
    }

    /// Acknowledge a sync request received through [`ClientEvent`].
    pub fn respond(
        &self,
        ack_id: &str,
        correlation_id: &str,
        response: SyncResponse,
        response_data: Option<serde_json::Value>,
    ) -> Result<()> {
        let ack = AckPayload {
            ack_id: ack_id.to_string(),
            seq: None,
            correlation_id: Some(correlation_id.to_string()),
            response: Some(response),
            response_data,
        };
        self.push(Command::Send(
            Envelope::new(Body::Ack(ack)).with_from(self.agent.clone()),
        ))
    }

    /// Join a channel.
    pub fn join(&self, channel: &str) -> Result<()> {
        self.push(Command::Send(
            Envelope::new(Body::ChannelJoin(ChannelPayload {
                channel: channel.to_string(),
            }))
            .with_from(self.agent.clone()),
        ))
    }

    /// Leave a channel.
    pub fn leave(&self, channel: &str) -> Result<()> {
        self.push(Command::Send(
            Envelope::new(Body::ChannelLeave(ChannelPayload {
                channel: channel.to_string(),
            }))
            .with_from(self.agent.clone()),
        ))
    }

    /// Subscribe to a raw topic.
    pub fn subscribe(&self, topic: &str) -> Result<()> {
        self.push(Command::Send(
            Envelope::new(Body::Subscribe(TopicPayload {
                topic: topic.to_string(),
            }))
            .with_from(self.agent.clone()),
        ))
    }

    /// Unsubscribe from a topic.
    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.push(Command::Send(
            Envelope::new(Body::Unsubscribe(TopicPayload {
                topic: topic.to_string(),
            }))
            .with_from(self.agent.clone()),
        ))
    }

    /// Bind a shadow observer.
    pub fn shadow_bind(&self, bind: ShadowBindPayload) -> Result<()> {
        self.push(Command::Send(
            Envelope::new(Body::ShadowBind(bind)).with_from(self.agent.clone()),
        ))
    }

    /// Remove a shadow binding.
    pub fn shadow_unbind(&self, unbind: ShadowUnbindPayload) -> Result<()> {
        self.push(Command::Send(
            Envelope::new(Body::ShadowUnbind(unbind)).with_from(self.agent.clone()),
        ))
    }

    /// Request a supervised child; resolves with the SPAWN_RESULT.
    pub async fn spawn_agent(&self, spawn: SpawnPayload) -> Result<SpawnResultPayload> {
        let envelope = Envelope::new(Body::Spawn(spawn)).with_from(self.agent.clone());
        let key = envelope.id.clone();
        let (tx, rx) = oneshot::channel();
        self.push(Command::Request {
            envelope,
            key,
            slot: PendingSlot::Spawn(tx),
        })?;
        match tokio::time::timeout(SPAWN_TIMEOUT, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => bail!("connection closed before SPAWN_RESULT"),
            Err(_) => bail!("SPAWN timed out after {SPAWN_TIMEOUT:?}"),
        }
    }

    /// Release a supervised child; resolves with the RELEASE_RESULT.
    pub async fn release_agent(&self, name: &str, force: bool) -> Result<ReleaseResultPayload> {
        let envelope = Envelope::new(Body::Release(ReleasePayload {
            name: name.to_string(),
            force,
        }))
        .with_from(self.agent.clone());
        let key = envelope.id.clone();
        let (tx, rx) = oneshot::channel();
        self.push(Command::Request {
            envelope,
            key,
            slot: PendingSlot::Release(tx),
        })?;
        match tokio::time::timeout(RELEASE_TIMEOUT, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => bail!("connection closed before RELEASE_RESULT"),
            Err(_) => bail!("RELEASE timed out after {RELEASE_TIMEOUT:?}"),
        }
    }

    /// Receive the next client event.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }

    /// Graceful disconnect: BYE, then the runtime stops.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }
}

// ─── Runtime ───────────────────────────────────────────────────────────────

enum SessionEnd {
    /// Application requested disconnect.
    Bye,
    /// Socket lost; reconnect may follow.
    Lost,
}

struct Runtime {
    config: ClientConfig,
    resume_token: Option<String>,
    max_frame: u32,
    dedup: DedupWindow,
    pending: HashMap<String, PendingSlot>,
    unsent: VecDeque<Envelope>,
}

impl Runtime {
    fn new(config: ClientConfig) -> Self {
        Self {
            config,
            resume_token: None,
            max_frame: MAX_FRAME_BYTES,
            dedup: DedupWindow::new(CLIENT_DEDUP_WINDOW),
            pending: HashMap::new(),
            unsent: VecDeque::new(),
        }
    }

    /// Write HELLO and wait for WELCOME (or a fatal ERROR).
    async fn handshake(&mut self, mut stream: UnixStream) -> Result<(UnixStream, WelcomePayload)> {
        let mut hello = self.config.hello.clone();
        hello.resume_token = self.resume_token.clone();
        let envelope = Envelope::new(Body::Hello(hello));
        stream
            .write_all(&encode(&envelope, self.max_frame)?)
            .await
            .context("write HELLO")?;

        let mut decoder = FrameDecoder::new(self.max_frame);
        let mut buf = vec![0u8; 64 * 1024];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

        loop {
            let n = tokio::time::timeout_at(deadline, stream.read(&mut buf))
                .await
                .context("handshake timed out")?
                .context("read during handshake")?;
            if n == 0 {
                bail!("broker closed the connection during handshake");
            }
            for item in decoder.feed(&buf[..n])? {
                match item {
                    Decoded::Envelope(env) => match env.body {
                        Body::Welcome(welcome) => return Ok((stream, welcome)),
                        Body::Error(err) if err.fatal => {
                            bail!("handshake rejected: {} {}", err.code, err.message)
                        }
                        other => {
                            log::debug!("[Client] pre-WELCOME {} ignored", other.tag());
                        }
                    },
                    Decoded::Malformed(e) => bail!("malformed frame during handshake: {e}"),
                }
            }
        }
    }

    fn apply_welcome(&mut self, welcome: &WelcomePayload) {
        if let Some(token) = &welcome.resume_token {
            self.resume_token = Some(token.clone());
        }
        self.max_frame = welcome.limits.max_frame_bytes;
        log::info!(
            "[Client] session {} ({}, heartbeat {}ms)",
            welcome.session_id,
            if welcome.resumed { "resumed" } else { "fresh" },
            welcome.limits.heartbeat_ms
        );
    }

    async fn run(
        mut self,
        mut stream: UnixStream,
        mut cmd_rx: UnboundedReceiver<Command>,
        event_tx: UnboundedSender<ClientEvent>,
        session_tx: watch::Sender<Option<String>>,
    ) {
        loop {
            // Flush anything preserved from before the (re)connect.
            let mut backlog: Vec<u8> = Vec::new();
            while let Some(envelope) = self.unsent.pop_front() {
                if let Ok(bytes) = encode(&envelope, self.max_frame) {
                    backlog.extend_from_slice(&bytes);
                }
            }
            if !backlog.is_empty() && stream.write_all(&backlog).await.is_err() {
                log::warn!("[Client] backlog flush failed");
            }

            let end = self
                .run_session(&mut stream, &mut cmd_rx, &event_tx)
                .await;
            let _ = event_tx.send(ClientEvent::Disconnected);
            self.reject_pending();

            match end {
                SessionEnd::Bye => break,
                SessionEnd::Lost if !self.config.reconnect => break,
                SessionEnd::Lost => {}
            }

            let Some(new_stream) = self.reconnect(&mut cmd_rx).await else {
                break;
            };

            match self.handshake(new_stream).await {
                Ok((handshaken, welcome)) => {
                    self.apply_welcome(&welcome);
                    stream = handshaken;
                    let _ = session_tx.send(Some(welcome.session_id.clone()));
                    let _ = event_tx.send(ClientEvent::Connected {
                        session_id: welcome.session_id,
                        resumed: welcome.resumed,
                    });
                }
                Err(e) => {
                    log::error!("[Client] re-handshake failed: {e}");
                    break;
                }
            }
        }
        log::info!("[Client] runtime stopped");
    }

    async fn run_session(
        &mut self,
        stream: &mut UnixStream,
        cmd_rx: &mut UnboundedReceiver<Command>,
        event_tx: &UnboundedSender<ClientEvent>,
    ) -> SessionEnd {
        let mut decoder = FrameDecoder::new(self.max_frame);
        let mut buf = vec![0u8; 64 * 1024];
        let (mut read_half, mut write_half) = stream.split();

        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    let Some(command) = command else {
                        // Handle dropped: say goodbye.
                        let bye = Envelope::new(Body::Bye(ByePayload::default()));
                        if let Ok(bytes) = encode(&bye, self.max_frame) {
                            let _ = write_half.write_all(&bytes).await;
                        }
                        return SessionEnd::Bye;
                    };
                    match self.handle_command(command, cmd_rx, &mut write_half).await {
                        Ok(true) => {}
                        Ok(false) => return SessionEnd::Bye,
                        Err(e) => {
                            log::warn!("[Client] write failed: {e}");
                            return SessionEnd::Lost;
                        }
                    }
                }
                read = read_half.read(&mut buf) => {
                    match read {
                        Ok(0) => return SessionEnd::Lost,
                        Ok(n) => {
                            let items = match decoder.feed(&buf[..n]) {
                                Ok(items) => items,
                                Err(e) => {
                                    log::error!("[Client] framing fault: {e}");
                                    return SessionEnd::Lost;
                                }
                            };
                            for item in items {
                                if let Decoded::Envelope(envelope) = item {
                                    if !self
                                        .handle_envelope(envelope, &mut write_half, event_tx)
                                        .await
                                    {
                                        return SessionEnd::Lost;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            log::warn!("[Client] read error: {e}");
                            return SessionEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Apply one command; coalesces immediately-available sends into a
    /// single write. Returns `Ok(false)` on Disconnect.
    async fn handle_command<W: tokio::io::AsyncWrite + Unpin>(
        &mut self,
        command: Command,
        cmd_rx: &mut UnboundedReceiver<Command>,
        stream: &mut W,
    ) -> Result<bool> {
        let mut batch: Vec<u8> = Vec::new();

        let queue_one = |rt: &mut Self, batch: &mut Vec<u8>, command: Command| -> bool {
            match command {
                Command::Send(envelope) => {
                    if let Ok(bytes) = encode(&envelope, rt.max_frame) {
                        batch.extend_from_slice(&bytes);
                    }
                    true
                }
                Command::Request { envelope, key, slot } => {
                    rt.pending.insert(key, slot);
                    if let Ok(bytes) = encode(&envelope, rt.max_frame) {
                        batch.extend_from_slice(&bytes);
                    }
                    true
                }
                Command::Disconnect => false,
            }
        };

        if !queue_one(self, &mut batch, command) {
            let bye = Envelope::new(Body::Bye(ByePayload::default()));
            if let Ok(bytes) = encode(&bye, self.max_frame) {
                let _ = stream.write_all(&bytes).await;
            }
            return Ok(false);
        }
        // Coalesce whatever else is already queued.
        while let Ok(more) = cmd_rx.try_recv() {
            if !queue_one(self, &mut batch, more) {
                stream.write_all(&batch).await?;
                let bye = Envelope::new(Body::Bye(ByePayload::default()));
                if let Ok(bytes) = encode(&bye, self.max_frame) {
                    let _ = stream.write_all(&bytes).await;
                }
                return Ok(false);
            }
        }

        stream.write_all(&batch).await?;
        Ok(true)
    }

    /// Handle one inbound envelope. Returns false on unrecoverable
    /// connection state.
    async fn handle_envelope<W: tokio::io::AsyncWrite + Unpin>(
        &mut self,
        envelope: Envelope,
        stream: &mut W,
        event_tx: &UnboundedSender<ClientEvent>,
    ) -> bool {
        match envelope.body {
            Body::Deliver(payload) => {
                let seq = envelope.delivery.as_ref().map_or(0, |d| d.seq);
                // ACK first, surface second; duplicates are re-ACKed
                // (the broker may have missed the first ACK) but never
                // re-surfaced.
                let ack = Envelope::new(Body::Ack(AckPayload::of(
                    envelope.id.clone(),
                    Some(seq),
                )))
                .with_from(self.config.hello.agent.clone());
                if let Ok(bytes) = encode(&ack, self.max_frame) {
                    if stream.write_all(&bytes).await.is_err() {
                        return false;
                    }
                }

                if self.dedup.insert(&envelope.id) {
                    let delivery = envelope.delivery.as_ref();
                    let _ = event_tx.send(ClientEvent::Message(IncomingMessage {
                        id: envelope.id,
                        from: envelope.from,
                        payload,
                        meta: envelope.payload_meta,
                        topic: envelope.topic,
                        original_to: delivery.and_then(|d| d.original_to.clone()),
                        shadow: delivery.is_some_and(|d| d.shadow),
                        seq,
                    }));
                } else {
                    log::debug!("[Client] suppressed duplicate {}", envelope.id);
                }
                true
            }
            Body::Ping(hb) => {
                let pong = Envelope::new(Body::Pong(HeartbeatPayload { nonce: hb.nonce }));
                if let Ok(bytes) = encode(&pong, self.max_frame) {
                    stream.write_all(&bytes).await.is_ok()
                } else {
                    true
                }
            }
            Body::Ack(ack) => {
                if let Some(correlation_id) = &ack.correlation_id {
                    if let Some(PendingSlot::Sync(tx)) = self.pending.remove(correlation_id) {
                        let _ = tx.send(ack);
                    }
                }
                true
            }
            Body::SpawnResult(result) => {
                if let Some(PendingSlot::Spawn(tx)) = self.pending.remove(&result.reply_to) {
                    let _ = tx.send(result);
                }
                true
            }
            Body::ReleaseResult(result) => {
                if let Some(PendingSlot::Release(tx)) = self.pending.remove(&result.reply_to) {
                    let _ = tx.send(result);
                }
                true
            }
            Body::Log(payload) => {
                let _ = event_tx.send(ClientEvent::Log {
                    topic: envelope.topic,
                    payload,
                });
                true
            }
            Body::Error(error) => {
                if error.code == ErrorCode::ResumeTooOld {
                    log::warn!("[Client] resume token stale, clearing");
                    self.resume_token = None;
                }
                let fatal = error.fatal;
                let _ = event_tx.send(ClientEvent::Error(error));
                !fatal
            }
            Body::Busy(busy) => {
                let _ = event_tx.send(ClientEvent::Busy(busy.reason));
                true
            }
            Body::Bye(_) => false,
            other => {
                log::debug!("[Client] ignoring {}", other.tag());
                true
            }
        }
    }

    /// Pending control requests are rejected when the connection
    /// closes: dropping the oneshot senders fails the awaiting callers.
    fn reject_pending(&mut self) {
        if !self.pending.is_empty() {
            log::warn!(
                "[Client] rejecting {} pending request(s) on disconnect",
                self.pending.len()
            );
            self.pending.clear();
        }
    }

    /// Reconnect with capped, jittered exponential backoff. Commands
    /// arriving while offline are preserved (or dropped, per config).
    async fn reconnect(&mut self, cmd_rx: &mut UnboundedReceiver<Command>) -> Option<UnixStream> {
        for attempt in 0u32.. {
            let delay = reconnect_backoff(attempt);
            log::info!(
                "[Client] reconnect attempt {} in {:?}",
                attempt + 1,
                delay
            );
            tokio::time::sleep(delay).await;

            // Drain commands that arrived while offline.
            while let Ok(command) = cmd_rx.try_recv() {
                match command {
                    Command::Send(envelope) if self.config.preserve_unsent => {
                        self.unsent.push_back(envelope);
                    }
                    Command::Send(_) => {
                        log::warn!("[Client] dropping send while offline");
                    }
                    Command::Request { .. } => {
                        // Rejected immediately: the oneshot drops here.
                        log::warn!("[Client] rejecting control request while offline");
                    }
                    Command::Disconnect => return None,
                }
            }

            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => return Some(stream),
                Err(e) => log::warn!("[Client] reconnect failed: {e}"),
            }
        }
        None
    }
}

/// Backoff for the Nth reconnect attempt (0-based): doubling from the
/// base, capped, with ±15% jitter.
fn reconnect_backoff(attempt: u32) -> Duration {
    let base_ms = RECONNECT_BASE.as_millis() as f64;
    let backoff = base_ms * 2f64.powi(attempt.min(16) as i32);
    let capped = backoff.min(RECONNECT_CAP.as_millis() as f64);
    let jitter = rand::rng().random_range(-RETRY_JITTER..=RETRY_JITTER);
    Duration::from_millis((capped * (1.0 + jitter)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let early = reconnect_backoff(0);
        assert!(early <= Duration::from_millis(600), "got {early:?}");

        let later = reconnect_backoff(3);
        assert!(later >= Duration::from_millis(3300), "got {later:?}");

        let capped = reconnect_backoff(30);
        assert!(capped <= Duration::from_millis(34500), "got {capped:?}");
    }

    #[test]
    fn test_config_builders() {
        let config = ClientConfig::new("/tmp/relay.sock", "Alice");
        assert_eq!(config.hello.agent, "Alice");
        assert_eq!(config.hello.entity, EntityType::Agent);
        assert!(config.reconnect);

        let user = ClientConfig::new("/tmp/relay.sock", "Pat").as_user();
        assert_eq!(user.hello.entity, EntityType::User);
    }

    // Protocol-level behavior (handshake, dedup + auto-ACK, sync
    // correlation, spawn results) is exercised end-to-end against a
    // real broker in `broker::integration_test`.
}
