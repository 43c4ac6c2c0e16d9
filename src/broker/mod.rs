//! The relay broker.
//!
//! A single-process Unix-socket server. One read task and one write
//! task per connection feed a single-owner event loop that holds every
//! piece of shared state — session store, router, message store,
//! delivery engine, supervisor — so all mutation is serialized without
//! locks (the readers' snapshot is whatever the loop sees at dispatch
//! time).
//!
//! ```text
//! accept loop ──Connected──►┐
//! read tasks  ──Frame──────►│ event loop ──send()──► write tasks
//! supervisor  ──events─────►│   (owns sessions/router/store/delivery)
//! intervals   ──ticks──────►┘
//! ```

// Rust guideline compliant 2026-02

pub mod connection;
pub mod delivery;
pub mod router;
pub mod session;
pub mod store;

#[cfg(test)]
mod integration_test;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::constants::{
    HANDSHAKE_TIMEOUT, HEALTH_INTERVAL, MAX_STORE_AGE, SERVER_DEDUP_WINDOW,
};
use crate::protocol::envelope::{
    AckPayload, Body, BusyPayload, DeliveryInfo, Envelope, ErrorCode, ErrorPayload,
    HeartbeatPayload, LogPayload, MessagePayload, ReleaseResultPayload, ServerLimits,
    SpawnResultPayload, WelcomePayload, BROADCAST,
};
use crate::supervisor::{pty::PtyProvider, scan::CompletionSignal, Supervisor, SupervisorEvent};

use connection::{ConnState, ConnectionHandle};
use delivery::{DeliveryEngine, DropReason, PendingDelivery};
use router::Router;
use session::SessionStore;
use store::{DeliveryState, MessageStore};

/// Topic that receives LOG envelopes with streamed PTY output.
pub const TOPIC_LOGS: &str = "logs";
/// Topic that receives supervisor lifecycle events as LOG envelopes.
pub const TOPIC_EVENTS: &str = "events";

/// Events processed by the broker loop.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A socket was accepted and its tasks spawned.
    Connected {
        /// The new connection.
        conn: ConnectionHandle,
    },
    /// A well-formed envelope arrived.
    Frame {
        /// Source connection.
        conn_id: String,
        /// The envelope.
        envelope: Box<Envelope>,
    },
    /// A complete frame failed envelope decoding (stream still synced).
    Malformed {
        /// Source connection.
        conn_id: String,
        /// Decode error.
        error: String,
    },
    /// Unrecoverable framing fault (oversized or corrupt length).
    FatalFrame {
        /// Source connection.
        conn_id: String,
        /// Description.
        error: String,
    },
    /// The peer closed or the socket failed.
    Disconnected {
        /// Source connection.
        conn_id: String,
    },
    /// Supervisor lifecycle or output event.
    Supervisor(SupervisorEvent),
    /// Stop serving: kill children, close connections, remove socket.
    Shutdown,
}

/// Running broker handle.
#[derive(Debug)]
pub struct BrokerHandle {
    socket_path: PathBuf,
    event_tx: UnboundedSender<BrokerEvent>,
    accept_handle: JoinHandle<()>,
    loop_handle: JoinHandle<()>,
}

impl BrokerHandle {
    /// Path of the listening socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Request shutdown and wait for the loop to drain.
    pub async fn shutdown(self) {
        let _ = self.event_tx.send(BrokerEvent::Shutdown);
        self.accept_handle.abort();
        let _ = self.loop_handle.await;
    }

    /// Wait until the broker stops on its own (Shutdown event).
    pub async fn wait(self) {
        let _ = self.loop_handle.await;
        self.accept_handle.abort();
    }

    /// Sender half for injecting a shutdown from a signal handler.
    pub fn shutdown_trigger(&self) -> UnboundedSender<BrokerEvent> {
        self.event_tx.clone()
    }
}

/// The broker.
pub struct Broker;

impl Broker {
    /// Bind the socket, restore durable state, and start serving.
    pub async fn start(config: RelayConfig) -> Result<BrokerHandle> {
        config.prepare_socket_dir()?;
        let socket_path = config.socket_path.clone();

        // Remove a stale socket file from a previous run.
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("remove stale socket: {}", socket_path.display())
            })?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("bind socket: {}", socket_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!("[Broker] listening on {}", socket_path.display());

        let (event_tx, event_rx) = mpsc::unbounded_channel::<BrokerEvent>();
        let (sup_tx, sup_rx) = mpsc::unbounded_channel::<SupervisorEvent>();

        let state = BrokerState::new(config, sup_tx)?;

        let accept_handle = tokio::spawn(accept_loop(
            listener,
            event_tx.clone(),
            state.config.max_frame_bytes,
            socket_path.clone(),
        ));
        let loop_handle = tokio::spawn(event_loop(state, event_rx, sup_rx));

        Ok(BrokerHandle {
            socket_path,
            event_tx,
            accept_handle,
            loop_handle,
        })
    }
}

/// Accept loop: wrap sockets into connections and hand them to the loop.
async fn accept_loop(
    listener: UnixListener,
    event_tx: UnboundedSender<BrokerEvent>,
    max_frame: u32,
    socket_path: PathBuf,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let conn =
                    ConnectionHandle::spawn(stream, event_tx.clone(), max_frame, SERVER_DEDUP_WINDOW);
                log::info!("[Broker] accepted {}", conn.conn_id);
                if event_tx.send(BrokerEvent::Connected { conn }).is_err() {
                    break;
                }
            }
            Err(e) => {
                if !socket_path.exists() {
                    log::info!("[Broker] socket removed, stopping accept loop");
                    break;
                }
                log::error!("[Broker] accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

// ─── Broker state ──────────────────────────────────────────────────────────

struct BrokerState {
    config: RelayConfig,
    sessions: SessionStore,
    router: Router,
    store: MessageStore,
    delivery: DeliveryEngine,
    supervisor: Supervisor,
    conns: HashMap<String, ConnectionHandle>,
    /// Session id → connection id.
    conn_by_session: HashMap<String, String>,
    /// Flow-controlled senders: connection id → the destination whose
    /// queue must drain before reading resumes.
    flow_blocked: HashMap<String, String>,
}

impl BrokerState {
    fn new(config: RelayConfig, sup_tx: UnboundedSender<SupervisorEvent>) -> Result<Self> {
        let (sessions, router, store, log_dir) = match &config.state_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create state dir: {}", dir.display()))?;
                (
                    SessionStore::with_state_dir(config.resume_window, dir)?,
                    Router::with_state_dir(dir)?,
                    MessageStore::with_state_dir(config.max_store_records, MAX_STORE_AGE, dir)?,
                    dir.join("logs"),
                )
            }
            None => (
                SessionStore::new(config.resume_window),
                Router::new(),
                MessageStore::new(config.max_store_records, MAX_STORE_AGE),
                config
                    .socket_path
                    .parent()
                    .map(|p| p.join("logs"))
                    .unwrap_or_else(|| PathBuf::from("logs")),
            ),
        };

        let supervisor = Supervisor::new(
            Box::new(PtyProvider),
            sup_tx,
            config.socket_path.clone(),
            config.workspace.clone(),
            log_dir,
        );

        let delivery = DeliveryEngine::new(config.max_queue_depth);
        let mut state = Self {
            config,
            sessions,
            router,
            store,
            delivery,
            supervisor,
            conns: HashMap::new(),
            conn_by_session: HashMap::new(),
            flow_blocked: HashMap::new(),
        };
        // Restored dormant sessions keep their names reserved in the
        // router (offline) so recovered deliveries can be re-queued and
        // fresh HELLOs see the reservation.
        for (session_id, agent) in state.sessions.dormant_sessions() {
            state.router.register(&agent, &session_id);
            state.router.set_live(&agent, false);
            state.delivery.set_online(&agent, false);
        }
        state.requeue_recovered();
        Ok(state)
    }

    /// Re-queue journalled deliveries whose destination session survived
    /// the restart (dormant, pending resume).
    fn requeue_recovered(&mut self) {
        let pending = self.store.pending_deliveries();
        if pending.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut requeued = 0usize;
        for (envelope, dest) in pending {
            let Body::Send(payload) = &envelope.body else {
                continue;
            };
            let sender = envelope.from.clone().unwrap_or_default();
            if self.sessions.id_for_name(&dest).is_none() {
                continue;
            }
            if let Some(deliver) =
                self.make_deliver(&envelope, payload, &sender, &dest, None, false)
            {
                self.delivery
                    .enqueue(PendingDelivery::new(deliver, dest.clone(), now));
                requeued += 1;
            }
        }
        if requeued > 0 {
            log::info!("[Broker] re-queued {requeued} recovered delivery(ies)");
        }
    }

    // ─── Outbound helpers ──────────────────────────────────────────────────

    fn send_to_conn(&self, conn_id: &str, envelope: &Envelope) {
        if let Some(conn) = self.conns.get(conn_id) {
            if !conn.send(envelope) {
                log::warn!("[Broker] send to {} failed", conn_id);
            }
        }
    }

    fn send_to_agent(&self, agent: &str, envelope: &Envelope) -> bool {
        let Some(session_id) = self.router.session_for(agent) else {
            return false;
        };
        let Some(conn_id) = self.conn_by_session.get(session_id) else {
            return false;
        };
        self.send_to_conn(conn_id, envelope);
        true
    }

    fn send_error(
        &self,
        conn_id: &str,
        code: ErrorCode,
        message: impl Into<String>,
        ref_id: Option<String>,
    ) {
        let envelope = Envelope::new(Body::Error(ErrorPayload::non_fatal(code, message, ref_id)));
        self.send_to_conn(conn_id, &envelope);
    }

    /// Notify a sender that a delivery reached a non-acked terminal
    /// state, referencing the original message id.
    fn report_drop(&mut self, dropped: &delivery::DroppedDelivery) {
        let (code, state) = match dropped.reason {
            DropReason::AckTimeout | DropReason::TtlExpired => {
                (ErrorCode::AckTimeout, DeliveryState::Expired)
            }
            DropReason::Overflow => (ErrorCode::QueueOverflow, DeliveryState::Failed),
            DropReason::SessionGone => (ErrorCode::DestinationOffline, DeliveryState::Failed),
            DropReason::Rejected => (ErrorCode::DeliveryFailed, DeliveryState::Failed),
        };
        self.store.mark(&dropped.msg_id, &dropped.dest, state);

        if let Some(sender) = &dropped.sender {
            let envelope = Envelope::new(Body::Error(ErrorPayload::non_fatal(
                code,
                format!("delivery to '{}' {:?}", dropped.dest, dropped.reason),
                Some(dropped.msg_id.clone()),
            )));
            self.send_to_agent(sender, &envelope);
        }
    }

    /// Drain sendable deliveries for one destination onto its wire.
    fn flush_dest(&mut self, dest: &str) {
        let now = Instant::now();
        let sendable = self.delivery.take_sendable(dest, now);
        if sendable.is_empty() {
            return;
        }
        let delivered: Vec<String> = sendable.iter().map(|e| e.id.clone()).collect();
        for envelope in &sendable {
            self.send_to_agent(dest, envelope);
        }
        for msg_id in delivered {
            self.store.mark(&msg_id, dest, DeliveryState::Inflight);
        }
    }

    /// Build a DELIVER for `dest` from an accepted SEND.
    fn make_deliver(
        &mut self,
        send_env: &Envelope,
        payload: &MessagePayload,
        sender: &str,
        dest: &str,
        original_to: Option<String>,
        shadow: bool,
    ) -> Option<Envelope> {
        let dest_session = self.router.session_for(dest)?.to_string();
        let seq = self.sessions.next_seq(&dest_session, sender);
        Some(Envelope {
            v: send_env.v,
            id: send_env.id.clone(),
            ts: send_env.ts,
            from: Some(sender.to_string()),
            to: send_env.to.clone().or_else(|| Some(dest.to_string())),
            topic: send_env.topic.clone(),
            payload_meta: send_env.payload_meta.clone(),
            delivery: Some(DeliveryInfo {
                seq,
                session_id: dest_session,
                original_to,
                shadow,
            }),
            body: Body::Deliver(payload.clone()),
        })
    }

    /// Fan an envelope out to every subscriber of a topic.
    fn publish_to_topic(&self, topic: &str, envelope: &Envelope) {
        for session_id in self.router.subscribers(topic) {
            if let Some(conn_id) = self.conn_by_session.get(&session_id) {
                self.send_to_conn(conn_id, envelope);
            }
        }
    }

    /// Publish a supervisor lifecycle event as a LOG envelope on the
    /// events topic.
    fn publish_event(&self, agent: &str, text: String) {
        let envelope = Envelope::new(Body::Log(LogPayload {
            agent: agent.to_string(),
            stream: "event".to_string(),
            chunk: text,
        }))
        .with_topic(TOPIC_EVENTS);
        self.publish_to_topic(TOPIC_EVENTS, &envelope);
    }

    // ─── Connection teardown ───────────────────────────────────────────────

    /// Connection gone: session goes dormant and waits for resume.
    fn handle_disconnect(&mut self, conn_id: &str) {
        self.flow_blocked.remove(conn_id);
        let Some(conn) = self.conns.remove(conn_id) else {
            return;
        };
        if let (Some(session_id), Some(agent)) = (&conn.session_id, &conn.agent) {
            // A resume takeover rebinds the session to a new connection
            // before the old one disconnects; only the current owner
            // may push its session dormant.
            if self.conn_by_session.get(session_id) == Some(&conn.conn_id) {
                self.conn_by_session.remove(session_id);
                self.sessions.mark_dormant(session_id);
                self.router.set_live(agent, false);
                self.delivery.set_online(agent, false);
            }
        }
        conn.shutdown();
    }

    /// Fatal protocol violation: report, destroy the session, close.
    fn close_fatal(&mut self, conn_id: &str, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        log::warn!("[Broker] fatal on {conn_id}: {code} {message}");
        let envelope = Envelope::new(Body::Error(ErrorPayload::fatal(code, message)));
        self.send_to_conn(conn_id, &envelope);

        let session_id = self.conns.get(conn_id).and_then(|c| c.session_id.clone());
        if let Some(session_id) = session_id {
            self.destroy_session(&session_id);
        }
        // Give the write task a beat to flush the ERROR before abort.
        if let Some(conn) = self.conns.remove(conn_id) {
            self.flow_blocked.remove(conn_id);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                conn.shutdown();
            });
        }
    }

    /// Destroy a session completely: release the name, leave channels,
    /// drop subscriptions, shadows, and pending deliveries.
    fn destroy_session(&mut self, session_id: &str) {
        let Some(expired) = self.sessions.close(session_id) else {
            return;
        };
        let agent = expired.agent;
        self.router.unregister(&agent);
        for channel in self.router.channels_of(&agent) {
            self.router.leave(&agent, &channel);
        }
        self.router.unsubscribe_all(session_id);
        self.router.drop_agent_shadows(&agent);
        self.conn_by_session.remove(session_id);

        let dropped = self.delivery.drop_dest(&agent);
        for d in dropped {
            self.report_drop(&d);
        }
    }
}

// ─── Event loop ────────────────────────────────────────────────────────────

async fn event_loop(
    mut state: BrokerState,
    mut event_rx: UnboundedReceiver<BrokerEvent>,
    mut sup_rx: UnboundedReceiver<SupervisorEvent>,
) {
    let heartbeat_sweep = state
        .config
        .heartbeat
        .checked_div(4)
        .unwrap_or(Duration::from_secs(1))
        .max(Duration::from_millis(50));
    let mut heartbeat_tick = tokio::time::interval(heartbeat_sweep);
    let mut retry_tick = tokio::time::interval(Duration::from_millis(250));
    let mut expiry_tick = tokio::time::interval(Duration::from_millis(500));
    let mut evict_tick = tokio::time::interval(Duration::from_secs(30));
    let mut health_tick = tokio::time::interval(HEALTH_INTERVAL);

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    BrokerEvent::Connected { conn } => {
                        state.conns.insert(conn.conn_id.clone(), conn);
                    }
                    BrokerEvent::Frame { conn_id, envelope } => {
                        handle_frame(&mut state, &conn_id, *envelope).await;
                    }
                    BrokerEvent::Malformed { conn_id, error } => {
                        // One frame skipped; the stream stays synchronized.
                        state.send_error(
                            &conn_id,
                            ErrorCode::MalformedFrame,
                            format!("frame skipped: {error}"),
                            None,
                        );
                    }
                    BrokerEvent::FatalFrame { conn_id, .. } => {
                        state.close_fatal(
                            &conn_id,
                            ErrorCode::FrameTooLarge,
                            "frame exceeds advertised limit",
                        );
                    }
                    BrokerEvent::Disconnected { conn_id } => {
                        state.handle_disconnect(&conn_id);
                    }
                    BrokerEvent::Supervisor(event) => {
                        handle_supervisor_event(&mut state, event);
                    }
                    BrokerEvent::Shutdown => {
                        shutdown(&mut state);
                        break;
                    }
                }
            }
            event = sup_rx.recv() => {
                if let Some(event) = event {
                    handle_supervisor_event(&mut state, event);
                }
            }
            _ = heartbeat_tick.tick() => heartbeat_sweep_pass(&mut state),
            _ = retry_tick.tick() => retry_pass(&mut state),
            _ = expiry_tick.tick() => expiry_pass(&mut state),
            _ = evict_tick.tick() => {
                state.store.evict(crate::protocol::envelope::now_ms());
            }
            _ = health_tick.tick() => {
                state.supervisor.poll_health().await;
            }
        }
    }

    log::info!("[Broker] event loop stopped");
}

fn shutdown(state: &mut BrokerState) {
    log::info!("[Broker] shutting down");
    state.supervisor.shutdown();
    state
        .store
        .snapshot_channel_memberships(state.router.channel_memberships());
    let bye = Envelope::new(Body::Bye(Default::default()));
    let conn_ids: Vec<String> = state.conns.keys().cloned().collect();
    for conn_id in conn_ids {
        state.send_to_conn(&conn_id, &bye);
    }
    for (_, conn) in state.conns.drain() {
        conn.shutdown();
    }
    let _ = std::fs::remove_file(&state.config.socket_path);
}

// ─── Frame dispatch ────────────────────────────────────────────────────────

async fn handle_frame(state: &mut BrokerState, conn_id: &str, envelope: Envelope) {
    let Some(conn) = state.conns.get(conn_id) else {
        return;
    };
    let conn_state = conn.state;

    // In ACCEPTED, only HELLO is legal.
    if conn_state == ConnState::Accepted && !matches!(envelope.body, Body::Hello(_)) {
        state.close_fatal(
            conn_id,
            ErrorCode::HandshakeRequired,
            format!("{} before HELLO", envelope.body.tag()),
        );
        return;
    }

    match envelope.body.clone() {
        Body::Hello(hello) => {
            if conn_state == ConnState::Ready {
                state.close_fatal(conn_id, ErrorCode::DuplicateHello, "second HELLO");
                return;
            }
            handle_hello(state, conn_id, &envelope, hello);
        }
        Body::Bye(_) => {
            log::info!("[Broker] BYE from {conn_id}");
            let session_id = state.conns.get(conn_id).and_then(|c| c.session_id.clone());
            if let Some(session_id) = session_id {
                state.destroy_session(&session_id);
            }
            if let Some(conn) = state.conns.remove(conn_id) {
                state.flow_blocked.remove(conn_id);
                conn.shutdown();
            }
        }
        Body::Ping(hb) => {
            let pong = Envelope::new(Body::Pong(HeartbeatPayload { nonce: hb.nonce }));
            state.send_to_conn(conn_id, &pong);
        }
        Body::Pong(hb) => {
            if let Some(conn) = state.conns.get_mut(conn_id) {
                if conn.pending_ping == Some(hb.nonce) {
                    conn.pending_ping = None;
                    conn.last_pong = Instant::now();
                } else {
                    log::debug!("[Broker] stale PONG nonce from {conn_id}");
                }
            }
        }
        Body::Send(payload) => handle_send(state, conn_id, envelope, payload),
        Body::Ack(ack) => handle_ack(state, conn_id, ack),
        Body::Nack(nack) => handle_nack(state, conn_id, nack),
        Body::Subscribe(topic) => {
            if let Some(session_id) = session_of(state, conn_id) {
                state.router.subscribe(&session_id, &topic.topic);
            }
        }
        Body::Unsubscribe(topic) => {
            if let Some(session_id) = session_of(state, conn_id) {
                state.router.unsubscribe(&session_id, &topic.topic);
            }
        }
        Body::ChannelJoin(channel) => {
            if let Some(agent) = agent_of(state, conn_id) {
                if let Err(e) = state.router.join(&agent, &channel.channel) {
                    state.send_error(
                        conn_id,
                        ErrorCode::InternalError,
                        e.to_string(),
                        Some(envelope.id.clone()),
                    );
                }
            }
        }
        Body::ChannelLeave(channel) => {
            if let Some(agent) = agent_of(state, conn_id) {
                state.router.leave(&agent, &channel.channel);
            }
        }
        Body::ShadowBind(bind) => match state.router.bind_shadow(&bind) {
            Ok(binding_id) => {
                log::debug!("[Broker] bound shadow {binding_id}");
            }
            Err(e) => state.send_error(
                conn_id,
                ErrorCode::InternalError,
                e.to_string(),
                Some(envelope.id.clone()),
            ),
        },
        Body::ShadowUnbind(unbind) => {
            state.router.unbind_shadow(&unbind);
        }
        Body::Log(log_payload) => {
            // Forward agent-originated LOG to topic subscribers.
            let topic = envelope.topic.clone().unwrap_or_else(|| TOPIC_LOGS.into());
            let forwarded = Envelope::new(Body::Log(log_payload)).with_topic(topic.clone());
            state.publish_to_topic(&topic, &forwarded);
        }
        Body::Spawn(spawn) => handle_spawn(state, conn_id, &envelope.id, spawn).await,
        Body::Release(release) => {
            let released = state.supervisor.release(&release.name, release.force);
            let result = Envelope::new(Body::ReleaseResult(ReleaseResultPayload {
                reply_to: envelope.id.clone(),
                success: released,
                name: release.name,
                error: None,
            }));
            state.send_to_conn(conn_id, &result);
        }
        // Server-to-client tags arriving inbound are protocol noise.
        Body::Welcome(_)
        | Body::Deliver(_)
        | Body::SpawnResult(_)
        | Body::ReleaseResult(_)
        | Body::Error(_)
        | Body::Busy(_) => {
            log::warn!(
                "[Broker] ignoring unexpected {} from {conn_id}",
                envelope.body.tag()
            );
        }
    }
}

fn session_of(state: &BrokerState, conn_id: &str) -> Option<String> {
    state.conns.get(conn_id)?.session_id.clone()
}

fn agent_of(state: &BrokerState, conn_id: &str) -> Option<String> {
    state.conns.get(conn_id)?.agent.clone()
}

// ─── Handshake ─────────────────────────────────────────────────────────────

fn handle_hello(
    state: &mut BrokerState,
    conn_id: &str,
    envelope: &Envelope,
    hello: crate::protocol::envelope::HelloPayload,
) {
    let opened = match state.sessions.open(
        &hello.agent,
        hello.entity,
        hello.capabilities.clone(),
        hello.resume_token.as_deref(),
    ) {
        Ok(opened) => opened,
        Err(e) => {
            state.close_fatal(conn_id, ErrorCode::NameInUse, e.to_string());
            return;
        }
    };

    // Resume takeover: kick the previous connection off the session.
    if opened.resumed {
        if let Some(old_conn_id) = state.conn_by_session.get(&opened.session_id).cloned() {
            if old_conn_id != conn_id {
                log::info!(
                    "[Broker] resume takeover: closing stale {old_conn_id} for {}",
                    opened.session_id
                );
                if let Some(old) = state.conns.remove(&old_conn_id) {
                    state.flow_blocked.remove(&old_conn_id);
                    old.shutdown();
                }
            }
        }
    }

    let Some(conn) = state.conns.get_mut(conn_id) else {
        return;
    };
    conn.state = ConnState::Ready;
    conn.session_id = Some(opened.session_id.clone());
    conn.agent = Some(hello.agent.clone());
    conn.last_pong = Instant::now();

    state
        .conn_by_session
        .insert(opened.session_id.clone(), conn_id.to_string());
    state.router.register(&hello.agent, &opened.session_id);
    state.delivery.set_online(&hello.agent, true);

    let welcome = Envelope::new(Body::Welcome(WelcomePayload {
        session_id: opened.session_id.clone(),
        resume_token: Some(opened.resume_token.clone()),
        limits: ServerLimits {
            max_frame_bytes: state.config.max_frame_bytes,
            heartbeat_ms: state.config.heartbeat_ms(),
        },
        resumed: opened.resumed,
    }));
    state.send_to_conn(conn_id, &welcome);

    if opened.stale_token {
        // Documented choice: fresh session plus an explicit warning so
        // the client clears the dead token.
        state.send_error(
            conn_id,
            ErrorCode::ResumeTooOld,
            "resume token did not match any dormant session",
            Some(envelope.id.clone()),
        );
    }

    log::info!(
        "[Broker] {} '{}' on {conn_id} (session {})",
        if opened.resumed { "resumed" } else { "registered" },
        hello.agent,
        opened.session_id
    );

    // Anything queued while the agent was away goes out now.
    state.flush_dest(&hello.agent);
}

// ─── SEND path ─────────────────────────────────────────────────────────────

fn handle_send(
    state: &mut BrokerState,
    conn_id: &str,
    envelope: Envelope,
    payload: MessagePayload,
) {
    let Some(sender) = agent_of(state, conn_id) else {
        return;
    };

    // Inbound dedup: a replay of an already-accepted SEND (client
    // retry across a resume) is dropped silently. Ids are recorded only
    // on acceptance so a SEND rejected with BUSY may be retried.
    if let Some(conn) = state.conns.get(conn_id) {
        if conn.dedup.contains(&envelope.id) {
            log::debug!("[Broker] duplicate SEND {} from '{sender}'", envelope.id);
            return;
        }
    }

    // Channel-addressed sends use `topic`; everything else uses `to`.
    let target = envelope
        .topic
        .clone()
        .or_else(|| envelope.to.clone());
    let Some(target) = target else {
        state.send_error(
            conn_id,
            ErrorCode::UnknownDestination,
            "SEND carries neither 'to' nor 'topic'",
            Some(envelope.id.clone()),
        );
        return;
    };

    let destinations = match state.router.resolve(&target, &sender) {
        Ok(dests) => dests,
        Err(e) => {
            state.send_error(
                conn_id,
                ErrorCode::UnknownDestination,
                e.to_string(),
                Some(envelope.id.clone()),
            );
            return;
        }
    };

    // Flow control: a live destination at queue capacity (or with a
    // backlogged socket) pushes back on the sender instead of shedding
    // queued messages.
    for dest in &destinations {
        let conn_backlogged = state
            .router
            .session_for(dest)
            .and_then(|sid| state.conn_by_session.get(sid))
            .and_then(|cid| state.conns.get(cid))
            .is_some_and(ConnectionHandle::is_backlogged);
        let queue_full = state.delivery.depth(dest) >= state.config.max_queue_depth
            && !state
                .sessions
                .id_for_name(dest)
                .is_some_and(|id| state.sessions.is_dormant(id));
        if conn_backlogged || queue_full {
            let busy = Envelope::new(Body::Busy(BusyPayload {
                reason: Some(format!("queue for '{dest}' is full")),
            }));
            state.send_to_conn(conn_id, &busy);
            if let Some(conn) = state.conns.get_mut(conn_id) {
                conn.set_read_paused(true);
            }
            state
                .flow_blocked
                .insert(conn_id.to_string(), dest.clone());
            return;
        }
    }

    if let Err(e) = state.store.record(envelope.clone(), destinations.clone()) {
        log::warn!("[Broker] store refused {}: {e}", envelope.id);
        let busy = Envelope::new(Body::Busy(BusyPayload {
            reason: Some("message store saturated".into()),
        }));
        state.send_to_conn(conn_id, &busy);
        return;
    }
    if let Some(conn) = state.conns.get_mut(conn_id) {
        conn.dedup.insert(&envelope.id);
    }

    let original_to = if target == BROADCAST || target.starts_with('#') {
        Some(target.clone())
    } else {
        None
    };

    let now = Instant::now();
    let mut touched: Vec<String> = Vec::new();

    for dest in &destinations {
        let Some(deliver) = state.make_deliver(
            &envelope,
            &payload,
            &sender,
            dest,
            original_to.clone(),
            false,
        ) else {
            state.store.mark(&envelope.id, dest, DeliveryState::Failed);
            continue;
        };
        let dropped = state
            .delivery
            .enqueue(PendingDelivery::new(deliver, dest.clone(), now));
        for d in dropped {
            state.report_drop(&d);
        }
        touched.push(dest.clone());
    }

    // Shadow mirroring: observers of the sender (outgoing) and of each
    // destination (incoming) get the envelope verbatim, flagged.
    for shadow in state.router.shadow_mirrors(&sender, &destinations) {
        if let Some(mirror) = state.make_deliver(
            &envelope,
            &payload,
            &sender,
            &shadow,
            original_to.clone(),
            true,
        ) {
            let dropped = state
                .delivery
                .enqueue(PendingDelivery::new(mirror, shadow.clone(), now));
            for d in dropped {
                state.report_drop(&d);
            }
            touched.push(shadow);
        }
    }

    for dest in touched {
        state.flush_dest(&dest);
    }
}

fn handle_ack(state: &mut BrokerState, conn_id: &str, ack: AckPayload) {
    let Some(agent) = agent_of(state, conn_id) else {
        return;
    };

    if state.delivery.on_ack(&agent, &ack.ack_id) {
        state.store.mark(&ack.ack_id, &agent, DeliveryState::Acked);
    }

    // Sync request/response: forward the correlated ACK to the original
    // sender so its blocking send resolves.
    if ack.correlation_id.is_some() {
        let sender = state
            .store
            .lookup(&ack.ack_id)
            .and_then(|r| r.envelope.from.clone());
        if let Some(sender) = sender {
            let forward = Envelope::new(Body::Ack(ack)).with_from(agent);
            state.send_to_agent(&sender, &forward);
        }
    }
}

fn handle_nack(state: &mut BrokerState, conn_id: &str, nack: crate::protocol::envelope::NackPayload) {
    let Some(agent) = agent_of(state, conn_id) else {
        return;
    };
    log::warn!(
        "[Broker] NACK from '{agent}' for {}: {}",
        nack.ack_id,
        nack.reason
    );
    if let Some(dropped) = state.delivery.on_nack(&agent, &nack.ack_id) {
        state.report_drop(&dropped);
    }
}

// ─── Control requests ──────────────────────────────────────────────────────

async fn handle_spawn(
    state: &mut BrokerState,
    conn_id: &str,
    request_id: &str,
    spawn: crate::protocol::envelope::SpawnPayload,
) {
    let name_taken = state
        .sessions
        .id_for_name(&spawn.name)
        .is_some()
        || state.supervisor.is_name_taken(&spawn.name);

    let result = if name_taken {
        SpawnResultPayload {
            reply_to: request_id.to_string(),
            success: false,
            name: spawn.name.clone(),
            pid: None,
            error: Some(format!("NAME_IN_USE: '{}' is already live", spawn.name)),
        }
    } else {
        match state.supervisor.spawn_child(&spawn).await {
            Ok(pid) => {
                if let Some(primary) = &spawn.shadow_of {
                    let bind = crate::protocol::envelope::ShadowBindPayload {
                        shadow: spawn.name.clone(),
                        primary: primary.clone(),
                        receive_incoming: true,
                        receive_outgoing: false,
                        speak_on: spawn.shadow_speak_on.clone(),
                    };
                    if let Err(e) = state.router.bind_shadow(&bind) {
                        log::warn!("[Broker] shadow bind for spawned '{}': {e}", spawn.name);
                    }
                }
                state.publish_event(&spawn.name, format!("agent_spawned pid={pid}"));
                SpawnResultPayload {
                    reply_to: request_id.to_string(),
                    success: true,
                    name: spawn.name.clone(),
                    pid: Some(pid),
                    error: None,
                }
            }
            Err(e) => SpawnResultPayload {
                reply_to: request_id.to_string(),
                success: false,
                name: spawn.name.clone(),
                pid: None,
                error: Some(e.to_string()),
            },
        }
    };

    let envelope = Envelope::new(Body::SpawnResult(result));
    state.send_to_conn(conn_id, &envelope);
}

// ─── Supervisor events ─────────────────────────────────────────────────────

fn handle_supervisor_event(state: &mut BrokerState, event: SupervisorEvent) {
    match event {
        SupervisorEvent::Output { name, chunk } => {
            let envelope = Envelope::new(Body::Log(LogPayload {
                agent: name,
                stream: "pty".to_string(),
                chunk,
            }))
            .with_topic(TOPIC_LOGS);
            state.publish_to_topic(TOPIC_LOGS, &envelope);
        }
        SupervisorEvent::Completion { name, signal } => {
            log::info!("[Broker] completion from '{name}': {signal:?}");
            let text = match &signal {
                CompletionSignal::Exit => "agent_exited reason=exit_request".to_string(),
                CompletionSignal::Done(msg) => format!("agent_done detail={msg}"),
                CompletionSignal::Error(msg) => format!("agent_failed detail={msg}"),
            };
            state.publish_event(&name, text);
            // A completion signal is a release request.
            state.supervisor.release(&name, false);
        }
        SupervisorEvent::PtyEof { name } => {
            if let Some(exit_code) = state.supervisor.handle_eof(&name) {
                state.publish_event(
                    &name,
                    format!("agent_exited code={}", exit_code.map_or(-1, |c| c)),
                );
            }
        }
        SupervisorEvent::Restarted {
            name,
            pid,
            restart_count,
        } => {
            state.publish_event(
                &name,
                format!("agent_restarted pid={pid} restart_count={restart_count}"),
            );
        }
        SupervisorEvent::PermanentlyDead { name } => {
            state.publish_event(&name, "agent_permanently_dead".to_string());
        }
    }
}

// ─── Periodic passes ───────────────────────────────────────────────────────

/// Heartbeat sweep: issue PINGs, detect misses, time out handshakes.
fn heartbeat_sweep_pass(state: &mut BrokerState) {
    let heartbeat = state.config.heartbeat;
    let grace = heartbeat * 2;
    let now = Instant::now();

    let mut to_dormant: Vec<String> = Vec::new();
    let mut to_timeout: Vec<String> = Vec::new();
    let mut pings: Vec<(String, u64)> = Vec::new();

    for (conn_id, conn) in &mut state.conns {
        match conn.state {
            ConnState::Accepted => {
                if now.duration_since(conn.accepted_at) >= HANDSHAKE_TIMEOUT {
                    to_timeout.push(conn_id.clone());
                }
            }
            ConnState::Ready => {
                if conn.pending_ping.is_some() {
                    if now.duration_since(conn.last_pong) >= grace {
                        to_dormant.push(conn_id.clone());
                    }
                } else if now.duration_since(conn.last_pong) >= heartbeat {
                    let nonce: u64 = rand::random();
                    conn.pending_ping = Some(nonce);
                    pings.push((conn_id.clone(), nonce));
                }
            }
            ConnState::Closing => {}
        }
    }

    for (conn_id, nonce) in pings {
        let ping = Envelope::new(Body::Ping(HeartbeatPayload { nonce }));
        state.send_to_conn(&conn_id, &ping);
    }
    for conn_id in to_timeout {
        state.close_fatal(
            &conn_id,
            ErrorCode::HandshakeTimeout,
            "no HELLO within the handshake window",
        );
    }
    for conn_id in to_dormant {
        log::warn!("[Broker] heartbeat miss on {conn_id}, marking dormant");
        state.handle_disconnect(&conn_id);
    }
}

/// Retry pass: retransmit due deliveries, expire exhausted ones, and
/// release flow-controlled senders whose blocking queue drained.
fn retry_pass(state: &mut BrokerState) {
    let now = Instant::now();
    let (retransmits, dropped) = state.delivery.sweep(now);

    for (dest, envelope) in retransmits {
        log::debug!("[Broker] retransmit {} to '{dest}'", envelope.id);
        state.store.bump_attempts(&envelope.id, &dest);
        state.send_to_agent(&dest, &envelope);
    }
    for d in dropped {
        state.report_drop(&d);
    }

    // Resume paused senders once their blocking destination drained
    // below the cap.
    let unblocked: Vec<String> = state
        .flow_blocked
        .iter()
        .filter(|(_, dest)| state.delivery.depth(dest) < state.config.max_queue_depth)
        .map(|(conn_id, _)| conn_id.clone())
        .collect();
    for conn_id in unblocked {
        state.flow_blocked.remove(&conn_id);
        if let Some(conn) = state.conns.get_mut(&conn_id) {
            log::debug!("[Broker] resuming reads on {conn_id}");
            conn.set_read_paused(false);
        }
    }
}

/// Expiry pass: destroy dormant sessions past the resume window.
fn expiry_pass(state: &mut BrokerState) {
    let expired = state.sessions.expire_dormant(Instant::now());
    for session in expired {
        log::info!(
            "[Broker] resume window elapsed for '{}' ({})",
            session.agent,
            session.id
        );
        state.router.unregister(&session.agent);
        for channel in state.router.channels_of(&session.agent) {
            state.router.leave(&session.agent, &channel);
        }
        state.router.unsubscribe_all(&session.id);
        state.router.drop_agent_shadows(&session.agent);
        let dropped = state.delivery.drop_dest(&session.agent);
        for d in dropped {
            state.report_drop(&d);
        }
    }
}
