//! Protocol envelope types and payloads.
//!
//! Every frame on the wire carries one [`Envelope`]: a fixed header
//! (`v`, `id`, `ts`, optional addressing fields) plus an adjacently
//! tagged body serialized as `"type"` / `"payload"` keys. The tag set is
//! closed; the connection layer switches on it exactly once.
//!
//! ```text
//! {
//!   "v": 1,
//!   "type": "SEND",
//!   "id": "alice-17",
//!   "ts": 1767224841000,
//!   "from": "Alice",
//!   "to": "Bob",
//!   "payload": { "kind": "chat", "body": "hi" },
//!   "payload_meta": { "ttl_ms": 60000 }
//! }
//! ```

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::PROTOCOL_VERSION;

/// Destination token that fans a SEND out to every live agent except the
/// sender.
pub const BROADCAST: &str = "*";

/// Milliseconds since the Unix epoch, the envelope timestamp base.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Error codes ───────────────────────────────────────────────────────────

/// Machine-readable error codes carried in ERROR payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// HELLO requested a name owned by a live session.
    NameInUse,
    /// A second HELLO arrived on an already-handshaken connection.
    DuplicateHello,
    /// Frame length prefix exceeded the advertised cap.
    FrameTooLarge,
    /// Frame bytes were not valid JSON for an envelope.
    MalformedFrame,
    /// No HELLO arrived within the handshake window.
    HandshakeTimeout,
    /// Resume token did not match any dormant session.
    ResumeTooOld,
    /// SEND addressed a name no live session owns.
    UnknownDestination,
    /// Destination is dormant and its offline queue is full.
    DestinationOffline,
    /// SEND payload exceeded what the destination queue accepts.
    PayloadTooLarge,
    /// Delivery retries exhausted without an ACK.
    AckTimeout,
    /// Per-destination queue overflowed; oldest deliveries were dropped.
    QueueOverflow,
    /// Supervisor failed to launch the requested child.
    SpawnFailed,
    /// A non-HELLO envelope arrived before the handshake completed.
    HandshakeRequired,
    /// Destination rejected the delivery (NACK).
    DeliveryFailed,
    /// Unclassified broker-side failure.
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde rename so logs match the wire.
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

// ─── Identity ──────────────────────────────────────────────────────────────

/// Kind of participant behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Automated process (the common case).
    #[default]
    Agent,
    /// Human-driven client.
    User,
}

// ─── Payload structs ───────────────────────────────────────────────────────

/// HELLO — client opens or resumes a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Requested agent name (case-sensitive, unique among live sessions).
    pub agent: String,
    /// Participant kind.
    #[serde(default)]
    pub entity: EntityType,
    /// Capability strings the client understands.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Token from a previous WELCOME; rebinds to a dormant session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// CLI kind, for supervised agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    /// Program the agent runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    /// Model identifier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Task description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Human-facing display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar reference for dashboards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl HelloPayload {
    /// Minimal HELLO for an agent with no optional attributes.
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            entity: EntityType::Agent,
            capabilities: Vec::new(),
            resume_token: None,
            cli: None,
            program: None,
            model: None,
            task: None,
            cwd: None,
            display_name: None,
            avatar: None,
        }
    }
}

/// Server limits announced in WELCOME.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLimits {
    /// Maximum frame size the broker accepts.
    pub max_frame_bytes: u32,
    /// Interval between server PINGs, in milliseconds.
    pub heartbeat_ms: u64,
}

/// WELCOME — handshake acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    /// Session assigned (or resumed) for this connection.
    pub session_id: String,
    /// Token to present on a future HELLO to resume this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Broker limits the client must apply.
    pub limits: ServerLimits,
    /// True when the session was resumed rather than freshly opened.
    #[serde(default)]
    pub resumed: bool,
}

/// BYE — graceful close from either side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ByePayload {
    /// Optional reason for the close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// PING / PONG — liveness probe. PONG must echo the nonce exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Opaque nonce; checked for strict equality on PONG.
    pub nonce: u64,
}

/// SEND / DELIVER — the deliverable message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Application-level message kind (e.g. "chat", "task").
    pub kind: String,
    /// Message text.
    pub body: String,
    /// Structured attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Conversation thread identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl MessagePayload {
    /// A plain chat message.
    pub fn chat(body: impl Into<String>) -> Self {
        Self {
            kind: "chat".to_string(),
            body: body.into(),
            data: None,
            thread: None,
        }
    }
}

/// Sync response verdict carried in a correlated ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncResponse {
    /// Request handled successfully.
    Ok,
    /// Request failed; see `responseData`.
    Error,
}

/// ACK — delivery acknowledgment, optionally carrying a sync response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Id of the DELIVER being acknowledged.
    pub ack_id: String,
    /// Destination-session sequence of the acknowledged delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Correlation id of the originating sync SEND, when replying.
    #[serde(
        default,
        rename = "correlationId",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    /// Sync verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<SyncResponse>,
    /// Structured sync response body.
    #[serde(
        default,
        rename = "responseData",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_data: Option<Value>,
}

impl AckPayload {
    /// Plain acknowledgment of a delivery.
    pub fn of(ack_id: impl Into<String>, seq: Option<u64>) -> Self {
        Self {
            ack_id: ack_id.into(),
            seq,
            correlation_id: None,
            response: None,
            response_data: None,
        }
    }
}

/// NACK — explicit delivery rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NackPayload {
    /// Id of the rejected DELIVER.
    pub ack_id: String,
    /// Why the destination refused it.
    pub reason: String,
}

/// SUBSCRIBE / UNSUBSCRIBE — raw topic pub/sub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicPayload {
    /// Topic string (not a channel; no fan-out to agents).
    pub topic: String,
}

/// CHANNEL_JOIN / CHANNEL_LEAVE — membership management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPayload {
    /// Channel name; must start with `#`.
    pub channel: String,
}

/// SHADOW_BIND — attach an observer to a primary agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowBindPayload {
    /// Observer agent name.
    pub shadow: String,
    /// Agent being observed.
    pub primary: String,
    /// Mirror messages delivered to the primary.
    #[serde(default = "default_true")]
    pub receive_incoming: bool,
    /// Mirror messages sent by the primary.
    #[serde(default)]
    pub receive_outgoing: bool,
    /// Conditions under which the shadow may speak (e.g. "EXPLICIT_ASK").
    #[serde(default)]
    pub speak_on: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// SHADOW_UNBIND — remove a binding by id or by (shadow, primary) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowUnbindPayload {
    /// Binding id returned on bind, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding_id: Option<String>,
    /// Observer name, for pair-addressed unbind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow: Option<String>,
    /// Primary name, for pair-addressed unbind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
}

/// LOG — streamed PTY output chunk for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    /// Agent the output belongs to.
    pub agent: String,
    /// Stream label ("pty").
    pub stream: String,
    /// UTF-8 (lossy) output chunk.
    pub chunk: String,
}

/// SPAWN — request a supervised child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnPayload {
    /// Name to reserve for the child.
    pub name: String,
    /// CLI kind to launch.
    pub cli: String,
    /// Task description handed to the child.
    pub task: String,
    /// Working directory for the child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Name of the agent that requested the spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawner: Option<String>,
    /// Keep the PTY interactive rather than scanning for completion.
    #[serde(default)]
    pub interactive: bool,
    /// Bind the child as a shadow of this primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_of: Option<String>,
    /// Speak policy for the shadow binding.
    #[serde(default)]
    pub shadow_speak_on: Vec<String>,
}

/// SPAWN_RESULT — reply to SPAWN, correlated via `reply_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnResultPayload {
    /// Id of the SPAWN envelope this answers.
    pub reply_to: String,
    /// Whether the child launched.
    pub success: bool,
    /// Requested child name.
    pub name: String,
    /// Child PID on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// RELEASE — terminate a supervised child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasePayload {
    /// Child name.
    pub name: String,
    /// Skip the graceful SIGTERM phase and kill immediately.
    #[serde(default)]
    pub force: bool,
}

/// RELEASE_RESULT — reply to RELEASE, correlated via `reply_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseResultPayload {
    /// Id of the RELEASE envelope this answers.
    pub reply_to: String,
    /// Whether the child is gone (idempotent: true if already gone).
    pub success: bool,
    /// Child name.
    pub name: String,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// ERROR — broker-reported failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// True when the connection is about to close.
    #[serde(default)]
    pub fatal: bool,
    /// Id of the envelope that triggered the error, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
}

impl ErrorPayload {
    /// Non-fatal error referencing an offending envelope.
    pub fn non_fatal(code: ErrorCode, message: impl Into<String>, ref_id: Option<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: false,
            ref_id,
        }
    }

    /// Fatal error; the connection closes after this is written.
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: true,
            ref_id: None,
        }
    }
}

/// BUSY — back-pressure signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusyPayload {
    /// What is saturated (e.g. "write_queue", "store").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ─── Body ──────────────────────────────────────────────────────────────────

/// Adjacently tagged envelope body: `"type"` tag, `"payload"` content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Body {
    /// Handshake request (client → server).
    #[serde(rename = "HELLO")]
    Hello(HelloPayload),
    /// Handshake acknowledgment (server → client).
    #[serde(rename = "WELCOME")]
    Welcome(WelcomePayload),
    /// Graceful close (either direction).
    #[serde(rename = "BYE")]
    Bye(ByePayload),
    /// Liveness probe.
    #[serde(rename = "PING")]
    Ping(HeartbeatPayload),
    /// Liveness reply; nonce must match the PING.
    #[serde(rename = "PONG")]
    Pong(HeartbeatPayload),
    /// Deliverable message (client → server).
    #[serde(rename = "SEND")]
    Send(MessagePayload),
    /// Fan-out of a SEND (server → client); carries a `delivery` block.
    #[serde(rename = "DELIVER")]
    Deliver(MessagePayload),
    /// Delivery acknowledgment (client → server).
    #[serde(rename = "ACK")]
    Ack(AckPayload),
    /// Delivery rejection (client → server).
    #[serde(rename = "NACK")]
    Nack(NackPayload),
    /// Topic subscription (client → server).
    #[serde(rename = "SUBSCRIBE")]
    Subscribe(TopicPayload),
    /// Topic unsubscription (client → server).
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe(TopicPayload),
    /// Channel membership join (client → server).
    #[serde(rename = "CHANNEL_JOIN")]
    ChannelJoin(ChannelPayload),
    /// Channel membership leave (client → server).
    #[serde(rename = "CHANNEL_LEAVE")]
    ChannelLeave(ChannelPayload),
    /// Shadow policy bind (client → server).
    #[serde(rename = "SHADOW_BIND")]
    ShadowBind(ShadowBindPayload),
    /// Shadow policy unbind (client → server).
    #[serde(rename = "SHADOW_UNBIND")]
    ShadowUnbind(ShadowUnbindPayload),
    /// Streamed PTY output (agent → server).
    #[serde(rename = "LOG")]
    Log(LogPayload),
    /// Control request: launch a supervised child (client → server).
    #[serde(rename = "SPAWN")]
    Spawn(SpawnPayload),
    /// Reply to SPAWN (server → client).
    #[serde(rename = "SPAWN_RESULT")]
    SpawnResult(SpawnResultPayload),
    /// Control request: terminate a supervised child (client → server).
    #[serde(rename = "RELEASE")]
    Release(ReleasePayload),
    /// Reply to RELEASE (server → client).
    #[serde(rename = "RELEASE_RESULT")]
    ReleaseResult(ReleaseResultPayload),
    /// Broker-reported failure (server → client).
    #[serde(rename = "ERROR")]
    Error(ErrorPayload),
    /// Back-pressure signal (server → client).
    #[serde(rename = "BUSY")]
    Busy(BusyPayload),
}

impl Body {
    /// Wire tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Body::Hello(_) => "HELLO",
            Body::Welcome(_) => "WELCOME",
            Body::Bye(_) => "BYE",
            Body::Ping(_) => "PING",
            Body::Pong(_) => "PONG",
            Body::Send(_) => "SEND",
            Body::Deliver(_) => "DELIVER",
            Body::Ack(_) => "ACK",
            Body::Nack(_) => "NACK",
            Body::Subscribe(_) => "SUBSCRIBE",
            Body::Unsubscribe(_) => "UNSUBSCRIBE",
            Body::ChannelJoin(_) => "CHANNEL_JOIN",
            Body::ChannelLeave(_) => "CHANNEL_LEAVE",
            Body::ShadowBind(_) => "SHADOW_BIND",
            Body::ShadowUnbind(_) => "SHADOW_UNBIND",
            Body::Log(_) => "LOG",
            Body::Spawn(_) => "SPAWN",
            Body::SpawnResult(_) => "SPAWN_RESULT",
            Body::Release(_) => "RELEASE",
            Body::ReleaseResult(_) => "RELEASE_RESULT",
            Body::Error(_) => "ERROR",
            Body::Busy(_) => "BUSY",
        }
    }
}

// ─── Payload meta & delivery block ─────────────────────────────────────────

/// Sync correlation block inside `payload_meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// When true, the sender blocks on a correlated ACK.
    #[serde(default)]
    pub blocking: bool,
    /// Correlation id echoed back in the responding ACK.
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

/// Optional metadata attached to a SEND/DELIVER.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadMeta {
    /// Sender-declared importance hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<String>,
    /// Absolute delivery time-to-live in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Id of the envelope this replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Sync request/response correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncMeta>,
}

/// Delivery block the broker stamps onto DELIVER envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// Destination-session per-sender sequence number.
    pub seq: u64,
    /// Destination session id.
    pub session_id: String,
    /// Original `to` before broadcast/channel rewriting.
    #[serde(
        default,
        rename = "originalTo",
        skip_serializing_if = "Option::is_none"
    )]
    pub original_to: Option<String>,
    /// True on deliveries mirrored to a shadow observer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shadow: bool,
}

// ─── Envelope ──────────────────────────────────────────────────────────────

/// The unit of exchange on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version.
    pub v: u32,
    /// Opaque message id, monotonic within one sender.
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    /// Sending agent name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Destination agent name or the broadcast token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Channel name (`#`-prefixed) for channel-addressed sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Optional metadata (importance, ttl, reply-to, sync).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_meta: Option<PayloadMeta>,
    /// Delivery block, present only on DELIVER.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryInfo>,
    /// Tagged body.
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    /// New envelope with a generated id and current timestamp.
    pub fn new(body: Body) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            ts: now_ms(),
            from: None,
            to: None,
            topic: None,
            payload_meta: None,
            delivery: None,
            body,
        }
    }

    /// Sets the message id (clients use per-sender monotonic ids).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the sender name.
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the destination name.
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Sets the channel topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Attaches payload metadata.
    pub fn with_meta(mut self, meta: PayloadMeta) -> Self {
        self.payload_meta = Some(meta);
        self
    }

    /// Stamps the delivery block.
    pub fn with_delivery(mut self, delivery: DeliveryInfo) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// The effective delivery TTL: `payload_meta.ttl_ms` or the default.
    pub fn ttl(&self) -> std::time::Duration {
        self.payload_meta
            .as_ref()
            .and_then(|m| m.ttl_ms)
            .map(std::time::Duration::from_millis)
            .unwrap_or(crate::constants::DEFAULT_DELIVERY_TTL)
    }

    /// The sync correlation id, when this is a blocking sync SEND.
    pub fn sync_correlation(&self) -> Option<&str> {
        self.payload_meta
            .as_ref()
            .and_then(|m| m.sync.as_ref())
            .filter(|s| s.blocking)
            .map(|s| s.correlation_id.as_str())
    }
}
