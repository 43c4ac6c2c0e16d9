//! Wire protocol: envelope types and length-prefixed framing.

pub mod envelope;
pub mod framing;

pub use envelope::{
    AckPayload, Body, BusyPayload, ByePayload, ChannelPayload, DeliveryInfo, EntityType, Envelope,
    ErrorCode, ErrorPayload, HeartbeatPayload, HelloPayload, LogPayload, MessagePayload,
    NackPayload, PayloadMeta, ReleasePayload, ReleaseResultPayload, ServerLimits,
    ShadowBindPayload, ShadowUnbindPayload, SpawnPayload, SpawnResultPayload, SyncMeta,
    SyncResponse, TopicPayload, WelcomePayload, BROADCAST,
};
pub use framing::{encode, Decoded, FrameDecoder};
