//! Agent Relay: a local multi-agent messaging fabric.
//!
//! A long-lived broker accepts connections from agent processes over a
//! Unix socket, routes point-to-point and channel-addressed messages
//! with at-least-once delivery, and supervises PTY-attached child
//! agents.

// Library modules
pub mod broker;
pub mod client;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod protocol;
pub mod supervisor;

// Re-export commonly used types
pub use broker::{Broker, BrokerHandle};
pub use client::{ClientConfig, ClientEvent, IncomingMessage, RelayClient};
pub use config::RelayConfig;
pub use protocol::{Body, Envelope, ErrorCode, MessagePayload};
