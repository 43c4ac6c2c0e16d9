//! Application-wide constants for agent-relay.
//!
//! This module centralizes protocol defaults and tuning knobs so the
//! broker, delivery engine, supervisor, and client runtime agree on one
//! set of numbers. Constants are grouped by domain with documentation
//! explaining their purpose.
//!
//! # Categories
//!
//! - **Protocol**: wire-level limits announced during the handshake
//! - **Heartbeat & sessions**: liveness and resume windows
//! - **Delivery**: retry policy and queue bounds
//! - **Supervisor**: health polling and restart caps
//! - **Client**: reconnect and request timeouts

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Wire protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size in bytes (1 MiB).
///
/// Announced in WELCOME as `max_frame_bytes`. A frame whose length prefix
/// exceeds this cap is a fatal protocol violation; the connection closes.
pub const MAX_FRAME_BYTES: u32 = 1_048_576;

// ============================================================================
// Heartbeat & sessions
// ============================================================================

/// Interval between server-issued PINGs, announced in WELCOME.
///
/// A peer that misses PONG for two intervals is marked dormant.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Time a peer has to answer a PING before its session goes dormant.
pub const HEARTBEAT_GRACE: Duration = Duration::from_secs(30);

/// How long a dormant session (and its queued deliveries) is retained
/// before the resume token is invalidated and the name released.
pub const RESUME_WINDOW: Duration = Duration::from_secs(60);

/// Time allowed between socket accept and a valid HELLO.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Delivery
// ============================================================================

/// Base retransmission timeout before backoff.
pub const RETRY_BASE: Duration = Duration::from_secs(1);

/// Cap for exponential retransmission backoff.
pub const RETRY_CAP: Duration = Duration::from_secs(30);

/// Jitter applied to each retry deadline (fraction of the timeout).
pub const RETRY_JITTER: f64 = 0.15;

/// Maximum delivery attempts before a record is marked expired.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Default delivery time-to-live when the payload carries no `ttl_ms`.
pub const DEFAULT_DELIVERY_TTL: Duration = Duration::from_secs(60);

/// Per-destination outbound queue depth. Overflow drops oldest-first and
/// signals the sender.
pub const MAX_QUEUE_DEPTH: usize = 1024;

/// Write-queue depth at which a connection signals BUSY and pauses
/// reading SEND envelopes from the peer.
pub const WRITE_BUSY_THRESHOLD: usize = 256;

/// Server-side inbound dedup window per connection (message ids).
pub const SERVER_DEDUP_WINDOW: usize = 512;

/// Maximum message records held in memory before terminal-state eviction.
pub const MAX_STORE_RECORDS: usize = 10_000;

/// Maximum age of a terminal record before age-based eviction.
pub const MAX_STORE_AGE: Duration = Duration::from_secs(3600);

// ============================================================================
// Supervisor
// ============================================================================

/// Interval between health checks on supervised children.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive unhealthy checks before a child is declared dead.
pub const UNHEALTHY_STREAK_LIMIT: u32 = 3;

/// Restarts allowed before a child is declared permanently dead.
pub const MAX_RESTARTS: u32 = 5;

/// Grace period between SIGTERM and SIGKILL on release.
pub const RELEASE_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Client
// ============================================================================

/// Client-side dedup window for DELIVER frames (message ids).
pub const CLIENT_DEDUP_WINDOW: usize = 2000;

/// Initial reconnect backoff.
pub const RECONNECT_BASE: Duration = Duration::from_millis(500);

/// Reconnect backoff cap.
pub const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Client-side timeout for a SPAWN request.
pub const SPAWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Client-side timeout for a RELEASE request.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_grace_is_twice_interval() {
        assert_eq!(HEARTBEAT_GRACE, HEARTBEAT_INTERVAL * 2);
    }

    #[test]
    fn test_retry_policy_is_reasonable() {
        assert!(RETRY_BASE < RETRY_CAP);
        assert!(RETRY_JITTER > 0.0 && RETRY_JITTER < 1.0);
        assert!(MAX_DELIVERY_ATTEMPTS >= 1);
    }

    #[test]
    fn test_frame_cap_matches_welcome_default() {
        assert_eq!(MAX_FRAME_BYTES, 1024 * 1024);
    }
}
