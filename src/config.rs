//! Broker configuration and environment handling.
//!
//! The default socket path is derived from the project root
//! (`<project>/.agent-relay/relay.sock`). Everything can be overridden
//! through environment variables so spawned children can locate the
//! socket and identify their spawner:
//!
//! - `AGENT_RELAY_SOCKET` — socket path override
//! - `AGENT_RELAY_WORKSPACE` — workspace id
//! - `AGENT_RELAY_SPAWNER` — spawner name propagated to children
//! - `AGENT_RELAY_STATE_DIR` — durable backing directory (enables
//!   session/channel/message journaling)

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::constants;

/// Env var: socket path override.
pub const ENV_SOCKET: &str = "AGENT_RELAY_SOCKET";
/// Env var: workspace id.
pub const ENV_WORKSPACE: &str = "AGENT_RELAY_WORKSPACE";
/// Env var: spawner name propagated to spawned children.
pub const ENV_SPAWNER: &str = "AGENT_RELAY_SPAWNER";
/// Env var: durable state directory.
pub const ENV_STATE_DIR: &str = "AGENT_RELAY_STATE_DIR";

/// `sun_path` is 104 bytes on macOS and 108 on Linux; use the
/// conservative limit.
const MAX_SOCKET_PATH: usize = 104;

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Path of the Unix socket the broker listens on.
    pub socket_path: PathBuf,
    /// Durable backing directory. `None` disables journaling; resume
    /// then fails across broker restarts with `RESUME_TOO_OLD`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Workspace identifier forwarded to spawned children.
    #[serde(default)]
    pub workspace: Option<String>,
    /// Maximum accepted frame size, announced in WELCOME.
    pub max_frame_bytes: u32,
    /// Interval between server PINGs, announced in WELCOME.
    #[serde(with = "duration_ms")]
    pub heartbeat: Duration,
    /// Dormant-session retention window.
    #[serde(with = "duration_ms")]
    pub resume_window: Duration,
    /// Per-destination outbound queue depth.
    pub max_queue_depth: usize,
    /// Maximum in-memory message records.
    pub max_store_records: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            state_dir: None,
            workspace: None,
            max_frame_bytes: constants::MAX_FRAME_BYTES,
            heartbeat: constants::HEARTBEAT_INTERVAL,
            resume_window: constants::RESUME_WINDOW,
            max_queue_depth: constants::MAX_QUEUE_DEPTH,
            max_store_records: constants::MAX_STORE_RECORDS,
        }
    }
}

impl RelayConfig {
    /// Defaults plus environment overrides.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_SOCKET) {
            self.socket_path = PathBuf::from(path);
        }
        if let Ok(workspace) = std::env::var(ENV_WORKSPACE) {
            self.workspace = Some(workspace);
        }
        if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
            self.state_dir = Some(PathBuf::from(dir));
        }
    }

    /// Validate the socket path against the kernel `sun_path` limit and
    /// make sure its parent directory exists with owner-only permissions.
    pub fn prepare_socket_dir(&self) -> Result<()> {
        validate_socket_path(&self.socket_path)?;
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(())
    }

    /// Heartbeat interval in milliseconds, for the WELCOME payload.
    pub fn heartbeat_ms(&self) -> u64 {
        self.heartbeat.as_millis() as u64
    }
}

/// Default socket path: `<cwd>/.agent-relay/relay.sock`.
fn default_socket_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".agent-relay")
        .join("relay.sock")
}

/// Reject paths the kernel cannot bind.
pub fn validate_socket_path(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= MAX_SOCKET_PATH {
        anyhow::bail!(
            "socket path too long ({len} bytes, max {}): {}\n\
             Consider setting {ENV_SOCKET} to a shorter value.",
            MAX_SOCKET_PATH - 1,
            path.display()
        );
    }
    Ok(())
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
