//! Agent supervisor: PTY child lifecycle, health, and bounded restart.
//!
//! The supervisor owns the supervised-children table; it is the only
//! mutator of child lifecycle state. Children are launched through the
//! pluggable [`SpawnProvider`] seam, monitored by a periodic health
//! poll, and torn down by RELEASE or by a detected completion signal.
//!
//! Event flow:
//!
//! ```text
//! PTY reader ──Output/Completion/PtyEof──► SupervisorEvent channel ──► broker loop
//! health poll ──Restarted/PermanentlyDead──► SupervisorEvent channel ──► broker loop
//! ```

pub mod monitor;
pub mod pty;
pub mod scan;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{ENV_SOCKET, ENV_SPAWNER, ENV_WORKSPACE};
use crate::protocol::envelope::SpawnPayload;

use monitor::{ChildState, LifecycleEvent, LifecycleMachine};
use pty::{ChildHandle, SpawnOptions, SpawnProvider};
use scan::CompletionSignal;

/// Env var announcing the summary-file path to the child.
pub const ENV_SUMMARY: &str = "AGENT_RELAY_SUMMARY";
/// Env var carrying the child's reserved agent name.
pub const ENV_AGENT_NAME: &str = "AGENT_RELAY_AGENT_NAME";
/// Env var pointing an MCP-capable CLI at its injected config.
pub const ENV_MCP_CONFIG: &str = "AGENT_RELAY_MCP_CONFIG";

/// CLI kinds known to speak the broker protocol through the MCP
/// adapter; their output is not scanned for completion markers.
const MCP_CAPABLE_CLIS: &[&str] = &["claude", "codex"];

/// Events the supervisor reports to the broker loop.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// Raw PTY output chunk (LOG streaming).
    Output {
        /// Child name.
        name: String,
        /// Lossy UTF-8 output.
        chunk: String,
    },
    /// A completion marker was detected in the child's output.
    Completion {
        /// Child name.
        name: String,
        /// Which marker fired.
        signal: CompletionSignal,
    },
    /// The child's PTY reached EOF (process exited or PTY closed).
    PtyEof {
        /// Child name.
        name: String,
    },
    /// The child died and was relaunched.
    Restarted {
        /// Child name.
        name: String,
        /// New process id.
        pid: u32,
        /// Restarts performed so far.
        restart_count: u32,
    },
    /// The child died with its restart budget exhausted.
    PermanentlyDead {
        /// Child name.
        name: String,
    },
}

/// One supervised child.
pub struct SupervisedChild {
    /// Reserved agent name.
    pub name: String,
    /// CLI kind / command line.
    pub cli: String,
    /// Current process id (changes across restarts).
    pub pid: u32,
    /// Working directory, if any.
    pub cwd: Option<PathBuf>,
    /// Launch instant.
    pub spawned_at: chrono::DateTime<chrono::Utc>,
    /// Last health-check instant.
    pub last_health: Option<Instant>,
    /// PTY output log path.
    pub log_path: PathBuf,

    machine: LifecycleMachine,
    options: SpawnOptions,
    handle: Box<dyn ChildHandle>,
    summary_path: PathBuf,
    summary_seen: bool,
    released: bool,
}

impl std::fmt::Debug for SupervisedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisedChild")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.machine.state())
            .finish_non_exhaustive()
    }
}

/// The supervisor.
pub struct Supervisor {
    children: HashMap<String, SupervisedChild>,
    provider: Box<dyn SpawnProvider>,
    events: UnboundedSender<SupervisorEvent>,
    socket_path: PathBuf,
    workspace: Option<String>,
    log_dir: PathBuf,
    auto_restart: bool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Supervisor with the given provider and event sink.
    pub fn new(
        provider: Box<dyn SpawnProvider>,
        events: UnboundedSender<SupervisorEvent>,
        socket_path: PathBuf,
        workspace: Option<String>,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            children: HashMap::new(),
            provider,
            events,
            socket_path,
            workspace,
            log_dir,
            auto_restart: true,
        }
    }

    /// Disable automatic restarts (children die permanently on first
    /// death).
    pub fn set_auto_restart(&mut self, enabled: bool) {
        self.auto_restart = enabled;
    }

    /// True when a child already owns this name.
    pub fn is_name_taken(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    /// Snapshot of child names, for diagnostics.
    pub fn child_names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    /// Launch a child for a SPAWN request; returns the PID.
    ///
    /// # Errors
    ///
    /// Fails when the name is taken or the launch itself fails; the
    /// broker reports either as an unsuccessful SPAWN_RESULT.
    pub async fn spawn_child(&mut self, payload: &SpawnPayload) -> Result<u32> {
        if self.children.contains_key(&payload.name) {
            bail!("a supervised child named '{}' already exists", payload.name);
        }

        let summary_path = self.log_dir.join(format!("{}.summary", payload.name));
        let mut env: Vec<(String, String)> = vec![
            (
                ENV_SOCKET.to_string(),
                self.socket_path.display().to_string(),
            ),
            (ENV_AGENT_NAME.to_string(), payload.name.clone()),
            (
                ENV_SUMMARY.to_string(),
                summary_path.display().to_string(),
            ),
        ];
        if let Some(workspace) = &self.workspace {
            env.push((ENV_WORKSPACE.to_string(), workspace.clone()));
        }
        if let Some(spawner) = &payload.spawner {
            env.push((ENV_SPAWNER.to_string(), spawner.clone()));
        }

        let mcp = cli_supports_mcp(&payload.cli);
        if mcp {
            let config_path = self.log_dir.join(format!("{}.mcp.json", payload.name));
            write_mcp_config(&config_path, &self.socket_path, &payload.name)?;
            env.push((
                ENV_MCP_CONFIG.to_string(),
                config_path.display().to_string(),
            ));
        }

        let options = SpawnOptions {
            name: payload.name.clone(),
            command: payload.cli.clone(),
            task: payload.task.clone(),
            cwd: payload.cwd.as_ref().map(PathBuf::from),
            env,
            // MCP-capable children report completion over the protocol;
            // interactive children are driven by a human.
            scan_markers: !mcp && !payload.interactive,
            log_path: self.log_dir.join(format!("{}.log", payload.name)),
        };

        let handle = self.provider.spawn(&options, self.events.clone()).await?;
        let pid = handle.pid();

        self.children.insert(
            payload.name.clone(),
            SupervisedChild {
                name: payload.name.clone(),
                cli: payload.cli.clone(),
                pid,
                cwd: options.cwd.clone(),
                spawned_at: chrono::Utc::now(),
                last_health: None,
                log_path: options.log_path.clone(),
                machine: LifecycleMachine::new(self.auto_restart),
                options,
                handle,
                summary_path,
                summary_seen: false,
                released: false,
            },
        );

        Ok(pid)
    }

    /// Release a child. Idempotent: releasing an unknown name succeeds.
    pub fn release(&mut self, name: &str, force: bool) -> bool {
        if let Some(child) = self.children.get_mut(name) {
            log::info!(
                "[Supervisor] releasing '{name}' (pid {}, {})",
                child.pid,
                if force { "forced" } else { "graceful" }
            );
            child.released = true;
            child.handle.destroy(!force);
        }
        true
    }

    /// PTY EOF for a child: reap it and return its exit code, when the
    /// child was still tracked.
    pub fn handle_eof(&mut self, name: &str) -> Option<Option<i32>> {
        // A child mid-restart gets a fresh PTY; its old reader's EOF
        // must not reap the new process.
        if self
            .children
            .get(name)
            .is_some_and(|c| c.machine.state() == ChildState::Restarting)
        {
            return None;
        }
        let mut child = self.children.remove(name)?;
        let exit_code = child.handle.exit_code();
        log::info!(
            "[Supervisor] '{name}' exited (pid {}, code {:?})",
            child.pid,
            exit_code
        );
        Some(exit_code)
    }

    /// Periodic health poll over every child.
    ///
    /// Emits lifecycle events into the supervisor channel; restarts dead
    /// children while their budget lasts.
    pub async fn poll_health(&mut self) {
        let names: Vec<String> = self.children.keys().cloned().collect();
        for name in names {
            // Summary-file completion check (mtime poll alternative to
            // output markers).
            let summary_fired = {
                let Some(child) = self.children.get_mut(&name) else {
                    continue;
                };
                if child.released {
                    continue;
                }
                child.last_health = Some(Instant::now());
                if !child.summary_seen && child.summary_path.exists() {
                    child.summary_seen = true;
                    true
                } else {
                    false
                }
            };
            if summary_fired {
                let path = self.children[&name].summary_path.display().to_string();
                let _ = self.events.send(SupervisorEvent::Completion {
                    name: name.clone(),
                    signal: CompletionSignal::Done(format!("summary file written: {path}")),
                });
            }

            let (alive, event) = {
                let child = self
                    .children
                    .get_mut(&name)
                    .expect("child present, just checked");
                let alive = child.handle.is_alive();
                (alive, child.machine.on_health(alive))
            };

            match event {
                Some(LifecycleEvent::BecameUnhealthy) => {
                    log::warn!("[Supervisor] '{name}' failed a health check (alive={alive})");
                }
                Some(LifecycleEvent::Recovered) => {
                    log::info!("[Supervisor] '{name}' recovered");
                }
                Some(LifecycleEvent::ShouldRestart) => {
                    self.restart_child(&name).await;
                }
                Some(LifecycleEvent::PermanentlyDead) => {
                    log::error!("[Supervisor] '{name}' is permanently dead");
                    let _ = self
                        .events
                        .send(SupervisorEvent::PermanentlyDead { name: name.clone() });
                }
                None => {}
            }
        }
    }

    async fn restart_child(&mut self, name: &str) {
        let options = match self.children.get(name) {
            Some(child) => child.options.clone(),
            None => return,
        };
        log::warn!("[Supervisor] restarting '{name}'");

        match self.provider.restart(&options, self.events.clone()).await {
            Ok(handle) => {
                let pid = handle.pid();
                let child = self
                    .children
                    .get_mut(name)
                    .expect("child present during restart");
                child.handle = handle;
                child.pid = pid;
                child.machine.on_restarted();
                let restart_count = child.machine.restart_count();
                let _ = self.events.send(SupervisorEvent::Restarted {
                    name: name.to_string(),
                    pid,
                    restart_count,
                });
            }
            Err(e) => {
                log::error!("[Supervisor] restart of '{name}' failed: {e}");
                if let Some(child) = self.children.get_mut(name) {
                    child.machine.on_restart_failed();
                }
                let _ = self.events.send(SupervisorEvent::PermanentlyDead {
                    name: name.to_string(),
                });
            }
        }
    }

    /// Kill every child (broker shutdown).
    pub fn shutdown(&mut self) {
        for (name, mut child) in self.children.drain() {
            log::info!("[Supervisor] shutdown: killing '{name}' (pid {})", child.pid);
            child.handle.destroy(false);
        }
    }
}

/// True for CLI kinds that speak the protocol natively via MCP.
fn cli_supports_mcp(cli: &str) -> bool {
    cli.split_whitespace()
        .next()
        .is_some_and(|program| MCP_CAPABLE_CLIS.contains(&program))
}

/// Write the MCP adapter config the child reads to find the broker.
fn write_mcp_config(path: &std::path::Path, socket_path: &std::path::Path, name: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let config = serde_json::json!({
        "socket": socket_path.display().to_string(),
        "agent": name,
    });
    std::fs::write(path, serde_json::to_string_pretty(&config)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn supervisor(tmp: &tempfile::TempDir) -> (Supervisor, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            Box::new(pty::PtyProvider),
            tx,
            tmp.path().join("relay.sock"),
            Some("ws-test".into()),
            tmp.path().join("logs"),
        );
        (supervisor, rx)
    }

    fn spawn_payload(name: &str, cli: &str) -> SpawnPayload {
        SpawnPayload {
            name: name.into(),
            cli: cli.into(),
            task: String::new(),
            cwd: None,
            spawner: Some("Orchestrator".into()),
            interactive: false,
            shadow_of: None,
            shadow_speak_on: vec![],
        }
    }

    #[tokio::test]
    async fn test_spawn_reserves_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut sup, _rx) = supervisor(&tmp);

        let pid = sup
            .spawn_child(&spawn_payload("Worker1", "sleep 60"))
            .await
            .unwrap();
        assert!(pid > 0);
        assert!(sup.is_name_taken("Worker1"));

        // Second spawn with the same name fails.
        assert!(sup
            .spawn_child(&spawn_payload("Worker1", "sleep 60"))
            .await
            .is_err());

        sup.shutdown();
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut sup, _rx) = supervisor(&tmp);

        sup.spawn_child(&spawn_payload("Worker1", "sleep 60"))
            .await
            .unwrap();
        assert!(sup.release("Worker1", true));
        assert!(sup.release("Worker1", true), "second release still succeeds");
        assert!(sup.release("NeverExisted", false));
    }

    #[tokio::test]
    async fn test_eof_reaps_child() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut sup, mut rx) = supervisor(&tmp);

        sup.spawn_child(&spawn_payload("Quick", "true")).await.unwrap();

        // Wait for the reader to report EOF.
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            if let SupervisorEvent::PtyEof { name } = event {
                assert_eq!(name, "Quick");
                break;
            }
        }

        assert!(sup.handle_eof("Quick").is_some());
        assert!(!sup.is_name_taken("Quick"));
        // Unknown child: nothing to reap.
        assert!(sup.handle_eof("Quick").is_none());
    }

    #[tokio::test]
    async fn test_summary_file_fires_completion() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut sup, mut rx) = supervisor(&tmp);

        sup.spawn_child(&spawn_payload("Writer", "sleep 60"))
            .await
            .unwrap();

        // Child "writes" its summary file.
        std::fs::create_dir_all(tmp.path().join("logs")).unwrap();
        std::fs::write(tmp.path().join("logs/Writer.summary"), "all done").unwrap();

        sup.poll_health().await;

        let mut saw_completion = false;
        while let Ok(event) = rx.try_recv() {
            if let SupervisorEvent::Completion { name, signal } = event {
                assert_eq!(name, "Writer");
                assert!(matches!(signal, CompletionSignal::Done(_)));
                saw_completion = true;
            }
        }
        assert!(saw_completion);

        // The signal fires once, not on every poll.
        sup.poll_health().await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, SupervisorEvent::Completion { .. }),
                "summary completion fired twice"
            );
        }

        sup.shutdown();
    }

    #[test]
    fn test_mcp_detection() {
        assert!(cli_supports_mcp("claude"));
        assert!(cli_supports_mcp("claude --model opus"));
        assert!(!cli_supports_mcp("cat"));
        assert!(!cli_supports_mcp(""));
    }
}
