//! PTY spawn provider.
//!
//! Launches children under a pseudo-terminal via `portable-pty` so CLI
//! agents that expect a TTY behave normally. A reader thread per child
//! captures output to the child's log file, forwards it to the
//! supervisor event channel for LOG streaming, and (for non-interactive,
//! non-MCP children) feeds the completion-signal scanner.
//!
//! The provider seam keeps the supervisor platform-agnostic: the core
//! only sees `spawn`, `is_alive`, `destroy`, and `restart`.

// Rust guideline compliant 2026-02

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc::UnboundedSender;

use crate::constants::RELEASE_GRACE;

use super::scan::OutputScanner;
use super::SupervisorEvent;

/// Everything needed to launch (or relaunch) one child.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Agent name the child will register under.
    pub name: String,
    /// Command line to launch (program + args, whitespace-split).
    pub command: String,
    /// Task description written into the PTY after launch.
    pub task: String,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment (socket path, workspace, spawner, …).
    pub env: Vec<(String, String)>,
    /// Scan output for completion markers.
    pub scan_markers: bool,
    /// Log file capturing all PTY output.
    pub log_path: PathBuf,
}

/// Live handle to a spawned child.
pub trait ChildHandle: Send {
    /// Child process id.
    fn pid(&self) -> u32;
    /// Liveness probe.
    fn is_alive(&self) -> bool;
    /// Terminate the child. Graceful sends SIGTERM and escalates to
    /// SIGKILL after the release grace period; forced kills immediately.
    fn destroy(&mut self, graceful: bool);
    /// Exit code, once the child has been reaped. `None` while running
    /// or when killed by signal.
    fn exit_code(&mut self) -> Option<i32>;
    /// Write bytes into the child's PTY.
    fn write_input(&mut self, data: &[u8]) -> Result<()>;
}

/// Platform seam for child process supervision.
#[async_trait]
pub trait SpawnProvider: Send + Sync {
    /// Launch a child; output events flow into `events`.
    async fn spawn(
        &self,
        options: &SpawnOptions,
        events: UnboundedSender<SupervisorEvent>,
    ) -> Result<Box<dyn ChildHandle>>;

    /// Relaunch with the same command and task.
    async fn restart(
        &self,
        options: &SpawnOptions,
        events: UnboundedSender<SupervisorEvent>,
    ) -> Result<Box<dyn ChildHandle>> {
        self.spawn(options, events).await
    }
}

/// The in-tree provider: PTY-based spawning.
#[derive(Debug, Default)]
pub struct PtyProvider;

#[async_trait]
impl SpawnProvider for PtyProvider {
    async fn spawn(
        &self,
        options: &SpawnOptions,
        events: UnboundedSender<SupervisorEvent>,
    ) -> Result<Box<dyn ChildHandle>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("open PTY")?;

        let parts: Vec<&str> = options.command.split_whitespace().collect();
        if parts.is_empty() {
            bail!("empty spawn command for '{}'", options.name);
        }
        let mut cmd = CommandBuilder::new(parts[0]);
        for arg in &parts[1..] {
            cmd.arg(arg);
        }
        if let Some(cwd) = &options.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("spawn '{}' for '{}'", options.command, options.name))?;
        let pid = child
            .process_id()
            .context("spawned child has no process id")?;

        let mut reader = pair.master.try_clone_reader().context("clone PTY reader")?;
        let mut writer = pair.master.take_writer().context("take PTY writer")?;

        // Hand the task to the child the way a human would: typed into
        // its terminal.
        if !options.task.is_empty() {
            writer
                .write_all(format!("{}\n", options.task).as_bytes())
                .context("write task to PTY")?;
            writer.flush().ok();
        }

        if let Some(parent) = options.log_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let mut log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&options.log_path)
            .with_context(|| format!("open log file {}", options.log_path.display()))?;

        let name = options.name.clone();
        let scan_markers = options.scan_markers;
        let reader_thread = thread::spawn(move || {
            log::debug!("[Supervisor] PTY reader for '{name}' started");
            let mut buf = [0u8; 4096];
            let mut scanner = OutputScanner::new();

            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break, // EOF: child exited
                    Ok(n) => {
                        let data = &buf[..n];
                        if let Err(e) = log_file.write_all(data) {
                            log::warn!("[Supervisor] log write for '{name}': {e}");
                        }
                        let chunk = String::from_utf8_lossy(data).into_owned();
                        let _ = events.send(SupervisorEvent::Output {
                            name: name.clone(),
                            chunk,
                        });
                        if scan_markers {
                            for signal in scanner.feed(data) {
                                let _ = events.send(SupervisorEvent::Completion {
                                    name: name.clone(),
                                    signal,
                                });
                            }
                        }
                    }
                    Err(_) => break,
                }
            }

            log::debug!("[Supervisor] PTY reader for '{name}' stopped");
            let _ = events.send(SupervisorEvent::PtyEof { name });
        });

        log::info!(
            "[Supervisor] spawned '{}' (pid {pid}): {}",
            options.name,
            options.command
        );

        Ok(Box::new(PtyChild {
            pid,
            child,
            writer: Some(writer),
            _master: pair.master,
            reader_thread: Some(reader_thread),
        }))
    }
}

/// A child living under a PTY.
struct PtyChild {
    pid: u32,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    writer: Option<Box<dyn Write + Send>>,
    /// Keeps the master side (and thus the PTY) open for the child's
    /// lifetime.
    _master: Box<dyn MasterPty + Send>,
    reader_thread: Option<thread::JoinHandle<()>>,
}

impl ChildHandle for PtyChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        process_alive(self.pid)
    }

    fn destroy(&mut self, graceful: bool) {
        let pid = self.pid as libc::pid_t;
        if graceful {
            unsafe { libc::kill(pid, libc::SIGTERM) };
            // Escalate off-thread so the supervisor loop never blocks on
            // the grace period.
            thread::spawn(move || {
                let deadline = std::time::Instant::now() + RELEASE_GRACE;
                while std::time::Instant::now() < deadline {
                    if !process_alive(pid as u32) {
                        return;
                    }
                    thread::sleep(Duration::from_millis(200));
                }
                log::warn!("[Supervisor] pid {pid} survived SIGTERM, sending SIGKILL");
                unsafe { libc::kill(pid, libc::SIGKILL) };
            });
        } else {
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
    }

    fn exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            _ => None,
        }
    }

    fn write_input(&mut self, data: &[u8]) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.write_all(data)?;
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for PtyChild {
    fn drop(&mut self) {
        // Reader thread exits on its own once the PTY closes; detach
        // rather than join so drop never blocks the event loop.
        self.reader_thread.take();
    }
}

/// `kill(pid, 0)` aliveness probe.
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
