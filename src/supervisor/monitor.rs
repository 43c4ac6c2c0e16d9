//! Child lifecycle state machine and health policy.
//!
//! ```text
//! Running ──unhealthy──► Unhealthy ──streak──► Died ──restart──► Restarting
//!    ▲                       │                  │                    │
//!    └───────healthy─────────┘                  │ cap reached        │
//!    ◄──────────────────────────────────────────┼────────────────────┘
//!                                               ▼
//!                                        PermanentlyDead
//! ```
//!
//! Transitions are the only way lifecycle fields change, and each
//! transition reports an event the supervisor turns into notifications.

use crate::constants::{MAX_RESTARTS, UNHEALTHY_STREAK_LIMIT};

/// Lifecycle state of a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Healthy and monitored.
    Running,
    /// Failing health checks; streak counting toward death.
    Unhealthy,
    /// Death detected, restart in progress.
    Restarting,
    /// Dead with restarts still available (transient).
    Died,
    /// Dead with the restart budget exhausted.
    PermanentlyDead,
}

/// Event produced by a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// First failed check after a healthy run.
    BecameUnhealthy,
    /// Streak limit reached; the child is dead and a restart is due.
    ShouldRestart,
    /// Streak limit reached with no restart budget left.
    PermanentlyDead,
    /// A failing child passed a check again.
    Recovered,
}

/// Per-child health and restart bookkeeping.
#[derive(Debug)]
pub struct LifecycleMachine {
    state: ChildState,
    unhealthy_streak: u32,
    restart_count: u32,
    auto_restart: bool,
}

impl LifecycleMachine {
    /// Machine for a freshly spawned child.
    pub fn new(auto_restart: bool) -> Self {
        Self {
            state: ChildState::Running,
            unhealthy_streak: 0,
            restart_count: 0,
            auto_restart,
        }
    }

    /// Current state.
    pub fn state(&self) -> ChildState {
        self.state
    }

    /// Restarts performed so far.
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Record one health-check outcome; returns the transition event, if
    /// any.
    pub fn on_health(&mut self, healthy: bool) -> Option<LifecycleEvent> {
        match (self.state, healthy) {
            (ChildState::Running, true) => None,
            (ChildState::Running, false) => {
                self.unhealthy_streak = 1;
                self.state = ChildState::Unhealthy;
                if self.unhealthy_streak >= UNHEALTHY_STREAK_LIMIT {
                    return Some(self.die());
                }
                Some(LifecycleEvent::BecameUnhealthy)
            }
            (ChildState::Unhealthy, true) => {
                self.unhealthy_streak = 0;
                self.state = ChildState::Running;
                Some(LifecycleEvent::Recovered)
            }
            (ChildState::Unhealthy, false) => {
                self.unhealthy_streak += 1;
                if self.unhealthy_streak >= UNHEALTHY_STREAK_LIMIT {
                    return Some(self.die());
                }
                None
            }
            // Terminal or in-progress states ignore further checks.
            _ => None,
        }
    }

    /// The process is known dead right now (EOF, completion marker, or
    /// `kill(pid, 0)` failure during restart). Skips the streak.
    pub fn on_confirmed_dead(&mut self) -> LifecycleEvent {
        self.die()
    }

    /// A restart completed; the child is running under a new PID.
    pub fn on_restarted(&mut self) {
        debug_assert_eq!(self.state, ChildState::Restarting);
        self.restart_count += 1;
        self.unhealthy_streak = 0;
        self.state = ChildState::Running;
    }

    /// A restart attempt failed to launch.
    pub fn on_restart_failed(&mut self) -> LifecycleEvent {
        self.state = ChildState::PermanentlyDead;
        LifecycleEvent::PermanentlyDead
    }

    fn die(&mut self) -> LifecycleEvent {
        if self.auto_restart && self.restart_count < MAX_RESTARTS {
            self.state = ChildState::Restarting;
            LifecycleEvent::ShouldRestart
        } else {
            self.state = ChildState::PermanentlyDead;
            LifecycleEvent::PermanentlyDead
        }
    }
}
