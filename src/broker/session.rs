//! Session identity, resume tokens, and per-peer sequencing.
//!
//! A session binds an agent name to a logical identity that survives
//! connection loss: when a socket dies the session goes dormant and is
//! retained for the resume window. A client presenting the session's
//! resume token on HELLO within the window rebinds to the same session
//! id and receives anything queued while it was away.
//!
//! With a state directory configured, session records are appended to
//! `sessions.jsonl` and reloaded on startup so resume also survives a
//! broker restart. Without one, resume after a restart answers
//! `RESUME_TOO_OLD` and the client handshakes fresh.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::protocol::envelope::{now_ms, EntityType};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// HELLO received, WELCOME not yet written.
    Initializing,
    /// Live and attached to a connection.
    Ready,
    /// Connection lost; retained for the resume window.
    Draining,
    /// Destroyed; kept only transiently for cleanup.
    Closed,
}

/// One logical agent identity.
#[derive(Debug)]
pub struct Session {
    /// Server-assigned id.
    pub id: String,
    /// Owned agent name.
    pub agent: String,
    /// Participant kind.
    pub entity: EntityType,
    /// Capability strings from HELLO.
    pub capabilities: Vec<String>,
    /// Opaque high-entropy token for resumption.
    pub resume_token: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// When the session went dormant, if it is.
    pub dormant_since: Option<Instant>,
    /// Per-peer outbound sequence counters.
    seq: HashMap<String, u64>,
}

impl Session {
    /// True while the session is attached to a connection.
    pub fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Initializing | SessionState::Ready)
    }
}

/// Outcome of [`SessionStore::open`].
#[derive(Debug)]
pub struct OpenResult {
    /// Session id (new or resumed).
    pub session_id: String,
    /// Token the client should present to resume later.
    pub resume_token: String,
    /// True when an existing dormant session was reattached.
    pub resumed: bool,
    /// True when a presented token matched nothing; the caller should
    /// attach a `RESUME_TOO_OLD` warning to the fresh session.
    pub stale_token: bool,
}

/// A session destroyed by resume-window expiry.
#[derive(Debug)]
pub struct ExpiredSession {
    /// Session id.
    pub id: String,
    /// Name released back to the pool.
    pub agent: String,
}

/// Durable session record, one JSON line per state change.
#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    id: String,
    agent_name: String,
    resume_token: String,
    last_seen: i64,
    #[serde(default)]
    closed: bool,
}

/// The session store: identity table plus optional durable backing.
#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
    /// Agent name → session id.
    names: HashMap<String, String>,
    resume_window: Duration,
    journal_path: Option<PathBuf>,
}

impl SessionStore {
    /// In-memory store.
    pub fn new(resume_window: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            names: HashMap::new(),
            resume_window,
            journal_path: None,
        }
    }

    /// Store with a durable journal under `state_dir`.
    ///
    /// Existing records are replayed so dormant sessions from a previous
    /// broker run can be resumed. Replayed sessions start dormant.
    pub fn with_state_dir(resume_window: Duration, state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("sessions.jsonl");
        let mut store = Self::new(resume_window);
        store.journal_path = Some(path.clone());

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("read session journal: {}", path.display()))?;
            // Latest record per session id wins; tombstones drop it.
            let mut latest: HashMap<String, SessionRecord> = HashMap::new();
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<SessionRecord>(line) {
                    Ok(rec) => {
                        if rec.closed {
                            latest.remove(&rec.id);
                        } else {
                            latest.insert(rec.id.clone(), rec);
                        }
                    }
                    Err(e) => log::warn!("[Sessions] skipping bad journal line: {e}"),
                }
            }
            for (_, rec) in latest {
                let session = Session {
                    id: rec.id.clone(),
                    agent: rec.agent_name.clone(),
                    entity: EntityType::Agent,
                    capabilities: Vec::new(),
                    resume_token: rec.resume_token,
                    state: SessionState::Draining,
                    dormant_since: Some(Instant::now()),
                    seq: HashMap::new(),
                };
                store.names.insert(rec.agent_name, rec.id.clone());
                store.sessions.insert(rec.id, session);
            }
            if !store.sessions.is_empty() {
                log::info!(
                    "[Sessions] restored {} dormant session(s) from journal",
                    store.sessions.len()
                );
            }
        }

        Ok(store)
    }

    /// Open a session for `agent`, or resume a dormant one when
    /// `resume_token` matches.
    ///
    /// # Errors
    ///
    /// Fails when the name is owned by a live session and the token does
    /// not match it (`NAME_IN_USE` at the protocol layer).
    pub fn open(
        &mut self,
        agent: &str,
        entity: EntityType,
        capabilities: Vec<String>,
        resume_token: Option<&str>,
    ) -> Result<OpenResult> {
        let mut stale_token = resume_token.is_some();

        // Resume path: the token must match the session owning this name.
        if let Some(token) = resume_token {
            if let Some(session_id) = self.names.get(agent).cloned() {
                let session = self
                    .sessions
                    .get_mut(&session_id)
                    .expect("name table points at a session");
                if session.resume_token == token {
                    session.state = SessionState::Ready;
                    session.dormant_since = None;
                    session.capabilities = capabilities;
                    self.persist(&session_id);
                    log::info!("[Sessions] resumed {session_id} for '{agent}'");
                    let session = &self.sessions[&session_id];
                    return Ok(OpenResult {
                        session_id,
                        resume_token: session.resume_token.clone(),
                        resumed: true,
                        stale_token: false,
                    });
                }
            }
            // Token matched nothing — fall through to a fresh session and
            // report the staleness so the client clears its token.
        } else {
            stale_token = false;
        }

        if let Some(existing_id) = self.names.get(agent) {
            let existing = &self.sessions[existing_id];
            if existing.is_live() {
                anyhow::bail!("agent name '{agent}' is owned by a live session");
            }
            // Dormant session without a matching token: the name is still
            // reserved for the resume window.
            anyhow::bail!("agent name '{agent}' is reserved by a dormant session");
        }

        let id = uuid::Uuid::new_v4().to_string();
        let token = generate_resume_token();
        let session = Session {
            id: id.clone(),
            agent: agent.to_string(),
            entity,
            capabilities,
            resume_token: token.clone(),
            state: SessionState::Ready,
            dormant_since: None,
            seq: HashMap::new(),
        };
        self.names.insert(agent.to_string(), id.clone());
        self.sessions.insert(id.clone(), session);
        self.persist(&id);
        log::info!("[Sessions] opened {id} for '{agent}'");

        Ok(OpenResult {
            session_id: id,
            resume_token: token,
            resumed: false,
            stale_token,
        })
    }

    /// Next per-peer sequence number for a session; strictly increasing.
    pub fn next_seq(&mut self, session_id: &str, peer: &str) -> u64 {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return 0;
        };
        let counter = session.seq.entry(peer.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Start the resume window for a session whose connection died.
    pub fn mark_dormant(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.state = SessionState::Draining;
            session.dormant_since = Some(Instant::now());
            log::info!(
                "[Sessions] {session_id} ('{}') dormant, resume window {}s",
                session.agent,
                self.resume_window.as_secs()
            );
        }
    }

    /// Destroy dormant sessions whose window has elapsed; returns the
    /// casualties so queued deliveries can be expired.
    pub fn expire_dormant(&mut self, now: Instant) -> Vec<ExpiredSession> {
        let window = self.resume_window;
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| {
                s.state == SessionState::Draining
                    && s.dormant_since
                        .is_some_and(|since| now.duration_since(since) >= window)
            })
            .map(|s| s.id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.close(&id))
            .collect()
    }

    /// Destroy a session (BYE, expiry, or fatal error) and release its
    /// name.
    pub fn close(&mut self, session_id: &str) -> Option<ExpiredSession> {
        let session = self.sessions.remove(session_id)?;
        self.names.remove(&session.agent);
        self.persist_tombstone(session_id, &session.agent, &session.resume_token);
        log::info!("[Sessions] closed {session_id} ('{}')", session.agent);
        Some(ExpiredSession {
            id: session.id,
            agent: session.agent,
        })
    }

    /// Session by id.
    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Session id owning an agent name.
    pub fn id_for_name(&self, agent: &str) -> Option<&str> {
        self.names.get(agent).map(String::as_str)
    }

    /// Agent names with live sessions.
    pub fn live_names(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.is_live())
            .map(|s| s.agent.clone())
            .collect()
    }

    /// (session id, agent name) of every dormant session — used after a
    /// restart to rebuild the router's name table.
    pub fn dormant_sessions(&self) -> Vec<(String, String)> {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Draining)
            .map(|s| (s.id.clone(), s.agent.clone()))
            .collect()
    }

    /// True when the session exists and is dormant.
    pub fn is_dormant(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.state == SessionState::Draining)
    }

    fn persist(&self, session_id: &str) {
        let Some(path) = &self.journal_path else {
            return;
        };
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let record = SessionRecord {
            id: session.id.clone(),
            agent_name: session.agent.clone(),
            resume_token: session.resume_token.clone(),
            last_seen: now_ms(),
            closed: false,
        };
        append_jsonl(path, &record);
    }

    fn persist_tombstone(&self, id: &str, agent: &str, token: &str) {
        let Some(path) = &self.journal_path else {
            return;
        };
        let record = SessionRecord {
            id: id.to_string(),
            agent_name: agent.to_string(),
            resume_token: token.to_string(),
            last_seen: now_ms(),
            closed: true,
        };
        append_jsonl(path, &record);
    }
}

/// 32 random bytes, base64url. Opaque to clients.
fn generate_resume_token() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Append one JSON line to a journal file, logging (not propagating)
/// write failures: durability is best-effort, the broker keeps serving.
pub(crate) fn append_jsonl<T: Serialize>(path: &Path, record: &T) {
    let line = match serde_json::to_string(record) {
        Ok(l) => l,
        Err(e) => {
            log::error!("[Journal] serialize failed: {e}");
            return;
        }
    };
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{line}"));
    if let Err(e) = result {
        log::error!("[Journal] append to {} failed: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Duration::from_secs(60))
    }

    #[test]
    fn test_open_reserves_name() {
        let mut s = store();
        let opened = s
            .open("Alice", EntityType::Agent, vec![], None)
            .unwrap();
        assert!(!opened.resumed);
        assert!(!opened.stale_token);
        assert_eq!(s.id_for_name("Alice"), Some(opened.session_id.as_str()));

        // Same name again while live: rejected.
        assert!(s.open("Alice", EntityType::Agent, vec![], None).is_err());
    }

    #[test]
    fn test_resume_within_window_returns_same_session() {
        let mut s = store();
        let opened = s.open("Agent1", EntityType::Agent, vec![], None).unwrap();
        s.mark_dormant(&opened.session_id);

        let resumed = s
            .open(
                "Agent1",
                EntityType::Agent,
                vec![],
                Some(&opened.resume_token),
            )
            .unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.session_id, opened.session_id);
        assert!(s.get(&opened.session_id).unwrap().is_live());
    }

    #[test]
    fn test_dormant_name_without_token_is_reserved() {
        let mut s = store();
        let opened = s.open("Agent1", EntityType::Agent, vec![], None).unwrap();
        s.mark_dormant(&opened.session_id);

        // No token: name still reserved for the resume window.
        assert!(s.open("Agent1", EntityType::Agent, vec![], None).is_err());
        // Wrong token: also reserved.
        assert!(s
            .open("Agent1", EntityType::Agent, vec![], Some("bogus"))
            .is_err());
    }

    #[test]
    fn test_stale_token_after_expiry_gets_fresh_session() {
        let mut s = store();
        let opened = s.open("Agent1", EntityType::Agent, vec![], None).unwrap();
        s.mark_dormant(&opened.session_id);

        let expired = s.expire_dormant(Instant::now() + Duration::from_secs(61));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].agent, "Agent1");

        let fresh = s
            .open(
                "Agent1",
                EntityType::Agent,
                vec![],
                Some(&opened.resume_token),
            )
            .unwrap();
        assert!(!fresh.resumed);
        assert!(fresh.stale_token, "client should be told its token is stale");
        assert_ne!(fresh.session_id, opened.session_id);
    }

    #[test]
    fn test_expire_before_window_is_noop() {
        let mut s = store();
        let opened = s.open("Agent1", EntityType::Agent, vec![], None).unwrap();
        s.mark_dormant(&opened.session_id);
        let expired = s.expire_dormant(Instant::now() + Duration::from_secs(5));
        assert!(expired.is_empty());
        assert!(s.is_dormant(&opened.session_id));
    }

    #[test]
    fn test_seq_is_monotonic_per_peer() {
        let mut s = store();
        let opened = s.open("Alice", EntityType::Agent, vec![], None).unwrap();
        let id = &opened.session_id;

        assert_eq!(s.next_seq(id, "Bob"), 1);
        assert_eq!(s.next_seq(id, "Bob"), 2);
        assert_eq!(s.next_seq(id, "Carol"), 1);
        assert_eq!(s.next_seq(id, "Bob"), 3);
    }

    #[test]
    fn test_close_releases_name() {
        let mut s = store();
        let opened = s.open("Alice", EntityType::Agent, vec![], None).unwrap();
        s.close(&opened.session_id);
        assert!(s.id_for_name("Alice").is_none());
        assert!(s.open("Alice", EntityType::Agent, vec![], None).is_ok());
    }

    #[test]
    fn test_resume_tokens_are_unique_and_opaque() {
        let a = generate_resume_token();
        let b = generate_resume_token();
        assert_ne!(a, b);
        assert!(a.len() >= 40, "expected ~43 chars of base64, got {}", a.len());
    }

    #[test]
    fn test_journal_restores_dormant_sessions() {
        let tmp = tempfile::TempDir::new().unwrap();

        let token;
        let session_id;
        {
            let mut s =
                SessionStore::with_state_dir(Duration::from_secs(60), tmp.path()).unwrap();
            let opened = s.open("Agent1", EntityType::Agent, vec![], None).unwrap();
            token = opened.resume_token;
            session_id = opened.session_id;
        }

        // Fresh store over the same dir: the session comes back dormant.
        let mut s = SessionStore::with_state_dir(Duration::from_secs(60), tmp.path()).unwrap();
        assert!(s.is_dormant(&session_id));

        let resumed = s
            .open("Agent1", EntityType::Agent, vec![], Some(&token))
            .unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.session_id, session_id);
    }

    #[test]
    fn test_journal_tombstone_drops_session() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let mut s =
                SessionStore::with_state_dir(Duration::from_secs(60), tmp.path()).unwrap();
            let opened = s.open("Agent1", EntityType::Agent, vec![], None).unwrap();
            s.close(&opened.session_id);
        }
        let s = SessionStore::with_state_dir(Duration::from_secs(60), tmp.path()).unwrap();
        assert!(s.id_for_name("Agent1").is_none());
    }
}
