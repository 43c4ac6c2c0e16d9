//! Name resolution, channels, topics, and the shadow graph.
//!
//! The router owns the agent name table, channel membership map, topic
//! subscription map, and shadow bindings. It is mutated only from the
//! broker event loop; dispatch reads take a consistent snapshot at call
//! time.
//!
//! Channel membership changes can be journalled to `channels.jsonl` so
//! that after a broker restart reconnecting agents are auto-rejoined.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::envelope::{ShadowBindPayload, ShadowUnbindPayload, BROADCAST};

use super::session::append_jsonl;

/// A directed shadow edge: `shadow` observes `primary`.
///
/// Bindings are indexed both by primary name and by binding id so that
/// back-references between a primary and its shadow stay explicit and
/// unbind is O(1). A shadow can never be its own primary.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowBinding {
    /// Binding id (uuid), returned to the binder.
    pub id: String,
    /// Observer agent name.
    pub shadow: String,
    /// Observed agent name.
    pub primary: String,
    /// Mirror deliveries addressed to the primary.
    pub receive_incoming: bool,
    /// Mirror messages the primary sends.
    pub receive_outgoing: bool,
    /// Conditions under which the shadow may speak.
    pub speak_on: Vec<String>,
}

/// One registered name-table entry.
#[derive(Debug)]
struct NameEntry {
    session_id: String,
    live: bool,
}

/// Journal line for channel membership replay.
#[derive(Debug, Serialize, Deserialize)]
struct MembershipRecord {
    channel: String,
    agent: String,
    joined: bool,
}

/// The routing state.
#[derive(Debug, Default)]
pub struct Router {
    /// Agent name → session id + liveness.
    names: HashMap<String, NameEntry>,
    /// Channel → member agent names.
    channels: HashMap<String, HashSet<String>>,
    /// Topic → subscribed session ids.
    topics: HashMap<String, HashSet<String>>,
    /// Primary name → binding ids.
    shadows_by_primary: HashMap<String, Vec<String>>,
    /// Binding id → binding.
    bindings: HashMap<String, ShadowBinding>,
    journal_path: Option<PathBuf>,
}

impl Router {
    /// In-memory router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with a membership journal under `state_dir`, replayed on
    /// construction.
    pub fn with_state_dir(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("channels.jsonl");
        let mut router = Self::new();
        router.journal_path = Some(path.clone());

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("read channel journal: {}", path.display()))?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<MembershipRecord>(line) {
                    Ok(rec) => {
                        if rec.joined {
                            router
                                .channels
                                .entry(rec.channel)
                                .or_default()
                                .insert(rec.agent);
                        } else if let Some(members) = router.channels.get_mut(&rec.channel) {
                            members.remove(&rec.agent);
                            if members.is_empty() {
                                router.channels.remove(&rec.channel);
                            }
                        }
                    }
                    Err(e) => log::warn!("[Router] skipping bad journal line: {e}"),
                }
            }
            if !router.channels.is_empty() {
                log::info!(
                    "[Router] restored {} channel(s) from journal",
                    router.channels.len()
                );
            }
        }

        Ok(router)
    }

    // ─── Name table ────────────────────────────────────────────────────────

    /// Register (or re-register) a name for a session.
    pub fn register(&mut self, agent: &str, session_id: &str) {
        self.names.insert(
            agent.to_string(),
            NameEntry {
                session_id: session_id.to_string(),
                live: true,
            },
        );
    }

    /// Flip liveness without dropping the registration (dormancy).
    pub fn set_live(&mut self, agent: &str, live: bool) {
        if let Some(entry) = self.names.get_mut(agent) {
            entry.live = live;
        }
    }

    /// Remove a name entirely (session destroyed).
    pub fn unregister(&mut self, agent: &str) {
        self.names.remove(agent);
    }

    /// Session id owning a registered name.
    pub fn session_for(&self, agent: &str) -> Option<&str> {
        self.names.get(agent).map(|e| e.session_id.as_str())
    }

    // ─── Channels ──────────────────────────────────────────────────────────

    /// Join a channel, creating it implicitly. Idempotent.
    ///
    /// # Errors
    ///
    /// Channel names must start with `#`.
    pub fn join(&mut self, agent: &str, channel: &str) -> Result<()> {
        if !channel.starts_with('#') {
            bail!("channel name must start with '#': {channel}");
        }
        let inserted = self
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(agent.to_string());
        if inserted {
            self.journal_membership(channel, agent, true);
            log::debug!("[Router] '{agent}' joined {channel}");
        }
        Ok(())
    }

    /// Leave a channel; empty channels are deleted.
    pub fn leave(&mut self, agent: &str, channel: &str) {
        let mut removed = false;
        let mut now_empty = false;
        if let Some(members) = self.channels.get_mut(channel) {
            removed = members.remove(agent);
            now_empty = members.is_empty();
        }
        if now_empty {
            self.channels.remove(channel);
        }
        if removed {
            self.journal_membership(channel, agent, false);
            log::debug!("[Router] '{agent}' left {channel}");
        }
    }

    /// Membership snapshot for a channel.
    pub fn members(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All channel memberships, for store snapshots and diagnostics.
    pub fn channel_memberships(&self) -> HashMap<String, Vec<String>> {
        self.channels
            .iter()
            .map(|(c, m)| (c.clone(), m.iter().cloned().collect()))
            .collect()
    }

    /// Channels an agent is a member of.
    pub fn channels_of(&self, agent: &str) -> Vec<String> {
        self.channels
            .iter()
            .filter(|(_, members)| members.contains(agent))
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    // ─── Topics ────────────────────────────────────────────────────────────

    /// Subscribe a session to a raw topic.
    pub fn subscribe(&mut self, session_id: &str, topic: &str) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    /// Unsubscribe a session from a topic.
    pub fn unsubscribe(&mut self, session_id: &str, topic: &str) {
        if let Some(subs) = self.topics.get_mut(topic) {
            subs.remove(session_id);
            if subs.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    /// Drop all topic subscriptions of a session (session destroyed).
    pub fn unsubscribe_all(&mut self, session_id: &str) {
        self.topics.retain(|_, subs| {
            subs.remove(session_id);
            !subs.is_empty()
        });
    }

    /// Sessions subscribed to a topic.
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ─── Shadow graph ──────────────────────────────────────────────────────

    /// Create a shadow binding.
    ///
    /// # Errors
    ///
    /// A shadow cannot be its own primary.
    pub fn bind_shadow(&mut self, payload: &ShadowBindPayload) -> Result<String> {
        if payload.shadow == payload.primary {
            bail!("shadow '{}' cannot observe itself", payload.shadow);
        }
        let binding = ShadowBinding {
            id: uuid::Uuid::new_v4().to_string(),
            shadow: payload.shadow.clone(),
            primary: payload.primary.clone(),
            receive_incoming: payload.receive_incoming,
            receive_outgoing: payload.receive_outgoing,
            speak_on: payload.speak_on.clone(),
        };
        let id = binding.id.clone();
        self.shadows_by_primary
            .entry(binding.primary.clone())
            .or_default()
            .push(id.clone());
        self.bindings.insert(id.clone(), binding);
        log::info!(
            "[Router] shadow bind {id}: '{}' observes '{}'",
            payload.shadow,
            payload.primary
        );
        Ok(id)
    }

    /// Remove a binding by id or (shadow, primary) pair. Returns whether
    /// anything was removed.
    pub fn unbind_shadow(&mut self, payload: &ShadowUnbindPayload) -> bool {
        let id = match &payload.binding_id {
            Some(id) => Some(id.clone()),
            None => match (&payload.shadow, &payload.primary) {
                (Some(shadow), Some(primary)) => self
                    .bindings
                    .values()
                    .find(|b| &b.shadow == shadow && &b.primary == primary)
                    .map(|b| b.id.clone()),
                _ => None,
            },
        };
        let Some(id) = id else {
            return false;
        };
        let Some(binding) = self.bindings.remove(&id) else {
            return false;
        };
        if let Some(ids) = self.shadows_by_primary.get_mut(&binding.primary) {
            ids.retain(|x| x != &id);
            if ids.is_empty() {
                self.shadows_by_primary.remove(&binding.primary);
            }
        }
        log::info!("[Router] shadow unbind {id}");
        true
    }

    /// Bindings observing a primary.
    pub fn shadows_of(&self, primary: &str) -> Vec<&ShadowBinding> {
        self.shadows_by_primary
            .get(primary)
            .map(|ids| ids.iter().filter_map(|id| self.bindings.get(id)).collect())
            .unwrap_or_default()
    }

    /// Drop every binding that references an agent, as shadow or primary.
    pub fn drop_agent_shadows(&mut self, agent: &str) {
        let ids: Vec<String> = self
            .bindings
            .values()
            .filter(|b| b.shadow == agent || b.primary == agent)
            .map(|b| b.id.clone())
            .collect();
        for id in ids {
            self.unbind_shadow(&ShadowUnbindPayload {
                binding_id: Some(id),
                shadow: None,
                primary: None,
            });
        }
    }

    // ─── Resolution ────────────────────────────────────────────────────────

    /// Resolve a destination expression into concrete agent names.
    ///
    /// - `*` → all live agents except the sender
    /// - `#channel` → current members except the sender
    /// - anything else → the single registered owner of that name
    ///
    /// # Errors
    ///
    /// Direct sends to unregistered names fail (`UNKNOWN_DESTINATION` at
    /// the protocol layer).
    pub fn resolve(&self, to: &str, sender: &str) -> Result<Vec<String>> {
        if to == BROADCAST {
            let mut dests: Vec<String> = self
                .names
                .iter()
                .filter(|(name, entry)| entry.live && name.as_str() != sender)
                .map(|(name, _)| name.clone())
                .collect();
            dests.sort();
            return Ok(dests);
        }

        if to.starts_with('#') {
            let mut dests: Vec<String> = self
                .members(to)
                .into_iter()
                .filter(|name| name != sender)
                .collect();
            dests.sort();
            return Ok(dests);
        }

        if self.names.contains_key(to) {
            Ok(vec![to.to_string()])
        } else {
            bail!("no agent named '{to}' is registered")
        }
    }

    /// Shadow mirrors for a dispatch: every shadow whose policy covers
    /// this direction, deduplicated, excluding names already receiving
    /// the message.
    pub fn shadow_mirrors(&self, sender: &str, destinations: &[String]) -> Vec<String> {
        let mut mirrors: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = destinations.iter().map(String::as_str).collect();
        seen.insert(sender);

        for binding in self.shadows_of(sender) {
            if binding.receive_outgoing && !seen.contains(binding.shadow.as_str()) {
                seen.insert(binding.shadow.as_str());
                mirrors.push(binding.shadow.clone());
            }
        }
        for dest in destinations {
            for binding in self.shadows_of(dest) {
                if binding.receive_incoming && !seen.contains(binding.shadow.as_str()) {
                    seen.insert(binding.shadow.as_str());
                    mirrors.push(binding.shadow.clone());
                }
            }
        }
        mirrors
    }

    fn journal_membership(&self, channel: &str, agent: &str, joined: bool) {
        let Some(path) = &self.journal_path else {
            return;
        };
        append_jsonl(
            path,
            &MembershipRecord {
                channel: channel.to_string(),
                agent: agent.to_string(),
                joined,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(shadow: &str, primary: &str, incoming: bool, outgoing: bool) -> ShadowBindPayload {
        ShadowBindPayload {
            shadow: shadow.into(),
            primary: primary.into(),
            receive_incoming: incoming,
            receive_outgoing: outgoing,
            speak_on: vec![],
        }
    }

    #[test]
    fn test_resolve_direct() {
        let mut r = Router::new();
        r.register("Bob", "s-bob");
        assert_eq!(r.resolve("Bob", "Alice").unwrap(), vec!["Bob"]);
        assert!(r.resolve("Nobody", "Alice").is_err());
    }

    #[test]
    fn test_resolve_broadcast_excludes_sender_and_dormant() {
        let mut r = Router::new();
        r.register("Alice", "s-a");
        r.register("Bob", "s-b");
        r.register("Carol", "s-c");
        r.set_live("Carol", false);

        let dests = r.resolve(BROADCAST, "Alice").unwrap();
        assert_eq!(dests, vec!["Bob"]);
    }

    #[test]
    fn test_resolve_broadcast_grows_with_registration() {
        let mut r = Router::new();
        r.register("Alice", "s-a");
        r.register("Bob", "s-b");
        let before = r.resolve(BROADCAST, "Alice").unwrap();

        r.register("Dave", "s-d");
        let after = r.resolve(BROADCAST, "Alice").unwrap();

        let mut expected = before.clone();
        expected.push("Dave".to_string());
        expected.sort();
        assert_eq!(after, expected);
    }

    #[test]
    fn test_channel_join_leave_and_sender_exclusion() {
        let mut r = Router::new();
        r.register("Alice", "s-a");
        r.register("Bob", "s-b");
        r.register("Carol", "s-c");
        r.join("Alice", "#team").unwrap();
        r.join("Bob", "#team").unwrap();

        // Sender exclusion: Carol sends, Alice and Bob receive.
        assert_eq!(r.resolve("#team", "Carol").unwrap(), vec!["Alice", "Bob"]);
        // A member sending is excluded from its own fan-out.
        assert_eq!(r.resolve("#team", "Alice").unwrap(), vec!["Bob"]);

        r.leave("Alice", "#team");
        assert_eq!(r.members("#team"), vec!["Bob"]);
        r.leave("Bob", "#team");
        assert!(r.members("#team").is_empty());
        assert!(r.channel_memberships().is_empty(), "empty channel deleted");
    }

    #[test]
    fn test_join_is_idempotent_and_validates_prefix() {
        let mut r = Router::new();
        r.join("Alice", "#team").unwrap();
        r.join("Alice", "#team").unwrap();
        assert_eq!(r.members("#team").len(), 1);
        assert!(r.join("Alice", "team").is_err());
    }

    #[test]
    fn test_topics_are_not_channels() {
        let mut r = Router::new();
        r.subscribe("s-1", "logs");
        r.subscribe("s-2", "logs");
        assert_eq!(r.subscribers("logs").len(), 2);

        r.unsubscribe("s-1", "logs");
        assert_eq!(r.subscribers("logs"), vec!["s-2"]);

        r.unsubscribe_all("s-2");
        assert!(r.subscribers("logs").is_empty());
    }

    #[test]
    fn test_shadow_bind_unbind() {
        let mut r = Router::new();
        let id = r.bind_shadow(&bind("Obs", "Alice", true, false)).unwrap();
        assert_eq!(r.shadows_of("Alice").len(), 1);

        assert!(r.unbind_shadow(&ShadowUnbindPayload {
            binding_id: Some(id),
            shadow: None,
            primary: None,
        }));
        assert!(r.shadows_of("Alice").is_empty());
    }

    #[test]
    fn test_shadow_unbind_by_pair() {
        let mut r = Router::new();
        r.bind_shadow(&bind("Obs", "Alice", true, true)).unwrap();
        assert!(r.unbind_shadow(&ShadowUnbindPayload {
            binding_id: None,
            shadow: Some("Obs".into()),
            primary: Some("Alice".into()),
        }));
        assert!(!r.unbind_shadow(&ShadowUnbindPayload::default()));
    }

    #[test]
    fn test_shadow_cannot_observe_itself() {
        let mut r = Router::new();
        assert!(r.bind_shadow(&bind("Alice", "Alice", true, true)).is_err());
    }

    #[test]
    fn test_shadow_cycle_is_allowed_and_explicit() {
        // A primary and its shadow may back-reference each other; both
        // edges exist independently and unbind independently.
        let mut r = Router::new();
        let ab = r.bind_shadow(&bind("A", "B", true, false)).unwrap();
        let ba = r.bind_shadow(&bind("B", "A", true, false)).unwrap();
        assert_eq!(r.shadows_of("A").len(), 1);
        assert_eq!(r.shadows_of("B").len(), 1);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_shadow_mirrors_directions() {
        let mut r = Router::new();
        r.register("Alice", "s-a");
        r.register("Bob", "s-b");
        r.register("Obs", "s-o");

        // Obs sees what Bob receives, not what Bob sends.
        r.bind_shadow(&bind("Obs", "Bob", true, false)).unwrap();

        let mirrors = r.shadow_mirrors("Alice", &["Bob".to_string()]);
        assert_eq!(mirrors, vec!["Obs"]);

        // Bob sending to Alice: no mirror (outgoing not granted).
        let mirrors = r.shadow_mirrors("Bob", &["Alice".to_string()]);
        assert!(mirrors.is_empty());
    }

    #[test]
    fn test_shadow_mirrors_deduplicated() {
        let mut r = Router::new();
        // Obs shadows both sides of the conversation.
        r.bind_shadow(&bind("Obs", "Alice", true, true)).unwrap();
        r.bind_shadow(&bind("Obs", "Bob", true, true)).unwrap();

        let mirrors = r.shadow_mirrors("Alice", &["Bob".to_string()]);
        assert_eq!(mirrors.len(), 1, "one mirror even with two bindings");
    }

    #[test]
    fn test_shadow_mirror_not_duplicated_into_destination() {
        let mut r = Router::new();
        r.bind_shadow(&bind("Obs", "Alice", true, true)).unwrap();
        // Obs is already an explicit destination — no extra mirror.
        let mirrors = r.shadow_mirrors("Alice", &["Obs".to_string()]);
        assert!(mirrors.is_empty());
    }

    #[test]
    fn test_membership_journal_replay() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let mut r = Router::with_state_dir(tmp.path()).unwrap();
            r.join("Alice", "#team").unwrap();
            r.join("Bob", "#team").unwrap();
            r.leave("Bob", "#team");
            r.join("Bob", "#ops").unwrap();
        }

        let r = Router::with_state_dir(tmp.path()).unwrap();
        assert_eq!(r.members("#team"), vec!["Alice"]);
        assert_eq!(r.members("#ops"), vec!["Bob"]);
        assert_eq!(r.channels_of("Bob"), vec!["#ops"]);
    }
}
