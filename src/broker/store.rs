//! Append-only message store.
//!
//! Every accepted SEND is recorded with its derived route and a
//! per-destination delivery state. The store is memory-bounded by record
//! count and age; eviction removes terminal records oldest-first and
//! never touches a record with an undelivered destination. When the
//! store is saturated with non-terminal records, new SENDs are refused
//! and the broker answers BUSY until the backlog drains.
//!
//! With a state directory, accepted records and terminal transitions are
//! appended to `messages.jsonl`; on restart the non-terminal remainder
//! is reloaded so deliveries to resumable sessions can be re-queued.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::envelope::{now_ms, Envelope};

use super::session::append_jsonl;

/// Per-destination delivery progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Waiting in the destination queue.
    Queued,
    /// On the wire, awaiting ACK.
    Inflight,
    /// Acknowledged by the destination.
    Acked,
    /// Retries or TTL exhausted.
    Expired,
    /// NACKed or dropped.
    Failed,
}

impl DeliveryState {
    /// Terminal states are never retried and are eligible for eviction.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::Expired | Self::Failed)
    }
}

/// One accepted SEND and its delivery progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// The original envelope as accepted.
    pub envelope: Envelope,
    /// When the broker accepted it (ms since epoch).
    pub accepted_ts: i64,
    /// Resolved destination agent names.
    pub route: Vec<String>,
    /// Per-destination state.
    pub states: HashMap<String, DeliveryState>,
    /// Per-destination attempt counters.
    pub attempts: HashMap<String, u32>,
}

impl MessageRecord {
    /// True once every destination reached a terminal state.
    pub fn is_fully_delivered(&self) -> bool {
        self.route
            .iter()
            .all(|d| self.states.get(d).is_some_and(|s| s.is_terminal()))
    }
}

/// History query parameters.
#[derive(Debug, Default, Clone)]
pub struct HistoryFilter {
    /// Restrict to this sender.
    pub from: Option<String>,
    /// Restrict to records routed to this destination.
    pub to: Option<String>,
    /// Only records accepted at or after this timestamp.
    pub since_ts: Option<i64>,
    /// Maximum records returned (newest last).
    pub limit: Option<usize>,
}

/// Journal line kinds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JournalEntry {
    Accepted {
        id: String,
        envelope: Envelope,
        route: Vec<String>,
        ts: i64,
    },
    Mark {
        id: String,
        dest: String,
        state: DeliveryState,
    },
    ChannelSnapshot {
        channels: HashMap<String, Vec<String>>,
        ts: i64,
    },
}

/// The message store.
#[derive(Debug)]
pub struct MessageStore {
    records: HashMap<String, MessageRecord>,
    /// Insertion order for oldest-first eviction.
    order: VecDeque<String>,
    max_records: usize,
    max_age: Duration,
    journal_path: Option<PathBuf>,
}

impl MessageStore {
    /// In-memory store with the given bounds.
    pub fn new(max_records: usize, max_age: Duration) -> Self {
        Self {
            records: HashMap::new(),
            order: VecDeque::new(),
            max_records,
            max_age,
            journal_path: None,
        }
    }

    /// Store with a durable log under `state_dir`, replayed on
    /// construction. Only records with at least one non-terminal
    /// destination are kept in memory after replay.
    pub fn with_state_dir(
        max_records: usize,
        max_age: Duration,
        state_dir: &Path,
    ) -> Result<Self> {
        let path = state_dir.join("messages.jsonl");
        let mut store = Self::new(max_records, max_age);
        store.journal_path = Some(path.clone());

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("read message journal: {}", path.display()))?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<JournalEntry>(line) {
                    Ok(JournalEntry::Accepted {
                        id,
                        envelope,
                        route,
                        ts,
                    }) => {
                        let states = route
                            .iter()
                            .map(|d| (d.clone(), DeliveryState::Queued))
                            .collect();
                        store.order.push_back(id.clone());
                        store.records.insert(
                            id,
                            MessageRecord {
                                envelope,
                                accepted_ts: ts,
                                route,
                                states,
                                attempts: HashMap::new(),
                            },
                        );
                    }
                    Ok(JournalEntry::Mark { id, dest, state }) => {
                        if let Some(rec) = store.records.get_mut(&id) {
                            rec.states.insert(dest, state);
                        }
                    }
                    Ok(JournalEntry::ChannelSnapshot { .. }) => {}
                    Err(e) => log::warn!("[Store] skipping bad journal line: {e}"),
                }
            }
            // Drop fully-delivered records; they were only replayed to
            // apply their marks.
            let done: Vec<String> = store
                .records
                .iter()
                .filter(|(_, r)| r.is_fully_delivered())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &done {
                store.records.remove(id);
            }
            store.order.retain(|id| store.records.contains_key(id));
            if !store.records.is_empty() {
                log::info!(
                    "[Store] restored {} undelivered record(s) from journal",
                    store.records.len()
                );
            }
        }

        Ok(store)
    }

    /// Record an accepted SEND with its resolved route.
    ///
    /// # Errors
    ///
    /// Fails when the store is saturated: at capacity with nothing
    /// terminal to evict. The broker answers BUSY in that case.
    pub fn record(&mut self, envelope: Envelope, route: Vec<String>) -> Result<()> {
        if self.records.len() >= self.max_records {
            self.evict(now_ms());
        }
        if self.records.len() >= self.max_records {
            // Make room for the incoming record: terminal oldest-first.
            let overflow = self.records.len() + 1 - self.max_records;
            let victims: Vec<String> = self
                .order
                .iter()
                .filter(|id| {
                    self.records
                        .get(*id)
                        .is_some_and(MessageRecord::is_fully_delivered)
                })
                .take(overflow)
                .cloned()
                .collect();
            for id in &victims {
                self.records.remove(id);
            }
            if !victims.is_empty() {
                self.order.retain(|id| self.records.contains_key(id));
            }
            if self.records.len() >= self.max_records {
                bail!("message store saturated with undelivered records");
            }
        }

        let id = envelope.id.clone();
        let states = route
            .iter()
            .map(|d| (d.clone(), DeliveryState::Queued))
            .collect();
        let accepted_ts = now_ms();

        if let Some(path) = &self.journal_path {
            append_jsonl(
                path,
                &JournalEntry::Accepted {
                    id: id.clone(),
                    envelope: envelope.clone(),
                    route: route.clone(),
                    ts: accepted_ts,
                },
            );
        }

        self.order.push_back(id.clone());
        self.records.insert(
            id,
            MessageRecord {
                envelope,
                accepted_ts,
                route,
                states,
                attempts: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Transition one destination of a message to a new state.
    ///
    /// Terminal states stick: a destination that already reached one is
    /// never moved again (exactly one terminal state per destination).
    pub fn mark(&mut self, msg_id: &str, dest: &str, state: DeliveryState) {
        let Some(record) = self.records.get_mut(msg_id) else {
            return;
        };
        if record
            .states
            .get(dest)
            .is_some_and(|s| s.is_terminal())
        {
            return;
        }
        record.states.insert(dest.to_string(), state);
        if state.is_terminal() {
            if let Some(path) = &self.journal_path {
                append_jsonl(
                    path,
                    &JournalEntry::Mark {
                        id: msg_id.to_string(),
                        dest: dest.to_string(),
                        state,
                    },
                );
            }
        }
    }

    /// Bump the attempt counter for one destination.
    pub fn bump_attempts(&mut self, msg_id: &str, dest: &str) {
        if let Some(record) = self.records.get_mut(msg_id) {
            *record.attempts.entry(dest.to_string()).or_insert(0) += 1;
        }
    }

    /// Record by message id.
    pub fn lookup(&self, msg_id: &str) -> Option<&MessageRecord> {
        self.records.get(msg_id)
    }

    /// Query records, oldest first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<&MessageRecord> {
        let mut out: Vec<&MessageRecord> = self
            .order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| {
                filter
                    .from
                    .as_ref()
                    .map_or(true, |f| r.envelope.from.as_deref() == Some(f.as_str()))
            })
            .filter(|r| {
                filter
                    .to
                    .as_ref()
                    .map_or(true, |t| r.route.iter().any(|d| d == t))
            })
            .filter(|r| filter.since_ts.map_or(true, |ts| r.accepted_ts >= ts))
            .collect();
        if let Some(limit) = filter.limit {
            let skip = out.len().saturating_sub(limit);
            out.drain(..skip);
        }
        out
    }

    /// Evict terminal records: anything older than `max_age`, then
    /// oldest-first down to the record cap. Non-terminal records are
    /// never evicted.
    pub fn evict(&mut self, now: i64) {
        let cutoff = now - self.max_age.as_millis() as i64;
        let mut evicted = 0usize;

        // Age pass.
        let stale: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.records.get(*id).is_some_and(|r| {
                    r.accepted_ts < cutoff && r.is_fully_delivered()
                })
            })
            .cloned()
            .collect();
        for id in stale {
            self.records.remove(&id);
            evicted += 1;
        }

        // Count pass.
        if self.records.len() > self.max_records {
            let mut excess = self.records.len() - self.max_records;
            let candidates: Vec<String> = self
                .order
                .iter()
                .filter(|id| {
                    self.records
                        .get(*id)
                        .is_some_and(MessageRecord::is_fully_delivered)
                })
                .cloned()
                .collect();
            for id in candidates {
                if excess == 0 {
                    break;
                }
                self.records.remove(&id);
                excess -= 1;
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.order.retain(|id| self.records.contains_key(id));
            log::debug!("[Store] evicted {evicted} terminal record(s)");
        }
    }

    /// Journal a snapshot of current channel memberships (diagnostics;
    /// authoritative replay lives in the router's own journal).
    pub fn snapshot_channel_memberships(&self, channels: HashMap<String, Vec<String>>) {
        if let Some(path) = &self.journal_path {
            append_jsonl(
                path,
                &JournalEntry::ChannelSnapshot {
                    channels,
                    ts: now_ms(),
                },
            );
        }
    }

    /// All (envelope, destination) pairs still awaiting delivery — used
    /// after a restart to re-queue work for resumable sessions.
    pub fn pending_deliveries(&self) -> Vec<(Envelope, String)> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .flat_map(|r| {
                r.route
                    .iter()
                    .filter(|d| {
                        !r.states.get(*d).is_some_and(|s| s.is_terminal())
                    })
                    .map(|d| (r.envelope.clone(), d.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no records are held.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{Body, MessagePayload};

    fn send(id: &str, from: &str, to: &str) -> Envelope {
        Envelope::new(Body::Send(MessagePayload::chat("hi")))
            .with_id(id)
            .with_from(from)
            .with_to(to)
    }

    fn store() -> MessageStore {
        MessageStore::new(100, Duration::from_secs(3600))
    }

    #[test]
    fn test_record_and_mark_terminal_once() {
        let mut s = store();
        s.record(send("m1", "A", "B"), vec!["B".into()]).unwrap();
        assert_eq!(
            s.lookup("m1").unwrap().states["B"],
            DeliveryState::Queued
        );

        s.mark("m1", "B", DeliveryState::Inflight);
        s.mark("m1", "B", DeliveryState::Acked);
        // Terminal states stick.
        s.mark("m1", "B", DeliveryState::Failed);
        assert_eq!(s.lookup("m1").unwrap().states["B"], DeliveryState::Acked);
        assert!(s.lookup("m1").unwrap().is_fully_delivered());
    }

    #[test]
    fn test_broadcast_accounting() {
        let mut s = store();
        s.record(send("m1", "A", "*"), vec!["B".into(), "C".into()])
            .unwrap();

        s.mark("m1", "B", DeliveryState::Acked);
        assert!(!s.lookup("m1").unwrap().is_fully_delivered());

        s.mark("m1", "C", DeliveryState::Expired);
        assert!(s.lookup("m1").unwrap().is_fully_delivered());
    }

    #[test]
    fn test_eviction_spares_non_terminal() {
        let mut s = MessageStore::new(2, Duration::from_secs(3600));
        s.record(send("m1", "A", "B"), vec!["B".into()]).unwrap();
        s.mark("m1", "B", DeliveryState::Acked);
        s.record(send("m2", "A", "B"), vec!["B".into()]).unwrap();

        // At capacity; m1 is terminal and gets evicted for m3.
        s.record(send("m3", "A", "B"), vec!["B".into()]).unwrap();
        assert!(s.lookup("m1").is_none());
        assert!(s.lookup("m2").is_some());
        assert!(s.lookup("m3").is_some());
    }

    #[test]
    fn test_saturation_rejects_new_sends() {
        let mut s = MessageStore::new(2, Duration::from_secs(3600));
        s.record(send("m1", "A", "B"), vec!["B".into()]).unwrap();
        s.record(send("m2", "A", "B"), vec!["B".into()]).unwrap();

        // Nothing terminal: the third record is refused.
        assert!(s.record(send("m3", "A", "B"), vec!["B".into()]).is_err());

        // Drain one and retry.
        s.mark("m1", "B", DeliveryState::Acked);
        assert!(s.record(send("m3", "A", "B"), vec!["B".into()]).is_ok());
    }

    #[test]
    fn test_history_filters() {
        let mut s = store();
        s.record(send("m1", "A", "B"), vec!["B".into()]).unwrap();
        s.record(send("m2", "A", "C"), vec!["C".into()]).unwrap();
        s.record(send("m3", "X", "B"), vec!["B".into()]).unwrap();

        let from_a = s.history(&HistoryFilter {
            from: Some("A".into()),
            ..Default::default()
        });
        assert_eq!(from_a.len(), 2);

        let to_b = s.history(&HistoryFilter {
            to: Some("B".into()),
            ..Default::default()
        });
        assert_eq!(to_b.len(), 2);

        let limited = s.history(&HistoryFilter {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].envelope.id, "m3", "limit keeps newest");
    }

    #[test]
    fn test_journal_replay_keeps_undelivered_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let mut s =
                MessageStore::with_state_dir(100, Duration::from_secs(3600), tmp.path())
                    .unwrap();
            s.record(send("done", "A", "B"), vec!["B".into()]).unwrap();
            s.mark("done", "B", DeliveryState::Acked);
            s.record(send("pending", "A", "B"), vec!["B".into()])
                .unwrap();
        }

        let s = MessageStore::with_state_dir(100, Duration::from_secs(3600), tmp.path())
            .unwrap();
        assert!(s.lookup("done").is_none());
        assert!(s.lookup("pending").is_some());

        let pending = s.pending_deliveries();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0.id, "pending");
        assert_eq!(pending[0].1, "B");
    }
}
