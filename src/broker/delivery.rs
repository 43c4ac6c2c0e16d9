//! At-least-once delivery engine.
//!
//! One FIFO outbound queue per destination. Deliveries move
//! `queued → inflight → (acked | expired | failed)`; the broker drains
//! sendable deliveries onto the destination connection and feeds ACKs
//! back in. Unacknowledged deliveries are retransmitted on a periodic
//! scan with exponential backoff and jitter until the attempt cap or the
//! message TTL, whichever triggers first.
//!
//! Dormant destinations keep their queue (nothing is sendable) until the
//! session resumes or deliveries expire; queue overflow drops
//! oldest-first and reports the casualties so the broker can notify
//! senders.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::constants::{MAX_DELIVERY_ATTEMPTS, RETRY_BASE, RETRY_CAP, RETRY_JITTER};
use crate::protocol::envelope::Envelope;

/// Why a delivery left the engine without an ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Retry attempts exhausted.
    AckTimeout,
    /// Message TTL elapsed.
    TtlExpired,
    /// Destination queue overflowed; oldest dropped first.
    Overflow,
    /// Destination session was destroyed.
    SessionGone,
    /// Destination rejected the delivery with NACK.
    Rejected,
}

/// A delivery that reached a non-acked terminal state.
#[derive(Debug)]
pub struct DroppedDelivery {
    /// Original message id.
    pub msg_id: String,
    /// Destination agent name.
    pub dest: String,
    /// Sender to notify, when known.
    pub sender: Option<String>,
    /// Why it was dropped.
    pub reason: DropReason,
}

/// One (message, destination) delivery unit.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    /// Fully prepared DELIVER envelope (delivery block already stamped).
    pub envelope: Envelope,
    /// Destination agent name.
    pub dest: String,
    /// Transmission attempts so far.
    pub attempts: u32,
    /// Next retransmission deadline.
    pub next_retry: Instant,
    /// Absolute TTL deadline.
    pub expires_at: Instant,
}

impl PendingDelivery {
    /// New delivery unit; `ttl` is taken from the envelope's meta.
    pub fn new(envelope: Envelope, dest: impl Into<String>, now: Instant) -> Self {
        let ttl = envelope.ttl();
        Self {
            envelope,
            dest: dest.into(),
            attempts: 0,
            next_retry: now,
            expires_at: now + ttl,
        }
    }

    fn msg_id(&self) -> &str {
        &self.envelope.id
    }

    fn sender(&self) -> Option<String> {
        self.envelope.from.clone()
    }
}

#[derive(Debug, Default)]
struct DestQueue {
    /// FIFO of not-yet-transmitted deliveries.
    queued: VecDeque<PendingDelivery>,
    /// Transmitted, awaiting ACK; keyed by message id.
    inflight: HashMap<String, PendingDelivery>,
    /// Whether the destination can receive right now.
    online: bool,
}

impl DestQueue {
    fn depth(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

/// The delivery engine: per-destination queues plus retry state.
#[derive(Debug)]
pub struct DeliveryEngine {
    queues: HashMap<String, DestQueue>,
    max_queue_depth: usize,
}

impl DeliveryEngine {
    /// Engine with the given per-destination queue bound.
    pub fn new(max_queue_depth: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_queue_depth,
        }
    }

    /// Enqueue a delivery for a destination.
    ///
    /// Returns deliveries dropped oldest-first to make room (the broker
    /// reports each to its sender with `QUEUE_OVERFLOW`).
    pub fn enqueue(&mut self, delivery: PendingDelivery) -> Vec<DroppedDelivery> {
        let queue = self.queues.entry(delivery.dest.clone()).or_default();
        let mut dropped = Vec::new();

        while queue.depth() >= self.max_queue_depth {
            match queue.queued.pop_front() {
                Some(old) => {
                    log::warn!(
                        "[Delivery] queue overflow for '{}': dropping {}",
                        old.dest,
                        old.msg_id()
                    );
                    dropped.push(DroppedDelivery {
                        msg_id: old.msg_id().to_string(),
                        dest: old.dest.clone(),
                        sender: old.sender(),
                        reason: DropReason::Overflow,
                    });
                }
                // Everything is inflight; nothing droppable from the
                // queue head. Drop the new delivery instead.
                None => {
                    dropped.push(DroppedDelivery {
                        msg_id: delivery.msg_id().to_string(),
                        dest: delivery.dest.clone(),
                        sender: delivery.sender(),
                        reason: DropReason::Overflow,
                    });
                    return dropped;
                }
            }
        }

        queue.queued.push_back(delivery);
        dropped
    }

    /// Mark a destination online (session live) or offline (dormant).
    pub fn set_online(&mut self, dest: &str, online: bool) {
        self.queues.entry(dest.to_string()).or_default().online = online;
    }

    /// Drain sendable deliveries for one destination, in FIFO order.
    ///
    /// Each drained delivery moves to inflight with its first retry
    /// deadline armed; the caller writes the returned envelopes to the
    /// destination connection in order.
    pub fn take_sendable(&mut self, dest: &str, now: Instant) -> Vec<Envelope> {
        let Some(queue) = self.queues.get_mut(dest) else {
            return Vec::new();
        };
        if !queue.online {
            return Vec::new();
        }

        let mut out = Vec::new();
        while let Some(mut delivery) = queue.queued.pop_front() {
            delivery.attempts = 1;
            delivery.next_retry = now + retry_timeout(1);
            out.push(delivery.envelope.clone());
            queue
                .inflight
                .insert(delivery.msg_id().to_string(), delivery);
        }
        out
    }

    /// Process an ACK from a destination. Returns true when it matched
    /// an inflight delivery (idempotent: duplicates return false).
    pub fn on_ack(&mut self, dest: &str, msg_id: &str) -> bool {
        self.queues
            .get_mut(dest)
            .and_then(|q| q.inflight.remove(msg_id))
            .is_some()
    }

    /// Process a NACK: the delivery is terminally failed.
    pub fn on_nack(&mut self, dest: &str, msg_id: &str) -> Option<DroppedDelivery> {
        let delivery = self
            .queues
            .get_mut(dest)
            .and_then(|q| q.inflight.remove(msg_id))?;
        Some(DroppedDelivery {
            msg_id: delivery.msg_id().to_string(),
            dest: delivery.dest.clone(),
            sender: delivery.sender(),
            reason: DropReason::Rejected,
        })
    }

    /// Periodic scan: collect retransmissions that are due and expire
    /// deliveries past their attempt cap or TTL.
    ///
    /// Queued (never-transmitted) deliveries also expire on TTL so a
    /// dormant destination cannot pin messages forever.
    pub fn sweep(&mut self, now: Instant) -> (Vec<(String, Envelope)>, Vec<DroppedDelivery>) {
        let mut retransmits = Vec::new();
        let mut dropped = Vec::new();

        for (dest, queue) in &mut self.queues {
            // TTL pass over the untransmitted queue.
            let before = queue.queued.len();
            queue.queued.retain(|d| {
                if now >= d.expires_at {
                    dropped.push(DroppedDelivery {
                        msg_id: d.msg_id().to_string(),
                        dest: d.dest.clone(),
                        sender: d.sender(),
                        reason: DropReason::TtlExpired,
                    });
                    false
                } else {
                    true
                }
            });
            if queue.queued.len() != before {
                log::debug!(
                    "[Delivery] expired {} queued delivery(ies) for '{dest}'",
                    before - queue.queued.len()
                );
            }

            // Retry pass over inflight.
            let mut exhausted: Vec<String> = Vec::new();
            for (msg_id, delivery) in &mut queue.inflight {
                if now >= delivery.expires_at {
                    dropped.push(DroppedDelivery {
                        msg_id: msg_id.clone(),
                        dest: delivery.dest.clone(),
                        sender: delivery.sender(),
                        reason: DropReason::TtlExpired,
                    });
                    exhausted.push(msg_id.clone());
                    continue;
                }
                if delivery.attempts >= MAX_DELIVERY_ATTEMPTS {
                    dropped.push(DroppedDelivery {
                        msg_id: msg_id.clone(),
                        dest: delivery.dest.clone(),
                        sender: delivery.sender(),
                        reason: DropReason::AckTimeout,
                    });
                    exhausted.push(msg_id.clone());
                    continue;
                }
                if queue.online && now >= delivery.next_retry {
                    delivery.attempts += 1;
                    delivery.next_retry = now + retry_timeout(delivery.attempts);
                    retransmits.push((dest.clone(), delivery.envelope.clone()));
                }
            }
            for msg_id in exhausted {
                queue.inflight.remove(&msg_id);
            }
        }

        (retransmits, dropped)
    }

    /// Destination session destroyed: everything pending is dropped.
    pub fn drop_dest(&mut self, dest: &str) -> Vec<DroppedDelivery> {
        let Some(queue) = self.queues.remove(dest) else {
            return Vec::new();
        };
        queue
            .queued
            .into_iter()
            .chain(queue.inflight.into_values())
            .map(|d| DroppedDelivery {
                msg_id: d.msg_id().to_string(),
                dest: d.dest.clone(),
                sender: d.sender(),
                reason: DropReason::SessionGone,
            })
            .collect()
    }

    /// Current depth (queued + inflight) for a destination.
    pub fn depth(&self, dest: &str) -> usize {
        self.queues.get(dest).map_or(0, DestQueue::depth)
    }
}

/// Backoff for the Nth attempt: `base · 2^(n-1)` capped, with ±15%
/// jitter so a burst of retries does not synchronize.
fn retry_timeout(attempts: u32) -> Duration {
    let base_ms = RETRY_BASE.as_millis() as f64;
    let backoff = base_ms * 2f64.powi(attempts.saturating_sub(1) as i32);
    let capped = backoff.min(RETRY_CAP.as_millis() as f64);
    let jitter = rand::rng().random_range(-RETRY_JITTER..=RETRY_JITTER);
    Duration::from_millis((capped * (1.0 + jitter)) as u64)
}
