//! Delivery tracker (spec §4.4): the retry/TTL state machine behind
//! at-least-once delivery.
//!
//! The tracker holds only connection *ids*, never connection values (spec
//! §9 "cyclic references" design note) — on disconnect the owning
//! `Connection` unregisters itself from the registry and calls
//! `clear_for_connection`, which the router drives.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use relay_protocol::Envelope;

#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub envelope: Envelope,
    pub target_connection_id: String,
    pub recipient: String,
    pub session_id: String,
    /// Agent name that originated the SEND this DELIVER carries, so a
    /// terminal event (ack/failure) can be routed back to them (spec §4.7
    /// `sendAndWait` resolves on this; the tracker holds only the name, not
    /// a connection id, per §9's cyclic-reference note — the sender's
    /// current connection is resolved at notify time).
    pub sender: Option<String>,
    pub attempts: u32,
    pub first_attempt_at: Instant,
    pub next_deadline: Instant,
}

/// What the caller should do as a result of a tracker operation.
#[derive(Debug)]
pub enum TrackerEvent {
    /// Retransmit this exact envelope on `target_connection_id`.
    Retransmit { envelope: Envelope, target_connection_id: String },
    /// The delivery exceeded `max_attempts` or `delivery_ttl` — drop it and
    /// report `storage.updateMessageStatus(id, 'failed')` / `delivery-failed`.
    Failed {
        envelope_id: String,
        recipient: String,
        sender: Option<String>,
        correlation_id: Option<String>,
    },
}

#[derive(Debug)]
pub struct DeliveryTracker {
    ack_timeout: Duration,
    max_attempts: u32,
    delivery_ttl: Duration,
    pending: HashMap<String, PendingDelivery>,
    /// Entries displaced by a disconnect, scoped by session id, in original
    /// seq order, waiting for a successful resume (spec §4.4).
    awaiting_reconnect: HashMap<String, Vec<PendingDelivery>>,
}

impl DeliveryTracker {
    pub fn new(ack_timeout: Duration, max_attempts: u32, delivery_ttl: Duration) -> Self {
        Self {
            ack_timeout,
            max_attempts,
            delivery_ttl,
            pending: HashMap::new(),
            awaiting_reconnect: HashMap::new(),
        }
    }

    /// Register a freshly-sent DELIVER for retry tracking.
    pub fn track(
        &mut self,
        envelope: Envelope,
        target_connection_id: String,
        recipient: String,
        session_id: String,
        sender: Option<String>,
    ) {
        let now = Instant::now();
        let id = envelope.id.clone();
        self.pending.insert(
            id,
            PendingDelivery {
                envelope,
                target_connection_id,
                recipient,
                session_id,
                sender,
                attempts: 1,
                first_attempt_at: now,
                next_deadline: now + self.ack_timeout,
            },
        );
    }

    /// Handle an ACK. Only clears the entry if it came from the connection
    /// the tracker last targeted (spec §4.4, §3 invariants). Returns the
    /// cleared entry so the caller can notify the original sender (spec
    /// §4.7 `sendAndWait`).
    pub fn ack(&mut self, envelope_id: &str, from_connection_id: &str) -> Option<PendingDelivery> {
        match self.pending.get(envelope_id) {
            Some(entry) if entry.target_connection_id == from_connection_id => self.pending.remove(envelope_id),
            _ => None,
        }
    }

    /// Number of deliveries still in flight for a connection (spec §5
    /// backpressure: `max_inflight`).
    pub fn inflight_for_connection(&self, connection_id: &str) -> usize {
        self.pending
            .values()
            .filter(|p| p.target_connection_id == connection_id)
            .count()
    }

    /// Scan for due retries/TTL expiry. Call this on a periodic tick.
    pub fn tick(&mut self) -> Vec<TrackerEvent> {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut to_remove = Vec::new();

        for (id, entry) in self.pending.iter_mut() {
            if now < entry.next_deadline {
                continue;
            }
            let expired_ttl = now.duration_since(entry.first_attempt_at) >= self.delivery_ttl;
            let exhausted = entry.attempts >= self.max_attempts;
            if expired_ttl || exhausted {
                let correlation_id = entry
                    .envelope
                    .payload_meta
                    .as_ref()
                    .and_then(|m| m.sync.as_ref())
                    .map(|s| s.correlation_id.clone());
                events.push(TrackerEvent::Failed {
                    envelope_id: id.clone(),
                    recipient: entry.recipient.clone(),
                    sender: entry.sender.clone(),
                    correlation_id,
                });
                to_remove.push(id.clone());
            } else {
                entry.attempts += 1;
                entry.next_deadline = now + self.ack_timeout;
                events.push(TrackerEvent::Retransmit {
                    envelope: entry.envelope.clone(),
                    target_connection_id: entry.target_connection_id.clone(),
                });
            }
        }

        for id in to_remove {
            self.pending.remove(&id);
        }

        events
    }

    /// Move all entries targeting `connection_id` into the awaiting-reconnect
    /// list for their session (spec §4.4).
    pub fn clear_for_connection(&mut self, connection_id: &str) {
        let mut moved: Vec<(String, PendingDelivery)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.target_connection_id == connection_id)
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();
        moved.sort_by_key(|(_, p)| p.envelope.delivery.as_ref().map(|d| d.seq).unwrap_or(0));

        for (id, entry) in moved {
            self.pending.remove(&id);
            self.awaiting_reconnect
                .entry(entry.session_id.clone())
                .or_default()
                .push(entry);
        }
    }

    /// On successful resume, return the pending deliveries for this session
    /// in original seq order and re-arm them against the new connection.
    pub fn replay_pending(&mut self, session_id: &str, new_connection_id: &str) -> Vec<Envelope> {
        let Some(mut entries) = self.awaiting_reconnect.remove(session_id) else {
            return Vec::new();
        };
        entries.sort_by_key(|p| p.envelope.delivery.as_ref().map(|d| d.seq).unwrap_or(0));

        let mut envelopes = Vec::with_capacity(entries.len());
        let now = Instant::now();
        for mut entry in entries {
            entry.target_connection_id = new_connection_id.to_string();
            entry.next_deadline = now + self.ack_timeout;
            envelopes.push(entry.envelope.clone());
            self.pending.insert(entry.envelope.id.clone(), entry);
        }
        envelopes
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{DeliveryInfo, Envelope, EnvelopeType, SendPayload};

    fn deliver(seq: u64) -> Envelope {
        Envelope::new(EnvelopeType::Deliver, SendPayload::message("hi"))
            .with_from("Alice")
            .with_to("Bob")
            .with_delivery(DeliveryInfo {
                seq,
                session_id: "sess-1".into(),
                original_to: "Bob".into(),
                original_type: EnvelopeType::Send,
            })
    }

    #[test]
    fn ack_from_wrong_connection_is_ignored() {
        let mut tracker = DeliveryTracker::new(Duration::from_secs(10), 3, Duration::from_secs(60));
        let env = deliver(1);
        let id = env.id.clone();
        tracker.track(env, "conn-1".into(), "Bob".into(), "sess-1".into(), Some("Alice".into()));
        assert!(tracker.ack(&id, "conn-2").is_none());
        assert!(tracker.ack(&id, "conn-1").is_some());
    }

    #[test]
    fn tick_retransmits_then_fails_after_max_attempts() {
        let mut tracker = DeliveryTracker::new(Duration::from_millis(0), 2, Duration::from_secs(60));
        let env = deliver(1);
        tracker.track(env, "conn-1".into(), "Bob".into(), "sess-1".into(), Some("Alice".into()));

        std::thread::sleep(Duration::from_millis(5));
        let events = tracker.tick();
        assert!(matches!(events.as_slice(), [TrackerEvent::Retransmit { .. }]));

        std::thread::sleep(Duration::from_millis(5));
        let events = tracker.tick();
        assert!(matches!(events.as_slice(), [TrackerEvent::Failed { .. }]));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn clear_and_replay_preserves_seq_order() {
        let mut tracker = DeliveryTracker::new(Duration::from_secs(10), 3, Duration::from_secs(60));
        tracker.track(deliver(2), "conn-1".into(), "Bob".into(), "sess-1".into(), Some("Alice".into()));
        tracker.track(deliver(1), "conn-1".into(), "Bob".into(), "sess-1".into(), Some("Alice".into()));
        tracker.track(deliver(3), "conn-1".into(), "Bob".into(), "sess-1".into(), Some("Alice".into()));

        tracker.clear_for_connection("conn-1");
        assert_eq!(tracker.pending_count(), 0);

        let replayed = tracker.replay_pending("sess-1", "conn-2");
        let seqs: Vec<u64> = replayed
            .iter()
            .map(|e| e.delivery.as_ref().unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(tracker.pending_count(), 3);
    }

    #[test]
    fn ttl_drops_even_under_max_attempts() {
        let mut tracker = DeliveryTracker::new(Duration::from_millis(0), 100, Duration::from_millis(1));
        tracker.track(deliver(1), "conn-1".into(), "Bob".into(), "sess-1".into(), Some("Alice".into()));
        std::thread::sleep(Duration::from_millis(5));
        let events = tracker.tick();
        assert!(matches!(events.as_slice(), [TrackerEvent::Failed { .. }]));
    }
}
