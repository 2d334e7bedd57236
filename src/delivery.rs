//! Ordered, deduplicated delivery over an at-least-once transport.
//!
//! A stream converts out-of-order, possibly duplicated arrivals into a strict
//! in-order sequence. `receive` is the sole ingress and returns the batch of
//! messages that became deliverable; protocol signals (duplicate, late, gap,
//! retransmission request, overflow, ack lifecycle) go to the event bus.
//! Ack deadlines are tokio timers, so streams must be driven inside a runtime.

use crate::error::ConfigError;
use crate::events::{DeliveryEvent, EventBus, RuntimeEvent};
use lru::LruCache;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A transport message addressed to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opaque, globally unique id; the dedup key.
    pub id: String,
    /// Strictly increasing per stream.
    pub seq: u64,
    /// Application routing tag; opaque to the stream.
    pub kind: String,
    pub payload: Vec<u8>,
    pub timestamp_millis: u64,
    pub requires_ack: bool,
}

impl Message {
    pub fn new(id: impl Into<String>, seq: u64) -> Self {
        Self {
            id: id.into(),
            seq,
            kind: String::new(),
            payload: Vec::new(),
            timestamp_millis: 0,
            requires_ack: false,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }
}

/// Per-stream tuning; validated at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Reorder buffer capacity; arrivals beyond it are shed newest-first.
    pub reorder_capacity: usize,
    /// Dedup window size. Ids older than this window may be re-delivered.
    pub seen_capacity: usize,
    /// Deadline for the peer's acknowledgment of an ack-requiring message.
    pub ack_timeout: Duration,
    /// First sequence number of the stream.
    pub base_seq: u64,
}

impl DeliveryConfig {
    pub fn new(reorder_capacity: usize) -> Self {
        Self {
            reorder_capacity,
            seen_capacity: reorder_capacity.saturating_mul(4).max(1),
            ack_timeout: Duration::from_secs(30),
            base_seq: 1,
        }
    }

    pub fn with_seen_capacity(mut self, capacity: usize) -> Self {
        self.seen_capacity = capacity;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_base_seq(mut self, base: u64) -> Self {
        self.base_seq = base;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reorder_capacity == 0 {
            return Err(ConfigError::ZeroCapacity { field: "reorder_capacity" });
        }
        if self.seen_capacity == 0 {
            return Err(ConfigError::ZeroCapacity { field: "seen_capacity" });
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "ack_timeout" });
        }
        Ok(())
    }
}

/// Counters exposed for dashboards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub next_expected: u64,
    pub buffered: usize,
    pub missing: usize,
    pub pending_acks: usize,
    pub delivered_total: u64,
    pub duplicates_total: u64,
}

struct StreamState {
    next_expected: u64,
    reorder: BTreeMap<u64, Message>,
    seen: LruCache<String, ()>,
    missing: BTreeSet<u64>,
    pending_acks: HashMap<String, tokio::task::JoinHandle<()>>,
    delivered_total: u64,
    duplicates_total: u64,
}

struct StreamInner {
    name: String,
    config: DeliveryConfig,
    state: Mutex<StreamState>,
    bus: EventBus,
    cancel: CancellationToken,
}

/// Builder for a [`DeliveryStream`].
pub struct DeliveryStreamBuilder {
    name: String,
    config: DeliveryConfig,
    bus: EventBus,
    cancel: CancellationToken,
}

impl DeliveryStreamBuilder {
    /// Publish stream events on the given bus.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Tie ack timers to an external cancellation tree.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<DeliveryStream, ConfigError> {
        self.config.validate()?;
        let seen_capacity = NonZeroUsize::new(self.config.seen_capacity)
            .ok_or(ConfigError::ZeroCapacity { field: "seen_capacity" })?;
        Ok(DeliveryStream {
            inner: Arc::new(StreamInner {
                name: self.name,
                state: Mutex::new(StreamState {
                    next_expected: self.config.base_seq,
                    reorder: BTreeMap::new(),
                    seen: LruCache::new(seen_capacity),
                    missing: BTreeSet::new(),
                    pending_acks: HashMap::new(),
                    delivered_total: 0,
                    duplicates_total: 0,
                }),
                config: self.config,
                bus: self.bus,
                cancel: self.cancel,
            }),
        })
    }
}

/// One inbound ordered stream.
///
/// Clones share the same state; per-stream mutation is serialized behind one
/// mutex, and the lock is never held while events are published or timers run.
#[derive(Clone)]
pub struct DeliveryStream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for DeliveryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStream")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl DeliveryStream {
    pub fn builder(name: impl Into<String>, config: DeliveryConfig) -> DeliveryStreamBuilder {
        DeliveryStreamBuilder {
            name: name.into(),
            config,
            bus: EventBus::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn new(name: impl Into<String>, config: DeliveryConfig) -> Result<Self, ConfigError> {
        Self::builder(name, config).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    /// Sole ingress: accept a transport message.
    ///
    /// Returns the messages that became deliverable, in strict seq order.
    pub fn receive(&self, message: Message) -> Vec<Message> {
        let msg_id = message.id.clone();
        let msg_seq = message.seq;
        let wants_ack = message.requires_ack;

        let mut events = Vec::new();
        let mut delivered = Vec::new();

        {
            let mut state = self.inner.state.lock().unwrap();

            if state.seen.get(&msg_id).is_some() {
                state.duplicates_total += 1;
                events.push(DeliveryEvent::Duplicate { id: msg_id });
                drop(state);
                self.publish(events);
                return delivered;
            }
            state.seen.put(msg_id.clone(), ());

            // Whether this call accepted the message (vs shedding it on overflow).
            let mut accepted = true;

            if msg_seq == state.next_expected {
                state.missing.remove(&msg_seq);
                state.next_expected = msg_seq + 1;
                events.push(DeliveryEvent::Delivered { seq: msg_seq, id: msg_id.clone() });
                delivered.push(message);

                // Drain the run of consecutive buffered successors.
                loop {
                    let cursor = state.next_expected;
                    let Some(next) = state.reorder.remove(&cursor) else { break };
                    state.next_expected = next.seq + 1;
                    events.push(DeliveryEvent::Delivered { seq: next.seq, id: next.id.clone() });
                    delivered.push(next);
                }
                state.delivered_total += delivered.len() as u64;
            } else if msg_seq > state.next_expected {
                if state.reorder.len() >= self.inner.config.reorder_capacity {
                    // Drop newest on full, so the low end of the gap stays fillable.
                    let highest = *state.reorder.keys().next_back().expect("buffer non-empty");
                    let (shed_seq, shed_id) = if msg_seq >= highest {
                        accepted = false;
                        (msg_seq, msg_id.clone())
                    } else {
                        let (evicted_seq, evicted) =
                            state.reorder.pop_last().expect("buffer non-empty");
                        (evicted_seq, evicted.id)
                    };
                    // Forget the shed id and reopen the gap so a retransmission
                    // is not suppressed as a duplicate later.
                    state.seen.pop(&shed_id);
                    events.push(DeliveryEvent::BufferOverflow { seq: shed_seq });
                    if state.missing.insert(shed_seq) {
                        events.push(DeliveryEvent::RetransmissionRequested { seq: shed_seq });
                    }
                    tracing::warn!(
                        stream = %self.inner.name,
                        seq = shed_seq,
                        capacity = self.inner.config.reorder_capacity,
                        "reorder buffer overflow"
                    );
                }

                if accepted {
                    state.missing.remove(&msg_seq);
                    state.reorder.insert(msg_seq, message);
                    events.push(DeliveryEvent::Buffered { seq: msg_seq });
                }

                // Every seq in the gap below this arrival is now known missing.
                for s in state.next_expected..msg_seq {
                    if !state.missing.contains(&s) && !state.reorder.contains_key(&s) {
                        state.missing.insert(s);
                        events.push(DeliveryEvent::Missing { seq: s });
                        events.push(DeliveryEvent::RetransmissionRequested { seq: s });
                    }
                }
            } else {
                // Below the cursor with an unseen id: distinct from a duplicate.
                events.push(DeliveryEvent::Late { seq: msg_seq, expected: state.next_expected });
            }

            if wants_ack && accepted {
                events.push(DeliveryEvent::AckSent { id: msg_id.clone() });
                let handle = self.spawn_ack_timer(msg_id.clone());
                state.pending_acks.insert(msg_id, handle);
            }
        }

        self.publish(events);
        delivered
    }

    /// Complete the ack handshake for a message id. Returns whether a deadline
    /// was still pending.
    pub fn acknowledge(&self, message_id: &str) -> bool {
        let handle = self.inner.state.lock().unwrap().pending_acks.remove(message_id);
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Feed a retransmitted message back in.
    ///
    /// If its seq was tracked as missing the gap is closed and a `Recovered`
    /// signal emitted; either way the message then takes the normal receive
    /// path (deliver, buffer, or duplicate).
    pub fn handle_retransmission(&self, message: Message) -> Vec<Message> {
        let was_missing = self.inner.state.lock().unwrap().missing.remove(&message.seq);
        if was_missing {
            self.publish(vec![DeliveryEvent::Recovered { seq: message.seq }]);
        }
        self.receive(message)
    }

    /// Sequence numbers currently known to be missing, ascending.
    pub fn missing(&self) -> Vec<u64> {
        self.inner.state.lock().unwrap().missing.iter().copied().collect()
    }

    pub fn next_expected(&self) -> u64 {
        self.inner.state.lock().unwrap().next_expected
    }

    pub fn stats(&self) -> StreamStats {
        let state = self.inner.state.lock().unwrap();
        StreamStats {
            next_expected: state.next_expected,
            buffered: state.reorder.len(),
            missing: state.missing.len(),
            pending_acks: state.pending_acks.len(),
            delivered_total: state.delivered_total,
            duplicates_total: state.duplicates_total,
        }
    }

    /// Cancel ack timers and freeze the stream.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.lock().unwrap();
        for (_, handle) in state.pending_acks.drain() {
            handle.abort();
        }
    }

    fn spawn_ack_timer(&self, id: String) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        let deadline = self.inner.config.ack_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    let fired = inner.state.lock().unwrap().pending_acks.remove(&id).is_some();
                    if fired {
                        tracing::warn!(stream = %inner.name, message = %id, "ack deadline passed");
                        inner.bus.emit(RuntimeEvent::Delivery {
                            stream: inner.name.clone(),
                            event: DeliveryEvent::AckTimeout { id },
                        });
                    }
                }
            }
        })
    }

    fn publish(&self, events: Vec<DeliveryEvent>) {
        for event in events {
            self.inner.bus.emit(RuntimeEvent::Delivery {
                stream: self.inner.name.clone(),
                event,
            });
        }
    }
}
