//! Structured events emitted by runtime components.
//!
//! Components publish transition and protocol events onto an [`EventBus`], a
//! bounded broadcast channel. Slow observers lag and lose events; they never
//! block a state transition.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Events emitted by circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// Circuit tripped; admissions are rejected until the recovery timeout.
    Opened { failure_count: u32 },
    /// Recovery timeout elapsed; trial admissions are allowed.
    HalfOpen,
    /// Trial succeeded; normal operation resumed.
    Closed,
}

/// Events emitted by the retry engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// A failed attempt will be retried after `delay`.
    Backoff { attempt: usize, delay: Duration },
    /// All attempts failed.
    Exhausted { attempts: usize },
}

/// Events emitted by the storm controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StormEvent {
    /// An operation was admitted under the per-key cap.
    Admitted { in_flight: usize, max: usize },
    /// An operation was rejected because the key is at capacity.
    Rejected { in_flight: usize, max: usize },
}

/// Events emitted by the health monitor on status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    /// Hysteresis threshold of consecutive failures reached.
    BecameUnhealthy { consecutive_failures: u32 },
    /// Hysteresis threshold of consecutive successes reached.
    Recovered { consecutive_successes: u32 },
}

/// Events emitted by ordered-delivery streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A message was handed to the application in order.
    Delivered { seq: u64, id: String },
    /// A message id was seen before; nothing was delivered.
    Duplicate { id: String },
    /// A message arrived below the delivery cursor with an unseen id.
    Late { seq: u64, expected: u64 },
    /// An out-of-order message was parked in the reorder buffer.
    Buffered { seq: u64 },
    /// A gap was detected; `seq` has not arrived.
    Missing { seq: u64 },
    /// The transport was asked to resend `seq`.
    RetransmissionRequested { seq: u64 },
    /// The reorder buffer was full; `seq` was discarded.
    BufferOverflow { seq: u64 },
    /// A previously missing message arrived via retransmission.
    Recovered { seq: u64 },
    /// An acknowledgment was scheduled for a message that requires one.
    AckSent { id: String },
    /// No acknowledgment arrived before the deadline.
    AckTimeout { id: String },
}

/// Any event emitted by the runtime, tagged with its source component.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    CircuitBreaker { name: String, event: BreakerEvent },
    Retry(RetryEvent),
    Storm { key: String, event: StormEvent },
    Health { target: String, event: HealthEvent },
    Delivery { stream: String, event: DeliveryEvent },
}

impl fmt::Display for RuntimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitBreaker { name, event } => match event {
                BreakerEvent::Opened { failure_count } => {
                    write!(f, "breaker {name} opened after {failure_count} failures")
                }
                BreakerEvent::HalfOpen => write!(f, "breaker {name} entered half-open trial"),
                BreakerEvent::Closed => write!(f, "breaker {name} closed"),
            },
            Self::Retry(RetryEvent::Backoff { attempt, delay }) => {
                write!(f, "retry attempt {attempt} failed, backing off {delay:?}")
            }
            Self::Retry(RetryEvent::Exhausted { attempts }) => {
                write!(f, "retry exhausted after {attempts} attempts")
            }
            Self::Storm { key, event } => match event {
                StormEvent::Admitted { in_flight, max } => {
                    write!(f, "storm key {key}: admitted ({in_flight}/{max})")
                }
                StormEvent::Rejected { in_flight, max } => {
                    write!(f, "storm key {key}: rejected ({in_flight}/{max})")
                }
            },
            Self::Health { target, event } => match event {
                HealthEvent::BecameUnhealthy { consecutive_failures } => {
                    write!(f, "target {target} unhealthy after {consecutive_failures} failures")
                }
                HealthEvent::Recovered { consecutive_successes } => {
                    write!(f, "target {target} healthy after {consecutive_successes} successes")
                }
            },
            Self::Delivery { stream, event } => write!(f, "stream {stream}: {event:?}"),
        }
    }
}

/// Bounded fan-out channel for [`RuntimeEvent`]s.
///
/// Cloning shares the underlying channel. Emission is fire-and-forget: with no
/// live subscriber the event is counted as dropped and discarded.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: RuntimeEvent) {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Open a new subscription starting at the current tail.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Events discarded because no subscriber was listening.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(RuntimeEvent::CircuitBreaker {
            name: "payments".into(),
            event: BreakerEvent::Opened { failure_count: 3 },
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            RuntimeEvent::CircuitBreaker {
                name: "payments".into(),
                event: BreakerEvent::Opened { failure_count: 3 },
            }
        );
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_counted_not_fatal() {
        let bus = EventBus::new(4);
        bus.emit(RuntimeEvent::Retry(RetryEvent::Exhausted { attempts: 3 }));
        assert_eq!(bus.dropped(), 1);
    }

    #[test]
    fn display_names_the_component() {
        let event = RuntimeEvent::CircuitBreaker {
            name: "search".into(),
            event: BreakerEvent::HalfOpen,
        };
        assert!(event.to_string().contains("search"));
        assert!(event.to_string().contains("half-open"));
    }
}
