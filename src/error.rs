//! Error types surfaced by the runtime.

use std::fmt;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type for every component of the runtime.
///
/// Admission errors (`CircuitOpen`, `HalfOpenExceeded`, `StormDetected`) and the
/// other runtime-raised variants are never retried and never counted as breaker
/// failures; only `Inner` carries an operation's own error.
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The circuit breaker is open and rejected the admission.
    CircuitOpen { failure_count: u32, open_for: Duration },
    /// The half-open trial window has no admissions left.
    HalfOpenExceeded { max_calls: u32 },
    /// Too many concurrent operations in flight for this key.
    StormDetected { key: String, in_flight: usize, max: usize },
    /// No service registered under this name.
    UnknownService { name: String },
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, failures: Vec<E> },
    /// The caller's context was cancelled.
    Cancelled,
    /// A health probe exceeded its per-probe timeout.
    ProbeTimeout { target: String, timeout: Duration },
    /// The reorder buffer was full; a message was discarded.
    BufferOverflow { stream: String, seq: u64, capacity: usize },
    /// A required acknowledgment did not arrive before the deadline.
    AckTimeout { message_id: String },
    /// The underlying operation failed.
    Inner(E),
}

impl<E> ResilienceError<E> {
    /// Stable tag identifying the error kind; application errors are `"inner"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::HalfOpenExceeded { .. } => "half_open_exceeded",
            Self::StormDetected { .. } => "storm_detected",
            Self::UnknownService { .. } => "unknown_service",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Cancelled => "cancelled",
            Self::ProbeTimeout { .. } => "probe_timeout",
            Self::BufferOverflow { .. } => "buffer_overflow",
            Self::AckTimeout { .. } => "ack_timeout",
            Self::Inner(_) => "inner",
        }
    }

    /// Check if this error is a breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is a half-open trial rejection.
    pub fn is_half_open_exceeded(&self) -> bool {
        matches!(self, Self::HalfOpenExceeded { .. })
    }

    /// Check if this error is a storm-control rejection.
    pub fn is_storm_detected(&self) -> bool {
        matches!(self, Self::StormDetected { .. })
    }

    /// Check if this error names an unregistered service.
    pub fn is_unknown_service(&self) -> bool {
        matches!(self, Self::UnknownService { .. })
    }

    /// Check if this error is due to retry exhaustion.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if the caller's context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error wraps an operation error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access all recorded failures for RetryExhausted, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
}

impl<E: Clone> Clone for ResilienceError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::CircuitOpen { failure_count, open_for } => {
                Self::CircuitOpen { failure_count: *failure_count, open_for: *open_for }
            }
            Self::HalfOpenExceeded { max_calls } => {
                Self::HalfOpenExceeded { max_calls: *max_calls }
            }
            Self::StormDetected { key, in_flight, max } => Self::StormDetected {
                key: key.clone(),
                in_flight: *in_flight,
                max: *max,
            },
            Self::UnknownService { name } => Self::UnknownService { name: name.clone() },
            Self::RetryExhausted { attempts, failures } => {
                Self::RetryExhausted { attempts: *attempts, failures: failures.clone() }
            }
            Self::Cancelled => Self::Cancelled,
            Self::ProbeTimeout { target, timeout } => {
                Self::ProbeTimeout { target: target.clone(), timeout: *timeout }
            }
            Self::BufferOverflow { stream, seq, capacity } => Self::BufferOverflow {
                stream: stream.clone(),
                seq: *seq,
                capacity: *capacity,
            },
            Self::AckTimeout { message_id } => {
                Self::AckTimeout { message_id: message_id.clone() }
            }
            Self::Inner(e) => Self::Inner(e.clone()),
        }
    }
}

impl<E: PartialEq> PartialEq for ResilienceError<E> {
    fn eq(&self, other: &Self) -> bool {
        use ResilienceError::*;
        match (self, other) {
            (
                CircuitOpen { failure_count: f1, open_for: d1 },
                CircuitOpen { failure_count: f2, open_for: d2 },
            ) => f1 == f2 && d1 == d2,
            (HalfOpenExceeded { max_calls: m1 }, HalfOpenExceeded { max_calls: m2 }) => m1 == m2,
            (
                StormDetected { key: k1, in_flight: i1, max: m1 },
                StormDetected { key: k2, in_flight: i2, max: m2 },
            ) => k1 == k2 && i1 == i2 && m1 == m2,
            (UnknownService { name: n1 }, UnknownService { name: n2 }) => n1 == n2,
            (
                RetryExhausted { attempts: a1, failures: f1 },
                RetryExhausted { attempts: a2, failures: f2 },
            ) => a1 == a2 && f1 == f2,
            (Cancelled, Cancelled) => true,
            (
                ProbeTimeout { target: t1, timeout: d1 },
                ProbeTimeout { target: t2, timeout: d2 },
            ) => t1 == t2 && d1 == d2,
            (
                BufferOverflow { stream: s1, seq: q1, capacity: c1 },
                BufferOverflow { stream: s2, seq: q2, capacity: c2 },
            ) => s1 == s2 && q1 == q2 && c1 == c2,
            (AckTimeout { message_id: m1 }, AckTimeout { message_id: m2 }) => m1 == m2,
            (Inner(e1), Inner(e2)) => e1 == e2,
            _ => false,
        }
    }
}

impl<E: Eq> Eq for ResilienceError<E> {}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { failure_count, open_for } => {
                write!(
                    f,
                    "circuit breaker open ({} failures, open for {:?})",
                    failure_count, open_for
                )
            }
            Self::HalfOpenExceeded { max_calls } => {
                write!(f, "half-open trial window full (max {} calls)", max_calls)
            }
            Self::StormDetected { key, in_flight, max } => {
                write!(f, "storm detected for key {:?} ({} in-flight, max {})", key, in_flight, max)
            }
            Self::UnknownService { name } => write!(f, "no service registered as {:?}", name),
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "retry exhausted after {} attempts ({} failures), last error: {}",
                    attempts,
                    failures.len(),
                    last
                )
            }
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::ProbeTimeout { target, timeout } => {
                write!(f, "probe for {:?} exceeded timeout {:?}", target, timeout)
            }
            Self::BufferOverflow { stream, seq, capacity } => {
                write!(
                    f,
                    "reorder buffer full on stream {:?} (capacity {}), discarded seq {}",
                    stream, capacity, seq
                )
            }
            Self::AckTimeout { message_id } => {
                write!(f, "ack deadline passed for message {:?}", message_id)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

/// Errors raised when a component is constructed from invalid configuration.
///
/// Construction fails; values are never silently clamped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be >= 1 (got {value})")]
    InvalidThreshold { field: &'static str, value: u64 },
    #[error("{field} must be > 0")]
    ZeroDuration { field: &'static str },
    #[error("{field} must be >= 1")]
    ZeroCapacity { field: &'static str },
    #[error("max_delay {max:?} must be >= base_delay {base:?}")]
    DelayRange { base: Duration, max: Duration },
    #[error("backoff_multiplier must be > 1 (got {value})")]
    InvalidMultiplier { value: f64 },
    #[error("jitter_factor must be within [0, 1] (got {value})")]
    InvalidJitter { value: f64 },
    #[error("{name:?} is already registered with a different configuration")]
    ConflictingRegistration { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);

    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for DummyError {}

    #[test]
    fn circuit_open_display() {
        let err: ResilienceError<DummyError> =
            ResilienceError::CircuitOpen { failure_count: 4, open_for: Duration::from_secs(3) };
        let msg = format!("{}", err);
        assert!(msg.contains("circuit breaker open"));
        assert!(msg.contains('4'));
    }

    #[test]
    fn retry_exhausted_display_includes_last_error() {
        let err: ResilienceError<DummyError> = ResilienceError::RetryExhausted {
            attempts: 3,
            failures: vec![DummyError("first"), DummyError("last")],
        };
        let msg = format!("{}", err);
        assert!(msg.contains('3'));
        assert!(msg.contains("last error"));
    }

    #[test]
    fn kinds_are_stable() {
        let err: ResilienceError<DummyError> = ResilienceError::Cancelled;
        assert_eq!(err.kind(), "cancelled");
        let err: ResilienceError<DummyError> =
            ResilienceError::AckTimeout { message_id: "m1".into() };
        assert_eq!(err.kind(), "ack_timeout");
        let err: ResilienceError<DummyError> = ResilienceError::Inner(DummyError("x"));
        assert_eq!(err.kind(), "inner");
    }

    #[test]
    fn predicates_cover_admission_errors() {
        let open: ResilienceError<DummyError> =
            ResilienceError::CircuitOpen { failure_count: 1, open_for: Duration::ZERO };
        assert!(open.is_circuit_open());
        assert!(!open.is_inner());

        let half: ResilienceError<DummyError> = ResilienceError::HalfOpenExceeded { max_calls: 2 };
        assert!(half.is_half_open_exceeded());

        let storm: ResilienceError<DummyError> =
            ResilienceError::StormDetected { key: "k".into(), in_flight: 8, max: 8 };
        assert!(storm.is_storm_detected());

        let unknown: ResilienceError<DummyError> =
            ResilienceError::UnknownService { name: "svc".into() };
        assert!(unknown.is_unknown_service());
    }

    #[test]
    fn source_returns_last_failure_for_retry_exhausted() {
        let err: ResilienceError<DummyError> = ResilienceError::RetryExhausted {
            attempts: 2,
            failures: vec![DummyError("a"), DummyError("b")],
        };
        let src = err.source().unwrap();
        assert_eq!(src.to_string(), "b");
    }

    #[test]
    fn into_inner_extracts_error() {
        let err = ResilienceError::Inner(DummyError("boom"));
        assert_eq!(err.into_inner().unwrap(), DummyError("boom"));
    }

    #[test]
    fn config_errors_render_the_offending_field() {
        let err = ConfigError::InvalidThreshold { field: "failure_threshold", value: 0 };
        assert!(err.to_string().contains("failure_threshold"));

        let err = ConfigError::DelayRange {
            base: Duration::from_secs(2),
            max: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("base_delay"));
    }
}
