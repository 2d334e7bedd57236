#![forbid(unsafe_code)]

//! # Holdfast
//!
//! A resilience runtime for async Rust services: wrap every outbound call and
//! inbound message stream so partial failures in dependencies don't cascade.
//!
//! ## Components
//!
//! - **Circuit breakers** with a throughput-gated trip and a bounded half-open
//!   trial ([`CircuitBreaker`])
//! - **Bounded retry** with exponential backoff, jitter, and failure
//!   classification ([`RetryEngine`], [`Backoff`], [`Classifier`])
//! - **Health monitoring** with hysteresis and a three-valued rollup
//!   ([`HealthMonitor`])
//! - **Graceful degradation** to registered fallbacks
//!   ([`DegradationCoordinator`])
//! - **Storm control**: per-key in-flight caps ([`StormController`])
//! - **Ordered delivery**: reorder buffering, dedup, gap detection, and
//!   acknowledgment tracking over at-least-once transports ([`DeliveryStream`])
//! - A [`Registry`] that owns names, background timers, and teardown
//!
//! ## Quick start
//!
//! ```rust
//! use holdfast::{
//!     Backoff, BreakerConfig, Classifier, ErrorTag, Registry, ResilienceError, RetryEngine,
//! };
//! use std::time::Duration;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("upstream unavailable")]
//! struct Unavailable;
//!
//! impl ErrorTag for Unavailable {
//!     fn tag(&self) -> &str {
//!         "unavailable"
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<Unavailable>> {
//!     let registry = Registry::new();
//!     let breaker = registry
//!         .breaker("upstream", BreakerConfig::new(5, Duration::from_secs(30)))
//!         .expect("valid breaker config");
//!
//!     let retry = RetryEngine::builder()
//!         .max_attempts(3)
//!         .backoff(
//!             Backoff::new(Duration::from_millis(200), Duration::from_secs(5), 2.0, 0.5)
//!                 .expect("valid backoff"),
//!         )
//!         .classifier(Classifier::exact(["unavailable"]))
//!         .build()
//!         .expect("valid retry config");
//!
//!     let value = retry
//!         .run(|| {
//!             let breaker = breaker.clone();
//!             async move {
//!                 breaker
//!                     .execute(|| async { Ok::<_, ResilienceError<Unavailable>>(42) })
//!                     .await
//!             }
//!         })
//!         .await?;
//!
//!     assert_eq!(value, 42);
//!     registry.shutdown();
//!     Ok(())
//! }
//! ```

mod backoff;
mod circuit_breaker;
mod classifier;
mod clock;
mod degradation;
mod delivery;
mod error;
mod events;
mod health;
mod registry;
mod retry;
mod sinks;
mod sleeper;
mod storm;

// Re-exports
pub use backoff::Backoff;
pub use circuit_breaker::{BreakerConfig, BreakerStatus, CircuitBreaker, CircuitState};
pub use classifier::{Classifier, ErrorTag, FailureKind, TagMatch};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use degradation::DegradationCoordinator;
pub use delivery::{DeliveryConfig, DeliveryStream, DeliveryStreamBuilder, Message, StreamStats};
pub use error::{ConfigError, ResilienceError, MAX_RETRY_FAILURES};
pub use events::{
    BreakerEvent, DeliveryEvent, EventBus, HealthEvent, RetryEvent, RuntimeEvent, StormEvent,
};
pub use health::{
    HealthCheckConfig, HealthMonitor, HealthSnapshot, HealthStatus, OverallHealth, Probe,
    ProbeError,
};
pub use registry::Registry;
pub use retry::{RetryEngine, RetryEngineBuilder};
pub use sinks::{emit_best_effort, pump, EventSink, LogSink, MemorySink, NullSink};
pub use sleeper::{sleep_cancellable, InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use storm::StormController;

pub mod prelude;
