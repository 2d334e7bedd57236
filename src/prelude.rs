//! Convenient re-exports for common Holdfast types.
pub use crate::{
    Backoff, BreakerConfig, BreakerStatus, CircuitBreaker, CircuitState, Classifier, ConfigError,
    DegradationCoordinator, DeliveryConfig, DeliveryStream, ErrorTag, EventBus, FailureKind,
    HealthCheckConfig, HealthMonitor, HealthStatus, Message, OverallHealth, Probe, Registry,
    ResilienceError, RetryEngine, StormController, StreamStats,
};
