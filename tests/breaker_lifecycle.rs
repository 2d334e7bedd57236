use holdfast::{BreakerConfig, CircuitBreaker, CircuitState, ManualClock, ResilienceError};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct UpstreamError;

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream error")
    }
}

impl std::error::Error for UpstreamError {}

fn trial_breaker() -> (CircuitBreaker, ManualClock) {
    let clock = ManualClock::new();
    let config = BreakerConfig::new(3, Duration::from_millis(100))
        .with_minimum_throughput(3)
        .with_half_open_max_calls(2);
    let breaker = CircuitBreaker::new("upstream", config)
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    (breaker, clock)
}

async fn admit_failure(breaker: &CircuitBreaker) -> Result<(), ResilienceError<UpstreamError>> {
    breaker.execute(|| async { Err::<(), _>(ResilienceError::Inner(UpstreamError)) }).await
}

async fn admit_success(breaker: &CircuitBreaker) -> Result<u32, ResilienceError<UpstreamError>> {
    breaker.execute(|| async { Ok::<_, ResilienceError<UpstreamError>>(1) }).await
}

#[tokio::test]
async fn breaker_trips_then_recovers_through_the_trial_window() {
    let (breaker, clock) = trial_breaker();

    // Three failures meet both the threshold and the throughput gate.
    for _ in 0..3 {
        let _ = admit_failure(&breaker).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Mid-timeout admissions are rejected outright.
    clock.advance(50);
    assert!(admit_success(&breaker).await.unwrap_err().is_circuit_open());

    // Past the recovery timeout the trial opens; two successes close it.
    clock.advance(51);
    assert_eq!(admit_success(&breaker).await.unwrap(), 1);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_eq!(admit_success(&breaker).await.unwrap(), 1);
    assert_eq!(breaker.state(), CircuitState::Closed);

    // Fresh failures start from a clean count.
    let _ = admit_failure(&breaker).await;
    let _ = admit_failure(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.status().failure_count, 2);
}

#[tokio::test]
async fn failed_trial_reopens_with_a_fresh_deadline() {
    let (breaker, clock) = trial_breaker();

    for _ in 0..3 {
        let _ = admit_failure(&breaker).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(101);
    let _ = admit_failure(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    // The failure instant was refreshed: 50ms later we are still rejected,
    // another 51ms later the trial opens again.
    clock.advance(50);
    assert!(admit_success(&breaker).await.unwrap_err().is_circuit_open());
    clock.advance(51);
    assert_eq!(admit_success(&breaker).await.unwrap(), 1);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test]
async fn first_failure_trips_the_tightest_config() {
    let clock = ManualClock::new();
    let config = BreakerConfig::new(1, Duration::from_millis(100));
    let breaker =
        CircuitBreaker::new("tight", config).unwrap().with_clock(Arc::new(clock.clone()));

    let _ = admit_failure(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(admit_success(&breaker).await.unwrap_err().is_circuit_open());
}
