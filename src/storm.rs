//! Per-key admission control against retry storms.
//!
//! Each key carries an in-flight counter with a hard cap; admission is an
//! immediate decision and the counter is restored exactly once per admission
//! via an RAII permit, whatever path the operation exits on.

use crate::error::{ConfigError, ResilienceError};
use crate::events::{EventBus, RuntimeEvent, StormEvent};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Per-key concurrency cap with fail-fast rejection.
#[derive(Debug, Clone)]
pub struct StormController {
    max_in_flight: usize,
    keys: Arc<Mutex<HashMap<String, usize>>>,
    bus: EventBus,
}

impl StormController {
    pub fn new(max_in_flight: usize) -> Result<Self, ConfigError> {
        if max_in_flight == 0 {
            return Err(ConfigError::ZeroCapacity { field: "max_in_flight" });
        }
        Ok(Self {
            max_in_flight,
            keys: Arc::new(Mutex::new(HashMap::new())),
            bus: EventBus::default(),
        })
    }

    /// Publish admission events on the given bus.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Run `operation` under `key`'s in-flight budget.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        key: &str,
        mut operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let _permit = self.acquire(key)?;
        operation().await
    }

    /// Keys with at least one operation in flight right now.
    pub fn stats(&self) -> HashMap<String, usize> {
        self.keys.lock().unwrap().clone()
    }

    /// Current in-flight count for a key (0 when idle).
    pub fn in_flight(&self, key: &str) -> usize {
        self.keys.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn acquire<E>(&self, key: &str) -> Result<InFlightPermit, ResilienceError<E>> {
        let mut keys = self.keys.lock().unwrap();
        let count = keys.entry(key.to_string()).or_default();
        if *count >= self.max_in_flight {
            let in_flight = *count;
            drop(keys);
            tracing::warn!(key, in_flight, max = self.max_in_flight, "storm detected");
            self.bus.emit(RuntimeEvent::Storm {
                key: key.to_string(),
                event: StormEvent::Rejected { in_flight, max: self.max_in_flight },
            });
            return Err(ResilienceError::StormDetected {
                key: key.to_string(),
                in_flight,
                max: self.max_in_flight,
            });
        }
        *count += 1;
        let in_flight = *count;
        drop(keys);
        self.bus.emit(RuntimeEvent::Storm {
            key: key.to_string(),
            event: StormEvent::Admitted { in_flight, max: self.max_in_flight },
        });
        Ok(InFlightPermit { keys: self.keys.clone(), key: key.to_string() })
    }
}

/// Decrements the key's counter when dropped; entries vanish at zero.
struct InFlightPermit {
    keys: Arc<Mutex<HashMap<String, usize>>>,
    key: String,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        let mut keys = self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(count) = keys.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                keys.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn sequential_calls_never_hit_the_cap() {
        let controller = StormController::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter_clone = counter.clone();
            let result = controller
                .execute("db", || {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ResilienceError<TestError>>(42)
                    }
                })
                .await;
            assert!(result.is_ok());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(controller.stats().is_empty());
    }

    #[tokio::test]
    async fn rejects_when_key_is_at_capacity() {
        let controller = StormController::new(2).unwrap();
        let barrier = Arc::new(tokio::sync::Barrier::new(3));

        let mut handles = vec![];
        for _ in 0..2 {
            let controller = controller.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                controller
                    .execute("api", || {
                        let barrier = barrier.clone();
                        async move {
                            barrier.wait().await;
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, ResilienceError<TestError>>(())
                        }
                    })
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.in_flight("api"), 2);

        let rejected = controller
            .execute("api", || async { Ok::<_, ResilienceError<TestError>>(()) })
            .await;
        match rejected.unwrap_err() {
            ResilienceError::StormDetected { key, in_flight, max } => {
                assert_eq!(key, "api");
                assert_eq!(in_flight, 2);
                assert_eq!(max, 2);
            }
            e => panic!("expected StormDetected, got {:?}", e),
        }

        barrier.wait().await;
        for handle in handles {
            let _ = handle.await;
        }
        assert!(controller.stats().is_empty());
    }

    #[tokio::test]
    async fn keys_are_isolated_from_each_other() {
        let controller = StormController::new(1).unwrap();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let holder = {
            let controller = controller.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                controller
                    .execute("slow", || {
                        let barrier = barrier.clone();
                        async move {
                            barrier.wait().await;
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, ResilienceError<TestError>>(())
                        }
                    })
                    .await
            })
        };

        barrier.wait().await;

        // "slow" is saturated, "fast" is untouched.
        let busy = controller
            .execute("slow", || async { Ok::<_, ResilienceError<TestError>>(()) })
            .await;
        assert!(busy.unwrap_err().is_storm_detected());

        let free = controller
            .execute("fast", || async { Ok::<_, ResilienceError<TestError>>(7) })
            .await;
        assert_eq!(free.unwrap(), 7);

        let _ = holder.await;
    }

    #[tokio::test]
    async fn counter_is_restored_on_the_failure_path() {
        let controller = StormController::new(1).unwrap();

        let result = controller
            .execute("flaky", || async {
                Err::<(), _>(ResilienceError::Inner(TestError("boom".into())))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(controller.in_flight("flaky"), 0);
        assert!(controller.stats().is_empty());
    }

    #[tokio::test]
    async fn counter_is_restored_when_the_operation_is_dropped() {
        let controller = StormController::new(1).unwrap();

        let handle = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .execute("orphan", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok::<_, ResilienceError<TestError>>(())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.in_flight("orphan"), 1);

        handle.abort();
        let _ = handle.await;

        assert_eq!(controller.in_flight("orphan"), 0);
        assert!(controller.stats().is_empty());
    }

    #[tokio::test]
    async fn stats_reports_only_live_keys() {
        let controller = StormController::new(4).unwrap();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let holder = {
            let controller = controller.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                controller
                    .execute("active", || {
                        let barrier = barrier.clone();
                        async move {
                            barrier.wait().await;
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, ResilienceError<TestError>>(())
                        }
                    })
                    .await
            })
        };

        barrier.wait().await;
        let stats = controller.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats.get("active"), Some(&1));

        let _ = holder.await;
        assert!(controller.stats().is_empty());
    }

    #[test]
    fn zero_capacity_is_rejected_at_construction() {
        assert!(matches!(
            StormController::new(0).unwrap_err(),
            ConfigError::ZeroCapacity { .. }
        ));
    }
}
