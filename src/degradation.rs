//! Primary/fallback dispatch layered on a circuit breaker.
//!
//! Each named service owns a breaker that guards only the primary; a failed
//! or rejected primary falls through to the registered fallback, whose own
//! outcome (success or error) is surfaced verbatim.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ConfigError, ResilienceError};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

type FallbackFn<T, E> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Send + Sync>;

struct ServiceEntry<T, E> {
    breaker: Arc<CircuitBreaker>,
    fallback: Option<FallbackFn<T, E>>,
}

/// Named services with breaker-guarded primaries and optional fallbacks.
///
/// The coordinator is typed by the service response `T` and application error
/// `E`; hosts with heterogeneous services keep one coordinator per response
/// shape.
pub struct DegradationCoordinator<T, E> {
    services: Mutex<HashMap<String, ServiceEntry<T, E>>>,
}

impl<T, E> DegradationCoordinator<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { services: Mutex::new(HashMap::new()) }
    }

    /// Register a service with no fallback.
    pub fn register(
        &self,
        name: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<(), ConfigError> {
        self.insert(name.into(), breaker, None)
    }

    /// Register a service with a fallback operation.
    pub fn register_with_fallback<F, Fut>(
        &self,
        name: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        fallback: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    {
        let boxed: FallbackFn<T, E> =
            Arc::new(move || -> BoxFuture<'static, Result<T, ResilienceError<E>>> {
                Box::pin(fallback())
            });
        self.insert(name.into(), breaker, Some(boxed))
    }

    fn insert(
        &self,
        name: String,
        breaker: Arc<CircuitBreaker>,
        fallback: Option<FallbackFn<T, E>>,
    ) -> Result<(), ConfigError> {
        let mut services = self.services.lock().unwrap();
        if services.contains_key(&name) {
            return Err(ConfigError::ConflictingRegistration { name });
        }
        services.insert(name, ServiceEntry { breaker, fallback });
        Ok(())
    }

    /// Drop a service registration. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.services.lock().unwrap().remove(name).is_some()
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.lock().unwrap().contains_key(name)
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.services.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `primary` through the service's breaker, degrading to the fallback
    /// on any failure (including breaker rejection).
    ///
    /// An unregistered name fails with `UnknownService` without invoking
    /// `primary`.
    pub async fn execute_with_degradation<Fut, Op>(
        &self,
        name: &str,
        primary: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let entry = {
            let services = self.services.lock().unwrap();
            services.get(name).map(|e| (e.breaker.clone(), e.fallback.clone()))
        };
        let Some((breaker, fallback)) = entry else {
            return Err(ResilienceError::UnknownService { name: name.to_string() });
        };

        match breaker.execute(primary).await {
            Ok(value) => Ok(value),
            Err(primary_err) => match fallback {
                Some(fallback) => {
                    tracing::warn!(
                        service = name,
                        kind = primary_err.kind(),
                        "primary failed, degrading to fallback"
                    );
                    fallback().await
                }
                None => Err(primary_err),
            },
        }
    }
}

impl<T, E> Default for DegradationCoordinator<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
