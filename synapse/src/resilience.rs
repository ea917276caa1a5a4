//! Circuit Breaker
//!
//! Shared resilience wrapper for every call to the external audit store and
//! quality gate. Explicit `Closed -> Open -> HalfOpen -> Closed` state
//! machine: the circuit opens after a configured number of failures inside a
//! rolling window, fails fast with [`DegradedServiceError`] during the open
//! cooldown, then admits exactly one probe call. A successful probe closes
//! the circuit; a failed probe reopens it and resets the cooldown.

use crate::config::BreakerConfig;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// The circuit is open and the wrapped service is not being called
#[derive(Debug, Clone, Error)]
#[error("degraded service: circuit '{service}' is open")]
pub struct DegradedServiceError {
    /// Name of the wrapped service
    pub service: String,
}

/// Error returned by breaker-wrapped calls
#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error> {
    /// The circuit was open and the call was rejected without reaching the
    /// service
    #[error(transparent)]
    Degraded(#[from] DegradedServiceError),

    /// The service was called and returned an error
    #[error(transparent)]
    Service(E),
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing; calls are rejected until the cooldown elapses
    Open,
    /// Cooldown elapsed; a single probe call is in flight
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Timestamps of recent failures, pruned to the rolling window
    failures: VecDeque<Instant>,
    /// When the circuit last transitioned to `Open`
    opened_at: Option<Instant>,
    /// A half-open probe has been admitted and has not yet completed
    probe_in_flight: bool,
}

/// Circuit breaker wrapping calls to one external service
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker for the named service
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run an operation through the breaker.
    ///
    /// Fails fast with [`DegradedServiceError`] while the circuit is open;
    /// otherwise runs the operation and records its outcome.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let is_probe = self.admit()?;

        match op().await {
            Ok(value) => {
                self.record_success(is_probe);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(is_probe);
                Err(BreakerError::Service(err))
            }
        }
    }

    /// Decide whether a call may proceed. Returns `true` when the admitted
    /// call is the half-open probe.
    fn admit(&self) -> Result<bool, DegradedServiceError> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or_default();

                if elapsed >= self.config.cooldown() {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(service = %self.service, "circuit entering half-open, admitting probe");
                    Ok(true)
                } else {
                    Err(DegradedServiceError {
                        service: self.service.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    // Only one probe at a time
                    Err(DegradedServiceError {
                        service: self.service.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self, was_probe: bool) {
        let mut inner = self.lock();

        if was_probe {
            inner.state = CircuitState::Closed;
            inner.probe_in_flight = false;
            inner.failures.clear();
            inner.opened_at = None;
            info!(service = %self.service, "circuit closed after successful probe");
        } else {
            Self::prune(&mut inner.failures, self.config.window());
        }
    }

    fn record_failure(&self, was_probe: bool) {
        let mut inner = self.lock();
        let now = Instant::now();

        if was_probe {
            inner.state = CircuitState::Open;
            inner.probe_in_flight = false;
            inner.opened_at = Some(now);
            warn!(service = %self.service, "circuit reopened after failed probe");
            return;
        }

        inner.failures.push_back(now);
        Self::prune(&mut inner.failures, self.config.window());

        if inner.state == CircuitState::Closed
            && inner.failures.len() as u32 >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            warn!(
                service = %self.service,
                failures = inner.failures.len(),
                "circuit opened after repeated failures"
            );
        }
    }

    fn prune(failures: &mut VecDeque<Instant>, window: std::time::Duration) {
        while let Some(front) = failures.front() {
            if front.elapsed() > window {
                failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // The mutex is never held across an await point; a poisoned lock
        // means a panic mid-update, so propagating is correct.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", BreakerConfig::default())
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<Boom>> {
        b.call(|| async { Err::<(), _>(Boom) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), BreakerError<Boom>> {
        b.call(|| async { Ok::<(), Boom>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let b = breaker();
        for _ in 0..5 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Service(_))));
        }
        assert_eq!(b.state(), CircuitState::Open);

        // Next call is rejected without reaching the service
        assert!(matches!(succeed(&b).await, Err(BreakerError::Degraded(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_cooldown_then_close() {
        let b = breaker();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(std::time::Duration::from_secs(31)).await;

        // The first call after the cooldown is the probe; success closes
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_and_resets_cooldown() {
        let b = breaker();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }

        tokio::time::advance(std::time::Duration::from_secs(31)).await;
        assert!(matches!(fail(&b).await, Err(BreakerError::Service(_))));
        assert_eq!(b.state(), CircuitState::Open);

        // Cooldown was reset by the failed probe
        tokio::time::advance(std::time::Duration::from_secs(10)).await;
        assert!(matches!(succeed(&b).await, Err(BreakerError::Degraded(_))));

        tokio::time::advance(std::time::Duration::from_secs(21)).await;
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_open() {
        let b = breaker();
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);

        // Old failures age out of the rolling window
        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
