use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    /// Upper bound on a single sink call; exceeding it counts as a failure.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("circuit breaker is open; sink writes are paused")]
    Open,
    #[error("sink call timed out after {0:?}")]
    Timeout(Duration),
    #[error("sink call failed: {0:#}")]
    Sink(anyhow::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub open_timeout: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Failure-counting gate in front of the averages sink.
///
/// Admission and outcome recording are separate critical sections; calls
/// admitted together while closed may report back in any order.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let config = BreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            ..config
        };
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            failure_threshold: self.config.failure_threshold,
            open_timeout: self.config.open_timeout,
        }
    }

    /// Runs `op` if the breaker admits it, bounded by the call timeout.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.try_acquire()?;
        let mut attempt = Attempt {
            breaker: self,
            settled: false,
        };

        let outcome = tokio::time::timeout(self.config.call_timeout, op()).await;
        attempt.settled = true;
        match outcome {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Err(GateError::Sink(err))
            }
            Err(_) => {
                self.record_failure();
                Err(GateError::Timeout(self.config.call_timeout))
            }
        }
    }

    fn try_acquire(&self) -> Result<(), GateError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() > self.config.open_timeout);
                if !cooled_down {
                    return Err(GateError::Open);
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                tracing::info!("circuit breaker half-open; probing sink");
                Ok(())
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(GateError::Open);
                }
                inner.probe_in_flight = true;
                Ok(())
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                tracing::info!("circuit breaker closed; sink writes re-enabled");
            }
            // A call admitted before the breaker opened; the open period stands.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    open_for = ?self.config.open_timeout,
                    "circuit breaker opened; sink writes disabled"
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.probe_in_flight = false;
                tracing::warn!(
                    open_for = ?self.config.open_timeout,
                    "circuit breaker reopened; sink probe failed"
                );
            }
            _ => {}
        }
    }
}

/// Counts an admitted call that was dropped before finishing as a failure,
/// so an abandoned half-open probe cannot pin the breaker.
struct Attempt<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure();
        }
    }
}
