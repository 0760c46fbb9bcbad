use crate::clock::Clock;
use crate::metrics::Metrics;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn label(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("circuit-open")]
pub struct CircuitOpen;

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Duration>,
    probe_in_flight: bool,
}

/// Circuit breaker around upstream receiver operations.
///
/// Closed counts consecutive failures; reaching the threshold opens the
/// circuit. Open rejects immediately until the reset timeout has elapsed,
/// then a single probe call runs half-open and decides the next state.
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_timeout: reset_timeout.max(Duration::from_millis(1)),
            clock,
            metrics: None,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Ask to run one guarded call. `Err(CircuitOpen)` means fail fast.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed_since_open = inner
                    .opened_at
                    .map(|t| self.clock.monotonic().saturating_sub(t))
                    .unwrap_or_default();
                if elapsed_since_open >= self.reset_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CircuitOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    // Only one probe at a time
                    Err(CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.probe_in_flight = false;
        inner.failures = 0;
        inner.opened_at = None;
        if inner.state != BreakerState::Closed {
            info!("upstream recovered, closing circuit");
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.threshold {
                    warn!(failures = inner.failures, "opening circuit to upstream");
                    inner.opened_at = Some(self.clock.monotonic());
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                warn!("half-open probe failed, reopening circuit");
                inner.opened_at = Some(self.clock.monotonic());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Run `f` under the breaker, recording its outcome
    pub async fn call<F, Fut, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.try_acquire()?;
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        inner.state = to;
        if let Some(m) = &self.metrics {
            m.breaker_transitions.with_label_values(&[to.label()]).inc();
        }
    }
}
