//! Retry policy and circuit breaker
//!
//! Retries use exponential backoff with fractional jitter and only apply
//! to errors whose category is retryable. The circuit breaker (unrelated
//! to onion circuits) guards external dependencies such as directory
//! authorities: Closed passes requests through and counts failures, Open
//! rejects until a cooldown elapses, HalfOpen admits a bounded number of
//! trials.

use crate::error::{Result, TorError};
use rand::Rng;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay: Duration,

    /// Ceiling on any single delay
    pub max_delay: Duration,

    /// Delay growth factor between attempts
    pub multiplier: f64,

    /// Fractional jitter applied to each delay (0.1 = +/-10%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (attempt 0 has no delay).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.powi(attempt as i32 - 1);
        let base = self.base_delay.as_secs_f64() * exp;
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }

    /// Run `op` until it succeeds, the error is not retryable, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = TorError::Internal("retry policy with zero attempts".into());
        for attempt in 0..self.max_attempts {
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() || attempt + 1 == self.max_attempts {
                        return Err(err);
                    }
                    log::debug!("attempt {} failed, retrying: {}", attempt + 1, err);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip Closed -> Open
    pub max_failures: u32,

    /// Failure-rate threshold (0..1) that trips Closed -> Open once
    /// `min_requests` have been observed
    pub failure_threshold: f64,

    /// Requests required before the rate threshold applies
    pub min_requests: u64,

    /// Cooldown in Open before a trial is admitted
    pub timeout: Duration,

    /// Concurrent trial requests admitted in HalfOpen
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            failure_threshold: 0.5,
            min_requests: 10,
            timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    total_requests: u64,
    total_failures: u64,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// Circuit breaker for an external dependency.
///
/// State changes are broadcast over a watch channel, so observers run in
/// their own tasks and can never deadlock the breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: StdMutex<BreakerInner>,
    state_tx: watch::Sender<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let (state_tx, _) = watch::channel(BreakerState::Closed);
        Self {
            config,
            inner: StdMutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                total_requests: 0,
                total_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
            state_tx,
        }
    }

    /// Current state (Open decays to HalfOpen lazily on the next
    /// `try_acquire`).
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<BreakerState> {
        self.state_tx.subscribe()
    }

    /// Ask to perform a request. The caller must report the outcome with
    /// `on_success` or `on_failure` when this returns true.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.total_requests += 1;
                true
            }
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if elapsed {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    inner.total_requests += 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_requests {
                    inner.half_open_in_flight += 1;
                    inner.total_requests += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Report a successful request.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.consecutive_failures = 0;
                inner.total_failures = 0;
                inner.total_requests = 0;
                self.transition(&mut inner, BreakerState::Closed);
            }
            _ => {
                inner.consecutive_failures = 0;
            }
        }
    }

    /// Report a failed request.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.total_failures += 1;
        inner.consecutive_failures += 1;

        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed => {
                let rate_tripped = inner.total_requests >= self.config.min_requests
                    && (inner.total_failures as f64 / inner.total_requests as f64)
                        >= self.config.failure_threshold;
                if inner.consecutive_failures >= self.config.max_failures || rate_tripped {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: BreakerState) {
        if inner.state != next {
            log::info!("circuit breaker {:?} -> {:?}", inner.state, next);
            inner.state = next;
            // watch::send never runs subscriber code; delivery is async.
            let _ = self.state_tx.send(next);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
