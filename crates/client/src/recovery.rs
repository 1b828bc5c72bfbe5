//! Failure recovery primitives: circuit breaker and exponential backoff.
//!
//! A `CircuitBreaker` guards one relay endpoint. Repeated failures open the
//! breaker and block traffic until a recovery window elapses, after which a
//! single probe is allowed (half-open). Enough consecutive probe successes
//! close the breaker again.

use rand::Rng;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, traffic allowed
    Closed,
    /// Too many failures, traffic blocked until the recovery window elapses
    Open,
    /// Recovery window elapsed, probing with limited traffic
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    next_retry_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Read-only view of a breaker for status display.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub next_retry_at: Option<Instant>,
}

/// Per-relay circuit breaker.
///
/// Interior-mutable so one instance can be shared between the send path and
/// status readers. Critical sections are short; a plain mutex suffices.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    recovery_window: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker with explicit thresholds.
    pub fn new(failure_threshold: u32, success_threshold: u32, recovery_window: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            recovery_window,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                next_retry_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a send attempt is currently allowed.
    ///
    /// An open breaker whose recovery window has elapsed transitions to
    /// half-open and allows exactly one probe; further calls return false
    /// until that probe is resolved by `record_success` or `record_failure`.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .next_retry_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful operation against this relay.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                // Tolerate isolated blips without a full reset
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_retry_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation against this relay.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.last_failure_at = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.next_retry_at = Some(now + self.recovery_window);
                }
            }
            CircuitState::HalfOpen => {
                // Failed probe reopens the breaker
                inner.state = CircuitState::Open;
                inner.probe_in_flight = false;
                inner.success_count = 0;
                inner.next_retry_at = Some(now + self.recovery_window);
            }
            CircuitState::Open => {
                inner.next_retry_at = Some(now + self.recovery_window);
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Earliest time the breaker will allow a probe, if currently open.
    pub fn next_retry_at(&self) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Open => inner.next_retry_at,
            _ => None,
        }
    }

    /// Snapshot for status display.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            next_retry_at: inner.next_retry_at,
        }
    }

    /// Reset to closed with all counters cleared.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_at = None;
        inner.next_retry_at = None;
        inner.probe_in_flight = false;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, 3, Duration::from_secs(60))
    }
}

/// Exponential backoff schedule with uniform jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a schedule: `base_delay * 2^attempt` capped at `max_delay`,
    /// with up to `max_attempts` delays before giving up (0 = unlimited).
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            jitter: Duration::from_secs(1),
            attempt: 0,
        }
    }

    /// The delay for a given attempt number, jittered by +/- the jitter
    /// bound to avoid synchronized retry storms.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        // Cap the exponent so the shift cannot overflow
        let factor = 1u64 << attempt.min(20);
        let raw_ms = base_ms.saturating_mul(factor).min(self.max_delay.as_millis() as u64);

        // Jitter never exceeds the delay itself, so short schedules stay short
        let jitter_ms = (self.jitter.as_millis() as i64).min(raw_ms as i64);
        let offset = if jitter_ms > 0 {
            rand::rng().random_range(-jitter_ms..=jitter_ms)
        } else {
            0
        };
        let jittered = (raw_ms as i64 + offset).max(0) as u64;
        Duration::from_millis(jittered)
    }

    /// Next delay in the schedule, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset the schedule after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), 5)
    }
}
