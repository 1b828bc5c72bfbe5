//! Retry manager: per-relay circuit breakers plus a backoff scheduler for
//! queued messages.
//!
//! Breakers are created lazily on first failure and never shared across
//! relays. Retry timers are keyed by message id; rescheduling a message
//! cancels its prior timer.

use nostr_client::recovery::{BreakerSnapshot, CircuitBreaker, CircuitState, ExponentialBackoff};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Retry policy knobs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retry budget per message
    pub max_retries: u32,
    /// Base backoff delay
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// Consecutive failures before a relay's breaker opens
    pub failure_threshold: u32,
    /// Half-open successes needed to close a breaker
    pub success_threshold: u32,
    /// How long an open breaker blocks before allowing a probe
    pub recovery_window: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            failure_threshold: 5,
            success_threshold: 3,
            recovery_window: Duration::from_secs(60),
        }
    }
}

/// Outcome of a retry eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry budget exhausted; report the message as failed
    GiveUp,
    /// Retry no earlier than this instant
    RetryAt(Instant),
}

/// Retry manager owning the per-relay breaker map and pending retry timers.
pub struct RetryManager {
    config: RetryConfig,
    backoff: ExponentialBackoff,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    timers: Arc<Mutex<HashMap<String, (u64, tokio::task::JoinHandle<()>)>>>,
    next_token: AtomicU64,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        let backoff = ExponentialBackoff::new(config.base_delay, config.max_delay, 0);
        Self {
            config,
            backoff,
            breakers: RwLock::new(HashMap::new()),
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
        }
    }

    /// Retry budget per message.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    fn breaker(&self, relay_url: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap();
            if let Some(b) = breakers.get(relay_url) {
                return Arc::clone(b);
            }
        }
        let mut breakers = self.breakers.write().unwrap();
        Arc::clone(breakers.entry(relay_url.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                self.config.failure_threshold,
                self.config.success_threshold,
                self.config.recovery_window,
            ))
        }))
    }

    /// Record a failed operation against a relay.
    pub fn record_relay_failure(&self, relay_url: &str) {
        self.breaker(relay_url).record_failure();
    }

    /// Record a successful operation against a relay.
    pub fn record_relay_success(&self, relay_url: &str) {
        self.breaker(relay_url).record_success();
    }

    /// Whether a relay may be used right now. A relay with no recorded
    /// failures is always available; an open breaker whose recovery window
    /// has elapsed yields exactly one probe.
    pub fn is_relay_available(&self, relay_url: &str) -> bool {
        let existing = {
            let breakers = self.breakers.read().unwrap();
            breakers.get(relay_url).cloned()
        };
        match existing {
            Some(b) => b.is_allowed(),
            None => true,
        }
    }

    /// Breaker snapshots for status display.
    pub fn relay_health(&self) -> HashMap<String, BreakerSnapshot> {
        let breakers = self.breakers.read().unwrap();
        breakers
            .iter()
            .map(|(url, b)| (url.clone(), b.snapshot()))
            .collect()
    }

    /// Whether every known relay is currently blocked by an open breaker.
    pub fn all_relays_blocked(&self) -> bool {
        let breakers = self.breakers.read().unwrap();
        if breakers.is_empty() {
            return false;
        }
        let now = Instant::now();
        breakers.values().all(|b| {
            let snap = b.snapshot();
            snap.state == CircuitState::Open
                && snap.next_retry_at.map(|at| at > now).unwrap_or(false)
        })
    }

    /// Earliest instant at which any blocked relay becomes probeable.
    pub fn earliest_recovery(&self) -> Option<Instant> {
        let breakers = self.breakers.read().unwrap();
        breakers
            .values()
            .filter_map(|b| b.next_retry_at())
            .min()
    }

    /// Decide whether and when a message should be retried.
    ///
    /// Gives up once the retry budget is spent. Otherwise the backoff delay
    /// for this attempt applies, pushed out to the earliest relay recovery
    /// time when every known relay is blocked.
    pub fn should_retry(&self, retry_count: u32) -> RetryDecision {
        if retry_count >= self.config.max_retries {
            return RetryDecision::GiveUp;
        }
        let mut at = Instant::now() + self.backoff.delay_for(retry_count);
        if self.all_relays_blocked() {
            if let Some(recovery) = self.earliest_recovery() {
                at = at.max(recovery);
            }
        }
        RetryDecision::RetryAt(at)
    }

    /// Schedule a retry task for a message id. Exactly one pending timer per
    /// id: rescheduling cancels the prior timer.
    pub async fn schedule_retry<F>(&self, message_id: &str, at: Instant, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let id = message_id.to_string();

        let handle = {
            let timers = Arc::clone(&timers);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
                task.await;
                // Only clear our own registration; a reschedule may have
                // replaced it already
                let mut map = timers.lock().await;
                if map.get(&id).map(|(t, _)| *t == token).unwrap_or(false) {
                    map.remove(&id);
                }
            })
        };

        let mut map = self.timers.lock().await;
        if let Some((_, old)) = map.insert(id.clone(), (token, handle)) {
            debug!("Rescheduling retry for {}", id);
            old.abort();
        }
    }

    /// Cancel a pending retry timer. Returns true if one existed.
    pub async fn cancel_retry(&self, message_id: &str) -> bool {
        let mut map = self.timers.lock().await;
        match map.remove(message_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending retry timer.
    pub async fn cancel_all(&self) {
        let mut map = self.timers.lock().await;
        for (_, (_, handle)) in map.drain() {
            handle.abort();
        }
    }

    /// Number of pending retry timers.
    pub async fn pending_timers(&self) -> usize {
        self.timers.lock().await.len()
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
