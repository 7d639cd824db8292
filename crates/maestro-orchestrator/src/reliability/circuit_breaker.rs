use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Dispatches flow normally.
    #[default]
    Closed,
    /// Dispatches are refused until the recovery timeout elapses.
    Open,
    /// One trial dispatch is allowed; its outcome closes or re-opens the breaker.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time spent open before a trial is allowed.
    #[serde(with = "maestro_core::duration_ms")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters exposed to monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Current position.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Successful executions.
    pub total_successes: u64,
    /// Failed executions.
    pub total_failures: u64,
    /// Dispatches refused while open or while a trial was in flight.
    pub rejected: u64,
    /// Transitions into `Open`.
    pub times_opened: u64,
}

impl CircuitBreakerStats {
    /// Successes over all outcomes; 1.0 before any.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_successes + self.total_failures;
        if total == 0 {
            1.0
        } else {
            self.total_successes as f64 / total as f64
        }
    }
}

struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    stats: CircuitBreakerStats,
}

/// Consecutive-failure circuit breaker guarding one agent type.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Closed breaker named after the agent type it guards.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                trial_in_flight: false,
                stats: CircuitBreakerStats::default(),
            }),
        }
    }

    /// Agent type guarded by this breaker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, moving `Open` to `HalfOpen` once the recovery timeout passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.recovery_timeout)
        {
            inner.state = CircuitState::HalfOpen;
            inner.stats.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            info!(agent_type = %self.name, "Circuit breaker half-open, allowing one trial");
        }
    }

    /// Ask permission to dispatch. In half-open state only one caller gets `true`
    /// until that trial reports back. A refusal is counted in the stats.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        let allowed = self.permit(&mut inner);
        if !allowed {
            inner.stats.rejected += 1;
        }
        allowed
    }

    /// Like [`CircuitBreaker::allow_request`] without counting a refusal.
    ///
    /// For callers that re-ask on every tick and report refusals themselves
    /// through [`CircuitBreaker::record_rejection`].
    pub fn poll_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.permit(&mut inner)
    }

    /// Count one refused dispatch.
    pub fn record_rejection(&self) {
        self.inner.lock().stats.rejected += 1;
    }

    fn permit(&self, inner: &mut BreakerState) -> bool {
        self.maybe_half_open(inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Give back a half-open permit that was never used for an execution.
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Close the breaker and reset the failure streak.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.stats.total_successes += 1;
        inner.stats.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            info!(agent_type = %self.name, "Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.stats.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Count a terminal failure; opens at the threshold or after a failed trial.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.stats.total_failures += 1;
        inner.stats.consecutive_failures += 1;
        let open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                inner.stats.consecutive_failures >= self.config.failure_threshold.max(1)
            }
            CircuitState::Open => false,
        };
        if open {
            self.open(&mut inner);
        }
    }

    /// Failure that will be retried: only a failed half-open trial counts.
    pub fn record_transient_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.stats.total_failures += 1;
            self.open(&mut inner);
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.stats.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        inner.stats.times_opened += 1;
        warn!(
            agent_type = %self.name,
            consecutive_failures = inner.stats.consecutive_failures,
            recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.stats.clone()
    }
}

/// One breaker per agent type, created on first use.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Empty registry; breakers are created with `config` on first use.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get a reference to the shared breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker for an agent type, created on first use.
    pub fn get(&self, agent_type: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(agent_type) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(agent_type.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(agent_type, self.config.clone()))
        }))
    }

    /// State of an agent type's breaker; `Closed` if none exists yet.
    pub fn state(&self, agent_type: &str) -> CircuitState {
        self.breakers
            .read()
            .get(agent_type)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Stats of every breaker by agent type.
    pub fn stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "coder",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
            },
        )
    }

    #[test]
    fn test_initial_state_closed() {
        let b = breaker(3, 100);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allow_request());
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let b = breaker(3, 100);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().consecutive_failures, 2);
    }

    #[test]
    fn test_three_failures_open_then_one_trial() {
        let b = breaker(3, 40);
        for _ in 0..3 {
            assert!(b.allow_request());
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow_request(), "fourth dispatch must be refused");

        std::thread::sleep(Duration::from_millis(60));
        assert!(b.allow_request(), "one trial after recovery timeout");
        assert!(!b.allow_request(), "only one trial at a time");
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allow_request());

        let stats = b.stats();
        assert_eq!(stats.times_opened, 1);
        assert_eq!(stats.rejected, 2);
    }

    #[test]
    fn test_polling_does_not_inflate_rejections() {
        let b = breaker(1, 60_000);
        b.record_failure();
        for _ in 0..20 {
            assert!(!b.poll_request());
        }
        assert_eq!(b.stats().rejected, 0);
        b.record_rejection();
        assert_eq!(b.stats().rejected, 1);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let b = breaker(1, 20);
        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.allow_request());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.stats().times_opened, 2);
    }

    #[test]
    fn test_transient_failure_only_counts_during_trial() {
        let b = breaker(1, 20);
        b.record_transient_failure();
        assert_eq!(b.state(), CircuitState::Closed);

        b.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(b.allow_request());
        b.record_transient_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_released_trial_can_be_reacquired() {
        let b = breaker(1, 10);
        b.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.allow_request());
        b.release_trial();
        assert!(b.allow_request());
    }

    #[test]
    fn test_registry_shares_breaker_per_type() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        });
        registry.get("coder").record_failure();
        assert_eq!(registry.state("coder"), CircuitState::Open);
        assert_eq!(registry.state("reviewer"), CircuitState::Closed);
        assert!(!registry.get("coder").allow_request());
        assert_eq!(registry.stats().len(), 1);
    }
}
