//! Circuit Breaker with a single half-open trial and escalating open periods
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Too many hard failures, requests are rejected until the open period ends
//! - HalfOpen: Exactly one trial request is allowed through
//!
//! Every re-open from HalfOpen doubles the open period up to a cap. A successful
//! trial closes the circuit and resets the backoff. A trial that reports nothing
//! within the trial timeout counts as failed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    #[default]
    Closed,
    /// Service is failing - requests are rejected immediately
    Open,
    /// Cooldown elapsed - a single trial request decides the next state
    HalfOpen,
}

/// State change produced by a breaker operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened { duration: Duration },
    HalfOpened,
    Closed,
}

/// Identifies one half-open trial. Only its holder can release or settle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrialId(u64);

/// Result of asking the breaker whether a request may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPermit {
    /// Circuit closed, request may proceed
    Pass,
    /// Circuit half-open, this request is the single trial
    Trial(TrialId),
    /// Circuit open (or trial already taken)
    Reject { retry_after: Duration },
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive hard failures before opening the circuit
    pub failure_threshold: u32,
    /// First open period
    pub open_duration: Duration,
    /// Upper bound for the escalated open period
    pub max_open_duration: Duration,
    /// How long a trial may stay unsettled before it counts as failed
    pub trial_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            max_open_duration: Duration::from_secs(600),
            trial_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with custom failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Create a new configuration with custom first open period
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Create a new configuration with custom open period cap
    pub fn with_max_open_duration(mut self, duration: Duration) -> Self {
        self.max_open_duration = duration;
        self
    }

    /// Create a new configuration with custom trial timeout
    pub fn with_trial_timeout(mut self, duration: Duration) -> Self {
        self.trial_timeout = duration;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Trial {
    id: TrialId,
    started: Instant,
}

/// Circuit breaker for managing exchange failures
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use exchange_coordinator::common::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_open_duration(Duration::from_secs(30));
///
/// let mut cb = CircuitBreaker::new(config);
///
/// cb.record_failure();
/// cb.record_failure();
/// cb.record_failure();
///
/// assert_eq!(cb.state(), CircuitState::Open);
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    reopen_count: u32,
    opened_at: Option<Instant>,
    current_open_duration: Duration,
    trial: Option<Trial>,
    next_trial: u64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            reopen_count: 0,
            opened_at: None,
            current_open_duration: config.open_duration,
            trial: None,
            next_trial: 0,
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Current state, without advancing Open → HalfOpen
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Number of times the circuit re-opened after a failed trial
    pub fn reopen_count(&self) -> u32 {
        self.reopen_count
    }

    /// Length of the current (or most recent) open period
    pub fn current_open_duration(&self) -> Duration {
        self.current_open_duration
    }

    /// Time left before an open circuit allows a trial
    pub fn open_remaining(&self) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => self.current_open_duration.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Whether `id` is the trial currently in flight
    pub fn holds_trial(&self, id: TrialId) -> bool {
        self.state == CircuitState::HalfOpen && self.trial.is_some_and(|t| t.id == id)
    }

    /// Advance Open → HalfOpen once the open period has elapsed, and reopen
    /// a HalfOpen circuit whose trial outlived the trial timeout
    pub fn poll(&mut self) -> Option<CircuitTransition> {
        match self.state {
            CircuitState::Open if self.open_remaining().is_zero() => {
                tracing::info!("Circuit breaker transitioning to HalfOpen state");
                self.state = CircuitState::HalfOpen;
                self.trial = None;
                Some(CircuitTransition::HalfOpened)
            }
            CircuitState::HalfOpen
                if self
                    .trial
                    .is_some_and(|t| t.started.elapsed() >= self.config.trial_timeout) =>
            {
                tracing::warn!(
                    "Circuit breaker re-opened: trial unsettled after {:?}",
                    self.config.trial_timeout
                );
                Some(self.open(true))
            }
            _ => None,
        }
    }

    /// Ask whether a request may proceed.
    ///
    /// In HalfOpen exactly one caller receives [`CircuitPermit::Trial`]; the
    /// trial slot stays taken until its holder settles or releases it, or
    /// the trial timeout passes.
    pub fn permit(&mut self) -> CircuitPermit {
        self.poll();
        match self.state {
            CircuitState::Closed => CircuitPermit::Pass,
            CircuitState::Open => CircuitPermit::Reject {
                retry_after: self.open_remaining(),
            },
            CircuitState::HalfOpen => match self.trial {
                Some(trial) => CircuitPermit::Reject {
                    retry_after: self
                        .config
                        .trial_timeout
                        .saturating_sub(trial.started.elapsed()),
                },
                None => {
                    let id = TrialId(self.next_trial);
                    self.next_trial = self.next_trial.wrapping_add(1);
                    self.trial = Some(Trial {
                        id,
                        started: Instant::now(),
                    });
                    CircuitPermit::Trial(id)
                }
            },
        }
    }

    /// Give back a trial permit that was never used. Returns false if `id`
    /// no longer holds the trial.
    pub fn release_trial(&mut self, id: TrialId) -> bool {
        if !self.holds_trial(id) {
            return false;
        }
        self.trial = None;
        true
    }

    /// Settle the trial held by `id`.
    ///
    /// A success closes the circuit, a failure reopens it with a longer open
    /// period. A stale id changes nothing.
    pub fn finish_trial(&mut self, id: TrialId, success: bool) -> Option<CircuitTransition> {
        if !self.holds_trial(id) {
            tracing::debug!("Ignoring result of stale trial {:?}", id);
            return None;
        }
        if success {
            self.record_success()
        } else {
            self.record_failure()
        }
    }

    /// Record a successful operation
    ///
    /// In Closed state: resets failure count
    /// In HalfOpen state: closes the circuit and resets the backoff
    pub fn record_success(&mut self) -> Option<CircuitTransition> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                tracing::info!("Circuit breaker closed after successful trial");
                self.close();
                Some(CircuitTransition::Closed)
            }
            // A late success from a call admitted before the circuit opened
            CircuitState::Open => None,
        }
    }

    /// Record a hard failure
    ///
    /// In Closed state: increments failure count, may open circuit
    /// In HalfOpen state: immediately reopens circuit with a longer open period
    pub fn record_failure(&mut self) -> Option<CircuitTransition> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        "Circuit breaker opened after {} consecutive failures",
                        self.consecutive_failures
                    );
                    Some(self.open(false))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Circuit breaker re-opened due to failed trial");
                Some(self.open(true))
            }
            CircuitState::Open => None,
        }
    }

    /// Open the circuit on an explicit signal (e.g. exchange rate limit),
    /// regardless of the failure count
    pub fn trip(&mut self) -> Option<CircuitTransition> {
        match self.state {
            CircuitState::Closed => {
                tracing::warn!("Circuit breaker tripped by explicit signal");
                Some(self.open(false))
            }
            CircuitState::HalfOpen => Some(self.open(true)),
            CircuitState::Open => {
                // Restart the current period without escalating
                self.opened_at = Some(Instant::now());
                None
            }
        }
    }

    /// Force the circuit closed. Callers must audit every use.
    pub fn force_close(&mut self) -> Option<CircuitTransition> {
        let was_closed = self.state == CircuitState::Closed;
        self.close();
        (!was_closed).then_some(CircuitTransition::Closed)
    }

    fn open(&mut self, escalate: bool) -> CircuitTransition {
        if escalate {
            self.reopen_count = self.reopen_count.saturating_add(1);
        }
        let factor = 2u32.saturating_pow(self.reopen_count);
        self.current_open_duration = self
            .config
            .open_duration
            .saturating_mul(factor)
            .min(self.config.max_open_duration);
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial = None;
        CircuitTransition::Opened {
            duration: self.current_open_duration,
        }
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.reopen_count = 0;
        self.opened_at = None;
        self.current_open_duration = self.config.open_duration;
        self.trial = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_open_duration(Duration::from_millis(10))
                .with_max_open_duration(Duration::from_millis(35)),
        )
    }

    fn take_trial(cb: &mut CircuitBreaker) -> TrialId {
        match cb.permit() {
            CircuitPermit::Trial(id) => id,
            other => panic!("expected trial, got {:?}", other),
        }
    }

    #[test]
    fn test_initial_state_is_closed() {
        let mut cb = CircuitBreaker::with_defaults();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.permit(), CircuitPermit::Pass);
    }

    #[test]
    fn test_failure_threshold_opens_circuit() {
        let mut cb = fast_breaker(3);

        assert_eq!(cb.record_failure(), None);
        assert_eq!(cb.record_failure(), None);
        assert_eq!(cb.consecutive_failures(), 2);

        let transition = cb.record_failure();
        assert_eq!(
            transition,
            Some(CircuitTransition::Opened {
                duration: Duration::from_millis(10)
            })
        );
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.permit(), CircuitPermit::Reject { .. }));
    }

    #[test]
    fn test_success_resets_failure_count_in_closed_state() {
        let mut cb = fast_breaker(3);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let mut cb = fast_breaker(1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));

        take_trial(&mut cb);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(cb.permit(), CircuitPermit::Reject { .. }));
    }

    #[test]
    fn test_released_trial_can_be_taken_again() {
        let mut cb = fast_breaker(1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));

        let first = take_trial(&mut cb);
        assert!(cb.release_trial(first));
        let second = take_trial(&mut cb);
        assert_ne!(first, second);
    }

    #[test]
    fn test_stale_trial_id_cannot_release_or_settle() {
        let mut cb = fast_breaker(1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));

        let first = take_trial(&mut cb);
        assert!(cb.release_trial(first));
        let second = take_trial(&mut cb);

        // The old holder no longer owns the slot
        assert!(!cb.release_trial(first));
        assert_eq!(cb.finish_trial(first, true), None);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(cb.permit(), CircuitPermit::Reject { .. }));

        assert_eq!(cb.finish_trial(second, true), Some(CircuitTransition::Closed));
    }

    #[test]
    fn test_unsettled_trial_reopens_after_timeout() {
        let mut cb = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_open_duration(Duration::from_millis(10))
                .with_max_open_duration(Duration::from_millis(35))
                .with_trial_timeout(Duration::from_millis(10)),
        );
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        let abandoned = take_trial(&mut cb);

        std::thread::sleep(Duration::from_millis(15));
        assert!(matches!(cb.permit(), CircuitPermit::Reject { .. }));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.reopen_count(), 1);
        assert_eq!(cb.current_open_duration(), Duration::from_millis(20));

        std::thread::sleep(Duration::from_millis(25));
        let fresh = take_trial(&mut cb);
        assert_eq!(cb.finish_trial(abandoned, true), None);
        assert_eq!(cb.finish_trial(fresh, true), Some(CircuitTransition::Closed));
    }

    #[test]
    fn test_trial_success_closes_circuit() {
        let mut cb = fast_breaker(1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        let trial = take_trial(&mut cb);

        assert_eq!(cb.finish_trial(trial, true), Some(CircuitTransition::Closed));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.reopen_count(), 0);
        assert_eq!(cb.permit(), CircuitPermit::Pass);
    }

    #[test]
    fn test_trial_failure_reopens_with_backoff() {
        let mut cb = fast_breaker(1);
        cb.record_failure();
        assert_eq!(cb.current_open_duration(), Duration::from_millis(10));

        std::thread::sleep(Duration::from_millis(15));
        let trial = take_trial(&mut cb);
        assert_eq!(
            cb.finish_trial(trial, false),
            Some(CircuitTransition::Opened {
                duration: Duration::from_millis(20)
            })
        );

        std::thread::sleep(Duration::from_millis(25));
        take_trial(&mut cb);
        cb.record_failure();
        // 40ms capped at 35ms
        assert_eq!(cb.current_open_duration(), Duration::from_millis(35));
        assert_eq!(cb.reopen_count(), 2);
    }

    #[test]
    fn test_trip_opens_without_threshold() {
        let mut cb = fast_breaker(10);
        assert!(matches!(cb.trip(), Some(CircuitTransition::Opened { .. })));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_force_close() {
        let mut cb = fast_breaker(1);
        cb.record_failure();
        assert_eq!(cb.force_close(), Some(CircuitTransition::Closed));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.force_close(), None);
    }

    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(10)
            .with_open_duration(Duration::from_secs(5))
            .with_max_open_duration(Duration::from_secs(120))
            .with_trial_timeout(Duration::from_secs(15));

        assert_eq!(config.trial_timeout, Duration::from_secs(15));
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.open_duration, Duration::from_secs(5));
        assert_eq!(config.max_open_duration, Duration::from_secs(120));
    }
}
