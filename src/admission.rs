//! Rate admission control
//!
//! One controller per connection gates every outbound private request:
//! - a decaying counter per [`RequestClass`] enforces the exchange quota
//! - a circuit breaker shared by all classes stops traffic after repeated
//!   hard failures or an explicit rate-limit signal
//!
//! Quota denials are retryable (`Throttled`). Circuit denials are fail-fast
//! (`CircuitOpen`) until the open period ends. The only ways around an open
//! circuit are [`RateAdmissionController::admit_critical`] and
//! [`RateAdmissionController::override_reset`], and both are audited.
//!
//! An allowed decision carries an [`AdmissionTicket`]. The ticket that holds
//! the half-open trial is the only one whose release or outcome can move the
//! circuit out of HalfOpen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::common::{
    lock, CircuitBreaker, CircuitPermit, CircuitState, CircuitTransition, DecayCounter, TrialId,
};
use crate::config::AdmissionConfig;
use crate::error::{CoordinatorError, GatewayError};
use crate::gateway::CounterStatus;
use crate::types::RequestClass;

/// Cost added to a class counter per admitted request
const REQUEST_COST: f64 = 1.0;

/// Proof that one request of `class` was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionTicket {
    pub class: RequestClass,
    trial: Option<TrialId>,
}

impl AdmissionTicket {
    /// Whether this request is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allowed(AdmissionTicket),
    /// Quota exhausted; retry after the hint
    Throttled { retry_after: Duration },
    /// Circuit open; do not retry before the hint
    CircuitOpen { retry_after: Duration },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed(_))
    }

    pub fn ticket(&self) -> Option<AdmissionTicket> {
        match self {
            AdmissionDecision::Allowed(ticket) => Some(*ticket),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Duration {
        match self {
            AdmissionDecision::Allowed(_) => Duration::ZERO,
            AdmissionDecision::Throttled { retry_after }
            | AdmissionDecision::CircuitOpen { retry_after } => *retry_after,
        }
    }

    /// Convert a denial into the matching typed error
    pub fn into_result(self, class: RequestClass) -> Result<AdmissionTicket, CoordinatorError> {
        match self {
            AdmissionDecision::Allowed(ticket) => Ok(ticket),
            AdmissionDecision::Throttled { retry_after } => {
                Err(CoordinatorError::RateLimited { class, retry_after })
            }
            AdmissionDecision::CircuitOpen { retry_after } => {
                Err(CoordinatorError::CircuitOpen { retry_after })
            }
        }
    }
}

/// Outcome of an admitted request, as reported back by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Exchange said we exceeded its limit
    RateLimited,
    /// Transport failure or server error
    HardFailure,
}

impl Outcome {
    /// Classify a gateway failure for circuit accounting.
    ///
    /// A business rejection still proves the exchange is reachable.
    pub fn for_error(err: &GatewayError) -> Self {
        match err {
            GatewayError::RateLimited { .. } => Outcome::RateLimited,
            GatewayError::Unavailable(_) | GatewayError::Timeout => Outcome::HardFailure,
            GatewayError::InvalidNonce
            | GatewayError::InsufficientFunds
            | GatewayError::Rejected(_) => Outcome::Success,
        }
    }
}

/// An admitted request that has not reported how it ended.
///
/// Dropping it unsettled while it holds the half-open trial records a hard
/// failure, so a cancelled trial reopens the circuit instead of wedging it.
#[must_use = "settle or release the admitted request"]
#[derive(Debug)]
pub struct AdmittedRequest<'a> {
    controller: &'a RateAdmissionController,
    ticket: AdmissionTicket,
    settled: bool,
}

impl AdmittedRequest<'_> {
    pub fn ticket(&self) -> AdmissionTicket {
        self.ticket
    }

    /// Report the outcome; see [`RateAdmissionController::record`]
    pub fn settle(mut self, outcome: Outcome) -> Option<CircuitTransition> {
        self.settled = true;
        self.controller.record(self.ticket, outcome)
    }

    /// Give the admission back without having sent anything
    pub fn release(mut self) {
        self.settled = true;
        self.controller.release(self.ticket);
    }
}

impl Drop for AdmittedRequest<'_> {
    fn drop(&mut self) {
        if !self.settled && self.ticket.is_trial() {
            warn!(
                "Half-open trial for {} abandoned before reporting, counting as failure",
                self.ticket.class
            );
            self.controller.record(self.ticket, Outcome::HardFailure);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    /// A critical intent passed an open circuit
    CriticalBypass,
    /// The circuit was forced closed
    CircuitReset,
}

/// Audit record for every use of an override path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideAudit {
    pub at: DateTime<Utc>,
    pub action: OverrideAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<RequestClass>,
    pub reason: String,
    /// Circuit state when the override was used
    pub circuit: CircuitState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassCounter {
    pub class: RequestClass,
    pub value: f64,
    pub max: f64,
    pub decay_per_sec: f64,
}

/// Point-in-time view of the admission state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub reopen_count: u32,
    pub open_remaining_ms: u64,
    pub counters: Vec<ClassCounter>,
}

#[derive(Debug)]
struct AdmissionState {
    counters: HashMap<RequestClass, DecayCounter>,
    breaker: CircuitBreaker,
    audit: VecDeque<OverrideAudit>,
}

impl AdmissionState {
    fn counter(&mut self, class: RequestClass) -> &mut DecayCounter {
        // Every class is inserted at construction
        self.counters
            .entry(class)
            .or_insert_with(|| DecayCounter::new(Default::default()))
    }

    fn record_audit(&mut self, entry: OverrideAudit, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.audit.len() >= capacity {
            self.audit.pop_front();
        }
        self.audit.push_back(entry);
    }
}

/// Admission controller for one connection
#[derive(Debug)]
pub struct RateAdmissionController {
    state: Mutex<AdmissionState>,
    audit_capacity: usize,
}

impl RateAdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        let counters = RequestClass::ALL
            .into_iter()
            .map(|class| (class, DecayCounter::new(config.counter(class))))
            .collect();

        Self {
            state: Mutex::new(AdmissionState {
                counters,
                breaker: CircuitBreaker::new(config.circuit_breaker()),
                audit: VecDeque::new(),
            }),
            audit_capacity: config.audit_capacity,
        }
    }

    /// Decide whether a request of `class` may go out now.
    ///
    /// Quota is checked before the circuit so a throttled caller never takes
    /// the single half-open trial.
    pub fn admit(&self, class: RequestClass) -> AdmissionDecision {
        let mut state = lock(&self.state);

        if let Err(retry_after) = state.counter(class).check(REQUEST_COST) {
            debug!("Admission throttled for {} (retry after {:?})", class, retry_after);
            return AdmissionDecision::Throttled { retry_after };
        }

        let trial = match state.breaker.permit() {
            CircuitPermit::Pass => None,
            CircuitPermit::Trial(id) => {
                info!("Admitting half-open trial request for {}", class);
                Some(id)
            }
            CircuitPermit::Reject { retry_after } => {
                debug!("Admission refused for {}: circuit open", class);
                return AdmissionDecision::CircuitOpen { retry_after };
            }
        };

        state.counter(class).consume(REQUEST_COST);
        AdmissionDecision::Allowed(AdmissionTicket { class, trial })
    }

    /// Like [`admit`](Self::admit), but a caller-flagged critical request may
    /// pass an open circuit. Quota denials are never bypassed.
    pub fn admit_critical(&self, class: RequestClass, reason: &str) -> AdmissionDecision {
        let mut state = lock(&self.state);

        if let Err(retry_after) = state.counter(class).check(REQUEST_COST) {
            return AdmissionDecision::Throttled { retry_after };
        }

        let trial = match state.breaker.permit() {
            CircuitPermit::Pass => None,
            CircuitPermit::Trial(id) => Some(id),
            CircuitPermit::Reject { .. } => {
                let circuit = state.breaker.state();
                warn!(
                    "Critical override: {} request passes {:?} circuit ({})",
                    class, circuit, reason
                );
                let entry = OverrideAudit {
                    at: Utc::now(),
                    action: OverrideAction::CriticalBypass,
                    class: Some(class),
                    reason: reason.to_string(),
                    circuit,
                };
                state.record_audit(entry, self.audit_capacity);
                None
            }
        };

        state.counter(class).consume(REQUEST_COST);
        AdmissionDecision::Allowed(AdmissionTicket { class, trial })
    }

    /// Wait through quota denials for at most `max_wait`.
    ///
    /// Circuit-open denials return immediately.
    pub async fn admit_wait(&self, class: RequestClass, max_wait: Duration) -> AdmissionDecision {
        let deadline = Instant::now() + max_wait;
        loop {
            let decision = self.admit(class);
            let retry_after = match decision {
                AdmissionDecision::Throttled { retry_after } => retry_after,
                _ => return decision,
            };

            let wake = Instant::now()
                .checked_add(retry_after.max(Duration::from_millis(1)))
                .unwrap_or(deadline);
            if wake > deadline {
                return decision;
            }
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Hold `ticket` until its outcome is known
    pub fn track(&self, ticket: AdmissionTicket) -> AdmittedRequest<'_> {
        AdmittedRequest {
            controller: self,
            ticket,
            settled: false,
        }
    }

    /// Give back an admission that was never used. Frees the half-open trial
    /// only if `ticket` is the one holding it.
    pub fn release(&self, ticket: AdmissionTicket) {
        if let Some(id) = ticket.trial {
            if lock(&self.state).breaker.release_trial(id) {
                debug!("Released unused half-open trial for {}", ticket.class);
            }
        }
    }

    /// Record how the request behind `ticket` ended.
    ///
    /// While the circuit is half-open only the trial ticket decides whether
    /// it closes or reopens; other tickets are requests admitted before the
    /// circuit opened. An exchange rate-limit signal always trips.
    ///
    /// Returns the circuit transition it caused, if any. A transition to
    /// `Closed` means every cached balance should be treated as suspect.
    pub fn record(&self, ticket: AdmissionTicket, outcome: Outcome) -> Option<CircuitTransition> {
        let mut state = lock(&self.state);
        let transition = match (outcome, ticket.trial) {
            (Outcome::RateLimited, _) => rate_limited(&mut state, ticket.class),
            (_, Some(id)) => state.breaker.finish_trial(id, outcome == Outcome::Success),
            (_, None) if state.breaker.state() == CircuitState::HalfOpen => None,
            (Outcome::Success, None) => state.breaker.record_success(),
            (Outcome::HardFailure, None) => state.breaker.record_failure(),
        };
        log_opened(transition, ticket.class);
        transition
    }

    /// Record an outcome not tied to an admission ticket, such as a failure
    /// observed outside the request path
    pub fn record_result(&self, class: RequestClass, outcome: Outcome) -> Option<CircuitTransition> {
        let mut state = lock(&self.state);
        let transition = match outcome {
            Outcome::Success => state.breaker.record_success(),
            Outcome::HardFailure => state.breaker.record_failure(),
            Outcome::RateLimited => rate_limited(&mut state, class),
        };
        log_opened(transition, class);
        transition
    }

    /// Force the circuit closed. Audited; the only way to close it early.
    pub fn override_reset(&self, reason: &str) -> Option<CircuitTransition> {
        let mut state = lock(&self.state);
        let circuit = state.breaker.state();
        warn!("Circuit override reset from {:?}: {}", circuit, reason);

        let entry = OverrideAudit {
            at: Utc::now(),
            action: OverrideAction::CircuitReset,
            class: None,
            reason: reason.to_string(),
            circuit,
        };
        state.record_audit(entry, self.audit_capacity);
        state.breaker.force_close()
    }

    /// Seed counters from what the exchange reports, so a restarted process
    /// does not assume an empty quota
    pub fn sync_from_gateway(&self, statuses: &[CounterStatus]) {
        let mut state = lock(&self.state);
        for status in statuses {
            let counter = state.counter(status.class);
            let configured = *counter.config();
            if (configured.max_counter - status.max_counter).abs() > f64::EPSILON
                || (configured.decay_per_sec - status.decay_per_sec).abs() > f64::EPSILON
            {
                warn!(
                    "Exchange reports {} limit {}/{}/s, configured {}/{}/s",
                    status.class,
                    status.max_counter,
                    status.decay_per_sec,
                    configured.max_counter,
                    configured.decay_per_sec
                );
            }
            counter.seed(status.counter);
            debug!("Seeded {} counter at {}", status.class, status.counter);
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        let mut state = lock(&self.state);
        state.breaker.poll();
        state.breaker.state()
    }

    pub fn audit_log(&self) -> Vec<OverrideAudit> {
        lock(&self.state).audit.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let mut state = lock(&self.state);
        state.breaker.poll();

        let counters = RequestClass::ALL
            .into_iter()
            .map(|class| {
                let counter = state.counter(class);
                let config = *counter.config();
                ClassCounter {
                    class,
                    value: counter.value(),
                    max: config.max_counter,
                    decay_per_sec: config.decay_per_sec,
                }
            })
            .collect();

        AdmissionSnapshot {
            circuit: state.breaker.state(),
            consecutive_failures: state.breaker.consecutive_failures(),
            reopen_count: state.breaker.reopen_count(),
            open_remaining_ms: state.breaker.open_remaining().as_millis() as u64,
            counters,
        }
    }
}

fn rate_limited(state: &mut AdmissionState, class: RequestClass) -> Option<CircuitTransition> {
    warn!("Exchange rate limit hit on {} requests", class);
    state.counter(class).saturate();
    state.breaker.trip()
}

fn log_opened(transition: Option<CircuitTransition>, class: RequestClass) {
    if let Some(CircuitTransition::Opened { duration }) = transition {
        warn!("Admission circuit opened for {:?} ({} outcome)", duration, class);
    }
}
