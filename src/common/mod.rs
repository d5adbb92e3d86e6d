//! Common building blocks shared by the coordinator components
//!
//! - Circuit breaker with a single half-open trial and escalating open periods
//! - Decaying request counter for exchange call quotas
//! - Bounded retry with exponential backoff

pub mod circuit_breaker;
pub mod decay_counter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitState, CircuitTransition, TrialId,
};
pub use decay_counter::{DecayCounter, DecayCounterConfig};
pub use retry::{retry_bounded, Exhausted, RetryPolicy};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
