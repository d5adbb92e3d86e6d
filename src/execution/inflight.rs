//! Single-flight slots, one per (pair, side)
//!
//! A slot is claimed atomically before any balance read or exchange call and
//! lives until the order reaches a terminal state or its deadline passes.
//! Each slot carries a generation id so that a late finisher cannot release a
//! slot that has since been swept and re-acquired.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{IdempotencyKey, OrderIntent};

/// In-flight order state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Slot claimed, not yet acknowledged by the exchange
    Pending,

    /// Acknowledged and resting on the book
    Submitted,

    /// Completely filled
    Filled,

    /// Rejected, cancelled or never delivered
    Failed,

    /// Deadline passed with the outcome unknown
    TimedOut,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Failed | Self::TimedOut)
    }
}

/// An order holding its slot
#[derive(Debug, Clone, Serialize)]
pub struct InFlightOrder {
    pub key: IdempotencyKey,
    pub intent: OrderIntent,
    pub state: OrderState,
    pub acquired_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    #[serde(skip)]
    generation: u64,
    #[serde(skip)]
    deadline: Instant,
}

impl InFlightOrder {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Proof of slot ownership returned by [`SlotMap::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotToken {
    pub key: IdempotencyKey,
    generation: u64,
    deadline: Instant,
}

impl SlotToken {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the slot may be swept
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Default)]
pub struct SlotMap {
    slots: DashMap<IdempotencyKey, InFlightOrder>,
    generations: AtomicU64,
}

impl SlotMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for the intent's key, or fail with `DuplicateInFlight`
    pub fn acquire(&self, intent: &OrderIntent, timeout: Duration) -> CoordinatorResult<SlotToken> {
        let key = intent.idempotency_key();
        match self.slots.entry(key.clone()) {
            Entry::Occupied(_) => Err(CoordinatorError::DuplicateInFlight(key)),
            Entry::Vacant(vacant) => {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                let deadline = Instant::now() + timeout;
                vacant.insert(InFlightOrder {
                    key: key.clone(),
                    intent: intent.clone(),
                    state: OrderState::Pending,
                    acquired_at: Utc::now(),
                    order_id: None,
                    nonce: None,
                    size: None,
                    generation,
                    deadline,
                });
                Ok(SlotToken {
                    key,
                    generation,
                    deadline,
                })
            }
        }
    }

    /// Mutate the slot if `token` still owns it
    pub fn update(&self, token: &SlotToken, f: impl FnOnce(&mut InFlightOrder)) -> bool {
        match self.slots.get_mut(&token.key) {
            Some(mut order) if order.generation == token.generation => {
                f(order.value_mut());
                true
            }
            _ => false,
        }
    }

    /// Release the slot if `token` still owns it, recording the final state
    pub fn release(&self, token: &SlotToken, state: OrderState) -> Option<InFlightOrder> {
        self.slots
            .remove_if(&token.key, |_, order| order.generation == token.generation)
            .map(|(_, mut order)| {
                order.state = state;
                order
            })
    }

    /// Release whichever slot holds the exchange order `order_id`
    pub fn release_order(&self, order_id: &str, state: OrderState) -> Option<InFlightOrder> {
        let key = self
            .slots
            .iter()
            .find(|entry| entry.order_id.as_deref() == Some(order_id))
            .map(|entry| entry.key().clone())?;
        self.slots
            .remove_if(&key, |_, order| order.order_id.as_deref() == Some(order_id))
            .map(|(_, mut order)| {
                order.state = state;
                order
            })
    }

    /// Remove and return every slot whose deadline has passed, marked timed out
    pub fn take_expired(&self, now: Instant) -> Vec<InFlightOrder> {
        let mut expired = Vec::new();
        self.slots.retain(|_, order| {
            if order.is_expired(now) {
                let mut order = order.clone();
                order.state = OrderState::TimedOut;
                expired.push(order);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn get(&self, key: &IdempotencyKey) -> Option<InFlightOrder> {
        self.slots.get(key).map(|order| order.clone())
    }

    pub fn contains(&self, key: &IdempotencyKey) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn orders(&self) -> Vec<InFlightOrder> {
        self.slots.iter().map(|entry| entry.value().clone()).collect()
    }
}
