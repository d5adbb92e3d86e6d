//! Execution coordination
//!
//! Turns order intents into exchange orders: single-flight per (pair, side),
//! sized against a fresh funding balance, admitted, nonce-stamped and tracked
//! until terminal.

pub mod coordinator;
pub mod inflight;
pub mod sizing;

pub use coordinator::{
    CoordinatorStatus, ExecutionCoordinator, OrderOutcome, OrderUpdate, SubmitReceipt,
};
pub use inflight::{InFlightOrder, OrderState, SlotMap, SlotToken};
pub use sizing::{size_order, SizedOrder, SizingRules};
