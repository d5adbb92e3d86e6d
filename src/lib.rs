//! Exchange Coordinator
//!
//! The coordination layer between trading strategies and a rate-limited
//! cryptocurrency exchange: strictly increasing nonces that survive restarts,
//! decay-counter admission with a circuit breaker, a balance ledger fed by both
//! a push stream and pulled snapshots, and single-flight order execution.

pub mod admission;
pub mod balance;
pub mod common;
pub mod config;
pub mod connection;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod nonce;
pub mod types;

pub use admission::{
    AdmissionDecision, AdmissionTicket, AdmittedRequest, Outcome, RateAdmissionController,
};
pub use balance::{BalanceEntry, BalanceStateStore, DualChannelSync, Freshness, InvalidationReason};
pub use config::CoordinatorConfig;
pub use connection::Connection;
pub use error::{CoordinatorError, CoordinatorResult, ErrorKind, GatewayError};
pub use execution::{ExecutionCoordinator, OrderOutcome, SubmitReceipt};
pub use gateway::{ExchangeGateway, PaperGateway};
pub use nonce::NonceSequencer;
pub use types::*;
