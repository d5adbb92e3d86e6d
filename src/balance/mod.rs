//! Balance ledger and its two feeds

pub mod entry;
pub mod store;
pub mod sync;

pub use entry::{
    BalanceEntry, BalanceSource, Freshness, Invalidation, InvalidationReason, OrderingMarker,
};
pub use store::{ApplyOutcome, BalanceStateStore, SnapshotReport};
pub use sync::DualChannelSync;
