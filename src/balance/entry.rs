//! Balance entries and their ordering markers

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tokio::time::Instant;

/// Channel an accepted update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceSource {
    Stream,
    Pull,
}

/// Comparable position of an update in the account's history.
///
/// Two stream markers compare by sequence number. Any other pair compares by
/// wall-clock time: stream `observed_at` against pull `taken_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum OrderingMarker {
    Stream {
        sequence: u64,
        observed_at: DateTime<Utc>,
    },
    Pull {
        taken_at: DateTime<Utc>,
    },
}

impl OrderingMarker {
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            OrderingMarker::Stream { observed_at, .. } => *observed_at,
            OrderingMarker::Pull { taken_at } => *taken_at,
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            OrderingMarker::Stream { sequence, .. } => Some(*sequence),
            OrderingMarker::Pull { .. } => None,
        }
    }

    pub fn source(&self) -> BalanceSource {
        match self {
            OrderingMarker::Stream { .. } => BalanceSource::Stream,
            OrderingMarker::Pull { .. } => BalanceSource::Pull,
        }
    }

    pub fn compare(&self, other: &OrderingMarker) -> Ordering {
        match (self, other) {
            (
                OrderingMarker::Stream { sequence: a, .. },
                OrderingMarker::Stream { sequence: b, .. },
            ) => a.cmp(b),
            _ => self.time().cmp(&other.time()),
        }
    }
}

/// How much a read can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    /// Nothing heard within the staleness window
    Stale,
    /// Waiting for a pull taken after the invalidation
    Invalidated,
    /// Both channels silent beyond the hard deadline
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    TradeCompleted,
    CircuitReset,
    ChannelMismatch,
    ManualRefresh,
    OrderTimedOut,
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvalidationReason::TradeCompleted => "trade completed",
            InvalidationReason::CircuitReset => "circuit reset",
            InvalidationReason::ChannelMismatch => "channel mismatch",
            InvalidationReason::ManualRefresh => "manual refresh",
            InvalidationReason::OrderTimedOut => "order timed out",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    pub reason: InvalidationReason,
    pub at: DateTime<Utc>,
}

/// Cached balance of one asset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceEntry {
    pub asset: String,
    pub available: Decimal,
    /// Held in open orders
    pub locked: Decimal,
    pub source: BalanceSource,
    /// Highest marker accepted so far
    pub marker: OrderingMarker,
    /// Highest stream sequence seen, kept when a pull takes over the marker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stream_sequence: Option<u64>,
    pub stale: bool,
    pub freshness: Freshness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidation: Option<Invalidation>,
    /// Pulls taken at or before this instant predate an optimistic reservation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) stream_heard: Option<Instant>,
    #[serde(skip)]
    pub(crate) pull_heard: Option<Instant>,
}

impl BalanceEntry {
    pub(crate) fn new(
        asset: &str,
        available: Decimal,
        locked: Decimal,
        marker: OrderingMarker,
        heard: Instant,
    ) -> Self {
        let (stream_heard, pull_heard) = match marker.source() {
            BalanceSource::Stream => (Some(heard), None),
            BalanceSource::Pull => (None, Some(heard)),
        };
        Self {
            asset: asset.to_string(),
            available,
            locked,
            source: marker.source(),
            marker,
            last_stream_sequence: marker.sequence(),
            stale: false,
            freshness: Freshness::Fresh,
            invalidation: None,
            reserved_at: None,
            stream_heard,
            pull_heard,
        }
    }

    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }

    /// Most recent arrival on either channel
    pub fn last_heard(&self) -> Option<Instant> {
        match (self.stream_heard, self.pull_heard) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn heard(&mut self, source: BalanceSource, at: Instant) {
        match source {
            BalanceSource::Stream => self.stream_heard = Some(at),
            BalanceSource::Pull => self.pull_heard = Some(at),
        }
    }

    pub(crate) fn overwrite(&mut self, available: Decimal, locked: Decimal, marker: OrderingMarker) {
        self.available = available;
        self.locked = locked;
        self.marker = marker;
        self.source = marker.source();
        self.stale = false;
    }
}
