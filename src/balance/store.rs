//! In-memory balance ledger
//!
//! The single source of truth for balances on a connection. Entries only move
//! forward: an update is applied when its marker is strictly greater than the
//! stored one, ignored when equal and discarded when lower. Reads classify the
//! entry by how recently either channel was heard from.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::entry::{
    BalanceEntry, BalanceSource, Freshness, Invalidation, InvalidationReason, OrderingMarker,
};
use crate::common::{lock, CircuitTransition};
use crate::config::BalanceConfig;
use crate::gateway::{AssetAmount, BalanceSnapshot};

/// What happened to an incoming update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Marker was greater; entry replaced
    Applied,
    /// Marker was equal; nothing changed
    Unchanged,
    /// Marker was lower; update dropped
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    pub applied: usize,
    pub unchanged: usize,
    pub discarded: usize,
}

fn normalize(asset: &str) -> String {
    asset.trim().to_uppercase()
}

#[derive(Debug)]
pub struct BalanceStateStore {
    entries: DashMap<String, BalanceEntry>,
    config: BalanceConfig,
    /// `taken_at` and local arrival of the last full snapshot
    last_snapshot: Mutex<Option<(DateTime<Utc>, Instant)>>,
}

impl BalanceStateStore {
    pub fn new(config: BalanceConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            last_snapshot: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BalanceConfig {
        &self.config
    }

    pub fn apply_stream_update(
        &self,
        asset: &str,
        amount: AssetAmount,
        sequence: u64,
        observed_at: DateTime<Utc>,
    ) -> ApplyOutcome {
        self.apply(
            asset,
            amount,
            OrderingMarker::Stream {
                sequence,
                observed_at,
            },
        )
    }

    pub fn apply_pull(&self, asset: &str, amount: AssetAmount, taken_at: DateTime<Utc>) -> ApplyOutcome {
        self.apply(asset, amount, OrderingMarker::Pull { taken_at })
    }

    /// Apply a complete account snapshot.
    ///
    /// Tracked assets missing from the snapshot are taken to be zero.
    pub fn apply_snapshot(&self, snapshot: &BalanceSnapshot) -> SnapshotReport {
        let mut report = SnapshotReport::default();
        let mut seen = Vec::with_capacity(snapshot.balances.len());

        for (asset, amount) in &snapshot.balances {
            let asset = normalize(asset);
            match self.apply(&asset, *amount, OrderingMarker::Pull { taken_at: snapshot.taken_at }) {
                ApplyOutcome::Applied => report.applied += 1,
                ApplyOutcome::Unchanged => report.unchanged += 1,
                ApplyOutcome::Discarded => report.discarded += 1,
            }
            seen.push(asset);
        }

        let missing: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|asset| !seen.contains(asset))
            .collect();
        for asset in missing {
            match self.apply(&asset, AssetAmount::default(), OrderingMarker::Pull { taken_at: snapshot.taken_at }) {
                ApplyOutcome::Applied => report.applied += 1,
                ApplyOutcome::Unchanged => report.unchanged += 1,
                ApplyOutcome::Discarded => report.discarded += 1,
            }
        }

        *lock(&self.last_snapshot) = Some((snapshot.taken_at, Instant::now()));
        debug!(
            "Snapshot applied: {} applied, {} unchanged, {} discarded",
            report.applied, report.unchanged, report.discarded
        );
        report
    }

    fn apply(&self, asset: &str, amount: AssetAmount, marker: OrderingMarker) -> ApplyOutcome {
        let asset = normalize(asset);
        let now = Instant::now();

        let mut entry = match self.entries.entry(asset.clone()) {
            Entry::Vacant(vacant) => {
                debug!("New balance entry for {} from {:?}", asset, marker.source());
                vacant.insert(BalanceEntry::new(
                    &asset,
                    amount.available,
                    amount.locked,
                    marker,
                    now,
                ));
                return ApplyOutcome::Applied;
            }
            Entry::Occupied(occupied) => occupied.into_ref(),
        };

        entry.heard(marker.source(), now);

        // Stream order holds even after a pull replaced the stream marker
        if let Some(sequence) = marker.sequence() {
            match entry.last_stream_sequence {
                Some(last) if sequence < last => {
                    debug!(
                        "Stream seq {} for {} is behind seq {}, discarded",
                        sequence, asset, last
                    );
                    return ApplyOutcome::Discarded;
                }
                Some(last) if sequence == last => return ApplyOutcome::Unchanged,
                _ => entry.last_stream_sequence = Some(sequence),
            }
        }

        if let OrderingMarker::Pull { taken_at } = marker {
            if entry.reserved_at.is_some_and(|reserved| taken_at <= reserved) {
                debug!("Pull for {} predates a local reservation, discarded", asset);
                return ApplyOutcome::Discarded;
            }
        }

        let outcome = match marker.compare(&entry.marker) {
            Ordering::Greater => {
                entry.overwrite(amount.available, amount.locked, marker);
                ApplyOutcome::Applied
            }
            Ordering::Equal => ApplyOutcome::Unchanged,
            Ordering::Less => ApplyOutcome::Discarded,
        };

        if let OrderingMarker::Pull { taken_at } = marker {
            if outcome == ApplyOutcome::Discarded && entry.source == BalanceSource::Stream {
                let diff = (amount.total() - entry.total()).abs();
                if diff > self.config.mismatch_tolerance {
                    warn!(
                        "Stream and pull disagree on {} by {} (tolerance {}), invalidating",
                        asset, diff, self.config.mismatch_tolerance
                    );
                    entry.invalidation = Some(Invalidation {
                        reason: InvalidationReason::ChannelMismatch,
                        at: Utc::now(),
                    });
                    return outcome;
                }
            }

            if entry.invalidation.is_some_and(|inv| taken_at > inv.at) {
                debug!("Invalidation of {} cleared by pull taken at {}", asset, taken_at);
                entry.invalidation = None;
            }
        }

        outcome
    }

    /// Read an entry with its freshness classified as of now.
    ///
    /// An asset never seen but absent from a recent full snapshot reads as zero.
    pub fn get(&self, asset: &str) -> Option<BalanceEntry> {
        let asset = normalize(asset);
        let now = Instant::now();

        if let Some(mut entry) = self.entries.get_mut(&asset) {
            self.classify(&mut entry, now);
            return Some(entry.clone());
        }

        let (taken_at, heard) = (*lock(&self.last_snapshot))?;
        if now.saturating_duration_since(heard) > self.config.staleness_window() {
            return None;
        }

        let mut entry = self
            .entries
            .entry(asset.clone())
            .or_insert_with(|| {
                BalanceEntry::new(
                    &asset,
                    Decimal::ZERO,
                    Decimal::ZERO,
                    OrderingMarker::Pull { taken_at },
                    heard,
                )
            });
        self.classify(&mut entry, now);
        Some(entry.clone())
    }

    fn classify(&self, entry: &mut BalanceEntry, now: Instant) {
        let age = entry
            .last_heard()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::MAX);

        let freshness = if age > self.config.hard_deadline() {
            Freshness::Unknown
        } else if entry.invalidation.is_some() {
            Freshness::Invalidated
        } else if age > self.config.staleness_window() {
            Freshness::Stale
        } else {
            Freshness::Fresh
        };

        let stale = matches!(freshness, Freshness::Stale | Freshness::Unknown);
        if stale && !entry.stale {
            info!("Balance for {} is stale (last heard {:?} ago)", entry.asset, age);
        }
        entry.stale = stale;
        entry.freshness = freshness;
    }

    /// Force the next read of `asset` to wait for a fresh pull
    pub fn invalidate(&self, asset: &str, reason: InvalidationReason) -> bool {
        let asset = normalize(asset);
        match self.entries.get_mut(&asset) {
            Some(mut entry) => {
                info!("Balance for {} invalidated: {}", asset, reason);
                entry.invalidation = Some(Invalidation {
                    reason,
                    at: Utc::now(),
                });
                true
            }
            None => {
                debug!("Invalidate for untracked asset {} ignored", asset);
                false
            }
        }
    }

    pub fn invalidate_all(&self, reason: InvalidationReason) -> usize {
        let at = Utc::now();
        let mut count = 0;
        for mut entry in self.entries.iter_mut() {
            entry.invalidation = Some(Invalidation { reason, at });
            count += 1;
        }
        if count > 0 {
            info!("Invalidated {} balance entries: {}", count, reason);
        }
        count
    }

    /// React to an admission circuit transition
    pub fn on_circuit_transition(&self, transition: Option<CircuitTransition>) {
        if transition == Some(CircuitTransition::Closed) {
            self.invalidate_all(InvalidationReason::CircuitReset);
        }
    }

    /// Optimistically move `amount` from available to locked after an order
    /// was accepted. The ordering marker is left untouched.
    pub fn reserve(&self, asset: &str, amount: Decimal) {
        let asset = normalize(asset);
        let Some(mut entry) = self.entries.get_mut(&asset) else {
            warn!("Reservation of {} {} on untracked asset", amount, asset);
            return;
        };

        let moved = if amount > entry.available {
            warn!(
                "Reservation of {} {} exceeds cached available {}",
                amount, asset, entry.available
            );
            entry.available
        } else {
            amount
        };
        entry.available -= moved;
        entry.locked += moved;
        entry.reserved_at = Some(Utc::now());
        debug!("Reserved {} {} (available now {})", moved, asset, entry.available);
    }

    /// Drop every entry (disconnect)
    pub fn clear(&self) {
        let count = self.entries.len();
        self.entries.clear();
        *lock(&self.last_snapshot) = None;
        info!("Balance store cleared ({} entries)", count);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry, classified as of now
    pub fn entries(&self) -> Vec<BalanceEntry> {
        let now = Instant::now();
        let mut out: Vec<BalanceEntry> = self
            .entries
            .iter_mut()
            .map(|mut entry| {
                self.classify(&mut entry, now);
                entry.clone()
            })
            .collect();
        out.sort_by(|a, b| a.asset.cmp(&b.asset));
        out
    }

    pub fn invalidated_assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.invalidation.is_some())
            .map(|e| e.key().clone())
            .collect();
        assets.sort();
        assets
    }
}
