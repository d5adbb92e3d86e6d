//! Push/pull reconciliation into the balance store
//!
//! The push channel delivers per-asset updates with a sequence number. The pull
//! channel fetches the whole account. Both feed [`BalanceStateStore`], which
//! keeps whichever carries the greater marker.
//!
//! Markers are stamped on the local clock: stream updates with their receipt
//! time, snapshots with the time the request was sent. The send time is a lower
//! bound on when the exchange took the snapshot, so a pull sent after an
//! invalidation is guaranteed to reflect everything before it.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::entry::{BalanceEntry, Freshness, InvalidationReason};
use super::store::{ApplyOutcome, BalanceStateStore, SnapshotReport};
use crate::admission::{AdmittedRequest, Outcome, RateAdmissionController};
use crate::common::{lock, retry_bounded};
use crate::config::BalanceConfig;
use crate::error::{CoordinatorError, CoordinatorResult, GatewayError};
use crate::gateway::{BalanceSnapshot, ExchangeGateway, StreamBalanceUpdate};
use crate::nonce::NonceSequencer;
use crate::types::RequestClass;

pub struct DualChannelSync {
    store: Arc<BalanceStateStore>,
    gateway: Arc<dyn ExchangeGateway>,
    sequencer: Arc<NonceSequencer>,
    admission: Arc<RateAdmissionController>,
    config: BalanceConfig,
    /// Serializes forced refreshes so concurrent readers share one pull
    refresh_lock: tokio::sync::Mutex<()>,
    /// Send time of the last applied snapshot
    last_pull: Mutex<Option<DateTime<Utc>>>,
}

impl DualChannelSync {
    pub fn new(
        store: Arc<BalanceStateStore>,
        gateway: Arc<dyn ExchangeGateway>,
        sequencer: Arc<NonceSequencer>,
        admission: Arc<RateAdmissionController>,
    ) -> Self {
        let config = store.config().clone();
        Self {
            store,
            gateway,
            sequencer,
            admission,
            config,
            refresh_lock: tokio::sync::Mutex::new(()),
            last_pull: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<BalanceStateStore> {
        &self.store
    }

    pub fn handle_stream_update(&self, update: StreamBalanceUpdate) -> ApplyOutcome {
        let outcome = self.store.apply_stream_update(
            &update.asset,
            update.amount,
            update.sequence,
            Utc::now(),
        );
        if outcome == ApplyOutcome::Discarded {
            debug!(
                "Stream update for {} (seq {}) is older than the cached entry",
                update.asset, update.sequence
            );
        }
        outcome
    }

    /// Consume the push channel until it closes or shutdown is signalled
    pub async fn run_stream(
        &self,
        mut updates: mpsc::Receiver<StreamBalanceUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Balance stream consumer started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                update = updates.recv() => match update {
                    Some(update) => {
                        self.handle_stream_update(update);
                    }
                    None => {
                        warn!("Balance stream closed by gateway");
                        break;
                    }
                },
            }
        }
        info!("Balance stream consumer stopped");
    }

    /// Pull on a fixed period until shutdown is signalled
    pub async fn run_periodic_pull(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.pull_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("Periodic balance pull failed: {}", e);
                    }
                }
            }
        }
        debug!("Periodic balance pull stopped");
    }

    /// Pull a snapshot unless one sent after this call began has already
    /// been applied
    pub async fn refresh(&self) -> CoordinatorResult<()> {
        let requested_at = Utc::now();
        let _guard = self.refresh_lock.lock().await;

        if lock(&self.last_pull).is_some_and(|t| t >= requested_at) {
            debug!("Balance refresh satisfied by a concurrent pull");
            return Ok(());
        }
        self.pull_now().await.map(|_| ())
    }

    /// Pull and apply a snapshot, retrying network failures
    pub async fn pull_now(&self) -> CoordinatorResult<SnapshotReport> {
        retry_bounded(
            &self.config.refresh_policy(),
            "balance pull",
            || self.pull_once(),
            |e: &CoordinatorError| matches!(e, CoordinatorError::NetworkError { .. }),
        )
        .await
        .map_err(|exhausted| exhausted.last_error)
    }

    async fn pull_once(&self) -> CoordinatorResult<SnapshotReport> {
        let wait = Duration::from_millis(self.config.refresh_admission_wait_ms);
        let ticket = self
            .admission
            .admit_wait(RequestClass::Balance, wait)
            .await
            .into_result(RequestClass::Balance)?;

        let sent_at = Utc::now();
        let snapshot = self.fetch_snapshot(self.admission.track(ticket)).await?;
        debug!(
            "Snapshot of {} assets (exchange time {}, sent {})",
            snapshot.balances.len(),
            snapshot.taken_at,
            sent_at
        );

        let report = self.store.apply_snapshot(&BalanceSnapshot {
            taken_at: sent_at,
            balances: snapshot.balances,
        });
        let mut last = lock(&self.last_pull);
        *last = Some(last.map_or(sent_at, |t| t.max(sent_at)));
        Ok(report)
    }

    /// One admitted snapshot request, with a single retry after a nonce resync.
    ///
    /// If this future is dropped mid-request, `admitted` records the
    /// abandoned attempt.
    async fn fetch_snapshot(
        &self,
        admitted: AdmittedRequest<'_>,
    ) -> CoordinatorResult<BalanceSnapshot> {
        let mut resynced = false;
        loop {
            let nonce = match self.sequencer.next().await {
                Ok(nonce) => nonce,
                Err(e) => {
                    admitted.release();
                    return Err(e);
                }
            };

            match self.gateway.balance_snapshot(nonce).await {
                Ok(snapshot) => {
                    self.store
                        .on_circuit_transition(admitted.settle(Outcome::Success));
                    return Ok(snapshot);
                }
                Err(GatewayError::InvalidNonce) if !resynced => {
                    warn!("Snapshot nonce {} rejected, resyncing", nonce);
                    if let Err(e) = self.sequencer.resync_after_rejection().await {
                        // The exchange did answer the rejected request
                        let outcome = Outcome::for_error(&GatewayError::InvalidNonce);
                        self.store.on_circuit_transition(admitted.settle(outcome));
                        return Err(e);
                    }
                    resynced = true;
                }
                Err(err) => {
                    let transition = admitted.settle(Outcome::for_error(&err));
                    self.store.on_circuit_transition(transition);
                    return Err(CoordinatorError::from_gateway(err, RequestClass::Balance, 1));
                }
            }
        }
    }

    /// Read a balance that is safe to trade against.
    ///
    /// Anything other than a fresh entry forces a pull first. If the pull
    /// cannot make the entry fresh the read fails; it never falls back to the
    /// last known value. A pull cut off by the hard deadline while holding
    /// the half-open trial counts as a failed trial.
    pub async fn get(&self, asset: &str) -> CoordinatorResult<BalanceEntry> {
        let reason = match self.store.get(asset) {
            Some(entry) if entry.freshness == Freshness::Fresh => return Ok(entry),
            Some(entry) => describe(&entry),
            None => "never observed".to_string(),
        };
        debug!("Refreshing {} before read: {}", asset, reason);

        let unknown = |detail: String| CoordinatorError::BalanceUnknown {
            asset: asset.to_uppercase(),
            reason: detail,
        };

        match tokio::time::timeout(self.config.hard_deadline(), self.refresh()).await {
            Ok(Ok(())) => {}
            Ok(Err(e @ (CoordinatorError::CircuitOpen { .. } | CoordinatorError::RateLimited { .. }))) => {
                return Err(e)
            }
            Ok(Err(e)) => return Err(unknown(format!("{}; refresh failed: {}", reason, e))),
            Err(_) => return Err(unknown(format!("{}; refresh timed out", reason))),
        }

        match self.store.get(asset) {
            Some(entry) if entry.freshness == Freshness::Fresh => Ok(entry),
            Some(entry) => Err(unknown(format!("{} after refresh", describe(&entry)))),
            None => Err(unknown("not reported by exchange".to_string())),
        }
    }

    /// Invalidate `asset` so the next read waits for a fresh pull
    pub fn invalidate(&self, asset: &str, reason: InvalidationReason) -> bool {
        self.store.invalidate(asset, reason)
    }
}

fn describe(entry: &BalanceEntry) -> String {
    match (entry.freshness, entry.invalidation) {
        (Freshness::Invalidated, Some(inv)) => format!("invalidated ({})", inv.reason),
        (Freshness::Unknown, _) => "no channel heard within the hard deadline".to_string(),
        (Freshness::Stale, _) => "stale".to_string(),
        (freshness, _) => format!("{:?}", freshness).to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CircuitState;
    use crate::config::{AdmissionConfig, NonceConfig};
    use crate::gateway::PaperGateway;
    use crate::nonce::{now_micros, MemoryNonceStore};
    use rust_decimal_macros::dec;

    struct Harness {
        gateway: Arc<PaperGateway>,
        admission: Arc<RateAdmissionController>,
        sync: Arc<DualChannelSync>,
    }

    async fn harness(config: BalanceConfig) -> Harness {
        harness_with(config, AdmissionConfig::default()).await
    }

    async fn harness_with(config: BalanceConfig, admission: AdmissionConfig) -> Harness {
        let gateway = Arc::new(
            PaperGateway::new()
                .with_balance("USD", dec!(1000))
                .with_balance("XBT", dec!(2)),
        );
        let sequencer = Arc::new(
            NonceSequencer::open("t", NonceConfig::default(), Arc::new(MemoryNonceStore::new()))
                .await
                .unwrap(),
        );
        let admission = Arc::new(RateAdmissionController::new(&admission));
        let store = Arc::new(BalanceStateStore::new(config));
        let sync = Arc::new(DualChannelSync::new(
            store,
            gateway.clone(),
            sequencer,
            admission.clone(),
        ));
        Harness {
            gateway,
            admission,
            sync,
        }
    }

    fn fast_config() -> BalanceConfig {
        BalanceConfig {
            staleness_window_ms: 40,
            hard_deadline_ms: 2_000,
            refresh_attempts: 2,
            ..BalanceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_first_read_pulls() {
        let h = harness(fast_config()).await;
        let entry = h.sync.get("usd").await.unwrap();
        assert_eq!(entry.available, dec!(1000));
        assert_eq!(h.gateway.snapshot_calls(), 1);

        // Fresh read served from cache
        h.sync.get("USD").await.unwrap();
        assert_eq!(h.gateway.snapshot_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_read_forces_refresh() {
        let h = harness(fast_config()).await;
        h.sync.get("USD").await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let entry = h.sync.get("USD").await.unwrap();
        assert_eq!(entry.freshness, Freshness::Fresh);
        assert_eq!(h.gateway.snapshot_calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidated_read_waits_for_new_pull() {
        let h = harness(fast_config()).await;
        h.sync.get("XBT").await.unwrap();

        h.gateway.set_balance("XBT", dec!(1.5));
        assert!(h.sync.invalidate("XBT", InvalidationReason::ManualRefresh));

        let entry = h.sync.get("XBT").await.unwrap();
        assert_eq!(entry.available, dec!(1.5));
        assert!(entry.invalidation.is_none());
    }

    #[tokio::test]
    async fn test_failed_refresh_reports_unknown() {
        let h = harness(fast_config()).await;
        h.gateway.fail_next_snapshots([
            GatewayError::Unavailable("down".into()),
            GatewayError::Unavailable("down".into()),
        ]);

        let err = h.sync.get("USD").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::BalanceUnknown { .. }));
        assert_eq!(h.gateway.snapshot_calls(), 2);
    }

    #[tokio::test]
    async fn test_trial_pull_cut_off_by_deadline_reopens_then_recovers() {
        let config = BalanceConfig {
            staleness_window_ms: 40,
            hard_deadline_ms: 50,
            refresh_attempts: 1,
            ..BalanceConfig::default()
        };
        let admission = AdmissionConfig {
            failure_threshold: 1,
            open_duration_ms: 20,
            max_open_duration_ms: 100,
            ..AdmissionConfig::default()
        };
        let h = harness_with(config, admission).await;
        h.admission
            .record_result(RequestClass::Balance, Outcome::HardFailure);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The half-open trial is the pull that the deadline cancels
        h.gateway.set_snapshot_latency(Duration::from_millis(200));
        let err = h.sync.get("USD").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::BalanceUnknown { .. }));
        assert_eq!(h.admission.circuit_state(), CircuitState::Open);
        assert_eq!(h.admission.snapshot().reopen_count, 1);

        h.gateway.set_snapshot_latency(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let entry = h.sync.get("USD").await.unwrap();
        assert_eq!(entry.available, dec!(1000));
        assert_eq!(h.admission.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_snapshot_nonce_rejection_resyncs_once() {
        let h = harness(fast_config()).await;
        // Exchange already saw nonces ten seconds ahead of our clock
        h.gateway.advance_nonce_floor(now_micros() + 10_000_000);

        let entry = h.sync.get("USD").await.unwrap();
        assert_eq!(entry.available, dec!(1000));
        assert_eq!(h.gateway.snapshot_calls(), 2);
    }

    #[tokio::test]
    async fn test_stream_updates_flow_into_store() {
        let h = harness(fast_config()).await;
        let (tx, rx) = watch::channel(false);
        let updates = h.gateway.subscribe_balance_stream().await.unwrap();

        let sync = Arc::clone(&h.sync);
        let consumer = tokio::spawn(async move { sync.run_stream(updates, rx).await });

        h.gateway.set_balance("ETH", dec!(7));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let entry = h.sync.store().get("ETH").unwrap();
        assert_eq!(entry.available, dec!(7));
        assert_eq!(entry.source, crate::balance::BalanceSource::Stream);

        tx.send(true).unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_asset_absent_from_snapshot_reads_zero() {
        let h = harness(fast_config()).await;
        let entry = h.sync.get("DOGE").await.unwrap();
        assert_eq!(entry.available, rust_decimal::Decimal::ZERO);
    }
}
