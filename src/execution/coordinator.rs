//! Order submission path
//!
//! Every intent runs the same sequence: claim the single-flight slot, read a
//! fresh funding balance, size, pass admission, take a nonce, and place. Each
//! step either hands off to the next or returns a typed rejection; nothing is
//! silently dropped.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::inflight::{InFlightOrder, OrderState, SlotMap, SlotToken};
use super::sizing::{size_order, SizedOrder, SizingRules};
use crate::admission::{
    AdmissionDecision, AdmissionSnapshot, AdmittedRequest, Outcome, RateAdmissionController,
};
use crate::balance::{DualChannelSync, InvalidationReason};
use crate::common::{lock, CircuitState, CircuitTransition};
use crate::config::ExecutionConfig;
use crate::error::{CoordinatorError, CoordinatorResult, GatewayError, Rejection};
use crate::gateway::{ExchangeGateway, OrderAck, OrderRequest, OrderStatus};
use crate::nonce::NonceSequencer;
use crate::types::{AssetPair, IdempotencyKey, OrderIntent, RequestClass};

/// Accepted order, as returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub key: IdempotencyKey,
    pub order_id: String,
    pub status: OrderStatus,
    pub size: Decimal,
    pub nonce: u64,
}

/// Terminal record of one intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderOutcome {
    pub at: DateTime<Utc>,
    pub key: IdempotencyKey,
    pub state: OrderState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

/// Terminal report for a resting order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderUpdate {
    Filled,
    Cancelled,
}

/// Health view for operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub circuit: CircuitState,
    /// Set after repeated circuit-open rejections; cleared by the next
    /// admitted order
    pub degraded: bool,
    pub circuit_rejections: u32,
    pub in_flight: usize,
    pub invalidated_assets: Vec<String>,
    pub admission: AdmissionSnapshot,
}

pub struct ExecutionCoordinator {
    config: ExecutionConfig,
    gateway: Arc<dyn ExchangeGateway>,
    sequencer: Arc<NonceSequencer>,
    admission: Arc<RateAdmissionController>,
    sync: Arc<DualChannelSync>,
    slots: SlotMap,
    history: Mutex<VecDeque<OrderOutcome>>,
    circuit_rejections: AtomicU32,
}

impl ExecutionCoordinator {
    pub fn new(
        config: ExecutionConfig,
        gateway: Arc<dyn ExchangeGateway>,
        sequencer: Arc<NonceSequencer>,
        admission: Arc<RateAdmissionController>,
        sync: Arc<DualChannelSync>,
    ) -> Self {
        Self {
            config,
            gateway,
            sequencer,
            admission,
            sync,
            slots: SlotMap::new(),
            history: Mutex::new(VecDeque::new()),
            circuit_rejections: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Submit an intent.
    ///
    /// At most one order per (pair, side) is in flight; a second submit for
    /// the same key fails with `DuplicateInFlight` without touching the
    /// exchange.
    pub async fn submit(&self, intent: OrderIntent) -> CoordinatorResult<SubmitReceipt> {
        self.sweep_expired();

        let token = match self.slots.acquire(&intent, self.config.slot_timeout()) {
            Ok(token) => token,
            Err(e) => {
                debug!("Rejecting {}: {}", intent.idempotency_key(), e);
                self.record(outcome_for(&intent, OrderState::Failed, None, None, Some(&e)));
                return Err(e);
            }
        };

        match self.execute(&intent, &token).await {
            Ok((ack, sized, nonce)) => {
                let receipt = SubmitReceipt {
                    key: token.key.clone(),
                    order_id: ack.order_id.clone(),
                    status: ack.status,
                    size: sized.size,
                    nonce,
                };
                self.on_accepted(&intent, &token, &ack, &sized, nonce);
                Ok(receipt)
            }
            Err(CoordinatorError::OrderTimedOut(key)) => {
                let err = CoordinatorError::OrderTimedOut(key);
                if let Some(order) = self.slots.release(&token, OrderState::TimedOut) {
                    self.on_timed_out(&order, Some(&err));
                }
                Err(err)
            }
            Err(err) => {
                if self.slots.release(&token, OrderState::Failed).is_some() {
                    info!("Order for {} rejected: {}", token.key, err);
                } else {
                    debug!("Slot for {} already swept", token.key);
                }
                self.record(outcome_for(&intent, OrderState::Failed, None, None, Some(&err)));
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        intent: &OrderIntent,
        token: &SlotToken,
    ) -> CoordinatorResult<(OrderAck, SizedOrder, u64)> {
        let funding = intent.pair.funding_asset(intent.side);
        let balance = tokio::time::timeout(token.remaining(), self.sync.get(funding))
            .await
            .map_err(|_| {
                warn!("Slot for {} expired while reading {}", token.key, funding);
                CoordinatorError::OrderTimedOut(token.key.clone())
            })??;

        let rules = SizingRules::resolve(&self.config, &intent.pair);
        let sized = size_order(intent, balance.available, &rules)?;
        debug!(
            "Sized {} at {} from {} {} available",
            token.key, sized.size, balance.available, sized.funding_asset
        );

        let policy = self.config.network_policy();
        let mut attempts = 0;
        let mut resynced = false;

        loop {
            attempts += 1;
            let admitted = self.admit(intent)?;
            let nonce = match self.sequencer.next().await {
                Ok(nonce) => nonce,
                Err(e) => {
                    admitted.release();
                    return Err(e);
                }
            };

            // A swept or expired slot may already belong to another submit
            let owned = self.slots.update(token, |order| {
                order.nonce = Some(nonce);
                order.size = Some(sized.size);
            });
            if !owned || token.remaining().is_zero() {
                admitted.release();
                warn!("Slot for {} lost before placing, order not sent", token.key);
                return Err(CoordinatorError::OrderTimedOut(token.key.clone()));
            }

            let request = OrderRequest {
                pair: intent.pair.clone(),
                side: intent.side,
                size: sized.size,
                price: intent.limit_price,
                nonce,
            };

            let placed = tokio::time::timeout(token.remaining(), self.gateway.place_order(&request))
                .await
                .unwrap_or(Err(GatewayError::Timeout));

            let err = match placed {
                Ok(ack) => {
                    self.note(admitted.settle(Outcome::Success));
                    return Ok((ack, sized, nonce));
                }
                Err(err) => err,
            };

            self.note(admitted.settle(Outcome::for_error(&err)));

            match err {
                GatewayError::InvalidNonce if !resynced => {
                    warn!("Order nonce {} rejected for {}, resyncing", nonce, token.key);
                    self.sequencer.resync_after_rejection().await?;
                    resynced = true;
                }
                GatewayError::Unavailable(message) if attempts < policy.max_attempts => {
                    let delay = policy.delay_before(attempts + 1);
                    if delay >= token.remaining() {
                        return Err(CoordinatorError::NetworkError { attempts, message });
                    }
                    warn!(
                        "Order for {} not delivered (attempt {}/{}): {}. Retrying in {:?}",
                        token.key, attempts, policy.max_attempts, message, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                GatewayError::Timeout => {
                    error!("Order for {} timed out with unknown outcome", token.key);
                    return Err(CoordinatorError::OrderTimedOut(token.key.clone()));
                }
                GatewayError::InsufficientFunds => {
                    // Cached balance disagreed with the exchange
                    self.sync
                        .invalidate(&sized.funding_asset, InvalidationReason::ChannelMismatch);
                    return Err(CoordinatorError::InsufficientBalance {
                        asset: sized.funding_asset,
                        available: balance.available,
                        required: sized.funding_amount,
                    });
                }
                other => {
                    return Err(CoordinatorError::from_gateway(
                        other,
                        RequestClass::Order,
                        attempts,
                    ))
                }
            }
        }
    }

    /// Pass admission for one outbound order request
    fn admit(&self, intent: &OrderIntent) -> CoordinatorResult<AdmittedRequest<'_>> {
        let decision = if intent.critical {
            let reason = intent
                .context
                .tag
                .clone()
                .unwrap_or_else(|| "critical intent".to_string());
            self.admission.admit_critical(RequestClass::Order, &reason)
        } else {
            self.admission.admit(RequestClass::Order)
        };

        match decision {
            AdmissionDecision::CircuitOpen { .. } => {
                let count = self.circuit_rejections.fetch_add(1, Ordering::Relaxed) + 1;
                if count == self.config.degraded_after {
                    error!(
                        "{} consecutive orders refused by open circuit, coordinator degraded",
                        count
                    );
                }
            }
            AdmissionDecision::Allowed(_) => {
                self.circuit_rejections.store(0, Ordering::Relaxed);
            }
            AdmissionDecision::Throttled { .. } => {}
        }
        let ticket = decision.into_result(RequestClass::Order)?;
        Ok(self.admission.track(ticket))
    }

    fn on_accepted(
        &self,
        intent: &OrderIntent,
        token: &SlotToken,
        ack: &OrderAck,
        sized: &SizedOrder,
        nonce: u64,
    ) {
        let store = self.sync.store();
        store.reserve(&sized.funding_asset, sized.funding_amount);

        match ack.status {
            OrderStatus::Filled => {
                self.slots.release(token, OrderState::Filled);
                self.invalidate_pair(&intent.pair, InvalidationReason::TradeCompleted);
                info!(
                    "Filled {} {} (order {}, nonce {})",
                    token.key, sized.size, ack.order_id, nonce
                );
                self.record(outcome_for(
                    intent,
                    OrderState::Filled,
                    Some(ack.order_id.clone()),
                    Some(sized.size),
                    None,
                ));
            }
            OrderStatus::Open => {
                self.slots.update(token, |order| {
                    order.state = OrderState::Submitted;
                    order.order_id = Some(ack.order_id.clone());
                });
                info!(
                    "Order {} for {} {} resting (nonce {})",
                    ack.order_id, token.key, sized.size, nonce
                );
            }
        }
    }

    /// Apply a terminal update for a resting order and free its slot
    pub fn on_order_update(&self, order_id: &str, update: OrderUpdate) -> Option<OrderOutcome> {
        let state = match update {
            OrderUpdate::Filled => OrderState::Filled,
            OrderUpdate::Cancelled => OrderState::Failed,
        };
        let Some(order) = self.slots.release_order(order_id, state) else {
            debug!("No in-flight order {} for {:?} update", order_id, update);
            return None;
        };

        // Either way the locked funds moved
        self.invalidate_pair(&order.key.pair, InvalidationReason::TradeCompleted);
        info!("Order {} for {} {:?}", order_id, order.key, update);

        let outcome = outcome_for(&order.intent, state, order.order_id.clone(), order.size, None);
        self.record(outcome.clone());
        Some(outcome)
    }

    /// Release every slot past its deadline. The outcome of those orders is
    /// unknown, so both assets of the pair are invalidated.
    pub fn sweep_expired(&self) -> Vec<OrderOutcome> {
        self.slots
            .take_expired(Instant::now())
            .into_iter()
            .map(|order| {
                warn!(
                    "In-flight order for {} exceeded its deadline, releasing slot",
                    order.key
                );
                self.on_timed_out(&order, None)
            })
            .collect()
    }

    fn on_timed_out(&self, order: &InFlightOrder, err: Option<&CoordinatorError>) -> OrderOutcome {
        self.invalidate_pair(&order.key.pair, InvalidationReason::OrderTimedOut);
        let timed_out = CoordinatorError::OrderTimedOut(order.key.clone());
        let outcome = outcome_for(
            &order.intent,
            OrderState::TimedOut,
            order.order_id.clone(),
            order.size,
            Some(err.unwrap_or(&timed_out)),
        );
        self.record(outcome.clone());
        outcome
    }

    /// Sweep expired slots on a fixed period until shutdown is signalled
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.sweep_expired();
                }
            }
        }
        debug!("Slot sweeper stopped");
    }

    fn invalidate_pair(&self, pair: &AssetPair, reason: InvalidationReason) {
        self.sync.invalidate(pair.base(), reason);
        self.sync.invalidate(pair.quote(), reason);
    }

    fn note(&self, transition: Option<CircuitTransition>) {
        self.sync.store().on_circuit_transition(transition);
    }

    fn record(&self, outcome: OrderOutcome) {
        let capacity = self.config.history_capacity;
        if capacity == 0 {
            return;
        }
        let mut history = lock(&self.history);
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(outcome);
    }

    /// Terminal outcomes, oldest first
    pub fn history(&self) -> Vec<OrderOutcome> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn in_flight(&self) -> Vec<InFlightOrder> {
        self.slots.orders()
    }

    pub fn is_degraded(&self) -> bool {
        self.config.degraded_after > 0
            && self.circuit_rejections.load(Ordering::Relaxed) >= self.config.degraded_after
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            circuit: self.admission.circuit_state(),
            degraded: self.is_degraded(),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            in_flight: self.slots.len(),
            invalidated_assets: self.sync.store().invalidated_assets(),
            admission: self.admission.snapshot(),
        }
    }
}

fn outcome_for(
    intent: &OrderIntent,
    state: OrderState,
    order_id: Option<String>,
    size: Option<Decimal>,
    err: Option<&CoordinatorError>,
) -> OrderOutcome {
    OrderOutcome {
        at: Utc::now(),
        key: intent.idempotency_key(),
        state,
        order_id,
        size,
        tag: intent.context.tag.clone(),
        rejection: err.map(CoordinatorError::to_rejection),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{BalanceStateStore, Freshness};
    use crate::config::{AdmissionConfig, BalanceConfig, NonceConfig, PairRules};
    use crate::error::ErrorKind;
    use crate::gateway::PaperGateway;
    use crate::nonce::{now_micros, MemoryNonceStore};
    use crate::types::{Side, Sizing};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        gateway: Arc<PaperGateway>,
        admission: Arc<RateAdmissionController>,
        sync: Arc<DualChannelSync>,
        coordinator: Arc<ExecutionCoordinator>,
    }

    fn xbt() -> AssetPair {
        AssetPair::new("XBT", "USD")
    }

    async fn harness_with(execution: ExecutionConfig, admission: AdmissionConfig) -> Harness {
        let gateway = Arc::new(
            PaperGateway::new()
                .with_balance("USD", dec!(10000))
                .with_balance("XBT", dec!(100))
                .with_price(xbt(), dec!(100)),
        );
        let sequencer = Arc::new(
            NonceSequencer::open("t", NonceConfig::default(), Arc::new(MemoryNonceStore::new()))
                .await
                .unwrap(),
        );
        let admission = Arc::new(RateAdmissionController::new(&admission));
        let store = Arc::new(BalanceStateStore::new(BalanceConfig::default()));
        let sync = Arc::new(DualChannelSync::new(
            store,
            gateway.clone(),
            sequencer.clone(),
            admission.clone(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            execution,
            gateway.clone(),
            sequencer,
            admission.clone(),
            sync.clone(),
        ));
        Harness {
            gateway,
            admission,
            sync,
            coordinator,
        }
    }

    async fn harness() -> Harness {
        harness_with(test_execution(), AdmissionConfig::default()).await
    }

    fn with_min(mut config: ExecutionConfig, min: Decimal) -> ExecutionConfig {
        config.pairs.insert(xbt(), PairRules::new(min));
        config
    }

    fn test_execution() -> ExecutionConfig {
        let config = ExecutionConfig {
            retry_delay_ms: 10,
            ..ExecutionConfig::default()
        };
        with_min(config, dec!(0.001))
    }

    fn sell(fraction: Decimal) -> OrderIntent {
        OrderIntent::new(xbt(), Side::Sell, Sizing::Fraction(fraction))
    }

    #[tokio::test]
    async fn test_sell_is_sized_from_base_balance() {
        let h = harness().await;
        let receipt = h.coordinator.submit(sell(dec!(0.5))).await.unwrap();

        assert_eq!(receipt.status, OrderStatus::Filled);
        assert_eq!(receipt.size, dec!(49));
        let sent = h.gateway.accepted_orders();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].size, dec!(49));
        assert_eq!(sent[0].nonce, receipt.nonce);
    }

    #[tokio::test]
    async fn test_buy_is_sized_from_quote_balance() {
        let h = harness().await;
        let intent = OrderIntent::new(xbt(), Side::Buy, Sizing::Fraction(dec!(0.1)))
            .with_reference_price(dec!(100));
        let receipt = h.coordinator.submit(intent).await.unwrap();
        // 10000 * 0.98 * 0.1 / 100
        assert_eq!(receipt.size, dec!(9.8));
    }

    #[tokio::test]
    async fn test_fill_invalidates_both_assets_and_frees_slot() {
        let h = harness().await;
        h.coordinator.submit(sell(dec!(0.5))).await.unwrap();

        for asset in ["XBT", "USD"] {
            let entry = h.sync.store().get(asset).unwrap();
            assert_eq!(entry.freshness, Freshness::Invalidated, "{}", asset);
        }
        assert_eq!(h.coordinator.in_flight().len(), 0);

        // Next read pulls the post-fill balance
        let xbt = h.sync.get("XBT").await.unwrap();
        assert_eq!(xbt.available, dec!(51));
        let history = h.coordinator.history();
        assert_eq!(history.last().unwrap().state, OrderState::Filled);
    }

    #[tokio::test]
    async fn test_too_small_is_rejected_before_exchange() {
        let execution = with_min(ExecutionConfig::default(), dec!(80));
        let h = harness_with(execution, AdmissionConfig::default()).await;

        let err = h.coordinator.submit(sell(dec!(0.8))).await.unwrap_err();
        match err {
            CoordinatorError::TooSmall { size, minimum, .. } => {
                assert_eq!(size, dec!(78.4));
                assert_eq!(minimum, dec!(80));
            }
            other => panic!("expected TooSmall, got {:?}", other),
        }
        assert_eq!(h.gateway.order_attempts(), 0);
        assert_eq!(h.coordinator.in_flight().len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_reaches_exchange_once() {
        let h = harness().await;
        h.gateway.set_order_latency(Duration::from_millis(50));

        let (a, b) = tokio::join!(
            h.coordinator.submit(sell(dec!(0.1))),
            h.coordinator.submit(sell(dec!(0.1)))
        );

        let results = [a, b];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let dup = results
            .iter()
            .filter(|r| matches!(r, Err(CoordinatorError::DuplicateInFlight(_))))
            .count();
        assert_eq!((ok, dup), (1, 1));
        assert_eq!(h.gateway.order_attempts(), 1);
    }

    #[tokio::test]
    async fn test_resting_order_holds_slot_until_update() {
        let h = harness().await;
        h.gateway.rest_limit_orders(true);

        let intent = sell(dec!(0.1)).with_limit_price(dec!(120));
        let receipt = h.coordinator.submit(intent.clone()).await.unwrap();
        assert_eq!(receipt.status, OrderStatus::Open);

        let err = h.coordinator.submit(intent.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateInFlight);

        h.gateway.fill_resting(&receipt.order_id).unwrap();
        let outcome = h
            .coordinator
            .on_order_update(&receipt.order_id, OrderUpdate::Filled)
            .unwrap();
        assert_eq!(outcome.state, OrderState::Filled);
        assert!(h.coordinator.on_order_update(&receipt.order_id, OrderUpdate::Filled).is_none());

        h.coordinator.submit(intent).await.unwrap();
    }

    #[tokio::test]
    async fn test_network_failure_retried_with_fresh_nonce() {
        let h = harness().await;
        h.gateway.fail_next_orders([GatewayError::Unavailable("reset".into())]);

        let receipt = h.coordinator.submit(sell(dec!(0.1))).await.unwrap();
        assert_eq!(h.gateway.order_attempts(), 2);
        assert_eq!(h.gateway.accepted_orders()[0].nonce, receipt.nonce);
    }

    #[tokio::test]
    async fn test_network_failure_surfaces_after_bounded_attempts() {
        let h = harness().await;
        h.gateway.fail_next_orders(
            (0..3).map(|_| GatewayError::Unavailable("down".into())),
        );

        let err = h.coordinator.submit(sell(dec!(0.1))).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NetworkError { attempts: 3, .. }));
        assert_eq!(h.coordinator.in_flight().len(), 0);
    }

    #[tokio::test]
    async fn test_order_nonce_rejection_resyncs_once() {
        let h = harness().await;
        // Prime the balance cache so only the order sees the nonce floor
        h.sync.get("XBT").await.unwrap();
        h.gateway.advance_nonce_floor(now_micros() + 10_000_000);

        h.coordinator.submit(sell(dec!(0.1))).await.unwrap();
        assert_eq!(h.gateway.order_attempts(), 2);
    }

    #[tokio::test]
    async fn test_timeout_releases_slot_and_invalidates() {
        let execution = ExecutionConfig {
            slot_timeout_ms: 50,
            ..test_execution()
        };
        let h = harness_with(execution, AdmissionConfig::default()).await;
        h.gateway.set_order_latency(Duration::from_millis(200));

        let err = h.coordinator.submit(sell(dec!(0.1))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OrderTimedOut);
        assert!(h.coordinator.in_flight().is_empty());
        assert_eq!(
            h.sync.store().get("XBT").unwrap().freshness,
            Freshness::Invalidated
        );
        assert_eq!(h.coordinator.history().last().unwrap().state, OrderState::TimedOut);
    }

    #[tokio::test]
    async fn test_slot_expiring_during_balance_read_never_places() {
        let execution = ExecutionConfig {
            slot_timeout_ms: 50,
            ..test_execution()
        };
        let h = harness_with(execution, AdmissionConfig::default()).await;
        h.gateway.set_snapshot_latency(Duration::from_millis(100));

        let (first, second) = tokio::join!(h.coordinator.submit(sell(dec!(0.1))), async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            h.gateway.set_snapshot_latency(Duration::ZERO);
            h.coordinator.submit(sell(dec!(0.1))).await
        });

        assert_eq!(first.unwrap_err().kind(), ErrorKind::OrderTimedOut);
        let receipt = second.unwrap();
        let sent = h.gateway.accepted_orders();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].nonce, receipt.nonce);

        let states: Vec<_> = h.coordinator.history().iter().map(|o| o.state).collect();
        assert_eq!(states, vec![OrderState::TimedOut, OrderState::Filled]);
    }

    #[tokio::test]
    async fn test_exchange_insufficient_funds_invalidates_funding() {
        let h = harness().await;
        h.gateway.fail_next_orders([GatewayError::InsufficientFunds]);

        let err = h.coordinator.submit(sell(dec!(0.1))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
        assert_eq!(
            h.sync.store().get("XBT").unwrap().freshness,
            Freshness::Invalidated
        );
        // Not a transport failure
        assert_eq!(h.admission.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_and_degrades() {
        let execution = ExecutionConfig {
            degraded_after: 2,
            ..test_execution()
        };
        let admission = AdmissionConfig {
            failure_threshold: 1,
            open_duration_ms: 10_000,
            ..AdmissionConfig::default()
        };
        let h = harness_with(execution, admission).await;
        h.sync.get("XBT").await.unwrap();

        h.gateway.fail_next_orders([GatewayError::Rejected("ignored".into())]);
        h.admission.record_result(RequestClass::Order, Outcome::HardFailure);
        assert_eq!(h.admission.circuit_state(), CircuitState::Open);

        for _ in 0..2 {
            let err = h.coordinator.submit(sell(dec!(0.1))).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        }
        assert!(h.coordinator.status().degraded);
        assert_eq!(h.gateway.order_attempts(), 0);

        // Critical intents bypass the open circuit
        let critical = sell(dec!(0.1)).critical();
        let err = h.coordinator.submit(critical).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(h.gateway.order_attempts(), 1);
        assert!(!h.coordinator.status().degraded);
    }

    #[tokio::test]
    async fn test_sweeper_releases_expired_slots() {
        let execution = ExecutionConfig {
            slot_timeout_ms: 30,
            ..test_execution()
        };
        let h = harness_with(execution, AdmissionConfig::default()).await;
        h.gateway.rest_limit_orders(true);

        h.coordinator
            .submit(sell(dec!(0.1)).with_limit_price(dec!(150)))
            .await
            .unwrap();
        assert_eq!(h.coordinator.in_flight().len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let swept = h.coordinator.sweep_expired();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].state, OrderState::TimedOut);
        assert!(h.coordinator.in_flight().is_empty());
    }
}
