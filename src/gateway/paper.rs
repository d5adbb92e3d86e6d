//! In-memory exchange for paper sessions and tests
//!
//! Behaves like a strict exchange where it matters to the coordinator:
//! - nonces must strictly increase across orders and snapshot pulls
//! - market orders fill immediately at the mark price
//! - limit orders fill immediately unless resting is enabled
//! - every balance change is pushed to subscribers with a new sequence number
//!
//! Failures and latency can be scripted to exercise the coordinator's
//! recovery paths.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    AssetAmount, BalanceSnapshot, CounterStatus, ExchangeGateway, OrderAck, OrderRequest,
    OrderStatus, StreamBalanceUpdate,
};
use crate::common::lock;
use crate::error::GatewayError;
use crate::types::{AssetPair, Side};

const STREAM_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct RestingOrder {
    order_id: String,
    request: OrderRequest,
    /// Funding amount locked while resting
    locked: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    balances: HashMap<String, AssetAmount>,
    prices: HashMap<AssetPair, Decimal>,
    last_nonce: u64,
    sequence: u64,
    order_count: u64,
    accepted: Vec<OrderRequest>,
    resting: Vec<RestingOrder>,
    rest_limit_orders: bool,
    stream_paused: bool,
    subscribers: Vec<mpsc::Sender<StreamBalanceUpdate>>,
    order_failures: VecDeque<GatewayError>,
    snapshot_failures: VecDeque<GatewayError>,
    order_latency: Duration,
    snapshot_latency: Duration,
    counters: Vec<CounterStatus>,
    order_attempts: u64,
    snapshot_calls: u64,
}

impl PaperState {
    fn amount_mut(&mut self, asset: &str) -> &mut AssetAmount {
        self.balances.entry(asset.to_string()).or_default()
    }

    fn check_nonce(&mut self, nonce: u64) -> Result<(), GatewayError> {
        if nonce <= self.last_nonce {
            debug!("Paper exchange rejects nonce {} (last {})", nonce, self.last_nonce);
            return Err(GatewayError::InvalidNonce);
        }
        self.last_nonce = nonce;
        Ok(())
    }

    fn publish(&mut self, assets: &[&str]) {
        if self.stream_paused {
            return;
        }
        for asset in assets {
            let amount = self.balances.get(*asset).copied().unwrap_or_default();
            self.sequence += 1;
            let update = StreamBalanceUpdate {
                asset: asset.to_string(),
                amount,
                sequence: self.sequence,
            };
            self.subscribers.retain(|tx| match tx.try_send(update.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Paper stream subscriber lagging, update dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    fn settle(&mut self, request: &OrderRequest, price: Decimal, from_locked: bool) {
        let base = request.pair.base().to_string();
        let quote = request.pair.quote().to_string();
        let notional = request.size * price;

        match request.side {
            Side::Buy => {
                let q = self.amount_mut(&quote);
                if from_locked {
                    q.locked -= notional;
                } else {
                    q.available -= notional;
                }
                self.amount_mut(&base).available += request.size;
            }
            Side::Sell => {
                let b = self.amount_mut(&base);
                if from_locked {
                    b.locked -= request.size;
                } else {
                    b.available -= request.size;
                }
                self.amount_mut(&quote).available += notional;
            }
        }
        self.publish(&[base.as_str(), quote.as_str()]);
    }
}

/// Paper exchange
#[derive(Debug, Default)]
pub struct PaperGateway {
    state: Mutex<PaperState>,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(self, asset: &str, available: Decimal) -> Self {
        lock(&self.state).amount_mut(&asset.to_uppercase()).available = available;
        self
    }

    pub fn with_price(self, pair: AssetPair, price: Decimal) -> Self {
        lock(&self.state).prices.insert(pair, price);
        self
    }

    /// Set an asset's available balance and push the change
    pub fn set_balance(&self, asset: &str, available: Decimal) {
        let asset = asset.to_uppercase();
        let mut state = lock(&self.state);
        state.amount_mut(&asset).available = available;
        state.publish(&[asset.as_str()]);
    }

    pub fn set_price(&self, pair: AssetPair, price: Decimal) {
        lock(&self.state).prices.insert(pair, price);
    }

    pub fn balance(&self, asset: &str) -> AssetAmount {
        lock(&self.state)
            .balances
            .get(&asset.to_uppercase())
            .copied()
            .unwrap_or_default()
    }

    /// Keep limit orders on the book instead of filling them
    pub fn rest_limit_orders(&self, enabled: bool) {
        lock(&self.state).rest_limit_orders = enabled;
    }

    /// Stop or resume the push channel (simulates a silent stream)
    pub fn pause_stream(&self, paused: bool) {
        lock(&self.state).stream_paused = paused;
    }

    /// Pretend another client already used nonces up to `nonce`
    pub fn advance_nonce_floor(&self, nonce: u64) {
        let mut state = lock(&self.state);
        state.last_nonce = state.last_nonce.max(nonce);
    }

    pub fn last_nonce(&self) -> u64 {
        lock(&self.state).last_nonce
    }

    /// Queue errors returned by the next order placements, in order
    pub fn fail_next_orders(&self, errors: impl IntoIterator<Item = GatewayError>) {
        lock(&self.state).order_failures.extend(errors);
    }

    /// Queue errors returned by the next snapshot pulls, in order
    pub fn fail_next_snapshots(&self, errors: impl IntoIterator<Item = GatewayError>) {
        lock(&self.state).snapshot_failures.extend(errors);
    }

    pub fn set_order_latency(&self, latency: Duration) {
        lock(&self.state).order_latency = latency;
    }

    pub fn set_snapshot_latency(&self, latency: Duration) {
        lock(&self.state).snapshot_latency = latency;
    }

    pub fn set_counters(&self, counters: Vec<CounterStatus>) {
        lock(&self.state).counters = counters;
    }

    /// Orders the exchange accepted
    pub fn accepted_orders(&self) -> Vec<OrderRequest> {
        lock(&self.state).accepted.clone()
    }

    /// Every call to `place_order`, including rejected ones
    pub fn order_attempts(&self) -> u64 {
        lock(&self.state).order_attempts
    }

    pub fn snapshot_calls(&self) -> u64 {
        lock(&self.state).snapshot_calls
    }

    /// Fill a resting order; returns its request if it was on the book
    pub fn fill_resting(&self, order_id: &str) -> Option<OrderRequest> {
        let mut state = lock(&self.state);
        let idx = state.resting.iter().position(|o| o.order_id == order_id)?;
        let order = state.resting.remove(idx);
        let price = order.request.price.unwrap_or_default();
        state.settle(&order.request, price, true);
        Some(order.request)
    }

    /// Cancel a resting order and release its locked funds
    pub fn cancel_resting(&self, order_id: &str) -> Option<OrderRequest> {
        let mut state = lock(&self.state);
        let idx = state.resting.iter().position(|o| o.order_id == order_id)?;
        let order = state.resting.remove(idx);
        let asset = order.request.pair.funding_asset(order.request.side).to_string();
        let amount = state.amount_mut(&asset);
        amount.locked -= order.locked;
        amount.available += order.locked;
        state.publish(&[asset.as_str()]);
        Some(order.request)
    }

    fn execute(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let mut state = lock(&self.state);

        if let Some(err) = state.order_failures.pop_front() {
            debug!("Paper exchange returns scripted error: {}", err);
            return Err(err);
        }

        state.check_nonce(request.nonce)?;

        if request.size <= Decimal::ZERO {
            return Err(GatewayError::Rejected("size must be positive".into()));
        }

        let price = match request.price.or_else(|| state.prices.get(&request.pair).copied()) {
            Some(p) if p > Decimal::ZERO => p,
            _ => {
                return Err(GatewayError::Rejected(format!(
                    "no price available for {}",
                    request.pair
                )))
            }
        };

        let funding_asset = request.pair.funding_asset(request.side).to_string();
        let required = match request.side {
            Side::Buy => request.size * price,
            Side::Sell => request.size,
        };
        let available = state
            .balances
            .get(&funding_asset)
            .map(|a| a.available)
            .unwrap_or_default();
        if available < required {
            return Err(GatewayError::InsufficientFunds);
        }

        state.order_count += 1;
        let order_id = format!("paper-{}", state.order_count);
        state.accepted.push(request.clone());

        if request.price.is_some() && state.rest_limit_orders {
            let amount = state.amount_mut(&funding_asset);
            amount.available -= required;
            amount.locked += required;
            state.resting.push(RestingOrder {
                order_id: order_id.clone(),
                request: request.clone(),
                locked: required,
            });
            state.publish(&[funding_asset.as_str()]);
            return Ok(OrderAck {
                order_id,
                status: OrderStatus::Open,
            });
        }

        state.settle(request, price, false);
        Ok(OrderAck {
            order_id,
            status: OrderStatus::Filled,
        })
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let latency = {
            let mut state = lock(&self.state);
            state.order_attempts += 1;
            state.order_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.execute(request)
    }

    async fn balance_snapshot(&self, nonce: u64) -> Result<BalanceSnapshot, GatewayError> {
        let latency = {
            let mut state = lock(&self.state);
            state.snapshot_calls += 1;
            state.snapshot_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = lock(&self.state);
        if let Some(err) = state.snapshot_failures.pop_front() {
            return Err(err);
        }
        state.check_nonce(nonce)?;
        Ok(BalanceSnapshot {
            taken_at: Utc::now(),
            balances: state.balances.clone(),
        })
    }

    async fn subscribe_balance_stream(
        &self,
    ) -> Result<mpsc::Receiver<StreamBalanceUpdate>, GatewayError> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        lock(&self.state).subscribers.push(tx);
        Ok(rx)
    }

    async fn admission_status(&self) -> Result<Vec<CounterStatus>, GatewayError> {
        Ok(lock(&self.state).counters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pair() -> AssetPair {
        AssetPair::new("XBT", "USD")
    }

    fn order(side: Side, size: Decimal, price: Option<Decimal>, nonce: u64) -> OrderRequest {
        OrderRequest {
            pair: pair(),
            side,
            size,
            price,
            nonce,
        }
    }

    #[tokio::test]
    async fn test_rejects_non_increasing_nonce() {
        let gw = PaperGateway::new()
            .with_balance("USD", dec!(1000))
            .with_price(pair(), dec!(100));

        assert!(gw.place_order(&order(Side::Buy, dec!(1), None, 10)).await.is_ok());
        assert_eq!(
            gw.place_order(&order(Side::Buy, dec!(1), None, 10)).await,
            Err(GatewayError::InvalidNonce)
        );
        assert_eq!(
            gw.balance_snapshot(9).await.unwrap_err(),
            GatewayError::InvalidNonce
        );
        assert!(gw.balance_snapshot(11).await.is_ok());
    }

    #[tokio::test]
    async fn test_market_buy_settles_both_assets() {
        let gw = PaperGateway::new()
            .with_balance("USD", dec!(1000))
            .with_price(pair(), dec!(100));

        let ack = gw.place_order(&order(Side::Buy, dec!(2.5), None, 1)).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(gw.balance("USD").available, dec!(750));
        assert_eq!(gw.balance("XBT").available, dec!(2.5));
    }

    #[tokio::test]
    async fn test_sell_checks_base_balance() {
        let gw = PaperGateway::new()
            .with_balance("USD", dec!(1000000))
            .with_balance("XBT", dec!(1))
            .with_price(pair(), dec!(100));

        assert_eq!(
            gw.place_order(&order(Side::Sell, dec!(2), None, 1)).await,
            Err(GatewayError::InsufficientFunds)
        );
    }

    #[tokio::test]
    async fn test_stream_sequences_increase() {
        let gw = PaperGateway::new();
        let mut rx = gw.subscribe_balance_stream().await.unwrap();

        gw.set_balance("eth", dec!(3));
        gw.set_balance("eth", dec!(4));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.asset, "ETH");
        assert!(second.sequence > first.sequence);
        assert_eq!(second.amount.available, dec!(4));
    }

    #[tokio::test]
    async fn test_resting_limit_order_locks_then_fills() {
        let gw = PaperGateway::new().with_balance("USD", dec!(1000));
        gw.rest_limit_orders(true);

        let ack = gw
            .place_order(&order(Side::Buy, dec!(2), Some(dec!(100)), 1))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(gw.balance("USD"), AssetAmount::new(dec!(800), dec!(200)));

        gw.fill_resting(&ack.order_id).unwrap();
        assert_eq!(gw.balance("USD"), AssetAmount::new(dec!(800), dec!(0)));
        assert_eq!(gw.balance("XBT").available, dec!(2));
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let gw = PaperGateway::new()
            .with_balance("USD", dec!(1000))
            .with_price(pair(), dec!(100));
        gw.fail_next_orders([GatewayError::Unavailable("reset".into()), GatewayError::Timeout]);

        let req = order(Side::Buy, dec!(1), None, 1);
        assert!(matches!(gw.place_order(&req).await, Err(GatewayError::Unavailable(_))));
        assert_eq!(gw.place_order(&req).await, Err(GatewayError::Timeout));
        assert!(gw.place_order(&req).await.is_ok());
        assert_eq!(gw.order_attempts(), 3);
        assert_eq!(gw.accepted_orders().len(), 1);
    }
}
