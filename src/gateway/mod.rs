//! Exchange gateway contract
//!
//! The coordinator never talks to a transport directly. Anything that can place
//! orders, serve balance snapshots, push balance updates and report its admission
//! counters can sit behind [`ExchangeGateway`]: a REST/WebSocket client in
//! production, [`PaperGateway`] for simulation and tests.

pub mod paper;

pub use paper::PaperGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::types::{AssetPair, RequestClass, Side};

/// A sized, nonce-stamped order as sent to the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub pair: AssetPair,
    pub side: Side,
    /// Base-asset quantity
    pub size: Decimal,
    /// Limit price; `None` for market orders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Fully executed on placement
    Filled,
    /// Accepted and resting on the book
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Available and locked amounts of one asset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmount {
    pub available: Decimal,
    pub locked: Decimal,
}

impl AssetAmount {
    pub fn new(available: Decimal, locked: Decimal) -> Self {
        Self { available, locked }
    }

    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

/// Pull-channel response: every asset as of `taken_at`
///
/// Assets the exchange leaves out hold a zero balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSnapshot {
    /// Exchange-reported time of the snapshot
    pub taken_at: DateTime<Utc>,
    pub balances: HashMap<String, AssetAmount>,
}

/// Push-channel message for one asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBalanceUpdate {
    pub asset: String,
    pub amount: AssetAmount,
    /// Strictly increasing within one subscription
    pub sequence: u64,
}

/// Exchange-reported counter state for one request class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterStatus {
    pub class: RequestClass,
    pub counter: f64,
    pub max_counter: f64,
    pub decay_per_sec: f64,
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Place an order
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError>;

    /// Fetch every balance (pull channel). Private calls consume a nonce.
    async fn balance_snapshot(&self, nonce: u64) -> Result<BalanceSnapshot, GatewayError>;

    /// Open the push channel
    async fn subscribe_balance_stream(
        &self,
    ) -> Result<mpsc::Receiver<StreamBalanceUpdate>, GatewayError>;

    /// Current counter and limit metadata, per request class
    async fn admission_status(&self) -> Result<Vec<CounterStatus>, GatewayError>;
}
