//! Core data types shared across the coordinator

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when an asset pair string cannot be parsed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid asset pair '{0}', expected BASE/QUOTE")]
pub struct PairParseError(pub String);

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// A tradable pair such as `XBT/USD`
///
/// The base asset is what gets bought or sold, the quote asset is what it is
/// priced in. Symbols are normalised to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetPair {
    base: String,
    quote: String,
}

impl AssetPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().trim().to_uppercase(),
            quote: quote.into().trim().to_uppercase(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Asset whose available balance funds an order on `side`.
    ///
    /// Buys spend the quote currency, sells spend the base asset.
    pub fn funding_asset(&self, side: Side) -> &str {
        match side {
            Side::Buy => &self.quote,
            Side::Sell => &self.base,
        }
    }

    /// Asset credited when an order on `side` fills
    pub fn proceeds_asset(&self, side: Side) -> &str {
        match side {
            Side::Buy => &self.base,
            Side::Sell => &self.quote,
        }
    }
}

impl fmt::Display for AssetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for AssetPair {
    type Err = PairParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| PairParseError(s.to_string()))?;
        if base.trim().is_empty() || quote.trim().is_empty() || quote.contains('/') {
            return Err(PairParseError(s.to_string()));
        }
        Ok(AssetPair::new(base, quote))
    }
}

impl TryFrom<String> for AssetPair {
    type Error = PairParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AssetPair> for String {
    fn from(pair: AssetPair) -> Self {
        pair.to_string()
    }
}

/// Request class used for admission accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestClass {
    /// Order placement
    Order,
    /// Private balance snapshot
    Balance,
    /// Any other private query
    Query,
}

impl RequestClass {
    pub const ALL: [RequestClass; 3] = [RequestClass::Order, RequestClass::Balance, RequestClass::Query];
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestClass::Order => write!(f, "order"),
            RequestClass::Balance => write!(f, "balance"),
            RequestClass::Query => write!(f, "query"),
        }
    }
}

/// How an intent asks to be sized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Sizing {
    /// Fraction in (0, 1] of the funding balance
    Fraction(Decimal),
    /// Explicit base-asset quantity
    Quantity(Decimal),
}

/// Free-form context attached by the signal producer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// A request to trade, before sizing and admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub pair: AssetPair,
    pub side: Side,
    pub sizing: Sizing,
    /// Limit price; `None` places a market order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    /// Last known price, used to convert quote budgets into base quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_price: Option<Decimal>,
    #[serde(default)]
    pub context: IntentContext,
    /// Caller-flagged critical intent (e.g. a protective exit)
    #[serde(default)]
    pub critical: bool,
}

impl OrderIntent {
    pub fn new(pair: AssetPair, side: Side, sizing: Sizing) -> Self {
        Self {
            pair,
            side,
            sizing,
            limit_price: None,
            reference_price: None,
            context: IntentContext::default(),
            critical: false,
        }
    }

    pub fn with_limit_price(mut self, price: Decimal) -> Self {
        self.limit_price = Some(price);
        self
    }

    pub fn with_reference_price(mut self, price: Decimal) -> Self {
        self.reference_price = Some(price);
        self
    }

    pub fn with_context(mut self, confidence: Option<f64>, tag: Option<String>) -> Self {
        self.context = IntentContext { confidence, tag };
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            pair: self.pair.clone(),
            side: self.side,
        }
    }

    /// Price used to convert between base and quote amounts
    pub fn pricing(&self) -> Option<Decimal> {
        self.limit_price.or(self.reference_price)
    }
}

/// Identifies a logical trading action for single-flight checks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub pair: AssetPair,
    pub side: Side,
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pair, self.side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_parse_and_display() {
        let pair: AssetPair = "xbt/usd".parse().unwrap();
        assert_eq!(pair.base(), "XBT");
        assert_eq!(pair.quote(), "USD");
        assert_eq!(pair.to_string(), "XBT/USD");
    }

    #[test]
    fn test_pair_parse_rejects_malformed() {
        assert!("XBTUSD".parse::<AssetPair>().is_err());
        assert!("/USD".parse::<AssetPair>().is_err());
        assert!("XBT/".parse::<AssetPair>().is_err());
        assert!("A/B/C".parse::<AssetPair>().is_err());
    }

    #[test]
    fn test_funding_asset_by_side() {
        let pair = AssetPair::new("ETH", "USD");
        assert_eq!(pair.funding_asset(Side::Buy), "USD");
        assert_eq!(pair.funding_asset(Side::Sell), "ETH");
        assert_eq!(pair.proceeds_asset(Side::Buy), "ETH");
        assert_eq!(pair.proceeds_asset(Side::Sell), "USD");
    }

    #[test]
    fn test_idempotency_key_ignores_size() {
        let pair = AssetPair::new("SOL", "USD");
        let a = OrderIntent::new(pair.clone(), Side::Buy, Sizing::Fraction(dec!(0.5)));
        let b = OrderIntent::new(pair, Side::Buy, Sizing::Quantity(dec!(3)));
        assert_eq!(a.idempotency_key(), b.idempotency_key());
        assert_eq!(a.idempotency_key().to_string(), "SOL/USD:buy");
    }

    #[test]
    fn test_intent_json_round_trip() {
        let json = r#"{
            "pair": "XBT/USD",
            "side": "sell",
            "sizing": {"type": "fraction", "value": "0.8"},
            "reference_price": "50000"
        }"#;
        let intent: OrderIntent = serde_json::from_str(json).unwrap();
        assert_eq!(intent.side, Side::Sell);
        assert_eq!(intent.sizing, Sizing::Fraction(dec!(0.8)));
        assert_eq!(intent.pricing(), Some(dec!(50000)));
        assert!(!intent.critical);
    }
}
