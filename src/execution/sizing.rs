//! Order sizing against the funding balance
//!
//! Buys are funded by the quote asset, sells by the base asset. The usable
//! balance is the funding balance minus the safety margin. The resulting base
//! quantity is clamped down to the maximum, rounded down to the lot size, and
//! rejected if it falls below the minimum. Sizes are never rounded up.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::config::ExecutionConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{AssetPair, OrderIntent, Side, Sizing};

/// Limits applied to one pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizingRules {
    /// Fraction of the balance held back, in [0, 1)
    pub margin: Decimal,
    pub min_size: Decimal,
    pub max_size: Option<Decimal>,
    pub lot_decimals: u32,
}

impl SizingRules {
    /// Combine the global limits with the pair's exchange metadata
    pub fn resolve(config: &ExecutionConfig, pair: &AssetPair) -> Self {
        let rules = config.rules_for(pair);
        let pair_min = rules.map(|r| r.min_size).unwrap_or(Decimal::ZERO);
        let max_size = match (config.max_order_size, rules.and_then(|r| r.max_size)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        Self {
            margin: config.safety_margin(),
            min_size: config.min_order_size.max(pair_min),
            max_size,
            lot_decimals: rules.map(|r| r.lot_decimals).unwrap_or(8),
        }
    }
}

/// A sized order, before a nonce is attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizedOrder {
    /// Base-asset quantity
    pub size: Decimal,
    /// Asset whose balance funds the order
    pub funding_asset: String,
    /// Funding consumed: quote notional for buys, base quantity for sells
    pub funding_amount: Decimal,
}

fn validate(intent: &OrderIntent) -> CoordinatorResult<()> {
    match intent.sizing {
        Sizing::Fraction(f) if f <= Decimal::ZERO || f > Decimal::ONE => {
            return Err(CoordinatorError::InvalidIntent(format!(
                "fraction {} outside (0, 1]",
                f
            )));
        }
        Sizing::Quantity(q) if q <= Decimal::ZERO => {
            return Err(CoordinatorError::InvalidIntent(format!(
                "quantity {} must be positive",
                q
            )));
        }
        _ => {}
    }

    for (name, price) in [
        ("limit price", intent.limit_price),
        ("reference price", intent.reference_price),
    ] {
        if let Some(p) = price {
            if p <= Decimal::ZERO {
                return Err(CoordinatorError::InvalidIntent(format!(
                    "{} {} must be positive",
                    name, p
                )));
            }
        }
    }

    if intent.side == Side::Buy && intent.pricing().is_none() {
        return Err(CoordinatorError::InvalidIntent(
            "buy needs a limit or reference price to size against the quote balance".into(),
        ));
    }
    Ok(())
}

fn overflow(step: &str) -> CoordinatorError {
    CoordinatorError::InvalidIntent(format!("{} exceeds the decimal range", step))
}

/// Size `intent` against `available`, the funding asset's available balance
pub fn size_order(
    intent: &OrderIntent,
    available: Decimal,
    rules: &SizingRules,
) -> CoordinatorResult<SizedOrder> {
    validate(intent)?;

    let funding_asset = intent.pair.funding_asset(intent.side).to_string();
    // Only buys convert between quote and base; validate() guarantees a price
    let price = intent.pricing().unwrap_or(Decimal::ONE);
    let to_funding = |base: Decimal| match intent.side {
        Side::Buy => base.checked_mul(price).ok_or_else(|| overflow("notional")),
        Side::Sell => Ok(base),
    };
    let kept = Decimal::ONE - rules.margin;

    if available <= Decimal::ZERO {
        return Err(CoordinatorError::InsufficientBalance {
            asset: funding_asset,
            available,
            required: to_funding(rules.min_size)?,
        });
    }

    let usable = available
        .checked_mul(kept)
        .ok_or_else(|| overflow("usable balance"))?;

    let raw = match intent.sizing {
        Sizing::Fraction(fraction) => {
            let budget = usable
                .checked_mul(fraction)
                .ok_or_else(|| overflow("budget"))?;
            match intent.side {
                Side::Buy => budget
                    .checked_div(price)
                    .ok_or_else(|| overflow("size"))?,
                Side::Sell => budget,
            }
        }
        Sizing::Quantity(quantity) => {
            let required = to_funding(quantity)?;
            if required > usable {
                return Err(CoordinatorError::InsufficientBalance {
                    asset: funding_asset,
                    available,
                    required: required
                        .checked_div(kept)
                        .ok_or_else(|| overflow("required balance"))?,
                });
            }
            quantity
        }
    };

    let clamped = match rules.max_size {
        Some(max) if raw > max => max,
        _ => raw,
    };
    let size = clamped
        .round_dp_with_strategy(rules.lot_decimals, RoundingStrategy::ToZero)
        .normalize();

    if size <= Decimal::ZERO || size < rules.min_size {
        return Err(CoordinatorError::TooSmall {
            pair: intent.pair.clone(),
            size,
            minimum: rules.min_size,
        });
    }

    Ok(SizedOrder {
        size,
        funding_amount: to_funding(size)?,
        funding_asset,
    })
}
