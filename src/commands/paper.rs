//! Paper session command implementation
//!
//! Replays a file of order intents through a full connection backed by the
//! in-memory paper exchange and prints one JSON line per intent.

use anyhow::{Context, Result};
use exchange_coordinator::execution::OrderOutcome;
use exchange_coordinator::{
    AssetPair, Connection, CoordinatorConfig, ExchangeGateway, OrderIntent, PaperGateway,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Starting state of the paper exchange plus the intents to replay
#[derive(Debug, Clone, Deserialize)]
struct Session {
    #[serde(default)]
    balances: HashMap<String, Decimal>,
    #[serde(default)]
    prices: HashMap<AssetPair, Decimal>,
    /// Rest limit orders on the book instead of filling them at once
    #[serde(default)]
    rest_limit_orders: bool,
    /// Pause between intents, in milliseconds
    #[serde(default)]
    interval_ms: u64,
    intents: Vec<OrderIntent>,
}

#[derive(Debug, Serialize)]
struct IntentReport<'a> {
    index: usize,
    intent: &'a OrderIntent,
    #[serde(flatten)]
    result: IntentResult,
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum IntentResult {
    Accepted {
        order_id: String,
        size: Decimal,
        nonce: u64,
    },
    Rejected {
        rejection: exchange_coordinator::error::Rejection,
    },
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    accepted: usize,
    rejected: usize,
    balances: HashMap<String, Decimal>,
    history: Vec<OrderOutcome>,
}

pub fn run(config_path: String, intents_path: String, state_db: Option<String>) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async { run_async(config_path, intents_path, state_db).await })
}

async fn run_async(
    config_path: String,
    intents_path: String,
    state_db: Option<String>,
) -> Result<()> {
    let mut config = CoordinatorConfig::from_file(&config_path)?;
    if let Some(path) = state_db {
        info!("Overriding nonce store path to: {}", path);
        config = config.with_state_db(path);
    }

    let contents = fs::read_to_string(&intents_path)
        .with_context(|| format!("Failed to read intents file {}", intents_path))?;
    let session: Session =
        serde_json::from_str(&contents).context("Failed to parse intents JSON")?;
    info!(
        "Paper session: {} intents, {} starting balances",
        session.intents.len(),
        session.balances.len()
    );

    let gateway = Arc::new(build_gateway(&session));
    let conn = Connection::open_with_sqlite(config, gateway.clone() as Arc<dyn ExchangeGateway>)
        .await?;
    conn.start().await?;

    let mut accepted = 0;
    let mut rejected = 0;

    for (index, intent) in session.intents.iter().enumerate() {
        let result = match conn.submit(intent.clone()).await {
            Ok(receipt) => {
                accepted += 1;
                IntentResult::Accepted {
                    order_id: receipt.order_id,
                    size: receipt.size,
                    nonce: receipt.nonce,
                }
            }
            Err(e) => {
                rejected += 1;
                warn!("Intent {} ({}) rejected: {}", index, intent.idempotency_key(), e);
                IntentResult::Rejected {
                    rejection: e.to_rejection(),
                }
            }
        };

        let report = IntentReport {
            index,
            intent,
            result,
        };
        println!("{}", serde_json::to_string(&report)?);

        if session.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(session.interval_ms)).await;
        }
    }

    let status = conn.status();
    if status.degraded {
        error!("Session ended with the coordinator degraded");
    }
    info!("Final status: {}", serde_json::to_string(&status)?);

    let summary = SessionSummary {
        accepted,
        rejected,
        balances: session
            .balances
            .keys()
            .map(|asset| (asset.clone(), gateway.balance(asset).available))
            .collect(),
        history: conn.coordinator().history(),
    };
    conn.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!("Paper session complete: {} accepted, {} rejected", accepted, rejected);
    Ok(())
}

fn build_gateway(session: &Session) -> PaperGateway {
    let gateway = session
        .balances
        .iter()
        .fold(PaperGateway::new(), |gw, (asset, amount)| {
            gw.with_balance(asset, *amount)
        });
    let gateway = session
        .prices
        .iter()
        .fold(gateway, |gw, (pair, price)| gw.with_price(pair.clone(), *price));
    gateway.rest_limit_orders(session.rest_limit_orders);
    gateway
}
