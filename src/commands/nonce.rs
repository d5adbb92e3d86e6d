//! Nonce record inspection and offline resync

use anyhow::{Context, Result};
use exchange_coordinator::nonce::{now_micros, NonceRecord, NonceStore, SqliteNonceStore};
use exchange_coordinator::CoordinatorConfig;
use tracing::{info, warn};

fn open_store(config_path: &str) -> Result<(CoordinatorConfig, SqliteNonceStore)> {
    let config = CoordinatorConfig::from_file(config_path)?;
    let store = SqliteNonceStore::open(&config.connection.state_db)?;
    info!("Nonce store: {}", store.path().display());
    Ok((config, store))
}

pub fn show(config_path: String) -> Result<()> {
    let (_, store) = open_store(&config_path)?;
    let records = store.records()?;
    if records.is_empty() {
        info!("No nonce records stored");
    }
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

/// Move the stored high-water mark ahead of the clock so the next process
/// start issues nonces the exchange will accept
pub fn resync(config_path: String, margin_secs: Option<u64>) -> Result<()> {
    let (config, store) = open_store(&config_path)?;
    let id = &config.connection.connection_id;
    let margin_us = margin_secs
        .map(|s| s.saturating_mul(1_000_000))
        .unwrap_or(config.nonce.resync_margin_us);

    let current = store
        .load(id)
        .with_context(|| format!("Failed to read nonce record for {}", id))?
        .map(|r| r.last_nonce)
        .unwrap_or(0);
    let target = current.max(now_micros()).saturating_add(margin_us);

    warn!("Resyncing nonce for {}: {} -> {}", id, current, target);
    store.save(&NonceRecord::new(id.clone(), target))?;

    println!("{}", target);
    Ok(())
}
