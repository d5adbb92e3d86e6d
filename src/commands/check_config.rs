//! Config check command implementation

use anyhow::Result;
use exchange_coordinator::CoordinatorConfig;
use tracing::info;

pub fn run(config_path: String) -> Result<()> {
    let config = CoordinatorConfig::from_file(&config_path)?;
    info!("Configuration {} is valid", config_path);

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
