//! Configuration management
//!
//! Handles loading and validation of the JSON configuration file, with
//! environment variable overrides for the connection identity and state path.
//!
//! Every numeric exchange limit (quota sizes, decay rates, minimum order sizes)
//! lives here. Defaults are conservative starting points only; production
//! values must come from the exchange's current published limits.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::{CircuitBreakerConfig, DecayCounterConfig, RetryPolicy};
use crate::types::{AssetPair, RequestClass};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl CoordinatorConfig {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: CoordinatorConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override connection identity from the environment if set
    pub fn apply_env(&mut self) {
        if let Ok(id) = std::env::var("EXCHANGE_CONNECTION_ID") {
            if !id.trim().is_empty() {
                self.connection.connection_id = id;
            }
        }
        if let Ok(path) = std::env::var("EXCHANGE_STATE_DB") {
            if !path.trim().is_empty() {
                self.connection.state_db = PathBuf::from(path);
            }
        }
    }

    /// Reject values no component can operate with
    pub fn validate(&self) -> Result<()> {
        if self.connection.connection_id.trim().is_empty() {
            bail!("connection.connection_id must not be empty");
        }
        if self.nonce.persist_every == 0 {
            bail!("nonce.persist_every must be at least 1");
        }
        if self.nonce.resync_margin_us == 0 {
            bail!("nonce.resync_margin_us must be positive");
        }

        for class in RequestClass::ALL {
            let counter = self.admission.counter(class);
            if !(counter.max_counter.is_finite() && counter.max_counter > 0.0) {
                bail!("admission.{}.max_counter must be positive", class);
            }
            if !(counter.decay_per_sec.is_finite() && counter.decay_per_sec > 0.0) {
                bail!("admission.{}.decay_per_sec must be positive", class);
            }
        }
        if self.admission.failure_threshold == 0 {
            bail!("admission.failure_threshold must be at least 1");
        }
        if self.admission.open_duration_ms == 0 {
            bail!("admission.open_duration_ms must be positive");
        }
        if self.admission.max_open_duration_ms < self.admission.open_duration_ms {
            bail!("admission.max_open_duration_ms must not be shorter than open_duration_ms");
        }
        if self.admission.trial_timeout_ms == 0 {
            bail!("admission.trial_timeout_ms must be positive");
        }

        if self.balance.staleness_window_ms == 0 {
            bail!("balance.staleness_window_ms must be positive");
        }
        if self.balance.hard_deadline_ms < self.balance.staleness_window_ms {
            bail!("balance.hard_deadline_ms must not be shorter than staleness_window_ms");
        }
        if self.balance.mismatch_tolerance < Decimal::ZERO {
            bail!("balance.mismatch_tolerance must not be negative");
        }
        if self.balance.pull_interval_ms == 0 {
            bail!("balance.pull_interval_ms must be positive");
        }

        let exec = &self.execution;
        if exec.safety_margin_pct < Decimal::ZERO || exec.safety_margin_pct >= dec!(100) {
            bail!("execution.safety_margin_pct must be within [0, 100)");
        }
        if exec.min_order_size < Decimal::ZERO {
            bail!("execution.min_order_size must not be negative");
        }
        if let Some(max) = exec.max_order_size {
            if max <= Decimal::ZERO || max < exec.min_order_size {
                bail!("execution.max_order_size must be positive and not below min_order_size");
            }
        }
        if exec.slot_timeout_ms == 0 {
            bail!("execution.slot_timeout_ms must be positive");
        }
        // A slot must outlive the forced balance refresh inside it
        if exec.slot_timeout_ms <= self.balance.hard_deadline_ms {
            bail!("execution.slot_timeout_ms must exceed balance.hard_deadline_ms");
        }
        if exec.network_attempts == 0 {
            bail!("execution.network_attempts must be at least 1");
        }
        for (pair, rules) in &exec.pairs {
            if rules.min_size < Decimal::ZERO {
                bail!("execution.pairs.{}.min_size must not be negative", pair);
            }
            if let Some(max) = rules.max_size {
                if max < rules.min_size {
                    bail!("execution.pairs.{}.max_size is below min_size", pair);
                }
            }
            if rules.lot_decimals > 28 {
                bail!("execution.pairs.{}.lot_decimals exceeds 28", pair);
            }
        }

        Ok(())
    }

    pub fn with_connection_id(mut self, id: impl Into<String>) -> Self {
        self.connection.connection_id = id.into();
        self
    }

    pub fn with_state_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.connection.state_db = path.into();
        self
    }

    pub fn with_pair(mut self, pair: AssetPair, rules: PairRules) -> Self {
        self.execution.pairs.insert(pair, rules);
        self
    }
}

/// Connection identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connection_id: String,
    /// SQLite file holding the nonce record
    pub state_db: PathBuf,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_id: "primary".to_string(),
            state_db: PathBuf::from("state/nonce.db"),
        }
    }
}

/// Nonce issuance and persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// Added to the wall clock for the first nonce after startup
    pub safety_offset_us: u64,
    /// Forward jump after the exchange rejects a nonce
    pub resync_margin_us: u64,
    /// Nonces covered by each persisted ceiling (1 = persist every call)
    pub persist_every: u64,
    /// Attempts for a single persistence flush
    pub flush_attempts: u32,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            safety_offset_us: 1_000_000,
            resync_margin_us: 30_000_000,
            persist_every: 1,
            flush_attempts: 3,
        }
    }
}

/// Admission quotas and circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub order: DecayCounterConfig,
    pub balance: DecayCounterConfig,
    pub query: DecayCounterConfig,
    /// Consecutive hard failures before the circuit opens
    pub failure_threshold: u32,
    pub open_duration_ms: u64,
    pub max_open_duration_ms: u64,
    /// Unsettled half-open trial counts as failed after this long
    pub trial_timeout_ms: u64,
    /// Override audit records kept in memory
    pub audit_capacity: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            order: DecayCounterConfig::default(),
            balance: DecayCounterConfig::default(),
            query: DecayCounterConfig::default(),
            failure_threshold: 5,
            open_duration_ms: 30_000,
            max_open_duration_ms: 600_000,
            trial_timeout_ms: 30_000,
            audit_capacity: 256,
        }
    }
}

impl AdmissionConfig {
    pub fn counter(&self, class: RequestClass) -> DecayCounterConfig {
        match class {
            RequestClass::Order => self.order,
            RequestClass::Balance => self.balance,
            RequestClass::Query => self.query,
        }
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.failure_threshold)
            .with_open_duration(Duration::from_millis(self.open_duration_ms))
            .with_max_open_duration(Duration::from_millis(self.max_open_duration_ms))
            .with_trial_timeout(Duration::from_millis(self.trial_timeout_ms))
    }
}

/// Balance freshness and reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// Age after which a read forces a pull refresh
    pub staleness_window_ms: u64,
    /// Age after which, with both channels silent, the balance is unknown
    pub hard_deadline_ms: u64,
    /// Largest stream/pull disagreement tolerated before invalidating
    pub mismatch_tolerance: Decimal,
    /// Period of the background pull
    pub pull_interval_ms: u64,
    /// Attempts for a forced refresh pull
    pub refresh_attempts: u32,
    /// Longest a pull waits for balance-class quota
    pub refresh_admission_wait_ms: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            staleness_window_ms: 10_000,
            hard_deadline_ms: 30_000,
            mismatch_tolerance: dec!(0.00000001),
            pull_interval_ms: 15_000,
            refresh_attempts: 3,
            refresh_admission_wait_ms: 2_000,
        }
    }
}

impl BalanceConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn hard_deadline(&self) -> Duration {
        Duration::from_millis(self.hard_deadline_ms)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }

    pub fn refresh_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.refresh_attempts)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
    }
}

/// Exchange metadata for one pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRules {
    /// Minimum tradable base quantity
    pub min_size: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<Decimal>,
    /// Decimal places allowed in the base quantity
    #[serde(default = "default_lot_decimals")]
    pub lot_decimals: u32,
}

fn default_lot_decimals() -> u32 {
    8
}

impl PairRules {
    pub fn new(min_size: Decimal) -> Self {
        Self {
            min_size,
            max_size: None,
            lot_decimals: default_lot_decimals(),
        }
    }

    pub fn with_max_size(mut self, max_size: Decimal) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_lot_decimals(mut self, decimals: u32) -> Self {
        self.lot_decimals = decimals;
        self
    }
}

/// Order sizing and execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Percentage of the funding balance held back for fees and slippage
    pub safety_margin_pct: Decimal,
    /// Floor applied to every pair in addition to its own minimum
    pub min_order_size: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_order_size: Option<Decimal>,
    /// Longest an idempotency slot may be held
    pub slot_timeout_ms: u64,
    /// Attempts for an order that provably never reached the exchange
    pub network_attempts: u32,
    pub retry_delay_ms: u64,
    pub sweep_interval_ms: u64,
    /// Terminal outcomes kept for status reporting
    pub history_capacity: usize,
    /// Consecutive circuit-open rejections before status reports degraded
    pub degraded_after: u32,
    pub pairs: HashMap<AssetPair, PairRules>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            safety_margin_pct: dec!(2),
            min_order_size: Decimal::ZERO,
            max_order_size: None,
            slot_timeout_ms: 45_000,
            network_attempts: 3,
            retry_delay_ms: 250,
            sweep_interval_ms: 1_000,
            history_capacity: 512,
            degraded_after: 3,
            pairs: HashMap::new(),
        }
    }
}

impl ExecutionConfig {
    /// Margin as a fraction, e.g. 2% -> 0.02
    pub fn safety_margin(&self) -> Decimal {
        self.safety_margin_pct / dec!(100)
    }

    pub fn slot_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn network_policy(&self) -> RetryPolicy {
        let initial = Duration::from_millis(self.retry_delay_ms);
        RetryPolicy::new(self.network_attempts)
            .with_initial_delay(initial)
            .with_max_delay(initial.saturating_mul(8))
    }

    pub fn rules_for(&self, pair: &AssetPair) -> Option<&PairRules> {
        self.pairs.get(pair)
    }
}
