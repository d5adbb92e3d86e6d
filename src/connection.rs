//! One authenticated exchange connection and everything scoped to it
//!
//! The nonce sequence, admission counters, circuit breaker and balance ledger
//! all belong to a single connection. [`Connection`] builds them together,
//! runs their background tasks, and tears them down in order.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admission::RateAdmissionController;
use crate::balance::{BalanceEntry, BalanceStateStore, DualChannelSync};
use crate::common::{lock, CircuitTransition};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::execution::{CoordinatorStatus, ExecutionCoordinator, SubmitReceipt};
use crate::gateway::ExchangeGateway;
use crate::nonce::{NonceSequencer, NonceStore, SqliteNonceStore};
use crate::types::{OrderIntent, RequestClass};

pub struct Connection {
    config: CoordinatorConfig,
    gateway: Arc<dyn ExchangeGateway>,
    sequencer: Arc<NonceSequencer>,
    admission: Arc<RateAdmissionController>,
    sync: Arc<DualChannelSync>,
    coordinator: Arc<ExecutionCoordinator>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Build every per-connection component and seed admission counters from
    /// the exchange
    pub async fn open(
        config: CoordinatorConfig,
        gateway: Arc<dyn ExchangeGateway>,
        nonce_store: Arc<dyn NonceStore>,
    ) -> Result<Self> {
        config.validate()?;
        let id = config.connection.connection_id.clone();

        let sequencer = Arc::new(
            NonceSequencer::open(&id, config.nonce.clone(), nonce_store)
                .await
                .with_context(|| format!("Failed to open nonce sequence for {}", id))?,
        );

        let admission = Arc::new(RateAdmissionController::new(&config.admission));
        match gateway.admission_status().await {
            Ok(statuses) => admission.sync_from_gateway(&statuses),
            Err(e) => warn!("Could not read exchange counters, starting from zero: {}", e),
        }

        let store = Arc::new(BalanceStateStore::new(config.balance.clone()));
        let sync = Arc::new(DualChannelSync::new(
            store,
            gateway.clone(),
            sequencer.clone(),
            admission.clone(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            config.execution.clone(),
            gateway.clone(),
            sequencer.clone(),
            admission.clone(),
            sync.clone(),
        ));

        let (shutdown, _) = watch::channel(false);
        info!("Connection {} opened", id);

        Ok(Self {
            config,
            gateway,
            sequencer,
            admission,
            sync,
            coordinator,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open with the SQLite nonce store at the configured path
    pub async fn open_with_sqlite(
        config: CoordinatorConfig,
        gateway: Arc<dyn ExchangeGateway>,
    ) -> Result<Self> {
        let store = SqliteNonceStore::open(&config.connection.state_db)?;
        Self::open(config, gateway, Arc::new(store)).await
    }

    /// Start the stream consumer, periodic pull and slot sweeper
    pub async fn start(&self) -> CoordinatorResult<()> {
        let updates = self
            .gateway
            .subscribe_balance_stream()
            .await
            .map_err(|e| CoordinatorError::from_gateway(e, RequestClass::Query, 1))?;

        let mut tasks = lock(&self.tasks);

        let sync = Arc::clone(&self.sync);
        let rx = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move { sync.run_stream(updates, rx).await }));

        let sync = Arc::clone(&self.sync);
        let rx = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move { sync.run_periodic_pull(rx).await }));

        let coordinator = Arc::clone(&self.coordinator);
        let rx = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move { coordinator.run_sweeper(rx).await }));

        info!(
            "Connection {} started ({} background tasks)",
            self.id(),
            tasks.len()
        );
        Ok(())
    }

    pub async fn submit(&self, intent: OrderIntent) -> CoordinatorResult<SubmitReceipt> {
        self.coordinator.submit(intent).await
    }

    pub async fn balance(&self, asset: &str) -> CoordinatorResult<BalanceEntry> {
        self.sync.get(asset).await
    }

    /// Operator force-close of the circuit. Closing invalidates every cached
    /// balance.
    pub fn override_reset(&self, reason: &str) -> Option<CircuitTransition> {
        let transition = self.admission.override_reset(reason);
        self.sync.store().on_circuit_transition(transition);
        transition
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.coordinator.status()
    }

    /// Stop background tasks, flush the nonce high-water mark and drop the
    /// balance cache
    pub async fn shutdown(&self) -> CoordinatorResult<()> {
        let _ = self.shutdown.send(true);

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.sequencer.flush_now().await?;
        self.sync.store().clear();
        info!("Connection {} shut down", self.id());
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.config.connection.connection_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    pub fn sync(&self) -> &Arc<DualChannelSync> {
        &self.sync
    }

    pub fn store(&self) -> &Arc<BalanceStateStore> {
        self.sync.store()
    }

    pub fn sequencer(&self) -> &Arc<NonceSequencer> {
        &self.sequencer
    }

    pub fn admission(&self) -> &Arc<RateAdmissionController> {
        &self.admission
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Outcome;
    use crate::balance::Freshness;
    use crate::common::CircuitState;
    use crate::gateway::{CounterStatus, PaperGateway};
    use crate::nonce::MemoryNonceStore;
    use crate::types::{AssetPair, Side, Sizing};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn paper() -> Arc<PaperGateway> {
        Arc::new(
            PaperGateway::new()
                .with_balance("USD", dec!(5000))
                .with_balance("XBT", dec!(3))
                .with_price(AssetPair::new("XBT", "USD"), dec!(1000)),
        )
    }

    #[tokio::test]
    async fn test_open_seeds_counters_from_exchange() {
        let gateway = paper();
        gateway.set_counters(vec![CounterStatus {
            class: RequestClass::Order,
            counter: 12.0,
            max_counter: 15.0,
            decay_per_sec: 0.33,
        }]);

        let conn = Connection::open(
            CoordinatorConfig::default(),
            gateway,
            Arc::new(MemoryNonceStore::new()),
        )
        .await
        .unwrap();

        let snapshot = conn.admission().snapshot();
        let order = snapshot
            .counters
            .iter()
            .find(|c| c.class == RequestClass::Order)
            .unwrap();
        assert!(order.value >= 11.9);
    }

    #[tokio::test]
    async fn test_stream_runs_until_shutdown() {
        let gateway = paper();
        let store = Arc::new(MemoryNonceStore::new());
        let conn = Connection::open(CoordinatorConfig::default(), gateway.clone(), store.clone())
            .await
            .unwrap();
        conn.start().await.unwrap();

        gateway.set_balance("ETH", dec!(4));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(conn.store().get("ETH").unwrap().available, dec!(4));

        let intent = OrderIntent::new(AssetPair::new("XBT", "USD"), Side::Sell, Sizing::Fraction(dec!(0.5)));
        let receipt = conn.submit(intent).await.unwrap();

        conn.shutdown().await.unwrap();
        assert!(conn.store().is_empty());
        assert!(store.last_nonce(conn.id()).unwrap() >= receipt.nonce);
    }

    #[tokio::test]
    async fn test_override_reset_invalidates_balances() {
        let conn = Connection::open(
            CoordinatorConfig::default(),
            paper(),
            Arc::new(MemoryNonceStore::new()),
        )
        .await
        .unwrap();
        conn.balance("XBT").await.unwrap();

        for _ in 0..conn.config().admission.failure_threshold {
            conn.admission()
                .record_result(RequestClass::Order, Outcome::HardFailure);
        }
        assert_eq!(conn.admission().circuit_state(), CircuitState::Open);

        assert!(conn.override_reset("exchange confirmed healthy").is_some());
        assert_eq!(conn.admission().circuit_state(), CircuitState::Closed);
        assert_eq!(
            conn.store().get("XBT").unwrap().freshness,
            Freshness::Invalidated
        );
        assert_eq!(conn.admission().audit_log().len(), 1);
    }
}
