//! Strictly increasing nonce issuance for one connection
//!
//! Issued values follow the wall clock in microseconds, never fall below the
//! persisted record, and are serialized through a single async mutex. The
//! persisted value is a lease ceiling: before any value above the ceiling is
//! handed out, a new ceiling is flushed, so a crash can never lead to reuse.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::{NonceRecord, NonceStore};
use crate::common::{retry_bounded, RetryPolicy};
use crate::config::NonceConfig;
use crate::error::{CoordinatorError, CoordinatorResult};

#[derive(Debug)]
struct SequencerState {
    /// Value loaded from storage at startup
    floor: u64,
    last_issued: Option<u64>,
    /// Highest value known to be durable
    ceiling: u64,
}

pub struct NonceSequencer {
    connection_id: String,
    config: NonceConfig,
    store: Arc<dyn NonceStore>,
    state: Mutex<SequencerState>,
}

impl std::fmt::Debug for NonceSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceSequencer")
            .field("connection_id", &self.connection_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Current wall clock in microseconds since the epoch
pub fn now_micros() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
}

impl NonceSequencer {
    /// Load the persisted record and build the sequencer for `connection_id`
    pub async fn open(
        connection_id: impl Into<String>,
        config: NonceConfig,
        store: Arc<dyn NonceStore>,
    ) -> CoordinatorResult<Self> {
        let connection_id = connection_id.into();

        let loader = Arc::clone(&store);
        let id = connection_id.clone();
        let record = tokio::task::spawn_blocking(move || loader.load(&id))
            .await
            .map_err(|e| CoordinatorError::Persistence(format!("nonce load task failed: {}", e)))?
            .map_err(|e| CoordinatorError::Persistence(format!("{:#}", e)))?;

        let floor = record.map(|r| r.last_nonce).unwrap_or(0);
        info!("Nonce sequencer for {} starts above {}", connection_id, floor);

        Ok(Self {
            connection_id,
            config,
            store,
            state: Mutex::new(SequencerState {
                floor,
                last_issued: None,
                ceiling: floor,
            }),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Issue the next nonce
    pub async fn next(&self) -> CoordinatorResult<u64> {
        let mut state = self.state.lock().await;
        let now = now_micros();

        let value = match state.last_issued {
            None => state
                .floor
                .saturating_add(1)
                .max(now.saturating_add(self.config.safety_offset_us)),
            Some(last) => last.saturating_add(1).max(now),
        };

        if value > state.ceiling {
            let ceiling = value.saturating_add(self.config.persist_every.max(1) - 1);
            self.flush(ceiling).await?;
            state.ceiling = ceiling;
        }

        state.last_issued = Some(value);
        Ok(value)
    }

    /// Jump forward after the exchange rejected a nonce as stale.
    ///
    /// Returns the new base; the next issued value is strictly above it.
    pub async fn resync_after_rejection(&self) -> CoordinatorResult<u64> {
        let mut state = self.state.lock().await;
        let last = state.last_issued.unwrap_or(state.floor);
        let base = last
            .max(now_micros())
            .saturating_add(self.config.resync_margin_us);

        if base > state.ceiling {
            self.flush(base).await?;
            state.ceiling = base;
        }
        state.last_issued = Some(base);

        warn!(
            "Nonce resync for {}: {} -> {} (margin {}us)",
            self.connection_id, last, base, self.config.resync_margin_us
        );
        Ok(base)
    }

    pub async fn last_issued(&self) -> Option<u64> {
        self.state.lock().await.last_issued
    }

    /// Highest value currently covered by the durable record
    pub async fn persisted_ceiling(&self) -> u64 {
        self.state.lock().await.ceiling
    }

    /// Persist the last issued value (used at shutdown)
    pub async fn flush_now(&self) -> CoordinatorResult<()> {
        let state = self.state.lock().await;
        match state.last_issued {
            Some(last) if last > state.floor => self.flush(last.max(state.ceiling)).await,
            _ => Ok(()),
        }
    }

    async fn flush(&self, value: u64) -> CoordinatorResult<()> {
        let policy = RetryPolicy::new(self.config.flush_attempts)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(200));
        let record = NonceRecord::new(self.connection_id.clone(), value);

        let result = retry_bounded(
            &policy,
            "nonce flush",
            || {
                let store = Arc::clone(&self.store);
                let record = record.clone();
                async move {
                    match tokio::task::spawn_blocking(move || store.save(&record)).await {
                        Ok(saved) => saved,
                        Err(e) => Err(anyhow::Error::new(e)),
                    }
                }
            },
            |_| true,
        )
        .await;

        match result {
            Ok(()) => {
                debug!("Nonce ceiling for {} persisted at {}", self.connection_id, value);
                Ok(())
            }
            Err(exhausted) => {
                tracing::error!(
                    "Nonce flush for {} failed after {} attempt(s): {:#}",
                    self.connection_id,
                    exhausted.attempts,
                    exhausted.last_error
                );
                Err(CoordinatorError::Persistence(format!(
                    "nonce flush failed: {:#}",
                    exhausted.last_error
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::store::MemoryNonceStore;
    use std::collections::HashSet;

    fn config(persist_every: u64) -> NonceConfig {
        NonceConfig {
            persist_every,
            ..NonceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_first_nonce_includes_safety_offset() {
        let store = Arc::new(MemoryNonceStore::new());
        let seq = NonceSequencer::open("c", config(1), store).await.unwrap();

        let before = now_micros();
        let first = seq.next().await.unwrap();
        assert!(first >= before + NonceConfig::default().safety_offset_us);
    }

    #[tokio::test]
    async fn test_sequential_values_strictly_increase() {
        let store = Arc::new(MemoryNonceStore::new());
        let seq = NonceSequencer::open("c", config(1), store).await.unwrap();

        let mut prev = 0;
        for _ in 0..500 {
            let n = seq.next().await.unwrap();
            assert!(n > prev);
            prev = n;
        }
    }

    #[tokio::test]
    async fn test_starts_above_persisted_value_far_in_future() {
        let store = Arc::new(MemoryNonceStore::new());
        let future = now_micros() + 3_600_000_000;
        store.save(&NonceRecord::new("c", future)).unwrap();

        let seq = NonceSequencer::open("c", config(1), store).await.unwrap();
        assert_eq!(seq.next().await.unwrap(), future + 1);
    }

    #[tokio::test]
    async fn test_every_issued_value_is_covered_by_lease() {
        let store = Arc::new(MemoryNonceStore::new());
        let seq = NonceSequencer::open("c", config(50), store.clone())
            .await
            .unwrap();

        let mut issued = Vec::new();
        for _ in 0..20 {
            issued.push(seq.next().await.unwrap());
        }
        let persisted = store.last_nonce("c").unwrap();
        assert!(issued.iter().all(|n| *n <= persisted));

        // Simulated crash: a fresh sequencer must not reissue anything
        let restarted = NonceSequencer::open("c", config(50), store).await.unwrap();
        let next = restarted.next().await.unwrap();
        assert!(issued.iter().all(|n| next > *n));
    }

    #[tokio::test]
    async fn test_resync_jumps_by_margin() {
        let store = Arc::new(MemoryNonceStore::new());
        let cfg = NonceConfig {
            resync_margin_us: 60_000_000,
            ..config(1)
        };
        let seq = NonceSequencer::open("c", cfg, store.clone()).await.unwrap();

        let before = seq.next().await.unwrap();
        let base = seq.resync_after_rejection().await.unwrap();
        assert!(base >= before + 60_000_000);
        assert!(seq.next().await.unwrap() > base);
        assert!(store.last_nonce("c").unwrap() >= base);
    }

    #[tokio::test]
    async fn test_transient_flush_failure_is_retried() {
        let store = Arc::new(MemoryNonceStore::new());
        let seq = NonceSequencer::open("c", config(1), store.clone())
            .await
            .unwrap();

        store.fail_next_saves(2);
        let n = seq.next().await.unwrap();
        assert_eq!(store.last_nonce("c"), Some(n));
    }

    #[tokio::test]
    async fn test_persistent_flush_failure_withholds_nonce() {
        let store = Arc::new(MemoryNonceStore::new());
        let seq = NonceSequencer::open("c", config(1), store.clone())
            .await
            .unwrap();

        store.fail_next_saves(10);
        let err = seq.next().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Persistence(_)));
        assert_eq!(seq.last_issued().await, None);
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_collide() {
        let store = Arc::new(MemoryNonceStore::new());
        let seq = Arc::new(
            NonceSequencer::open("c", config(10), store)
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let seq = Arc::clone(&seq);
            handles.push(tokio::spawn(async move {
                let mut values = Vec::new();
                for _ in 0..100 {
                    values.push(seq.next().await.unwrap());
                }
                values
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            let values = handle.await.unwrap();
            // Each caller observes its own values in increasing order
            assert!(values.windows(2).all(|w| w[0] < w[1]));
            for v in values {
                assert!(all.insert(v), "duplicate nonce {}", v);
            }
        }
        assert_eq!(all.len(), 800);
    }
}
