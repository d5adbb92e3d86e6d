//! Nonce issuance and its durable record

pub mod sequencer;
pub mod store;

pub use sequencer::{now_micros, NonceSequencer};
pub use store::{MemoryNonceStore, NonceRecord, NonceStore, SqliteNonceStore};
