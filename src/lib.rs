//! Kotobase: vocabulary ingestion for tokenized Japanese text
//!
//! Takes sentences that have already been morphologically analyzed and turns
//! them into a relational vocabulary store, featuring:
//! - An immutable in-memory JMdict index for reading and definition lookup
//! - A fixed-size worker pool for CPU-bound per-sentence analysis
//! - A reorder buffer that restores sentence order after parallel processing
//! - A batch writer that groups writes into size/interval-bounded transactions
//! - Upsert-based word de-duplication, sentence interning, and per-source
//!   occurrence counts in SQLite
//! - Crash-safe resume via a per-source sentence checkpoint committed in the
//!   same transaction as the sentence's writes

pub mod config;
pub mod dictionary;
pub mod ingest;
pub mod store;
pub mod types;

pub use config::Config;
pub use types::*;
