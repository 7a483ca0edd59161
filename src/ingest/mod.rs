//! Ingestion pipeline orchestration
//!
//! Coordinates the full flow: checkpoint → parallel sentence analysis →
//! reordering → batched transactional writes. Sentences are analyzed out of
//! order by the worker pool; a reorder buffer in the consumer restores the
//! original order so the per-source checkpoint only ever advances.
//!
//! Every sentence's word writes land in the same transaction as its
//! checkpoint update, so after a crash `last_processed_sentence = k` means
//! sentences `0..=k` are durably committed and nothing beyond `k` is.
//! Re-running with the same source resumes at `k + 1`.

mod batch_writer;
mod worker_pool;

pub use batch_writer::{BatchWriter, OnError, WriteFn, WriterError};
pub use worker_pool::{Job, JobPool, PoolError, WorkerPool};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::dictionary::{format_definitions, to_hiragana, DictionaryIndex, JmdictEntry};
use crate::store;
use crate::types::Sentence;

/// Timer-driven flush period for the batch writer.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Primary POS categories that never become vocabulary: symbols,
/// supplementary symbols, particles, auxiliary verbs.
const FILTERED_POS: [&str; 4] = ["記号", "補助記号", "助詞", "助動詞"];

/// Tokens whose surface is nothing but ASCII letters, digits, whitespace,
/// and punctuation carry no Japanese vocabulary.
static ASCII_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9\s[:punct:]]+$").expect("ascii filter regex"));

/// Errors from an ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingestion cancelled")]
    Cancelled,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Prepared data for one word's occurrences within a sentence.
#[derive(Debug, Clone)]
struct WordOccurrence {
    word: String,
    reading: String,
    definitions: String,
    count: u32,
}

/// Result of analyzing one sentence, before any database work.
struct ProcessedSentence {
    index: usize,
    sentence: String,
    words: Vec<WordOccurrence>,
    error: Option<anyhow::Error>,
}

type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Builds the worker pool for a run; replaceable so tests can inject
/// failing pools.
pub type PoolFactory = Box<dyn Fn(usize, usize) -> Arc<dyn JobPool> + Send + Sync>;

/// Ingests analyzed sentences into the vocabulary store.
pub struct Ingester {
    pool: SqlitePool,
    dictionary: Option<Arc<DictionaryIndex>>,
    workers: usize,
    batch_size: usize,
    on_progress: Option<ProgressFn>,
    pool_factory: Option<PoolFactory>,
}

impl Ingester {
    pub fn new(pool: SqlitePool, dictionary: Option<Arc<DictionaryIndex>>) -> Self {
        let defaults = IngestConfig::default();
        Self {
            pool,
            dictionary,
            workers: defaults.workers,
            batch_size: defaults.batch_size,
            on_progress: None,
            pool_factory: None,
        }
    }

    pub fn with_config(self, config: &IngestConfig) -> Self {
        self.with_workers(config.workers).with_batch_size(config.batch_size)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Installs a progress observer, called on batch boundaries and once at
    /// completion with `(processed, total)`.
    pub fn with_progress(mut self, on_progress: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    pub fn with_pool_factory(
        mut self,
        factory: impl Fn(usize, usize) -> Arc<dyn JobPool> + Send + Sync + 'static,
    ) -> Self {
        self.pool_factory = Some(Box::new(factory));
        self
    }

    /// Processes `sentences` for `source_id`, resuming from the source's
    /// checkpoint. Returns the number of durably written word occurrences.
    ///
    /// Already-committed progress survives cancellation; a re-run picks up
    /// at the first sentence whose transaction never committed.
    pub async fn ingest(
        &self,
        cancel: &CancellationToken,
        source_id: i64,
        sentences: &[Sentence],
    ) -> Result<u64, IngestError> {
        let last_processed = {
            let mut conn = self
                .pool
                .acquire()
                .await
                .context("failed to acquire connection for checkpoint read")?;
            match store::get_source_progress(&mut conn, source_id).await {
                Ok(index) => index,
                Err(e) => {
                    warn!(source_id, error = %e, "failed to read checkpoint, starting over");
                    -1
                }
            }
        };
        if last_processed >= 0 {
            info!(
                source_id,
                resume_at = last_processed + 1,
                "resuming from checkpoint"
            );
        }

        let total = sentences.len();
        let start_idx = (last_processed + 1).max(0) as usize;
        if start_idx >= total {
            return Ok(0);
        }

        let cancel = cancel.child_token();
        let queue = self.workers * 2;
        let worker_pool: Arc<dyn JobPool> = match &self.pool_factory {
            Some(factory) => factory(self.workers, queue),
            None => Arc::new(WorkerPool::new(self.workers, queue)),
        };
        worker_pool.start(&cancel);

        let (result_tx, result_rx) = mpsc::channel::<ProcessedSentence>(queue);
        let writer = Arc::new(BatchWriter::new(
            self.pool.clone(),
            self.batch_size,
            FLUSH_INTERVAL,
        ));
        let total_links = Arc::new(AtomicU64::new(0));

        let consumer = tokio::spawn(consume_results(ConsumerArgs {
            results: result_rx,
            writer: Arc::clone(&writer),
            cancel: cancel.clone(),
            source_id,
            start_idx,
            total,
            batch_size: self.batch_size,
            total_links: Arc::clone(&total_links),
            on_progress: self.on_progress.clone(),
        }));

        // Producer: one analysis job per remaining sentence, in order
        let mut submit_failure: Option<PoolError> = None;
        for (index, sentence) in sentences.iter().enumerate().skip(start_idx) {
            if cancel.is_cancelled() {
                break;
            }
            let job = analysis_job(
                index,
                sentence.clone(),
                self.dictionary.clone(),
                result_tx.clone(),
            );
            match worker_pool.submit_with_cancel(&cancel, job).await {
                Ok(()) => {}
                Err(PoolError::Closed) | Err(PoolError::Cancelled) => break,
                Err(e) => {
                    submit_failure = Some(e);
                    cancel.cancel();
                    break;
                }
            }
        }

        // Let workers drain, then close the result channel exactly once so
        // the consumer terminates
        worker_pool.close().await;
        drop(result_tx);

        let consumer_result = consumer.await;
        let close_result = writer.close().await;

        if let Some(e) = submit_failure {
            return Err(IngestError::Pool(e));
        }
        consumer_result
            .context("consumer task panicked")
            .map_err(IngestError::Other)??;
        close_result.map_err(IngestError::Other)?;

        Ok(total_links.load(Ordering::Relaxed))
    }
}

struct ConsumerArgs {
    results: mpsc::Receiver<ProcessedSentence>,
    writer: Arc<BatchWriter>,
    cancel: CancellationToken,
    source_id: i64,
    start_idx: usize,
    total: usize,
    batch_size: usize,
    total_links: Arc<AtomicU64>,
    on_progress: Option<ProgressFn>,
}

/// Drains worker results, restores sentence order, and submits one write
/// callback per sentence. Owns the reorder buffer: results are held until
/// the run of indices starting at the cursor is contiguous.
async fn consume_results(args: ConsumerArgs) -> Result<(), IngestError> {
    let ConsumerArgs {
        mut results,
        writer,
        cancel,
        source_id,
        start_idx,
        total,
        batch_size,
        total_links,
        on_progress,
    } = args;

    let mut buffer: HashMap<usize, ProcessedSentence> = HashMap::new();
    let mut next_idx = start_idx;

    for _ in start_idx..total {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            result = results.recv() => match result {
                Some(result) => result,
                // Producer stopped early; nothing more will arrive
                None => return Ok(()),
            },
        };

        if let Some(e) = result.error {
            cancel.cancel();
            return Err(IngestError::Other(
                e.context(format!("failed to analyze sentence {}", result.index)),
            ));
        }

        buffer.insert(result.index, result);

        // Hand every contiguous finished sentence to the writer
        while let Some(item) = buffer.remove(&next_idx) {
            let write = sentence_write(item, source_id, Arc::clone(&total_links));
            if let Err(e) = writer.submit(write).await {
                cancel.cancel();
                return Err(IngestError::Other(
                    anyhow::Error::from(e).context("failed to submit sentence writes"),
                ));
            }
            next_idx += 1;
            // Approximate: the batch holding this sentence may not have
            // flushed yet
            if let Some(on_progress) = &on_progress {
                if next_idx % batch_size == 0 {
                    on_progress(next_idx, total);
                }
            }
        }
    }

    if let Some(on_progress) = &on_progress {
        on_progress(total, total);
    }
    Ok(())
}

/// One write callback per sentence: word upserts, source links, and the
/// checkpoint update, all inside the batch's transaction.
fn sentence_write(
    item: ProcessedSentence,
    source_id: i64,
    total_links: Arc<AtomicU64>,
) -> WriteFn {
    Box::new(move |conn| {
        Box::pin(async move {
            for w in &item.words {
                let word_id = store::upsert_word(
                    &mut *conn,
                    &w.word,
                    &w.word,
                    &w.reading,
                    &w.definitions,
                    "ja",
                )
                .await
                .with_context(|| format!("failed to persist word {}", w.word))?;

                store::link_word_to_source(
                    &mut *conn,
                    word_id,
                    source_id,
                    &item.sentence,
                    &item.sentence,
                    w.count,
                )
                .await
                .with_context(|| format!("failed to link word {}", word_id))?;

                total_links.fetch_add(u64::from(w.count), Ordering::Relaxed);
            }

            store::update_source_progress(&mut *conn, source_id, item.index as i64)
                .await
                .context("failed to save checkpoint")?;
            Ok(())
        })
    })
}

/// Wraps one sentence's analysis as a pool job. The result send is guarded
/// by the run's token so workers never block through a shutdown.
fn analysis_job(
    index: usize,
    sentence: Sentence,
    dictionary: Option<Arc<DictionaryIndex>>,
    results: mpsc::Sender<ProcessedSentence>,
) -> Job {
    Box::new(move |cancel| {
        Box::pin(async move {
            let result = process_sentence(index, &sentence, dictionary.as_deref());
            tokio::select! {
                sent = results.send(result) => {
                    let _ = sent;
                }
                _ = cancel.cancelled() => {}
            }
            Ok(())
        })
    })
}

/// CPU-bound per-sentence analysis: filtering, aggregation, and dictionary
/// enrichment.
fn process_sentence(
    index: usize,
    sentence: &Sentence,
    dictionary: Option<&DictionaryIndex>,
) -> ProcessedSentence {
    let mut counts: HashMap<String, u32> = HashMap::new();
    let mut readings: HashMap<String, String> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for token in &sentence.tokens {
        if FILTERED_POS.contains(&token.primary_pos.as_str()) {
            continue;
        }
        if token.parts_of_speech.len() > 1 && token.parts_of_speech[1] == "数" {
            continue;
        }
        if ASCII_ONLY.is_match(&token.surface) {
            continue;
        }

        // The lemma is the canonical word when the analyzer supplies one
        let canonical = if !token.base_form.is_empty() && token.base_form != "*" {
            &token.base_form
        } else {
            &token.surface
        };

        match counts.get_mut(canonical) {
            None => {
                counts.insert(canonical.clone(), 1);
                readings.insert(canonical.clone(), to_hiragana(&token.reading));
                order.push(canonical.clone());
            }
            Some(count) => {
                *count += 1;
                // A later token may supply the reading an earlier one lacked
                if let Some(current) = readings.get_mut(canonical) {
                    if current.is_empty() {
                        let reading = to_hiragana(&token.reading);
                        if !reading.is_empty() {
                            *current = reading;
                        }
                    }
                }
            }
        }
    }

    let words = order
        .into_iter()
        .map(|word| {
            let count = counts.remove(&word).unwrap_or(1);
            let mut reading = readings.remove(&word).unwrap_or_default();
            let mut definitions = String::new();

            if let Some(dictionary) = dictionary {
                let matches = dictionary.lookup(&word, &word, "");
                if !matches.is_empty() {
                    if let Ok(json) = format_definitions(&matches) {
                        definitions = json;
                    }
                    if let Some(preferred) = preferred_reading(matches[0]) {
                        reading = to_hiragana(preferred);
                    }
                }
            }

            WordOccurrence {
                word,
                reading,
                definitions,
                count,
            }
        })
        .collect();

    ProcessedSentence {
        index,
        sentence: sentence.text.clone(),
        words,
        error: None,
    }
}

/// The dictionary's primary reading: the first kana form flagged common,
/// else the first kana form.
fn preferred_reading(entry: &JmdictEntry) -> Option<&str> {
    entry
        .kana
        .iter()
        .find(|form| form.common)
        .or_else(|| entry.kana.first())
        .map(|form| form.text.as_str())
}
