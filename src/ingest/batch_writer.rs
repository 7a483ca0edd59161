//! Transactional batch writer
//!
//! Buffers write callbacks and flushes them in batches, each batch inside a
//! single transaction. Flushes happen when the buffer fills or on a timer.
//! A lone committer task serializes all commits, so there is at most one
//! in-flight transaction on the write path.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A callback that performs database writes inside the batch's transaction.
pub type WriteFn =
    Box<dyn for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> + Send>;

/// Observer for asynchronous batch failures.
pub type OnError = Box<dyn Fn(&anyhow::Error) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriterError {
    #[error("batch writer closed")]
    Closed,
}

/// Buffer a couple of batches so flushes rarely wait on the committer.
const COMMIT_QUEUE: usize = 2;

struct Buffer {
    items: Vec<WriteFn>,
    /// Dropped on close to end the committer loop
    commit_tx: Option<mpsc::Sender<Vec<WriteFn>>>,
    closed: bool,
}

struct Inner {
    pool: SqlitePool,
    capacity: usize,
    buf: tokio::sync::Mutex<Buffer>,
    cancel: CancellationToken,
    first_err: Mutex<Option<anyhow::Error>>,
    on_error: Mutex<Option<OnError>>,
}

impl Inner {
    /// Keeps the first asynchronous error and reports every one through the
    /// observer.
    fn record_error(&self, err: anyhow::Error) {
        warn!(error = %err, "batch writer error");
        {
            let guard = self.on_error.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(on_error) = guard.as_ref() {
                on_error(&err);
            }
        }
        let mut first = self.first_err.lock().unwrap_or_else(|e| e.into_inner());
        if first.is_none() {
            *first = Some(err);
        }
    }

    /// Detaches the buffered writes and hands them to the committer. Called
    /// with the buffer lock held so batches keep submission order.
    ///
    /// If the commit queue is full and the writer is shutting down, the
    /// batch is dropped and the loss is recorded as an error; shutdown must
    /// make progress even when the store is blocked.
    async fn flush(&self, buf: &mut Buffer) {
        if buf.items.is_empty() {
            return;
        }
        let batch = mem::replace(&mut buf.items, Vec::with_capacity(self.capacity));
        let writes = batch.len();

        let Some(commit_tx) = buf.commit_tx.as_ref() else {
            self.record_error(anyhow!(
                "batch writer: dropping batch of {} writes, committer is gone",
                writes
            ));
            return;
        };

        tokio::select! {
            biased;
            sent = commit_tx.send(batch) => {
                if sent.is_err() {
                    self.record_error(anyhow!(
                        "batch writer: dropping batch of {} writes, committer is gone",
                        writes
                    ));
                }
            }
            _ = self.cancel.cancelled() => {
                self.record_error(anyhow!(
                    "batch writer: dropping batch of {} writes due to shutdown",
                    writes
                ));
            }
        }
    }
}

/// Groups write callbacks into bounded transactions.
pub struct BatchWriter {
    inner: Arc<Inner>,
    committer: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    /// Creates a writer that flushes every `capacity` writes (clamped to at
    /// least 1) and every `interval` (zero disables the timer).
    pub fn new(pool: SqlitePool, capacity: usize, interval: Duration) -> Self {
        let capacity = capacity.max(1);
        let (commit_tx, mut commit_rx) = mpsc::channel(COMMIT_QUEUE);

        let inner = Arc::new(Inner {
            pool,
            capacity,
            buf: tokio::sync::Mutex::new(Buffer {
                items: Vec::with_capacity(capacity),
                commit_tx: Some(commit_tx),
                closed: false,
            }),
            cancel: CancellationToken::new(),
            first_err: Mutex::new(None),
            on_error: Mutex::new(None),
        });

        let committer = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                // Commits run to completion here regardless of pipeline
                // cancellation; close() drains this loop
                while let Some(batch) = commit_rx.recv().await {
                    if let Err(e) = execute_batch(&inner.pool, batch).await {
                        inner.record_error(e);
                    }
                }
            })
        };

        let ticker = (!interval.is_zero()).then(|| {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let start = tokio::time::Instant::now() + interval;
                let mut tick = tokio::time::interval_at(start, interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = tick.tick() => {
                            let mut buf = inner.buf.lock().await;
                            if !buf.closed && !buf.items.is_empty() {
                                inner.flush(&mut buf).await;
                            }
                        }
                    }
                }
            })
        });

        Self {
            inner,
            committer: Mutex::new(Some(committer)),
            ticker: Mutex::new(ticker),
        }
    }

    /// Installs the asynchronous error observer.
    pub fn set_on_error(&self, on_error: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
        *self
            .inner
            .on_error
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(on_error));
    }

    /// Enqueues a write callback, flushing when the buffer reaches capacity.
    pub async fn submit(&self, write: WriteFn) -> Result<(), WriterError> {
        let mut buf = self.inner.buf.lock().await;
        if buf.closed {
            return Err(WriterError::Closed);
        }
        buf.items.push(write);
        if buf.items.len() >= self.inner.capacity {
            self.inner.flush(&mut buf).await;
        }
        Ok(())
    }

    /// Stops accepting submissions, flushes the remainder, waits for pending
    /// commits, and returns the first asynchronous error seen over the
    /// writer's lifetime.
    pub async fn close(&self) -> Result<()> {
        {
            let mut buf = self.inner.buf.lock().await;
            if buf.closed {
                return Err(WriterError::Closed.into());
            }
            buf.closed = true;
            if !buf.items.is_empty() {
                self.inner.flush(&mut buf).await;
            }
            buf.commit_tx = None;
        }

        self.inner.cancel.cancel();

        let ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = ticker {
            let _ = handle.await;
        }
        let committer = self
            .committer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = committer {
            let _ = handle.await;
        }

        let first = self
            .inner
            .first_err
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Runs one batch inside one transaction; any callback error rolls the whole
/// batch back.
async fn execute_batch(pool: &SqlitePool, batch: Vec<WriteFn>) -> Result<()> {
    let writes = batch.len();
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin batch transaction")?;

    for write in batch {
        if let Err(e) = write(&mut *tx).await {
            tx.rollback().await.ok();
            return Err(e);
        }
    }

    tx.commit()
        .await
        .with_context(|| format!("failed to commit batch of {} writes", writes))?;
    debug!(writes, "committed batch");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_pool;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    async fn scratch_table(pool: &SqlitePool) {
        sqlx::query("CREATE TABLE scratch (id INTEGER PRIMARY KEY, val TEXT)")
            .execute(pool)
            .await
            .unwrap();
    }

    fn insert_row(val: &'static str) -> WriteFn {
        Box::new(move |conn| {
            Box::pin(async move {
                sqlx::query("INSERT INTO scratch (val) VALUES (?)")
                    .bind(val)
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
    }

    fn counting_write(counter: Arc<AtomicU32>) -> WriteFn {
        Box::new(move |_conn| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_commits_batch_in_transaction() {
        let pool = test_pool().await;
        scratch_table(&pool).await;

        let writer = BatchWriter::new(pool.clone(), 2, Duration::ZERO);
        writer.submit(insert_row("A")).await.unwrap();
        writer.submit(insert_row("B")).await.unwrap();
        writer.close().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scratch")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_rolls_back_whole_batch_on_error() {
        let pool = test_pool().await;
        scratch_table(&pool).await;

        let writer = BatchWriter::new(pool.clone(), 2, Duration::ZERO);
        let reported = Arc::new(AtomicU32::new(0));
        {
            let reported = Arc::clone(&reported);
            writer.set_on_error(move |_err| {
                reported.fetch_add(1, Ordering::SeqCst);
            });
        }

        writer.submit(insert_row("C")).await.unwrap();
        writer
            .submit(Box::new(|_conn| {
                Box::pin(async move { Err(anyhow!("intentional error")) })
            }))
            .await
            .unwrap();

        let err = writer.close().await.unwrap_err();
        assert!(err.to_string().contains("intentional error"));
        assert_eq!(reported.load(Ordering::SeqCst), 1);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scratch")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_flushes_by_size() {
        let pool = test_pool().await;
        let writer = BatchWriter::new(pool, 5, Duration::ZERO);

        let called = Arc::new(AtomicU32::new(0));
        for _ in 0..12 {
            writer
                .submit(counting_write(Arc::clone(&called)))
                .await
                .unwrap();
        }
        writer.close().await.unwrap();

        assert_eq!(called.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_flushes_on_interval() {
        let pool = test_pool().await;
        let writer = BatchWriter::new(pool, 10, Duration::from_millis(50));

        let called = Arc::new(AtomicU32::new(0));
        writer
            .submit(counting_write(Arc::clone(&called)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(called.load(Ordering::SeqCst), 1);

        writer.close().await.unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drops_batch_when_cancelled_and_queue_full() {
        let pool = test_pool().await;
        let writer = BatchWriter::new(pool, 1, Duration::ZERO);

        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let messages = Arc::clone(&messages);
            writer.set_on_error(move |err| {
                messages.lock().unwrap().push(err.to_string());
            });
        }

        // First batch parks the committer until released
        let blocker = Arc::new(Notify::new());
        {
            let blocker = Arc::clone(&blocker);
            writer
                .submit(Box::new(move |_conn| {
                    Box::pin(async move {
                        blocker.notified().await;
                        Ok(())
                    })
                }))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fill the commit queue behind the parked batch
        for _ in 0..COMMIT_QUEUE {
            writer
                .submit(counting_write(Arc::new(AtomicU32::new(0))))
                .await
                .unwrap();
        }

        // Shutdown in progress: the next flush finds the queue full and the
        // token fired, and must drop rather than hang
        writer.inner.cancel.cancel();
        writer
            .submit(counting_write(Arc::new(AtomicU32::new(0))))
            .await
            .unwrap();

        blocker.notify_one();

        let err = writer.close().await.unwrap_err();
        assert!(err.to_string().contains("dropping batch"));

        let messages = messages.lock().unwrap();
        assert!(messages.iter().any(|m| m.contains("dropping batch of 1")));
    }

    #[tokio::test]
    async fn test_double_close_reports_closed() {
        let pool = test_pool().await;
        let writer = BatchWriter::new(pool, 2, Duration::ZERO);
        writer.close().await.unwrap();

        let err = writer.close().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<WriterError>(),
            Some(&WriterError::Closed)
        );
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let pool = test_pool().await;
        let writer = BatchWriter::new(pool, 2, Duration::ZERO);
        writer.close().await.unwrap();

        let err = writer
            .submit(counting_write(Arc::new(AtomicU32::new(0))))
            .await
            .unwrap_err();
        assert_eq!(err, WriterError::Closed);
    }
}
