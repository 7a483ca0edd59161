//! Fixed-parallelism worker pool
//!
//! Runs independent jobs with a bounded queue. Intentionally lightweight;
//! the ingester uses it to parallelize CPU-bound sentence analysis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A unit of work submitted to the pool. Receives the pool's cancellation
/// token so blocking sends inside the job can be guarded.
pub type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Errors from pool operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool closed")]
    Closed,

    #[error("submit cancelled")]
    Cancelled,

    #[error("submit failed: {0}")]
    Other(String),
}

/// The pool surface the ingester drives. Kept as a trait so tests can inject
/// failing pools.
#[async_trait]
pub trait JobPool: Send + Sync {
    /// Spawns the workers; they run until the token fires or the queue closes.
    fn start(&self, cancel: &CancellationToken);

    /// Enqueues a job. May block when the queue is full. Returns `Closed`
    /// after `close`, including for submits already blocked when the pool
    /// closes under them.
    async fn submit(&self, job: Job) -> Result<(), PoolError>;

    /// As [`submit`](JobPool::submit), but also gives up with `Cancelled`
    /// when the caller's token fires.
    async fn submit_with_cancel(
        &self,
        cancel: &CancellationToken,
        job: Job,
    ) -> Result<(), PoolError>;

    /// Stops accepting jobs, lets the workers drain the queue, and waits for
    /// them to exit. Idempotent.
    async fn close(&self);
}

pub struct WorkerPool {
    workers: usize,
    jobs_tx: Mutex<Option<mpsc::Sender<Job>>>,
    jobs_rx: Mutex<Option<mpsc::Receiver<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Fires on close so a submit blocked on a full queue returns `Closed`
    /// instead of hanging
    close_guard: CancellationToken,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool with the given number of workers and queue capacity.
    /// Workers are clamped to at least 1; a zero queue defaults to
    /// `2 * workers`.
    pub fn new(workers: usize, queue: usize) -> Self {
        let workers = workers.max(1);
        let queue = if queue == 0 { workers * 2 } else { queue };
        let (jobs_tx, jobs_rx) = mpsc::channel(queue);
        Self {
            workers,
            jobs_tx: Mutex::new(Some(jobs_tx)),
            jobs_rx: Mutex::new(Some(jobs_rx)),
            handles: Mutex::new(Vec::new()),
            close_guard: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        self.jobs_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .cloned()
            .ok_or(PoolError::Closed)
    }
}

#[async_trait]
impl JobPool for WorkerPool {
    fn start(&self, cancel: &CancellationToken) {
        let Some(jobs_rx) = self
            .jobs_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());

        for _ in 0..self.workers {
            let jobs_rx = Arc::clone(&jobs_rx);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    // Take a job without holding the queue lock while running it
                    let job = {
                        let mut rx = jobs_rx.lock().await;
                        tokio::select! {
                            _ = token.cancelled() => return,
                            job = rx.recv() => match job {
                                Some(job) => job,
                                None => return,
                            },
                        }
                    };
                    // Job errors travel through whatever results the job emits
                    let _ = job(token.clone()).await;
                }
            }));
        }
    }

    async fn submit(&self, job: Job) -> Result<(), PoolError> {
        let tx = self.sender()?;
        tokio::select! {
            sent = tx.send(job) => sent.map_err(|_| PoolError::Closed),
            _ = self.close_guard.cancelled() => Err(PoolError::Closed),
        }
    }

    async fn submit_with_cancel(
        &self,
        cancel: &CancellationToken,
        job: Job,
    ) -> Result<(), PoolError> {
        let tx = self.sender()?;
        tokio::select! {
            sent = tx.send(job) => sent.map_err(|_| PoolError::Closed),
            _ = self.close_guard.cancelled() => Err(PoolError::Closed),
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_guard.cancel();
        self.jobs_tx.lock().unwrap_or_else(|e| e.into_inner()).take();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn counting_job(counter: Arc<AtomicU32>) -> Job {
        Box::new(move |_cancel| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_pool_runs_all_jobs() {
        let pool = WorkerPool::new(4, 16);
        let cancel = CancellationToken::new();
        pool.start(&cancel);

        let ran = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            pool.submit(counting_job(Arc::clone(&ran))).await.unwrap();
        }
        pool.close().await;

        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let pool = WorkerPool::new(1, 2);
        let cancel = CancellationToken::new();
        pool.start(&cancel);
        pool.close().await;

        let err = pool
            .submit(counting_job(Arc::new(AtomicU32::new(0))))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::Closed);
    }

    #[tokio::test]
    async fn test_blocked_submit_returns_closed_on_close() {
        // Workers never started, so the second submit blocks on the full queue
        let pool = Arc::new(WorkerPool::new(1, 1));
        pool.submit(counting_job(Arc::new(AtomicU32::new(0))))
            .await
            .unwrap();

        let blocked = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.submit(counting_job(Arc::new(AtomicU32::new(0)))).await
            })
        };

        // Give the spawned submit time to block on the full queue
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.close().await;

        let result = blocked.await.unwrap();
        assert_eq!(result.unwrap_err(), PoolError::Closed);
    }

    #[tokio::test]
    async fn test_submit_with_cancel_returns_cancelled() {
        let pool = WorkerPool::new(1, 1);
        pool.submit(counting_job(Arc::new(AtomicU32::new(0))))
            .await
            .unwrap();

        // Queue is full and no workers are draining; a cancelled token must
        // release the submit
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pool
            .submit_with_cancel(&cancel, counting_job(Arc::new(AtomicU32::new(0))))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::Cancelled);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_cancellation_stops_workers() {
        let pool = WorkerPool::new(2, 16);
        let cancel = CancellationToken::new();
        pool.start(&cancel);

        cancel.cancel();
        // close() must not hang waiting for cancelled workers
        tokio::time::timeout(Duration::from_millis(500), pool.close())
            .await
            .expect("close blocked after cancellation");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pool = WorkerPool::new(1, 2);
        let cancel = CancellationToken::new();
        pool.start(&cancel);
        pool.close().await;
        pool.close().await;
    }
}
