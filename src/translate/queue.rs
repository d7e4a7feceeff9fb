use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::QueueConfig;
use crate::translate::models::{LanguagePair, ModelManager};

// Greedy batch bound per worker wakeup
const MAX_BATCH: usize = 8;

/// Why a submitted job did not produce translations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job cancelled before execution")]
    Cancelled,
    #[error("Job exceeded the task timeout")]
    Timeout,
    #[error("Translation failed: {0}")]
    Failed(String),
}

/// Why a job could not be enqueued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity. Callers skip or retry later; the queue
    /// never blocks a fetch pass.
    #[error("Translation queue is full")]
    Full,
    #[error("Translation queue is shut down")]
    Closed,
}

/// One translation request: a set of texts for a single language pair.
#[derive(Debug, Clone)]
pub struct TranslationJob {
    pub pair: LanguagePair,
    pub texts: Vec<String>,
}

struct QueuedJob {
    job: TranslationJob,
    cancelled: Arc<AtomicBool>,
    result_tx: oneshot::Sender<Result<Vec<String>, JobError>>,
}

/// Caller's handle to a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    cancelled: Arc<AtomicBool>,
    result_rx: oneshot::Receiver<Result<Vec<String>, JobError>>,
}

impl JobHandle {
    /// Mark the job cancelled. A job already executing runs to completion;
    /// a queued one is dropped when a worker reaches it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Wait for the job's outcome.
    pub async fn result(self) -> Result<Vec<String>, JobError> {
        match self.result_rx.await {
            Ok(result) => result,
            // Worker dropped the sender: queue shut down with the job pending
            Err(_) => Err(JobError::Cancelled),
        }
    }

    /// Wait for the outcome with a deadline of the caller's own.
    pub async fn result_within(self, deadline: Duration) -> Result<Vec<String>, JobError> {
        match tokio::time::timeout(deadline, self.result()).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout),
        }
    }
}

/// Queue throughput counters.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

/// Bounded translation work queue.
///
/// Submission is non-blocking: a full queue rejects with
/// [`QueueError::Full`] so producers shed load instead of stalling.
/// Workers drain greedily and merge same-pair jobs into one backend batch.
/// Shutdown closes intake and lets workers finish everything already
/// queued.
pub struct TaskQueue {
    tx: mpsc::Sender<QueuedJob>,
    task_timeout: Duration,
    counters: Arc<Counters>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(manager: Arc<ModelManager>, config: &QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.max_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let task_timeout = config.task_timeout();

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let manager = Arc::clone(&manager);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    worker_loop(worker_id, rx, manager, counters, task_timeout).await;
                })
            })
            .collect();

        Self {
            tx,
            task_timeout,
            counters,
            workers,
        }
    }

    /// Enqueue a job without blocking.
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`] when the queue is at capacity and
    /// [`QueueError::Closed`] after shutdown.
    pub fn submit(&self, job: TranslationJob) -> Result<JobHandle, QueueError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = oneshot::channel();
        let queued = QueuedJob {
            job,
            cancelled: Arc::clone(&cancelled),
            result_tx,
        };

        match self.tx.try_send(queued) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(JobHandle {
                    cancelled,
                    result_rx,
                })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Translation queue full, rejecting job");
                Err(QueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    /// Submit and wait, bounded by the queue's own task timeout.
    pub async fn submit_and_wait(&self, job: TranslationJob) -> Result<Vec<String>, JobError> {
        let timeout = self.task_timeout;
        match self.submit(job) {
            Ok(handle) => handle.result_within(timeout).await,
            Err(QueueError::Full) | Err(QueueError::Closed) => Err(JobError::Cancelled),
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Stop intake, drain everything already queued, and wait for workers.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Queue worker panicked during shutdown");
            }
        }
        tracing::debug!("Translation queue drained");
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    manager: Arc<ModelManager>,
    counters: Arc<Counters>,
    task_timeout: Duration,
) {
    loop {
        // Hold the receiver lock only while pulling the batch
        let batch = {
            let mut rx = rx.lock().await;
            let Some(first) = rx.recv().await else { break };
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(job) => batch.push(job),
                    Err(_) => break,
                }
            }
            batch
        };

        let mut by_pair: HashMap<LanguagePair, Vec<QueuedJob>> = HashMap::new();
        for queued in batch {
            if queued.cancelled.load(Ordering::SeqCst) {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let _ = queued.result_tx.send(Err(JobError::Cancelled));
                continue;
            }
            by_pair.entry(queued.job.pair.clone()).or_default().push(queued);
        }

        for (pair, jobs) in by_pair {
            run_pair_batch(worker_id, &manager, &counters, task_timeout, pair, jobs).await;
        }
    }
}

/// Execute all jobs for one language pair as a single backend call, then
/// fan the results back out to each job's slice of the batch.
async fn run_pair_batch(
    worker_id: usize,
    manager: &ModelManager,
    counters: &Counters,
    task_timeout: Duration,
    pair: LanguagePair,
    jobs: Vec<QueuedJob>,
) {
    let mut texts = Vec::new();
    let mut slices = Vec::with_capacity(jobs.len());
    for queued in &jobs {
        let start = texts.len();
        texts.extend(queued.job.texts.iter().cloned());
        slices.push(start..texts.len());
    }

    tracing::debug!(
        worker = worker_id,
        pair = %pair,
        jobs = jobs.len(),
        texts = texts.len(),
        "Running translation batch"
    );

    let outcome = tokio::time::timeout(task_timeout, manager.translate_batch(&pair, &texts)).await;

    match outcome {
        Ok(Ok(translated)) => {
            for (queued, range) in jobs.into_iter().zip(slices) {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                let _ = queued.result_tx.send(Ok(translated[range].to_vec()));
            }
        }
        Ok(Err(e)) => {
            tracing::warn!(worker = worker_id, pair = %pair, error = %e, "Translation batch failed");
            let shared = e.to_string();
            for queued in jobs {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                let _ = queued.result_tx.send(Err(JobError::Failed(shared.clone())));
            }
        }
        Err(_) => {
            tracing::warn!(worker = worker_id, pair = %pair, "Translation batch timed out");
            for queued in jobs {
                counters.timed_out.fetch_add(1, Ordering::Relaxed);
                let _ = queued.result_tx.send(Err(JobError::Timeout));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::models::EchoBackend;

    fn queue_with(
        backend: Arc<EchoBackend>,
        config: &QueueConfig,
    ) -> (TaskQueue, Arc<ModelManager>) {
        let manager = Arc::new(ModelManager::new(
            backend,
            15,
            Duration::from_secs(1800),
        ));
        (TaskQueue::new(Arc::clone(&manager), config), manager)
    }

    fn job(source: &str, target: &str, texts: &[&str]) -> TranslationJob {
        TranslationJob {
            pair: LanguagePair::new(source, target),
            texts: texts.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let backend = Arc::new(EchoBackend::new());
        let (queue, _) = queue_with(backend, &QueueConfig::default());

        let handle = queue.submit(job("en", "ru", &["hello", "world"])).unwrap();
        let out = handle.result().await.unwrap();
        assert_eq!(out, vec!["[ru] hello", "[ru] world"]);

        let stats = queue.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let backend = Arc::new(EchoBackend::new().with_load_delay(Duration::from_secs(60)));
        let config = QueueConfig {
            max_size: 2,
            workers: 1,
            ..QueueConfig::default()
        };
        let (queue, _) = queue_with(backend, &config);

        // First job occupies the worker (slow load); two more fill the queue
        let _h1 = queue.submit(job("en", "ru", &["a"])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _h2 = queue.submit(job("en", "ru", &["b"])).unwrap();
        let _h3 = queue.submit(job("en", "ru", &["c"])).unwrap();

        let err = queue.submit(job("en", "ru", &["d"])).unwrap_err();
        assert_eq!(err, QueueError::Full);
    }

    #[tokio::test]
    async fn test_cancelled_job_not_executed() {
        let backend = Arc::new(EchoBackend::new().with_load_delay(Duration::from_millis(100)));
        let config = QueueConfig {
            workers: 1,
            ..QueueConfig::default()
        };
        let (queue, _) = queue_with(backend.clone(), &config);

        // Occupy the worker, then cancel a queued job before it runs
        let _busy = queue.submit(job("en", "ru", &["busy"])).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let handle = queue.submit(job("en", "de", &["doomed"])).unwrap();
        handle.cancel();

        match handle.result().await {
            Err(JobError::Cancelled) => {}
            other => panic!("Expected Cancelled, got {:?}", other),
        }
        assert_eq!(queue.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_same_pair_jobs_batched() {
        let backend = Arc::new(EchoBackend::new().with_load_delay(Duration::from_millis(100)));
        let config = QueueConfig {
            workers: 1,
            ..QueueConfig::default()
        };
        let (queue, _) = queue_with(backend.clone(), &config);

        // While the worker is stuck in the first load, queue several same-pair
        // jobs; the worker should drain them into one backend call.
        let first = queue.submit(job("en", "ru", &["warmup"])).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let h1 = queue.submit(job("en", "de", &["one"])).unwrap();
        let h2 = queue.submit(job("en", "de", &["two"])).unwrap();
        let h3 = queue.submit(job("en", "de", &["three"])).unwrap();

        first.result().await.unwrap();
        assert_eq!(h1.result().await.unwrap(), vec!["[de] one"]);
        assert_eq!(h2.result().await.unwrap(), vec!["[de] two"]);
        assert_eq!(h3.result().await.unwrap(), vec!["[de] three"]);

        // One call for the warmup job, one for the merged en->de batch
        assert_eq!(backend.translation_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_pair_fails_all_its_jobs() {
        let backend = Arc::new(EchoBackend::new());
        let bad = LanguagePair::new("xx", "yy");
        backend.fail_pair(bad.clone());
        let (queue, _) = queue_with(backend, &QueueConfig::default());

        let handle = queue.submit(job("xx", "yy", &["text"])).unwrap();
        match handle.result().await {
            Err(JobError::Failed(_)) => {}
            other => panic!("Expected Failed error, got {:?}", other),
        }
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_jobs() {
        let backend = Arc::new(EchoBackend::new());
        let config = QueueConfig {
            workers: 1,
            ..QueueConfig::default()
        };
        let (queue, _) = queue_with(backend, &config);

        let handles: Vec<JobHandle> = (0..5)
            .map(|i| {
                queue
                    .submit(job("en", "ru", &[&format!("text {i}")]))
                    .unwrap()
            })
            .collect();

        queue.shutdown().await;

        for handle in handles {
            assert!(handle.result().await.is_ok(), "queued jobs must drain");
        }
    }

    #[tokio::test]
    async fn test_result_deadline() {
        let backend = Arc::new(EchoBackend::new().with_load_delay(Duration::from_secs(60)));
        let (queue, _) = queue_with(backend, &QueueConfig::default());

        let handle = queue.submit(job("en", "ru", &["slow"])).unwrap();
        match handle.result_within(Duration::from_millis(50)).await {
            Err(JobError::Timeout) => {}
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }
}
