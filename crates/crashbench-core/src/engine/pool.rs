use super::executor::{CrashSafeExecutor, Statement, WorkerSession};
use crate::errors::BenchError;
use crate::model::{ExecutionRecord, Job};
use crate::stats::StatisticsAggregator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

type JobReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Option<Job>>>>;

/// Fixed set of workers draining one FIFO. Each worker owns its sessions
/// for its whole lifetime; `None` on the queue tells one worker to stop.
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Option<Job>>,
    workers: Vec<JoinHandle<Result<usize, BenchError>>>,
    aborted: Arc<AtomicBool>,
    submitted: usize,
}

impl WorkerPool {
    pub fn start(
        executor: Arc<CrashSafeExecutor>,
        stats: Arc<StatisticsAggregator>,
        n_workers: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver: JobReceiver = Arc::new(Mutex::new(receiver));
        let aborted = Arc::new(AtomicBool::new(false));
        let workers = (0..n_workers.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                let executor = executor.clone();
                let stats = stats.clone();
                let aborted = aborted.clone();
                tokio::spawn(async move { worker_loop(id, receiver, executor, stats, aborted).await })
            })
            .collect();
        Self {
            sender,
            workers,
            aborted,
            submitted: 0,
        }
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Enqueues one job. Returns false once a worker failed; callers stop
    /// producing then.
    pub fn submit(&mut self, job: Job) -> bool {
        if self.is_aborted() {
            return false;
        }
        if self.sender.send(Some(job)).is_err() {
            return false;
        }
        self.submitted += 1;
        true
    }

    /// Sends one sentinel per worker and waits for all of them. Returns the
    /// number of jobs executed, or the first fatal worker error.
    pub async fn finish(self) -> anyhow::Result<usize> {
        for _ in 0..self.workers.len() {
            // Fails only once every worker has exited.
            let _ = self.sender.send(None);
        }
        let mut executed = 0;
        let mut first_error = None;
        for handle in self.workers {
            match handle.await? {
                Ok(n) => executed += n,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => {
                tracing::debug!(submitted = self.submitted, executed, "worker pool drained");
                Ok(executed)
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    receiver: JobReceiver,
    executor: Arc<CrashSafeExecutor>,
    stats: Arc<StatisticsAggregator>,
    aborted: Arc<AtomicBool>,
) -> Result<usize, BenchError> {
    let mut session = WorkerSession::new();
    let mut executed = 0;
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(Some(job)) = next else {
            break;
        };
        if aborted.load(Ordering::SeqCst) {
            break;
        }
        let stmt = Statement::new(&job.sql).with_crash_test(job.crash_test);
        let started = Instant::now();
        if let Err(e) = executor.run(&mut session, &stmt).await {
            aborted.store(true, Ordering::SeqCst);
            tracing::error!(worker = id, job = %job.name, index = job.index, error = %e, "job failed");
            return Err(e);
        }
        stats.record(ExecutionRecord {
            name: job.name,
            index: job.index,
            elapsed: started.elapsed(),
        });
        executed += 1;
    }
    tracing::debug!(worker = id, executed, "worker stopped");
    Ok(executed)
}
