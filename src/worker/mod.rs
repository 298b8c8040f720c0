//! Worker pool draining the shared queue with bounded parallelism.
//!
//! One intake loop pulls job identifiers and spawns one task per job.
//! A counting semaphore (capacity = configured max process count) is the
//! concurrency guard: the intake loop acquires a permit *before* popping,
//! so at most `max_process_count` jobs are ever dequeued and unfinished,
//! and a full pool exerts backpressure by simply not popping.
//!
//! Cancellation is cooperative. The blocking pop always uses a short
//! timeout, the token is checked every iteration, and shutdown waits for
//! every permit to come back before returning, so in-flight updates run
//! to completion and report their outcome while no new work is pulled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::Metrics;
use crate::queue::{QueueError, WorkQueue};
use crate::runner::UpdateRunner;

/// Source of job identifiers for the pool.
///
/// The shared [`WorkQueue`] is the production source; tests feed the pool
/// from memory.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Returns the next job, waiting up to `timeout`; `Ok(None)` when
    /// nothing arrived in time.
    async fn next_job(&self, timeout: Duration) -> Result<Option<String>, QueueError>;
}

#[async_trait]
impl JobSource for WorkQueue {
    async fn next_job(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        self.dequeue_blocking(timeout).await
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of update processes running at once.
    pub max_process_count: usize,
    /// How long one blocking pop may wait. Keep this short; it bounds how
    /// late the pool notices cancellation.
    pub poll_timeout: Duration,
    /// Pause after a store error before polling again.
    pub error_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_process_count: 1,
            poll_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(2),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(max_process_count: usize) -> Self {
        Self {
            max_process_count,
            ..Default::default()
        }
    }
}

/// Pool of update executions fed from a [`JobSource`].
pub struct WorkerPool {
    config: WorkerPoolConfig,
    source: Arc<dyn JobSource>,
    runner: Arc<UpdateRunner>,
    metrics: Arc<Metrics>,
    guard: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        source: Arc<dyn JobSource>,
        runner: Arc<UpdateRunner>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let guard = Arc::new(Semaphore::new(config.max_process_count));
        Self {
            config,
            source,
            runner,
            metrics,
            guard,
        }
    }

    /// Runs intake until `token` is cancelled, then drains.
    ///
    /// Job failures are logged and counted; they never stop the pool. A
    /// store error pauses intake briefly instead of hot-looping.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            max_process_count = self.config.max_process_count,
            "worker pool started"
        );

        loop {
            // Backpressure: no permit, no pop. Waiting for a permit can
            // take as long as a running update, so cancellation must be
            // able to interrupt it.
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = Arc::clone(&self.guard).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if token.is_cancelled() {
                break;
            }

            // The pop itself is not raced against the token: its timeout
            // is short, and abandoning it mid-flight could drop an entry
            // the server already handed us.
            match self.source.next_job(self.config.poll_timeout).await {
                Ok(Some(job)) => {
                    let runner = Arc::clone(&self.runner);
                    let metrics = Arc::clone(&self.metrics);
                    tokio::spawn(async move {
                        run_one(runner, metrics, job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    debug!("no jobs available");
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "failed to pop job from queue");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        // Drain: every outstanding permit is held by an in-flight update.
        debug!("worker pool intake stopped, draining in-flight updates");
        let _ = self
            .guard
            .acquire_many(self.config.max_process_count as u32)
            .await;
        info!("worker pool drained");
    }
}

/// Executes one job and records its outcome.
async fn run_one(runner: Arc<UpdateRunner>, metrics: Arc<Metrics>, job: String) {
    info!(repo = %job, "running update");
    metrics.jobs_in_progress.inc();
    let start = Instant::now();

    let result = runner.run_update(&job).await;

    let elapsed = start.elapsed();
    metrics.jobs_in_progress.dec();
    metrics.run_duration.observe(elapsed.as_secs_f64());

    match result {
        Ok(()) => {
            metrics.update_runs.with_label_values(&["ok", &job]).inc();
            info!(repo = %job, duration = ?elapsed, "finished update");
        }
        Err(e) => {
            metrics.update_runs.with_label_values(&["error", &job]).inc();
            error!(repo = %job, error = %e, "update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::runner::{CommandOutput, Commander, RunnerError};

    /// In-memory job source: pops immediately, sleeps out the timeout when
    /// empty like the real blocking pop would.
    struct MemorySource {
        jobs: Mutex<VecDeque<String>>,
    }

    impl MemorySource {
        fn new(jobs: &[&str]) -> Self {
            Self {
                jobs: Mutex::new(jobs.iter().map(|j| j.to_string()).collect()),
            }
        }

        fn remaining(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobSource for MemorySource {
        async fn next_job(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
            let job = self.jobs.lock().unwrap().pop_front();
            if job.is_none() {
                tokio::time::sleep(timeout).await;
            }
            Ok(job)
        }
    }

    /// Commander that sleeps per run and records observed concurrency.
    struct SlowCommander {
        delay: Duration,
        running: AtomicUsize,
        max_running: AtomicUsize,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl SlowCommander {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Commander for SlowCommander {
        async fn run(
            &self,
            _program: &str,
            _args: &[&str],
            _env: &[(String, String)],
        ) -> Result<CommandOutput, RunnerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);

            #[cfg(unix)]
            let status = {
                use std::os::unix::process::ExitStatusExt;
                std::process::ExitStatus::from_raw(0)
            };
            #[cfg(not(unix))]
            let status = {
                use std::os::windows::process::ExitStatusExt;
                std::process::ExitStatus::from_raw(0)
            };

            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                status,
            })
        }
    }

    fn pool_with(
        commander: Arc<SlowCommander>,
        source: Arc<MemorySource>,
        max_process_count: usize,
    ) -> WorkerPool {
        let config = WorkerPoolConfig {
            max_process_count,
            poll_timeout: Duration::from_millis(50),
            error_backoff: Duration::from_millis(50),
        };
        WorkerPool::new(
            config,
            source,
            Arc::new(UpdateRunner::new(commander)),
            Arc::new(Metrics::new().expect("metrics")),
        )
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_max() {
        let commander = Arc::new(SlowCommander::new(Duration::from_millis(100)));
        let source = Arc::new(MemorySource::new(&[
            "p/r1", "p/r2", "p/r3", "p/r4", "p/r5", "p/r6", "p/r7", "p/r8",
        ]));
        let pool = pool_with(Arc::clone(&commander), Arc::clone(&source), 2);

        let token = CancellationToken::new();
        let stopper = token.clone();
        let run = tokio::spawn(async move { pool.run(stopper).await });

        // Let everything drain, then stop the pool.
        while commander.finished.load(Ordering::SeqCst) < 8 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        token.cancel();
        run.await.unwrap();

        assert_eq!(commander.started.load(Ordering::SeqCst), 8);
        assert!(commander.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(source.remaining(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_jobs() {
        let commander = Arc::new(SlowCommander::new(Duration::from_millis(300)));
        let source = Arc::new(MemorySource::new(&[
            "p/r1", "p/r2", "p/r3", "p/r4", "p/r5", "p/r6",
        ]));
        let pool = pool_with(Arc::clone(&commander), Arc::clone(&source), 2);

        let token = CancellationToken::new();
        let stopper = token.clone();
        let run = tokio::spawn(async move { pool.run(stopper).await });

        // Cancel while the first jobs are still executing.
        while commander.started.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        run.await.unwrap();

        let started = commander.started.load(Ordering::SeqCst);
        let finished = commander.finished.load(Ordering::SeqCst);

        // Everything that started was allowed to finish, and most of the
        // queue was never pulled.
        assert_eq!(started, finished);
        assert!(source.remaining() >= 6 - started);
        assert!(source.remaining() > 0);
    }

    #[tokio::test]
    async fn test_pool_idles_on_empty_source_until_cancelled() {
        let commander = Arc::new(SlowCommander::new(Duration::from_millis(10)));
        let source = Arc::new(MemorySource::new(&[]));
        let pool = pool_with(Arc::clone(&commander), source, 1);

        let token = CancellationToken::new();
        let stopper = token.clone();
        let run = tokio::spawn(async move { pool.run(stopper).await });

        tokio::time::sleep(Duration::from_millis(120)).await;
        token.cancel();
        run.await.unwrap();

        assert_eq!(commander.started.load(Ordering::SeqCst), 0);
    }
}
