//! Agent orchestration: drain the shared queue and run updates.
//!
//! An agent is a worker pool wired to the shared queue, plus the http
//! surface and a small loop keeping the queue-depth gauge fresh. On
//! shutdown the pool stops pulling work and finishes what it started;
//! the agent returns once everything has drained.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use crate::runner::UpdateRunner;
use crate::web;
use crate::worker::{WorkerPool, WorkerPoolConfig};

/// How often the queue-depth gauge is refreshed.
const QUEUE_DEPTH_INTERVAL: Duration = Duration::from_secs(15);

/// Errors from agent startup.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to bind http listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// Composition root for the agent process.
pub struct Agent {
    pub queue: WorkQueue,
    pub runner: Arc<UpdateRunner>,
    pub metrics: Arc<Metrics>,
    pub max_process_count: usize,
    pub http_port: u16,
}

impl Agent {
    /// Runs the agent until cancellation, then drains.
    pub async fn run(&self, token: CancellationToken) -> Result<(), AgentError> {
        let listener = web::bind(self.http_port).await?;
        let web_handle = tokio::spawn(web::serve(
            listener,
            Arc::clone(&self.metrics),
            token.clone(),
        ));
        let depth_handle = tokio::spawn(refresh_queue_depth(
            self.queue.clone(),
            Arc::clone(&self.metrics),
            token.clone(),
        ));

        let pool = WorkerPool::new(
            WorkerPoolConfig::new(self.max_process_count),
            Arc::new(self.queue.clone()),
            Arc::clone(&self.runner),
            Arc::clone(&self.metrics),
        );
        pool.run(token.clone()).await;

        let _ = depth_handle.await;
        let _ = web_handle.await;
        Ok(())
    }
}

async fn refresh_queue_depth(queue: WorkQueue, metrics: Arc<Metrics>, token: CancellationToken) {
    let mut interval = tokio::time::interval(QUEUE_DEPTH_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        match queue.len().await {
            Ok(len) => metrics.queue_depth.set(len as f64),
            Err(e) => debug!(error = %e, "failed to read queue depth"),
        }
    }
}
