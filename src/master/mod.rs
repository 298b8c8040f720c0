//! Master orchestration: repository discovery and scheduling.
//!
//! A master runs discovery cycles. One cycle asks the update tool for
//! the repository list, deduplicates it against the shared queue, and
//! appends whatever is new. With leader election enabled the cycle first
//! checks the lease and quietly does nothing when another master leads —
//! every master keeps a live schedule, but only the leader enqueues.
//!
//! Without a schedule the master runs exactly one cycle and exits. With
//! a schedule it also serves the http surface and, when configured, the
//! event-stream ingestor, and keeps firing cycles until shutdown.
//! Cancellation is observed between firings only: an in-flight cycle
//! always runs to completion.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::EventIngestor;
use crate::leader::{Candidate, LeaderError};
use crate::metrics::Metrics;
use crate::queue::{QueueError, WorkQueue};
use crate::runner::{RunnerError, UpdateRunner};
use crate::web;

/// Errors from a discovery cycle or master startup.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error("leader election failed: {0}")]
    Leader(#[from] LeaderError),

    #[error("repository discovery failed: {0}")]
    Discovery(#[from] RunnerError),

    #[error("queue update failed: {0}")]
    Queue(#[from] QueueError),

    #[error("failed to bind http listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// Parses a cron expression into a [`Schedule`].
///
/// Accepts both the classic five-field form (minute first) and the
/// six/seven-field form with seconds; five-field expressions fire at
/// second zero.
pub fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        Schedule::from_str(&format!("0 {expr}"))
    } else {
        Schedule::from_str(expr)
    }
}

/// Master behavior switches, fixed at startup.
pub struct MasterConfig {
    /// Gate discovery on holding the leadership lease.
    pub leader_elect: bool,
    /// Recurring discovery schedule; `None` means run once and exit.
    pub schedule: Option<Schedule>,
    /// Run one cycle immediately before entering the schedule loop.
    pub run_first_time: bool,
}

/// Composition root for the master process.
pub struct Master {
    pub queue: WorkQueue,
    pub candidate: Candidate,
    pub runner: UpdateRunner,
    pub metrics: Arc<Metrics>,
    /// Event-stream ingestor; `None` disables the priority path.
    pub ingestor: Option<EventIngestor>,
    pub http_port: u16,
    pub config: MasterConfig,
}

impl Master {
    /// Runs the master until cancellation (scheduled mode) or until the
    /// single discovery cycle finishes (one-shot mode).
    pub async fn run(&self, token: CancellationToken) -> Result<(), MasterError> {
        let Some(schedule) = self.config.schedule.clone() else {
            return self.run_cycle().await;
        };

        // Long-running mode: bring up the ambient services first. A bind
        // failure is a configuration problem and aborts startup.
        let listener = web::bind(self.http_port).await?;

        let mut handles = Vec::new();
        handles.push(tokio::spawn(web::serve(
            listener,
            Arc::clone(&self.metrics),
            token.clone(),
        )));
        if let Some(ingestor) = &self.ingestor {
            let ingestor = ingestor.clone();
            let events_token = token.clone();
            handles.push(tokio::spawn(async move {
                ingestor.run(events_token).await;
            }));
        }

        if self.config.run_first_time {
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "first discovery run failed");
            }
        }

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("schedule has no upcoming run, stopping discovery loop");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(next = %next, "waiting for next discovery run");

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            // The cycle itself is never raced against the token.
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "scheduled discovery run failed");
            }
        }

        debug!("discovery loop stopped, waiting for event stream and http server");
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// One discovery cycle: leader gate, discover, dedup, append.
    async fn run_cycle(&self) -> Result<(), MasterError> {
        if self.config.leader_elect {
            if !self.candidate.is_leader().await? {
                debug!("lost election, skipping discovery");
                return Ok(());
            }
            debug!("won election, running repo discovery");
        }

        debug!("running repository discovery");
        let repos = self.runner.discover().await?;

        let appended = self.queue.enqueue_deduped(&repos).await?;
        if appended == 0 {
            warn!(discovered = repos.len(), "zero new repos to queue");
        } else {
            info!(
                discovered = repos.len(),
                appended, "queued discovered repos"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schedule_five_fields() {
        let schedule = parse_schedule("*/5 * * * *").expect("five-field expression");
        assert!(schedule.upcoming(Utc).next().is_some());
    }

    #[test]
    fn test_parse_schedule_with_seconds() {
        let schedule = parse_schedule("30 */10 * * * *").expect("six-field expression");
        assert!(schedule.upcoming(Utc).next().is_some());
    }

    #[test]
    fn test_parse_schedule_rejects_garbage() {
        assert!(parse_schedule("not a schedule").is_err());
        assert!(parse_schedule("99 99 99 99 99").is_err());
    }
}
