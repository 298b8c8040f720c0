//! Shared work queue backed by a Redis list.
//!
//! The queue holds repository job identifiers under one well-known key and
//! is shared by every master and agent process:
//!
//! - Masters append discovered repositories with [`WorkQueue::enqueue_deduped`]
//! - Agents drain the head with [`WorkQueue::dequeue_blocking`]
//! - The event ingestor moves urgent repositories to the head with
//!   [`WorkQueue::promote_to_front`]
//!
//! All mutation goes through Redis list primitives (RPUSH, BLPOP, LREM,
//! LPUSH), so the queue survives process restarts and delivers each entry
//! at least once. Dedup happens on enqueue only: an entry that was already
//! popped by an agent can be discovered and queued again.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

/// Well-known Redis key holding the job list.
pub const JOB_LIST_KEY: &str = "renofleet:joblist";

/// Errors that can occur during queue operations.
///
/// An empty queue or an expired blocking pop is not an error; those are
/// reported as `Ok(None)` so callers can loop without special-casing.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis operation failed.
    #[error("redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// BLPOP returned a reply shape we do not understand.
    #[error("unexpected BLPOP reply for key {0}")]
    UnexpectedReply(String),
}

/// The candidates that are not yet present in the queue, in candidate order.
fn new_entries(current: &[String], candidates: &[String]) -> Vec<String> {
    candidates
        .iter()
        .filter(|candidate| !current.iter().any(|queued| queued == *candidate))
        .cloned()
        .collect()
}

/// Distributed work queue over a Redis list.
#[derive(Clone)]
pub struct WorkQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Redis key the list is stored under.
    key: String,
}

impl WorkQueue {
    /// Creates a queue over an existing connection.
    ///
    /// The connection is shared; `ConnectionManager` multiplexes internally,
    /// so clones of the same manager can be handed to every component.
    pub fn new(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }

    /// Appends the candidates that are not already queued, preserving their
    /// relative order. Returns how many entries were appended; zero means
    /// everything was already queued (or the batch was empty), which is a
    /// normal outcome, not an error.
    ///
    /// The read and the append are two Redis commands, so two producers
    /// racing through here can both miss the other's append and queue a
    /// duplicate. Discovery is idempotent, so this window is accepted.
    pub async fn enqueue_deduped(&self, candidates: &[String]) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();

        let current: Vec<String> = conn.lrange(&self.key, 0, -1).await?;
        let fresh = new_entries(&current, candidates);
        if fresh.is_empty() {
            return Ok(0);
        }

        let appended = fresh.len();
        conn.rpush::<_, _, ()>(&self.key, fresh).await?;
        Ok(appended)
    }

    /// Pops the head entry, blocking up to `timeout` if the queue is empty.
    ///
    /// Returns `Ok(None)` when the timeout expires with nothing available.
    /// The timeout is rounded up to whole seconds with a minimum of one,
    /// and callers must keep it short: this call is the suspension point of
    /// the intake loop, and cancellation is only observed between calls.
    pub async fn dequeue_blocking(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match reply {
            Some((key, value)) => {
                if key != self.key {
                    return Err(QueueError::UnexpectedReply(key));
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Pops the head entry without blocking; `Ok(None)` when empty.
    pub async fn dequeue_nonblocking(&self) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.lpop(&self.key, None).await?;
        Ok(value)
    }

    /// Moves `id` to the head of the queue.
    ///
    /// All queued occurrences are removed first, then a single copy is
    /// pushed to the head. An identifier that is not currently queued
    /// (never discovered, or already handed to an agent) is left alone;
    /// promotion is best-effort and never touches in-flight work.
    pub async fn promote_to_front(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let removed: usize = conn.lrem(&self.key, 0, id).await?;
        if removed == 0 {
            return Ok(());
        }

        conn.lpush::<_, _, ()>(&self.key, id).await?;
        Ok(())
    }

    /// Reads the full queue contents, head first.
    pub async fn contents(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.key, 0, -1).await?;
        Ok(entries)
    }

    /// Number of queued entries.
    pub async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.key).await?;
        Ok(len)
    }

    /// Returns the Redis key this queue lives under.
    pub fn key(&self) -> &str {
        &self.key
    }
}
