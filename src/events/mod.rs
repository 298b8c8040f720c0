//! Event-stream ingestor for out-of-band reprioritization.
//!
//! Pull-request webhook events arrive on a Redis Stream and are consumed
//! through a consumer group, so several master instances can share the
//! stream without double-handling entries. When a pull request title was
//! just changed to carry the rebase marker, the referenced repository is
//! promoted to the front of the work queue.
//!
//! Every entry is acknowledged right after the parse attempt, whether or
//! not the parse or the promotion succeeded; a malformed or unpromotable
//! message must never block the stream or cause redelivery storms. The
//! outer supervisor loop re-enters consumption after transient store
//! errors until the process shuts down.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::WorkQueue;

/// Well-known Redis Stream carrying webhook events.
pub const EVENT_STREAM_KEY: &str = "renofleet:events";

/// Consumer group shared by master instances.
pub const CONSUMER_GROUP: &str = "renofleet-master";

/// Title prefix that requests an immediate rebase run.
pub const REBASE_MARKER: &str = "rebase!";

/// Stream entry field holding the webhook JSON document.
const PAYLOAD_FIELD: &str = "payload";

/// How long one blocking stream read may wait.
const READ_BLOCK: Duration = Duration::from_secs(5);

/// Entries fetched per read.
const READ_COUNT: usize = 10;

/// Pause before re-entering consumption after a transient error.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Errors from stream consumption.
#[derive(Debug, Error)]
pub enum EventError {
    /// Redis operation failed.
    #[error("redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Deserialize)]
struct HookEnvelope {
    #[serde(rename = "hookData")]
    hook_data: WebhookEvent,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "pullRequest")]
    pull_request: PullRequest,
    #[serde(rename = "previousTitle", default)]
    previous_title: String,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    title: String,
    #[serde(rename = "toRef")]
    to_ref: PullRequestRef,
}

#[derive(Debug, Deserialize)]
struct PullRequestRef {
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Repository {
    slug: String,
    project: Project,
}

#[derive(Debug, Deserialize)]
struct Project {
    key: String,
}

/// The repository to promote, if this event is a fresh rebase request.
///
/// A title that already carried the marker before the change is not a
/// request; the title must actually have changed.
fn rebase_target(envelope: &HookEnvelope) -> Option<String> {
    let event = &envelope.hook_data;
    let pr = &event.pull_request;

    if !pr.title.starts_with(REBASE_MARKER) || pr.title == event.previous_title {
        return None;
    }

    let repository = &pr.to_ref.repository;
    Some(format!("{}/{}", repository.project.key, repository.slug))
}

/// Consumer-group reader promoting rebase-requested repositories.
#[derive(Clone)]
pub struct EventIngestor {
    redis: ConnectionManager,
    queue: WorkQueue,
    stream: String,
    group: String,
    /// Per-process consumer name within the group.
    consumer: String,
}

impl EventIngestor {
    pub fn new(
        redis: ConnectionManager,
        queue: WorkQueue,
        stream: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            queue,
            stream: stream.into(),
            group: group.into(),
            consumer: format!("consumer-{}", Uuid::new_v4()),
        }
    }

    /// Consumes the stream until `token` is cancelled.
    ///
    /// Transient failures (connection loss, group rebalance) restart
    /// consumption after a short delay instead of propagating.
    pub async fn run(&self, token: CancellationToken) {
        while !token.is_cancelled() {
            if let Err(e) = self.consume(&token).await {
                error!(error = %e, "event stream consumption failed, retrying");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
        info!("event ingestor stopped");
    }

    /// One consumption session; returns `Ok` only on cancellation.
    async fn consume(&self, token: &CancellationToken) -> Result<(), EventError> {
        self.ensure_group().await?;

        let mut conn = self.redis.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_COUNT)
            .block(READ_BLOCK.as_millis() as usize);

        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            // Bounded block, so cancellation is observed within READ_BLOCK.
            let reply: Option<StreamReadReply> = conn
                .xread_options(&[&self.stream], &[">"], &options)
                .await?;

            let Some(reply) = reply else { continue };
            for key in reply.keys {
                for entry in key.ids {
                    self.handle_entry(&entry).await;
                }
            }
        }
    }

    /// Creates the consumer group if it does not exist yet.
    async fn ensure_group(&self) -> Result<(), EventError> {
        let mut conn = self.redis.clone();

        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                debug!(stream = %self.stream, group = %self.group, "created consumer group");
                Ok(())
            }
            // Another instance won the race; the group is there.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Parses, acknowledges, and (when warranted) promotes one entry.
    async fn handle_entry(&self, entry: &StreamId) {
        let target = match entry.map.get(PAYLOAD_FIELD) {
            Some(value) => match redis::from_redis_value::<String>(value) {
                Ok(payload) => match serde_json::from_str::<HookEnvelope>(&payload) {
                    Ok(envelope) => rebase_target(&envelope),
                    Err(e) => {
                        error!(entry = %entry.id, error = %e, "failed to parse event payload");
                        None
                    }
                },
                Err(e) => {
                    error!(entry = %entry.id, error = %e, "event payload is not a string");
                    None
                }
            },
            None => {
                warn!(entry = %entry.id, "event entry has no payload field");
                None
            }
        };

        // Acknowledge unconditionally; a bad or unpromotable message must
        // not come back on the next read.
        self.ack(&entry.id).await;

        let Some(repo) = target else { return };

        match self.queue.promote_to_front(&repo).await {
            Ok(()) => info!(repo = %repo, "promoted repo after rebase request"),
            Err(e) => error!(repo = %repo, error = %e, "failed to promote repo"),
        }
    }

    async fn ack(&self, entry_id: &str) {
        let mut conn = self.redis.clone();
        let acked: Result<i64, redis::RedisError> =
            conn.xack(&self.stream, &self.group, &[entry_id]).await;
        if let Err(e) = acked {
            error!(entry = %entry_id, error = %e, "failed to ack event entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_json(title: &str, previous: &str, key: &str, slug: &str) -> String {
        format!(
            r#"{{
                "hookData": {{
                    "pullRequest": {{
                        "title": "{title}",
                        "toRef": {{
                            "repository": {{
                                "slug": "{slug}",
                                "project": {{ "key": "{key}" }}
                            }}
                        }}
                    }},
                    "previousTitle": "{previous}"
                }}
            }}"#
        )
    }

    #[test]
    fn test_rebase_request_yields_target() {
        let payload = event_json("rebase! update deps", "update deps", "proj1", "repo1");
        let envelope: HookEnvelope = serde_json::from_str(&payload).unwrap();

        assert_eq!(rebase_target(&envelope), Some("proj1/repo1".to_string()));
    }

    #[test]
    fn test_unmarked_title_is_ignored() {
        let payload = event_json("update deps", "old title", "proj1", "repo1");
        let envelope: HookEnvelope = serde_json::from_str(&payload).unwrap();

        assert_eq!(rebase_target(&envelope), None);
    }

    #[test]
    fn test_unchanged_marked_title_is_ignored() {
        // The marker was already present; nothing new was requested.
        let payload = event_json("rebase! update deps", "rebase! update deps", "p", "r");
        let envelope: HookEnvelope = serde_json::from_str(&payload).unwrap();

        assert_eq!(rebase_target(&envelope), None);
    }

    #[test]
    fn test_missing_previous_title_defaults_to_empty() {
        let payload = r#"{
            "hookData": {
                "pullRequest": {
                    "title": "rebase!",
                    "toRef": {
                        "repository": {
                            "slug": "r",
                            "project": { "key": "p" }
                        }
                    }
                }
            }
        }"#;
        let envelope: HookEnvelope = serde_json::from_str(payload).unwrap();

        assert_eq!(rebase_target(&envelope), Some("p/r".to_string()));
    }

    #[test]
    fn test_malformed_payload_is_a_parse_error() {
        assert!(serde_json::from_str::<HookEnvelope>("{}").is_err());
        assert!(serde_json::from_str::<HookEnvelope>("not json").is_err());
    }
}
