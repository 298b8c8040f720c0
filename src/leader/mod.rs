//! Lease-based leader election over Redis.
//!
//! Every master process creates one [`Candidate`] at startup with a fresh
//! random identity. Leadership is a single Redis key written with
//! `SET NX PX`: whoever creates the key holds the lease until its TTL
//! lapses. The lease is never deleted explicitly and never renewed; a
//! leader that wants to stay leader simply wins the next acquisition
//! attempt once the previous lease expires.
//!
//! Leadership here is advisory. There is no fencing token, so a process
//! whose lease expired under clock or scheduling skew can briefly act
//! alongside a newly elected leader. The only singleton work gated on
//! leadership is repository discovery, which is idempotent, so the worst
//! case is a duplicate discovery pass.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Well-known Redis key holding the leadership lease.
pub const LEADER_LOCK_KEY: &str = "renofleet:leader-lock";

/// Errors that can occur during election attempts.
#[derive(Debug, Error)]
pub enum LeaderError {
    /// Redis operation failed.
    #[error("redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One process's claim to leadership.
pub struct Candidate {
    /// Process-unique identity, generated once at startup.
    id: String,
    redis: ConnectionManager,
    /// Redis key the lease is stored under.
    lock_key: String,
    /// Lease time-to-live.
    session_ttl: Duration,
}

impl Candidate {
    /// Creates a candidate with a fresh identity.
    pub fn new(redis: ConnectionManager, lock_key: impl Into<String>, session_ttl: Duration) -> Self {
        Self {
            id: format!("candidate-{}", Uuid::new_v4()),
            redis,
            lock_key: lock_key.into(),
            session_ttl,
        }
    }

    /// Attempts to acquire the lease.
    ///
    /// Returns `true` iff this call created the lease, i.e. this process
    /// just became leader. Each call is a fresh attempt; holding the lease
    /// already does not make this succeed.
    pub async fn elect(&self) -> Result<bool, LeaderError> {
        let mut conn = self.redis.clone();
        let ttl_ms = self.session_ttl.as_millis().max(1) as u64;

        // SET NX PX is the atomic create-if-absent; reply is OK or nil.
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.lock_key)
            .arg(&self.id)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    /// Whether this process is currently the leader.
    ///
    /// First tries a fresh acquisition, so an expired lease is re-claimed
    /// in the same call. If someone holds the lease, reads it back and
    /// compares identities. A lease that vanishes between the two steps
    /// counts as not-leader; only store failures are errors.
    pub async fn is_leader(&self) -> Result<bool, LeaderError> {
        if self.elect().await? {
            debug!(candidate = %self.id, "acquired new leader lease");
            return Ok(true);
        }

        let mut conn = self.redis.clone();
        let holder: Option<String> = conn.get(&self.lock_key).await?;

        match holder {
            Some(leader_id) => {
                debug!(leader = %leader_id, "current leader");
                Ok(leader_id == self.id)
            }
            None => Ok(false),
        }
    }

    /// This candidate's identity token.
    pub fn id(&self) -> &str {
        &self.id
    }
}
