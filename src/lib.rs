//! renofleet: split repository update workload across multiple agents.
//!
//! A `master` process discovers repositories with the external update
//! tool and appends them to a shared Redis list, deduplicated against
//! what is already queued. `agent` processes drain that list with
//! bounded parallelism and run the tool per repository. A Redis Stream
//! of pull-request webhook events lets urgent repositories jump the
//! queue. Any number of masters may run; lease-based leader election
//! ensures only one of them performs discovery at a time.

pub mod agent;
pub mod cli;
pub mod events;
pub mod leader;
pub mod master;
pub mod metrics;
pub mod queue;
pub mod runner;
pub mod shutdown;
pub mod web;
pub mod worker;

pub use leader::Candidate;
pub use queue::{QueueError, WorkQueue};
pub use runner::{Commander, UpdateRunner};
pub use worker::{WorkerPool, WorkerPoolConfig};
