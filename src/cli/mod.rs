//! Command-line interface.
//!
//! Two modes share one binary: `master` discovers repositories and feeds
//! the shared queue; `agent` drains the queue and runs updates. All
//! configuration is validated here, before any component starts — a bad
//! redis URL, cron expression, or port is fatal at startup, while every
//! later failure is logged and retried by the component that hit it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use redis::aio::ConnectionManager;

use crate::agent::Agent;
use crate::events::{EventIngestor, CONSUMER_GROUP, EVENT_STREAM_KEY};
use crate::leader::{Candidate, LEADER_LOCK_KEY};
use crate::master::{parse_schedule, Master, MasterConfig};
use crate::metrics::Metrics;
use crate::queue::{WorkQueue, JOB_LIST_KEY};
use crate::runner::{Exec, UpdateRunner};
use crate::shutdown;

/// Split repository update workload across multiple agents using Redis.
#[derive(Parser)]
#[command(name = "renofleet")]
#[command(about = "Split repository update workload across multiple agents using Redis")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run repository discovery and feed the shared queue.
    Master(MasterArgs),

    /// Drain the shared queue and run updates.
    Agent(AgentArgs),
}

#[derive(Parser, Debug)]
pub struct MasterArgs {
    /// Redis url, e.g. redis://[[username]:[password]@]localhost:6379/0
    /// (rediss:// for TLS).
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: String,

    /// Gate discovery on lease-based leader election.
    #[arg(long)]
    pub leader_elect: bool,

    /// Leadership lease time-to-live.
    #[arg(long, default_value = "2m", value_parser = humantime::parse_duration)]
    pub election_ttl: Duration,

    /// Run discovery on a cron schedule instead of once. Five-field
    /// expressions (minute first) and six-field expressions with seconds
    /// are both accepted.
    #[arg(long)]
    pub schedule: Option<String>,

    /// Run discovery immediately before entering the schedule loop.
    /// Only applicable together with --schedule.
    #[arg(long)]
    pub run_first_time: bool,

    /// Consume the pull-request event stream and promote rebase-requested
    /// repositories to the front of the queue. Only applicable together
    /// with --schedule.
    #[arg(long)]
    pub event_stream: bool,

    /// Port for the health and metrics endpoints.
    #[arg(long, default_value = "8080")]
    pub port: u16,
}

#[derive(Parser, Debug)]
pub struct AgentArgs {
    /// Redis url, e.g. redis://[[username]:[password]@]localhost:6379/0
    /// (rediss:// for TLS).
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: String,

    /// Maximum number of simultaneous update processes.
    #[arg(long, default_value = "1")]
    pub max_process_count: usize,

    /// Port for the health and metrics endpoints.
    #[arg(long, default_value = "8080")]
    pub port: u16,
}

/// Parses the command line.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the selected mode to completion.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let token = shutdown::install_handler();

    match cli.command {
        Commands::Master(args) => run_master(args, token).await,
        Commands::Agent(args) => run_agent(args, token).await,
    }
}

async fn connect(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(redis_url).context("invalid redis url")?;
    ConnectionManager::new(client)
        .await
        .context("failed to connect to redis")
}

async fn run_master(
    args: MasterArgs,
    token: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let schedule = args
        .schedule
        .as_deref()
        .map(parse_schedule)
        .transpose()
        .with_context(|| format!("invalid cron schedule: {:?}", args.schedule))?;

    let redis = connect(&args.redis_url).await?;
    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
    let queue = WorkQueue::new(redis.clone(), JOB_LIST_KEY);

    let ingestor = args.event_stream.then(|| {
        EventIngestor::new(
            redis.clone(),
            queue.clone(),
            EVENT_STREAM_KEY,
            CONSUMER_GROUP,
        )
    });

    let master = Master {
        candidate: Candidate::new(redis, LEADER_LOCK_KEY, args.election_ttl),
        queue,
        runner: UpdateRunner::new(Arc::new(Exec)),
        metrics,
        ingestor,
        http_port: args.port,
        config: MasterConfig {
            leader_elect: args.leader_elect,
            schedule,
            run_first_time: args.run_first_time,
        },
    };

    master.run(token).await?;
    Ok(())
}

async fn run_agent(
    args: AgentArgs,
    token: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let redis = connect(&args.redis_url).await?;
    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);

    let agent = Agent {
        queue: WorkQueue::new(redis, JOB_LIST_KEY),
        runner: Arc::new(UpdateRunner::new(Arc::new(Exec))),
        metrics,
        max_process_count: args.max_process_count,
        http_port: args.port,
    };

    agent.run(token).await?;
    Ok(())
}
