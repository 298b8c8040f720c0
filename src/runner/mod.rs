//! External update tool invocation.
//!
//! Everything that shells out lives behind the [`Commander`] capability
//! trait so tests can substitute a recording implementation. The
//! production [`Exec`] runs commands through `tokio::process`, captures
//! output and exit status, and reaps any detached children the tool left
//! behind.
//!
//! [`UpdateRunner`] drives the tool itself for the two operations the
//! system needs:
//!
//! - `run_update(job)`: update one repository; an option suffix on the
//!   job identifier (`repo?loglevel=debug`) becomes an environment
//!   override for the tool
//! - `discover()`: ask the tool for the repository list via the
//!   temp-file protocol (`--write-discovered-repos <path>`)

use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// The external update tool executed for every job.
pub const UPDATE_TOOL: &str = "renovate";

/// How much captured stderr to carry into an error message.
const STDERR_TAIL_BYTES: usize = 2048;

/// Errors from invoking the update tool.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The command could not be spawned at all.
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran but exited unsuccessfully.
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    /// Could not create the discovery temp file.
    #[error("error creating temp file: {0}")]
    TempFile(#[source] std::io::Error),

    /// Could not read the discovered repository list back.
    #[error("error reading discovered repo list: {0}")]
    ReadRepoList(#[source] std::io::Error),

    /// The discovered repository list was not a JSON array of strings.
    #[error("error parsing discovered repo list: {0}")]
    ParseRepoList(#[from] serde_json::Error),
}

/// Captured result of one external command.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

/// Capability to run an external command.
///
/// Production code uses [`Exec`]; tests substitute mocks that record the
/// invocation and fabricate output.
#[async_trait]
pub trait Commander: Send + Sync {
    /// Runs `program` with `args`, injecting `env` on top of the inherited
    /// environment, and captures its output and exit status. A non-zero
    /// exit is not an error at this layer; callers inspect `status`.
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        env: &[(String, String)],
    ) -> Result<CommandOutput, RunnerError>;
}

/// Runs commands as real child processes.
pub struct Exec;

#[async_trait]
impl Commander for Exec {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        env: &[(String, String)],
    ) -> Result<CommandOutput, RunnerError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }

        debug!(program, ?args, "running command");

        let output = cmd.output().await.map_err(|source| RunnerError::Spawn {
            tool: program.to_string(),
            source,
        })?;

        reap_children();

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status,
        })
    }
}

/// Collects zombie children left behind by the update tool.
///
/// The tool forks helpers (git, package managers) that it does not always
/// wait on. When this process runs as PID 1 in a container those orphans
/// reparent to us and stay zombies unless collected. Outside PID 1 the
/// init system handles them, and waiting on arbitrary pids would race
/// with the runtime's own child management, so this is a no-op there.
#[cfg(unix)]
fn reap_children() {
    if std::process::id() != 1 {
        return;
    }
    loop {
        let mut status: libc::c_int = 0;
        // WNOHANG: only collect children that already exited.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        match pid {
            -1 | 0 => return,
            pid => debug!(pid, status, "reaped zombie child"),
        }
    }
}

#[cfg(not(unix))]
fn reap_children() {}

/// Splits a job identifier into the repository and the env overrides its
/// option suffix maps to. Unknown options are stripped and ignored.
fn job_env(job: &str) -> (&str, Vec<(String, String)>) {
    let (repo, options) = match job.split_once('?') {
        Some((repo, options)) => (repo, options),
        None => return (job, Vec::new()),
    };

    let env = match options {
        "loglevel=debug" => vec![("LOG_LEVEL".to_string(), "debug".to_string())],
        other => {
            warn!(repo, options = other, "ignoring unknown job options");
            Vec::new()
        }
    };
    (repo, env)
}

/// Drives the update tool for job execution and repository discovery.
pub struct UpdateRunner {
    commander: Arc<dyn Commander>,
}

impl UpdateRunner {
    pub fn new(commander: Arc<dyn Commander>) -> Self {
        Self { commander }
    }

    /// Updates one repository. The option suffix, if any, is stripped from
    /// the identifier and turned into environment overrides.
    pub async fn run_update(&self, job: &str) -> Result<(), RunnerError> {
        let (repo, env) = job_env(job);

        let output = self.commander.run(UPDATE_TOOL, &[repo], &env).await?;
        if !output.status.success() {
            return Err(RunnerError::Failed {
                tool: UPDATE_TOOL.to_string(),
                status: output.status,
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(())
    }

    /// Runs repository discovery and returns the discovered identifiers.
    ///
    /// The tool is handed a freshly created empty temp file and must write
    /// a JSON array of strings to it. The file is removed when this
    /// function returns, whether discovery succeeded or not.
    pub async fn discover(&self) -> Result<Vec<String>, RunnerError> {
        // NamedTempFile deletes the file on drop, covering every exit path.
        let file = tempfile::Builder::new()
            .prefix("renofleet_")
            .tempfile()
            .map_err(RunnerError::TempFile)?;
        let path = file.path().display().to_string();

        let output = self
            .commander
            .run(UPDATE_TOOL, &["--write-discovered-repos", &path], &[])
            .await?;
        if !output.status.success() {
            return Err(RunnerError::Failed {
                tool: UPDATE_TOOL.to_string(),
                status: output.status,
                stderr: stderr_tail(&output.stderr),
            });
        }

        let data = std::fs::read(file.path()).map_err(RunnerError::ReadRepoList)?;
        let repos: Vec<String> = serde_json::from_slice(&data)?;
        Ok(repos)
    }
}

fn stderr_tail(stderr: &str) -> String {
    if stderr.len() <= STDERR_TAIL_BYTES {
        return stderr.trim_end().to_string();
    }
    let start = stderr.len() - STDERR_TAIL_BYTES;
    // Back off to a char boundary so the slice is valid UTF-8.
    let start = (start..stderr.len())
        .find(|i| stderr.is_char_boundary(*i))
        .unwrap_or(stderr.len());
    stderr[start..].trim_end().to_string()
}
