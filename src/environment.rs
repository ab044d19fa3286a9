//! Host environment: subprocess execution and container-runtime probes.
//!
//! The SPIRE server and agent run in containers. Every call into them goes
//! through a [`CommandRunner`] so tests can script process output.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// A required tool or process is missing or unreachable.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("required tool '{tool}' is not available: {reason}")]
    ToolMissing { tool: String, reason: String },

    #[error("container runtime query failed: {0}")]
    RuntimeUnavailable(String),

    #[error("container '{0}' is not running")]
    ContainerNotRunning(String),

    #[error("authorization server is unreachable at {url}: {reason}")]
    AuthServerUnreachable { url: String, reason: String },
}

/// Captured output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; None if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stderr if present, stdout otherwise. Used for diagnostics.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runs external programs to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for Arc<T> {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        (**self).run(program, args).await
    }
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        trace!(program = %program, args = ?args, "Running command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        let output = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(program = %program, status = ?output.status, "Command finished");
        Ok(output)
    }
}

/// Host checks performed before the flow touches any external state.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Confirm a command-line tool can be executed.
    async fn check_tool(&self, tool: &str) -> Result<(), EnvironmentError>;

    /// Names of the running containers.
    async fn running_containers(&self) -> Result<Vec<String>, EnvironmentError>;
}

/// Confirm the identity server and agent containers are running.
///
/// A container counts as running when any running name contains the
/// configured name.
pub async fn ensure_containers_running(
    runtime: &dyn ContainerRuntime,
    required: &[&str],
) -> Result<(), EnvironmentError> {
    let running = runtime.running_containers().await?;
    debug!(running = ?running, "Listed running containers");

    for name in required {
        if !running.iter().any(|r| r.contains(name)) {
            warn!(container = %name, "Required container is not running");
            return Err(EnvironmentError::ContainerNotRunning(name.to_string()));
        }
    }

    Ok(())
}

/// Docker CLI implementation of [`ContainerRuntime`].
pub struct DockerRuntime<R> {
    runner: R,
}

impl<R: CommandRunner> DockerRuntime<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<R: CommandRunner> ContainerRuntime for DockerRuntime<R> {
    async fn check_tool(&self, tool: &str) -> Result<(), EnvironmentError> {
        let output = self
            .runner
            .run(tool, &["--version".to_string()])
            .await
            .map_err(|e| EnvironmentError::ToolMissing {
                tool: tool.to_string(),
                reason: e.to_string(),
            })?;

        if !output.success() {
            return Err(EnvironmentError::ToolMissing {
                tool: tool.to_string(),
                reason: output.diagnostic().to_string(),
            });
        }

        debug!(tool = %tool, version = %output.stdout.trim(), "Found required tool");
        Ok(())
    }

    async fn running_containers(&self) -> Result<Vec<String>, EnvironmentError> {
        let args = ["ps".to_string(), "--format".to_string(), "{{.Names}}".to_string()];
        let output = self
            .runner
            .run("docker", &args)
            .await
            .map_err(|e| EnvironmentError::RuntimeUnavailable(e.to_string()))?;

        if !output.success() {
            return Err(EnvironmentError::RuntimeUnavailable(
                output.diagnostic().to_string(),
            ));
        }

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}
