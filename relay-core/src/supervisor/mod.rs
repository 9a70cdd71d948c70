mod command;
mod tmux;

use std::io;
use std::process::Output;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::error::ErrorKind;

pub use command::{CommandError, WorkerCommand, WorkerCommandBuilder};
pub use tmux::TmuxSupervisor;

/// Returned by `tail_output` when a worker has nothing to show.
pub const NO_OUTPUT_PLACEHOLDER: &str = "no output available";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{tool} is not installed or not on PATH")]
    ToolUnavailable { tool: String },
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::ToolUnavailable { .. } => ErrorKind::ToolUnavailable,
            SupervisorError::CommandFailure { .. } => ErrorKind::SpawnFailure,
            SupervisorError::Io(_) => ErrorKind::Internal,
        }
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        command.kill_on_drop(true).output().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub name: String,
}

/// Named detached workers. `exists` is the only trustworthy answer to
/// "is this job running".
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn exists(&self, name: &str) -> SupervisorResult<bool>;

    async fn spawn(&self, name: &str, command: &WorkerCommand) -> SupervisorResult<WorkerHandle>;

    /// Stops the worker; a missing worker is not an error.
    async fn terminate(&self, name: &str) -> SupervisorResult<()>;

    /// Last `lines` lines of worker output, or [`NO_OUTPUT_PLACEHOLDER`].
    async fn tail_output(&self, name: &str, lines: usize) -> SupervisorResult<Vec<String>>;
}
