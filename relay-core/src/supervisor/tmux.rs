use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    CommandExecutor, ProcessSupervisor, SupervisorError, SupervisorResult, SystemCommandExecutor,
    WorkerCommand, WorkerHandle, NO_OUTPUT_PLACEHOLDER,
};

/// Runs each worker inside its own detached tmux session.
pub struct TmuxSupervisor {
    binary: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for TmuxSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TmuxSupervisor")
            .field("binary", &self.binary)
            .finish()
    }
}

impl TmuxSupervisor {
    pub fn new(binary: impl AsRef<Path>, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            binary: binary.as_ref().to_path_buf(),
            executor,
        }
    }

    async fn tmux(&self, args: &[String]) -> SupervisorResult<Output> {
        let mut command = Command::new(&self.binary);
        command.args(args).stdin(Stdio::null());
        self.executor.run(&mut command).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                SupervisorError::ToolUnavailable {
                    tool: self.binary.display().to_string(),
                }
            } else {
                SupervisorError::Io(err)
            }
        })
    }

    fn failure(&self, args: &[String], output: &Output) -> SupervisorError {
        SupervisorError::CommandFailure {
            command: format!("{} {}", self.binary.display(), args.join(" ")),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

// A leading `=` makes tmux match the session name exactly instead of by prefix.
fn session_target(name: &str) -> String {
    format!("={name}")
}

fn pane_target(name: &str) -> String {
    format!("={name}:")
}

#[async_trait]
impl ProcessSupervisor for TmuxSupervisor {
    async fn exists(&self, name: &str) -> SupervisorResult<bool> {
        let args = vec![
            "has-session".to_string(),
            "-t".to_string(),
            session_target(name),
        ];
        let output = self.tmux(&args).await?;
        Ok(output.status.success())
    }

    async fn spawn(&self, name: &str, command: &WorkerCommand) -> SupervisorResult<WorkerHandle> {
        let mut args = vec![
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            name.to_string(),
            "--".to_string(),
            command.program().to_string_lossy().to_string(),
        ];
        args.extend(command.args().iter().cloned());
        let output = self.tmux(&args).await?;
        if !output.status.success() {
            return Err(self.failure(&args, &output));
        }
        info!(session = name, program = %command.program().display(), "worker session created");
        Ok(WorkerHandle {
            name: name.to_string(),
        })
    }

    async fn terminate(&self, name: &str) -> SupervisorResult<()> {
        if !self.exists(name).await? {
            debug!(session = name, "terminate skipped; session absent");
            return Ok(());
        }
        let args = vec![
            "kill-session".to_string(),
            "-t".to_string(),
            session_target(name),
        ];
        let output = self.tmux(&args).await?;
        if !output.status.success() && self.exists(name).await? {
            return Err(self.failure(&args, &output));
        }
        info!(session = name, "worker session terminated");
        Ok(())
    }

    async fn tail_output(&self, name: &str, lines: usize) -> SupervisorResult<Vec<String>> {
        let args = vec![
            "capture-pane".to_string(),
            "-p".to_string(),
            "-t".to_string(),
            pane_target(name),
            "-S".to_string(),
            format!("-{}", lines.max(1)),
        ];
        let output = self.tmux(&args).await?;
        if !output.status.success() {
            warn!(
                session = name,
                status = output.status.code(),
                "capture-pane failed"
            );
            return Ok(vec![NO_OUTPUT_PLACEHOLDER.to_string()]);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut captured: Vec<String> = stdout.lines().map(str::to_string).collect();
        while captured.last().map(|line| line.trim().is_empty()).unwrap_or(false) {
            captured.pop();
        }
        if captured.is_empty() {
            return Ok(vec![NO_OUTPUT_PLACEHOLDER.to_string()]);
        }
        Ok(captured)
    }
}
