use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use crate::config::ResolverSection;
use crate::supervisor::CommandExecutor;

use super::candidates::select_resolver_url;
use super::{
    excerpt, ExtractionContext, ExtractionStrategy, StrategyError, StrategyOutcome,
    STDERR_EXCERPT_CHARS,
};

/// Hands the cookies and source to an external resolver (yt-dlp) and reads
/// the URLs it prints.
pub struct ResolverStrategy {
    binary: String,
    format: String,
    cookie_domain: String,
    scratch_dir: Option<PathBuf>,
    timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for ResolverStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverStrategy")
            .field("binary", &self.binary)
            .field("format", &self.format)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

impl ResolverStrategy {
    pub fn new(
        config: &ResolverSection,
        cookie_domain: &str,
        scratch_dir: Option<PathBuf>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            binary: config.binary.clone(),
            format: config.format.clone(),
            cookie_domain: cookie_domain.to_string(),
            scratch_dir,
            timeout: Duration::from_secs(config.timeout_seconds),
            executor,
        }
    }

    /// The file is deleted when the handle drops, including when the
    /// attempt is cancelled by its timeout.
    fn write_cookie_file(&self, ctx: &ExtractionContext) -> io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("relay-cookies-").suffix(".txt");
        let mut file = match &self.scratch_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempfile_in(dir)?
            }
            None => builder.tempfile()?,
        };
        file.write_all(ctx.jar.to_netscape(&self.cookie_domain).as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

#[async_trait]
impl ExtractionStrategy for ResolverStrategy {
    fn name(&self) -> &'static str {
        "external_resolver"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &ExtractionContext) -> Result<StrategyOutcome, StrategyError> {
        let cookie_file = self.write_cookie_file(ctx)?;
        let mut command = Command::new(&self.binary);
        command
            .arg("--cookies")
            .arg(cookie_file.path())
            .arg("--get-url")
            .arg("-f")
            .arg(&self.format)
            .arg(ctx.source.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = self.executor.run(&mut command).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StrategyError::ToolUnavailable {
                    tool: self.binary.clone(),
                }
            } else {
                StrategyError::Io(err)
            }
        })?;
        drop(cookie_file);

        if !output.status.success() {
            return Err(StrategyError::ToolFailed {
                tool: self.binary.clone(),
                status: output.status.code(),
                stderr: excerpt(&String::from_utf8_lossy(&output.stderr), STDERR_EXCERPT_CHARS),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(tool = %self.binary, lines = stdout.lines().count(), "resolver finished");
        match select_resolver_url(stdout.lines()) {
            Some(url) => Ok(StrategyOutcome::Found(url)),
            None => Ok(StrategyOutcome::Nothing(
                "resolver printed no usable url".into(),
            )),
        }
    }
}
