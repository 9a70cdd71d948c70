use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use relay_core::config::RegistryBackendKind;
use relay_core::{
    load_relay_config, AddSessionRequest, ControllerError, ErrorKind, ExtractionPipeline,
    ExtractionRequest, ExtractionResult, ReconcileReport, RelayConfig, SessionController,
    SessionKind, StreamSession, SystemCommandExecutor,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] relay_core::ConfigError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid extraction pattern: {0}")]
    Pattern(String),
    #[error("{message}")]
    Extraction { kind: ErrorKind, message: String },
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Controller(err) => err.kind(),
            AppError::Extraction { kind, .. } => *kind,
            AppError::Config(_) | AppError::Pattern(_) => ErrorKind::Validation,
            AppError::Io(_) | AppError::Serialize(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live stream relay control interface", long_about = None)]
pub struct Cli {
    /// Path to relay.toml
    #[arg(long, env = "RELAY_CONFIG", default_value = "configs/relay.toml")]
    pub config: PathBuf,
    /// Root that relative paths resolve against (overrides paths.base_dir)
    #[arg(long)]
    pub base_dir: Option<PathBuf>,
    /// Registry location, relative to the data dir (overrides registry.path)
    #[arg(long)]
    pub registry: Option<PathBuf>,
    /// Registry storage backend
    #[arg(long, value_enum)]
    pub registry_backend: Option<BackendArg>,
    /// tmux binary used to supervise workers
    #[arg(long)]
    pub tmux: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Json,
    Sqlite,
}

impl From<BackendArg> for RegistryBackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Json => RegistryBackendKind::Json,
            BackendArg::Sqlite => RegistryBackendKind::Sqlite,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage relay and capture sessions
    #[command(subcommand)]
    Sessions(SessionCommands),
    /// Resolve a playable stream URL from a page and a cookie export
    Extract(ExtractArgs),
    /// Refresh cached session statuses from tmux
    Reconcile(ReconcileArgs),
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// List sessions with reconciled statuses
    List,
    /// Start a new session
    Add(AddArgs),
    /// Stop a session's worker, keeping its record
    Stop(SessionIdArgs),
    /// Stop a session if needed and remove its record
    Delete(SessionIdArgs),
    /// Show the tail of a session's worker output
    Logs(LogsArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Session kind
    #[arg(long, default_value = "relay")]
    pub kind: SessionKind,
    /// Display name (defaults to "<kind> HH:MM:SS")
    #[arg(long)]
    pub name: Option<String>,
    /// Ingest URL including the stream key
    #[arg(long, env = "RELAY_CREDENTIAL", hide_env_values = true)]
    pub credential: String,
    /// Upstream source URL (defaults to worker.default_source)
    #[arg(long)]
    pub source: Option<String>,
}

#[derive(Args, Debug)]
pub struct SessionIdArgs {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    pub id: String,
    /// Number of lines (defaults to supervisor.log_lines)
    #[arg(long)]
    pub lines: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Page that carries the live stream
    pub source: String,
    /// Cookie export (Netscape file or name=value lines); `-` reads stdin
    #[arg(long)]
    pub cookies: PathBuf,
    /// Known stream identifier for the CDN guesses
    #[arg(long)]
    pub stream_id: Option<String>,
    /// Write the resolved URL as a link record to this file
    #[arg(long)]
    pub save: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Keep reconciling every N seconds until interrupted
    #[arg(long)]
    pub watch: Option<u64>,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Sessions(SessionCommands::List) => {
            let sessions = SessionList {
                sessions: context.controller.list().await?,
            };
            render(&sessions, cli.format)?;
        }
        Commands::Sessions(SessionCommands::Add(args)) => {
            let session = context
                .controller
                .add(AddSessionRequest {
                    kind: args.kind,
                    display_name: args.name.clone(),
                    credential: args.credential.clone(),
                    source_url: args.source.clone(),
                })
                .await?;
            render(&session, cli.format)?;
        }
        Commands::Sessions(SessionCommands::Stop(args)) => {
            let session = context.controller.stop(&args.id).await?;
            render(&session, cli.format)?;
        }
        Commands::Sessions(SessionCommands::Delete(args)) => {
            let session = context.controller.delete(&args.id).await?;
            render(&session, cli.format)?;
        }
        Commands::Sessions(SessionCommands::Logs(args)) => {
            let lines = context.controller.logs(&args.id, args.lines).await?;
            render(
                &LogTail {
                    id: args.id.clone(),
                    lines,
                },
                cli.format,
            )?;
        }
        Commands::Extract(args) => {
            let result = context.extract(args).await?;
            render(&result, cli.format)?;
            if let Some(error) = &result.error {
                return Err(AppError::Extraction {
                    kind: error.kind,
                    message: error.message.clone(),
                });
            }
            if let (Some(path), Some(record)) = (&args.save, result.link_record()) {
                record.save(path)?;
            }
        }
        Commands::Reconcile(args) => {
            let report = context.controller.reconcile().await?;
            render(&report, cli.format)?;
            if let Some(seconds) = args.watch {
                context.watch(Duration::from_secs(seconds.max(1))).await;
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: RelayConfig,
    controller: SessionController,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_relay_config(&cli.config)?;
        if let Some(dir) = &cli.base_dir {
            config.paths.base_dir = dir.to_string_lossy().to_string();
        }
        if let Some(path) = &cli.registry {
            config.registry.path = path.to_string_lossy().to_string();
        }
        if let Some(backend) = cli.registry_backend {
            config.registry.backend = backend.into();
        }
        if let Some(tmux) = &cli.tmux {
            config.supervisor.tmux_binary = tmux.to_string_lossy().to_string();
        }
        let controller = SessionController::from_config(config.clone())?;
        Ok(Self { config, controller })
    }

    async fn extract(&self, args: &ExtractArgs) -> Result<ExtractionResult> {
        let cookie_text = if args.cookies.as_os_str() == "-" {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        } else {
            fs::read_to_string(&args.cookies)?
        };
        let pipeline = ExtractionPipeline::standard(&self.config, Arc::new(SystemCommandExecutor))
            .map_err(|err| AppError::Pattern(err.to_string()))?;
        let mut request = ExtractionRequest::new(args.source.clone(), cookie_text);
        if let Some(stream_id) = &args.stream_id {
            request = request.with_stream_id(stream_id.clone());
        }
        Ok(pipeline.extract(&request).await)
    }

    async fn watch(&self, every: Duration) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                let _ = shutdown_tx.send(true);
            }
        });
        self.controller.run_reconciler(every, shutdown_rx).await;
        signal.abort();
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct SessionList {
    sessions: Vec<StreamSession>,
}

#[derive(Debug, Serialize)]
struct LogTail {
    id: String,
    lines: Vec<String>,
}

fn session_line(session: &StreamSession) -> String {
    format!(
        "{id} [{status}] {kind} {name} | tmux {session_name} | key {credential} | src {source} | since {created}",
        id = session.id,
        status = session.status,
        kind = session.kind,
        name = session.display_name,
        session_name = session.session_name,
        credential = session.credential_masked,
        source = session.source_url,
        created = session.created_at.format("%Y-%m-%d %H:%M:%S"),
    )
}

impl DisplayFallback for SessionList {
    fn display(&self) -> String {
        if self.sessions.is_empty() {
            return "No sessions registered".to_string();
        }
        self.sessions
            .iter()
            .map(session_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for StreamSession {
    fn display(&self) -> String {
        session_line(self)
    }
}

impl DisplayFallback for LogTail {
    fn display(&self) -> String {
        self.lines.join("\n")
    }
}

impl DisplayFallback for ReconcileReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Checked {} sessions, {} changed",
            self.checked,
            self.changes.len()
        )];
        for change in &self.changes {
            lines.push(format!(
                "  - {} ({}): {} -> {}",
                change.id, change.session_name, change.from, change.to
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for ExtractionResult {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        match (&self.stream_url, &self.method, &self.format) {
            (Some(url), Some(method), Some(format)) => {
                lines.push(format!("Resolved via {method} ({format})"));
                lines.push(url.clone());
            }
            _ => {
                if let Some(error) = &self.error {
                    lines.push(format!("Extraction failed [{}]: {}", error.kind, error.message));
                }
            }
        }
        for attempt in &self.tried_methods {
            lines.push(format!(
                "  - {} {:?}: {}",
                attempt.method, attempt.outcome, attempt.detail
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::SessionStatus;
    use tempfile::TempDir;

    fn fixture_config() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../configs/relay.toml")
    }

    fn cli_for(temp: &TempDir, command: Commands) -> Cli {
        Cli {
            config: fixture_config(),
            base_dir: Some(temp.path().to_path_buf()),
            registry: None,
            registry_backend: None,
            tmux: None,
            format: OutputFormat::Json,
            command,
        }
    }

    #[test]
    fn parses_session_add_arguments() {
        let cli = Cli::try_parse_from([
            "relayctl",
            "--format",
            "json",
            "sessions",
            "add",
            "--kind",
            "capture",
            "--credential",
            "rtmp://ingest.example.com/app/key",
            "--name",
            "night",
        ])
        .unwrap();
        match cli.command {
            Commands::Sessions(SessionCommands::Add(args)) => {
                assert_eq!(args.kind, SessionKind::Capture);
                assert_eq!(args.name.as_deref(), Some("night"));
                assert!(args.source.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn overrides_apply_to_loaded_config() {
        let temp = TempDir::new().unwrap();
        let mut cli = cli_for(&temp, Commands::Sessions(SessionCommands::List));
        cli.registry = Some(PathBuf::from("custom/sessions.db"));
        cli.registry_backend = Some(BackendArg::Sqlite);
        cli.tmux = Some(PathBuf::from("/usr/local/bin/tmux"));
        let context = AppContext::new(&cli).unwrap();
        assert_eq!(
            context.config.registry_path(),
            temp.path().join("data/custom/sessions.db")
        );
        assert_eq!(context.config.registry.backend, RegistryBackendKind::Sqlite);
        assert_eq!(context.config.supervisor.tmux_binary, "/usr/local/bin/tmux");
        assert!(temp.path().join("data/custom/sessions.db").exists());
    }

    #[tokio::test]
    async fn listing_an_empty_registry_succeeds() {
        let temp = TempDir::new().unwrap();
        let cli = cli_for(&temp, Commands::Sessions(SessionCommands::List));
        let context = AppContext::new(&cli).unwrap();
        let sessions = context.controller.list().await.unwrap();
        assert!(sessions.is_empty());
        let list = SessionList { sessions };
        assert_eq!(list.display(), "No sessions registered");
        assert_eq!(serde_json::to_string(&list).unwrap(), "[]");
    }

    #[tokio::test]
    async fn unknown_session_maps_to_not_found() {
        let temp = TempDir::new().unwrap();
        let cli = cli_for(
            &temp,
            Commands::Sessions(SessionCommands::Stop(SessionIdArgs {
                id: "missing1".into(),
            })),
        );
        let err = run(cli).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn extraction_with_empty_cookies_is_a_validation_error() {
        let temp = TempDir::new().unwrap();
        let cookies = temp.path().join("cookies.txt");
        fs::write(&cookies, "# nothing but comments\n\n").unwrap();
        let cli = cli_for(
            &temp,
            Commands::Extract(ExtractArgs {
                source: "https://t.me/somechannel".into(),
                cookies,
                stream_id: None,
                save: Some(temp.path().join("link.json")),
            }),
        );
        let err = run(cli).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!temp.path().join("link.json").exists());
    }

    #[test]
    fn session_text_output_shows_masked_credential_only() {
        let session = StreamSession {
            id: "1a2b3c4d".into(),
            session_name: "relay_1a2b3c4d".into(),
            kind: SessionKind::Relay,
            display_name: "relay 10:00:00".into(),
            credential_masked: "rtmps://li...".into(),
            source_url: "http://127.0.0.1:8080/live/default.ts".into(),
            created_at: chrono::Utc::now(),
            status: SessionStatus::Running,
        };
        let text = session.display();
        assert!(text.starts_with("1a2b3c4d [running] relay relay 10:00:00"));
        assert!(text.contains("key rtmps://li..."));
    }
}
