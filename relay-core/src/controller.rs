use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::ErrorKind;
use crate::reconcile::{self, ReconcileError, ReconcileReport};
use crate::session::{
    session_name_for, RegistryError, RegistryLockGuard, SessionKind, SessionRegistry,
    SessionStatus, StreamSession,
};
use crate::supervisor::{
    CommandError, ProcessSupervisor, SupervisorError, TmuxSupervisor, WorkerCommandBuilder,
};

const SESSION_ID_LEN: usize = 8;
const HEARTBEAT_MARKER: &str = "progress=";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {session} failed to start: {reason}")]
    SpawnFailure { session: String, reason: String },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

impl ControllerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Validation(_) | ControllerError::Command(_) => ErrorKind::Validation,
            ControllerError::NotFound(_) => ErrorKind::NotFound,
            ControllerError::SpawnFailure { .. } => ErrorKind::SpawnFailure,
            ControllerError::Supervisor(err) => err.kind(),
            ControllerError::Reconcile(err) => err.kind(),
            ControllerError::Registry(_) | ControllerError::Io { .. } => ErrorKind::Internal,
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Clone, Default)]
pub struct AddSessionRequest {
    pub kind: SessionKind,
    pub display_name: Option<String>,
    /// Full ingest URL, or a bare stream key when the kind has an
    /// `ingest_base`. Never persisted unmasked.
    pub credential: String,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Heartbeat,
    SettledPresent,
    Vanished,
}

/// Owns every state transition of a session. Operations take the
/// controller-wide lock and then the registry's file lock, so registry writes
/// and tmux actions never interleave, not even across processes sharing a
/// registry; `add` keeps both through the settle window.
pub struct SessionController {
    config: RelayConfig,
    registry: SessionRegistry,
    supervisor: Arc<dyn ProcessSupervisor>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("registry", &self.registry)
            .finish()
    }
}

impl SessionController {
    pub fn new(
        config: RelayConfig,
        registry: SessionRegistry,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            config,
            registry,
            supervisor,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: RelayConfig) -> ControllerResult<Self> {
        let registry = SessionRegistry::from_config(&config)?;
        let supervisor = Arc::new(TmuxSupervisor::new(&config.supervisor.tmux_binary, None));
        Ok(Self::new(config, registry, supervisor))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Sessions with statuses freshly reconciled against the supervisor.
    pub async fn list(&self) -> ControllerResult<Vec<StreamSession>> {
        let _guard = self.exclusive().await?;
        let (sessions, _) = reconcile::reconcile(&self.registry, self.supervisor.as_ref()).await?;
        Ok(sessions)
    }

    pub async fn reconcile(&self) -> ControllerResult<ReconcileReport> {
        let _guard = self.exclusive().await?;
        let (_, report) = reconcile::reconcile(&self.registry, self.supervisor.as_ref()).await?;
        Ok(report)
    }

    pub async fn add(&self, request: AddSessionRequest) -> ControllerResult<StreamSession> {
        let _guard = self.exclusive().await?;
        let credential = request.credential.trim();
        if credential.is_empty() {
            return Err(ControllerError::Validation("credential is required".into()));
        }
        let source = request
            .source_url
            .as_deref()
            .map(str::trim)
            .filter(|source| !source.is_empty())
            .unwrap_or(self.config.worker.default_source.as_str())
            .to_string();

        let kind_config = self.config.kind(request.kind);
        let id = self.allocate_id()?;
        let session_name = session_name_for(&kind_config.prefix, &id);
        let progress_path = self.progress_path(&session_name);
        let mut builder = WorkerCommandBuilder::new(&self.config.worker)
            .source(source.clone())
            .destination(credential)
            .progress_file(progress_path.clone());
        if let Some(base) = &kind_config.ingest_base {
            builder = builder.ingest_base(base.clone());
        }
        let command = builder.build()?;
        if command.progress_file().is_some() {
            self.prepare_progress_file(&progress_path)?;
        }

        let mut session = StreamSession::new(
            id,
            request.kind,
            kind_config,
            request.display_name.as_deref(),
            credential,
            source,
            Utc::now(),
        );
        self.registry.insert(&session)?;
        info!(
            session_id = %session.id,
            session = %session.session_name,
            kind = %session.kind,
            "session registered; spawning worker"
        );

        if let Err(err) = self.supervisor.spawn(&session.session_name, &command).await {
            self.roll_back(&session).await;
            return Err(match err {
                SupervisorError::CommandFailure { stderr, .. } => ControllerError::SpawnFailure {
                    session: session.session_name.clone(),
                    reason: stderr,
                },
                other => other.into(),
            });
        }

        let readiness = match self
            .await_readiness(&session.session_name, command.progress_file())
            .await
        {
            Ok(readiness) => readiness,
            Err(err) => {
                self.roll_back(&session).await;
                return Err(err.into());
            }
        };
        if readiness == Readiness::Vanished {
            self.roll_back(&session).await;
            return Err(ControllerError::SpawnFailure {
                session: session.session_name.clone(),
                reason: format!(
                    "worker exited within the {}s settle window",
                    self.config.supervisor.settle_seconds
                ),
            });
        }

        session.status = SessionStatus::Running;
        if let Err(err) = self.registry.update(&session) {
            self.roll_back(&session).await;
            return Err(err.into());
        }
        info!(
            session_id = %session.id,
            session = %session.session_name,
            confirmed_by = ?readiness,
            "session running"
        );
        Ok(session)
    }

    pub async fn stop(&self, id: &str) -> ControllerResult<StreamSession> {
        let _guard = self.exclusive().await?;
        let mut session = self.require(id)?;
        self.supervisor.terminate(&session.session_name).await?;
        tokio::time::sleep(self.config.supervisor.stop_grace()).await;
        session.status = SessionStatus::Stopped;
        self.registry.update(&session)?;
        info!(session_id = %session.id, session = %session.session_name, "session stopped");
        Ok(session)
    }

    pub async fn delete(&self, id: &str) -> ControllerResult<StreamSession> {
        let _guard = self.exclusive().await?;
        let session = self.require(id)?;
        if self.supervisor.exists(&session.session_name).await? {
            self.supervisor.terminate(&session.session_name).await?;
        }
        self.registry.remove(&session.id)?;
        self.discard_progress_file(&session.session_name);
        info!(session_id = %session.id, session = %session.session_name, "session deleted");
        Ok(session)
    }

    /// Tail of the worker's output; `lines` defaults to the configured count.
    pub async fn logs(&self, id: &str, lines: Option<usize>) -> ControllerResult<Vec<String>> {
        let _guard = self.exclusive().await?;
        let session = self.require(id)?;
        let lines = lines.unwrap_or(self.config.supervisor.log_lines);
        Ok(self
            .supervisor
            .tail_output(&session.session_name, lines)
            .await?)
    }

    /// Reconciles every `every` until `shutdown` flips to true or its sender
    /// goes away. Failures are logged and the loop keeps going.
    pub async fn run_reconciler(&self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        info!(every = ?every, "reconciler started");
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconciler shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    match self.reconcile().await {
                        Ok(report) => debug!(
                            checked = report.checked,
                            changed = report.changes.len(),
                            "periodic reconciliation"
                        ),
                        Err(err) => warn!(error = %err, kind = %err.kind(), "periodic reconciliation failed"),
                    }
                }
            }
        }
    }

    async fn exclusive(&self) -> ControllerResult<(MutexGuard<'_, ()>, RegistryLockGuard)> {
        let local = self.lock.lock().await;
        let shared = self.registry.exclusive().await?;
        Ok((local, shared))
    }

    fn require(&self, id: &str) -> ControllerResult<StreamSession> {
        self.registry
            .get(id)?
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))
    }

    fn allocate_id(&self) -> ControllerResult<String> {
        let taken: HashSet<String> = self
            .registry
            .list()?
            .into_iter()
            .map(|session| session.id)
            .collect();
        loop {
            let mut id = Uuid::new_v4().simple().to_string();
            id.truncate(SESSION_ID_LEN);
            if !taken.contains(&id) {
                return Ok(id);
            }
        }
    }

    fn progress_path(&self, session_name: &str) -> PathBuf {
        self.config
            .scratch_dir()
            .join(format!("{session_name}.progress"))
    }

    fn prepare_progress_file(&self, path: &Path) -> ControllerResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ControllerError::Io {
                source,
                path: dir.to_path_buf(),
            })?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ControllerError::Io {
                source,
                path: path.to_path_buf(),
            }),
        }
    }

    fn discard_progress_file(&self, session_name: &str) {
        let path = self.progress_path(session_name);
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove progress file");
            }
        }
    }

    /// Polls until the worker reports progress, disappears, or the settle
    /// window runs out. At the deadline, existence alone decides.
    async fn await_readiness(
        &self,
        session_name: &str,
        progress_file: Option<&Path>,
    ) -> Result<Readiness, SupervisorError> {
        let settings = &self.config.supervisor;
        let deadline = Instant::now() + settings.settle_window();
        loop {
            if !self.supervisor.exists(session_name).await? {
                return Ok(Readiness::Vanished);
            }
            if let Some(path) = progress_file {
                if heartbeat_seen(path).await {
                    return Ok(Readiness::Heartbeat);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Readiness::SettledPresent);
            }
            tokio::time::sleep(settings.poll_interval().min(deadline - now)).await;
        }
    }

    async fn roll_back(&self, session: &StreamSession) {
        if let Err(err) = self.supervisor.terminate(&session.session_name).await {
            warn!(session = %session.session_name, error = %err, "rollback could not terminate worker");
        }
        match self.registry.remove(&session.id) {
            Ok(()) | Err(RegistryError::NotFound(_)) => {}
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "rollback could not remove session record")
            }
        }
        self.discard_progress_file(&session.session_name);
        warn!(session_id = %session.id, session = %session.session_name, "session start rolled back");
    }
}

async fn heartbeat_seen(path: &Path) -> bool {
    tokio::fs::read_to_string(path)
        .await
        .map(|content| content.contains(HEARTBEAT_MARKER))
        .unwrap_or(false)
}
