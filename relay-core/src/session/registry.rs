use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use thiserror::Error;

use crate::config::{RegistryBackendKind, RelayConfig};

use super::document::JsonDocumentBackend;
use super::lock::{RegistryLock, RegistryLockGuard};
use super::models::{SessionStatus, StreamSession};
use super::sqlite::SqliteRegistryBackend;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to encode registry document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to open registry database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("registry database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} already registered")]
    Duplicate(String),
    #[error("registry lock poisoned")]
    Poisoned,
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Sibling an unreadable registry file is moved to: `<file>.corrupt-<ts>`.
pub(crate) fn quarantine_target(path: &Path) -> PathBuf {
    let mut target = path.to_path_buf().into_os_string();
    target.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
    PathBuf::from(target)
}

/// Storage behind the registry. Implementations are driven by a single
/// writer; [`SessionRegistry`] provides the exclusion.
pub trait RegistryBackend: Send + fmt::Debug {
    fn list(&mut self) -> RegistryResult<Vec<StreamSession>>;

    fn get(&mut self, id: &str) -> RegistryResult<Option<StreamSession>> {
        Ok(self.list()?.into_iter().find(|session| session.id == id))
    }

    fn insert(&mut self, session: &StreamSession) -> RegistryResult<()>;

    fn update(&mut self, session: &StreamSession) -> RegistryResult<()>;

    fn remove(&mut self, id: &str) -> RegistryResult<()>;

    /// Applies several status changes as one write.
    fn set_statuses(&mut self, changes: &[(String, SessionStatus)]) -> RegistryResult<()>;
}

pub struct SessionRegistry {
    backend: Mutex<Box<dyn RegistryBackend>>,
    location: PathBuf,
    file_lock: RegistryLock,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("location", &self.location)
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(backend: Box<dyn RegistryBackend>, location: impl AsRef<Path>) -> Self {
        let location = location.as_ref().to_path_buf();
        Self {
            backend: Mutex::new(backend),
            file_lock: RegistryLock::beside(&location),
            location,
        }
    }

    pub fn json(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self::new(Box::new(JsonDocumentBackend::new(path)), path)
    }

    pub fn sqlite(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref();
        let backend = SqliteRegistryBackend::open(path)?;
        Ok(Self::new(Box::new(backend), path))
    }

    pub fn from_config(config: &RelayConfig) -> RegistryResult<Self> {
        let path = config.registry_path();
        match config.registry.backend {
            RegistryBackendKind::Json => Ok(Self::json(path)),
            RegistryBackendKind::Sqlite => Self::sqlite(path),
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Cross-process exclusion for a sequence of operations. Individual
    /// calls below do not take it.
    pub async fn exclusive(&self) -> RegistryResult<RegistryLockGuard> {
        self.file_lock.acquire().await
    }

    pub fn list(&self) -> RegistryResult<Vec<StreamSession>> {
        self.lock()?.list()
    }

    pub fn get(&self, id: &str) -> RegistryResult<Option<StreamSession>> {
        self.lock()?.get(id)
    }

    pub fn insert(&self, session: &StreamSession) -> RegistryResult<()> {
        self.lock()?.insert(session)
    }

    pub fn update(&self, session: &StreamSession) -> RegistryResult<()> {
        self.lock()?.update(session)
    }

    pub fn remove(&self, id: &str) -> RegistryResult<()> {
        self.lock()?.remove(id)
    }

    pub fn set_statuses(&self, changes: &[(String, SessionStatus)]) -> RegistryResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.lock()?.set_statuses(changes)
    }

    fn lock(&self) -> RegistryResult<MutexGuard<'_, Box<dyn RegistryBackend>>> {
        self.backend.lock().map_err(|_| RegistryError::Poisoned)
    }
}
