use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::models::{SessionStatus, StreamSession};
use super::registry::{quarantine_target, RegistryBackend, RegistryError, RegistryResult};

/// Keeps every session in one JSON array, rewritten whole on each mutation.
#[derive(Debug, Clone)]
pub struct JsonDocumentBackend {
    path: PathBuf,
}

impl JsonDocumentBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> RegistryResult<Vec<StreamSession>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RegistryError::Io {
                    source,
                    path: self.path.clone(),
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Vec<StreamSession>>(&content) {
            Ok(sessions) => Ok(sessions),
            Err(error) => {
                self.quarantine(&error);
                Ok(Vec::new())
            }
        }
    }

    /// Moves an unreadable document aside so the next write starts clean
    /// without destroying what was there.
    fn quarantine(&self, error: &serde_json::Error) {
        let target = quarantine_target(&self.path);
        match fs::rename(&self.path, &target) {
            Ok(()) => warn!(
                path = %self.path.display(),
                moved_to = %target.display(),
                %error,
                "registry document unreadable; starting from an empty registry"
            ),
            Err(rename_error) => warn!(
                path = %self.path.display(),
                %error,
                %rename_error,
                "registry document unreadable and could not be moved aside"
            ),
        }
    }

    fn store(&self, sessions: &[StreamSession]) -> RegistryResult<()> {
        let parent = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
            source,
            path: parent.to_path_buf(),
        })?;
        let mut file = NamedTempFile::new_in(parent).map_err(|source| RegistryError::Io {
            source,
            path: parent.to_path_buf(),
        })?;
        serde_json::to_writer_pretty(&mut file, sessions)?;
        file.write_all(b"\n").map_err(|source| RegistryError::Io {
            source,
            path: file.path().to_path_buf(),
        })?;
        file.persist(&self.path).map_err(|err| RegistryError::Io {
            source: err.error,
            path: self.path.clone(),
        })?;
        debug!(path = %self.path.display(), sessions = sessions.len(), "registry document written");
        Ok(())
    }
}

impl RegistryBackend for JsonDocumentBackend {
    fn list(&mut self) -> RegistryResult<Vec<StreamSession>> {
        self.load()
    }

    fn insert(&mut self, session: &StreamSession) -> RegistryResult<()> {
        let mut sessions = self.load()?;
        if sessions.iter().any(|existing| existing.id == session.id) {
            return Err(RegistryError::Duplicate(session.id.clone()));
        }
        sessions.push(session.clone());
        self.store(&sessions)
    }

    fn update(&mut self, session: &StreamSession) -> RegistryResult<()> {
        let mut sessions = self.load()?;
        let slot = sessions
            .iter_mut()
            .find(|existing| existing.id == session.id)
            .ok_or_else(|| RegistryError::NotFound(session.id.clone()))?;
        *slot = session.clone();
        self.store(&sessions)
    }

    fn remove(&mut self, id: &str) -> RegistryResult<()> {
        let mut sessions = self.load()?;
        let before = sessions.len();
        sessions.retain(|session| session.id != id);
        if sessions.len() == before {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        self.store(&sessions)
    }

    fn set_statuses(&mut self, changes: &[(String, SessionStatus)]) -> RegistryResult<()> {
        let mut sessions = self.load()?;
        for (id, status) in changes {
            if let Some(session) = sessions.iter_mut().find(|session| &session.id == id) {
                session.status = *status;
            }
        }
        self.store(&sessions)
    }
}
