use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::debug;

use super::registry::{RegistryError, RegistryResult};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Advisory lock file next to a registry, `<registry>.lock`. Every process
/// opening the same registry contends on it.
#[derive(Debug, Clone)]
pub struct RegistryLock {
    path: PathBuf,
}

/// Held for the duration of one operation; the lock is released when the
/// file is closed.
#[derive(Debug)]
pub struct RegistryLockGuard {
    _file: File,
}

impl RegistryLock {
    pub fn beside(registry: impl AsRef<Path>) -> Self {
        let mut path = registry.as_ref().to_path_buf().into_os_string();
        path.push(".lock");
        Self {
            path: PathBuf::from(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits until no other holder remains. Retries on a timer instead of
    /// blocking a runtime thread.
    pub async fn acquire(&self) -> RegistryResult<RegistryLockGuard> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|source| RegistryError::Io {
                source,
                path: self.path.clone(),
            })?;
        let contended = fs2::lock_contended_error().kind();
        let mut waiting = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(RegistryLockGuard { _file: file }),
                Err(err) if err.kind() == contended => {
                    if !waiting {
                        debug!(path = %self.path.display(), "registry locked elsewhere; waiting");
                        waiting = true;
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(source) => {
                    return Err(RegistryError::Io {
                        source,
                        path: self.path.clone(),
                    })
                }
            }
        }
    }
}
