mod document;
mod lock;
pub mod models;
pub mod registry;
mod sqlite;

pub use document::JsonDocumentBackend;
pub use lock::{RegistryLock, RegistryLockGuard};
pub use models::{
    mask_credential, session_name_for, SessionKind, SessionStatus, StreamSession, MASK_SUFFIX,
};
pub use registry::{RegistryBackend, RegistryError, RegistryResult, SessionRegistry};
pub use sqlite::SqliteRegistryBackend;
