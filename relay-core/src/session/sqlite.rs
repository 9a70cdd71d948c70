use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row};
use tracing::warn;

use super::models::{SessionKind, SessionStatus, StreamSession};
use super::registry::{quarantine_target, RegistryBackend, RegistryError, RegistryResult};

const SESSION_SCHEMA: &str = include_str!("../../../sql/sessions.sql");

const SELECT_COLUMNS: &str = "SELECT id, session_name, kind, display_name, credential_masked, \
     source_url, created_at, status FROM stream_sessions";

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = FULL;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

/// Transactional alternative to the JSON document: one row per session,
/// insertion order kept by an autoincrement sequence.
#[derive(Debug)]
pub struct SqliteRegistryBackend {
    path: PathBuf,
}

impl SqliteRegistryBackend {
    pub fn open(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let backend = Self {
            path: path.as_ref().to_path_buf(),
        };
        if let Some(parent) = backend.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        match backend.initialise() {
            Err(err) if is_unreadable(&err) => {
                backend.quarantine(&err)?;
                backend.initialise()?;
            }
            other => other?,
        }
        Ok(backend)
    }

    fn initialise(&self) -> RegistryResult<()> {
        let conn = self.connect()?;
        conn.execute_batch(SESSION_SCHEMA)?;
        Ok(())
    }

    /// Moves an unreadable database aside so a fresh one can be created in
    /// its place.
    fn quarantine(&self, error: &RegistryError) -> RegistryResult<()> {
        let target = quarantine_target(&self.path);
        std::fs::rename(&self.path, &target).map_err(|source| RegistryError::Io {
            source,
            path: self.path.clone(),
        })?;
        warn!(
            path = %self.path.display(),
            moved_to = %target.display(),
            %error,
            "registry database unreadable; starting from an empty registry"
        );
        Ok(())
    }

    fn connect(&self) -> RegistryResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn =
            Connection::open_with_flags(&self.path, flags).map_err(|source| RegistryError::Open {
                source,
                path: self.path.clone(),
            })?;
        configure_connection(&conn).map_err(|source| RegistryError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }
}

fn is_unreadable(err: &RegistryError) -> bool {
    let source = match err {
        RegistryError::Open { source, .. } | RegistryError::Database(source) => source,
        _ => return false,
    };
    matches!(
        source,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

fn parse_column<T>(row: &Row<'_>, column: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(column)?;
    raw.parse().map_err(|err: String| {
        let index = row.as_ref().column_index(column).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, err.into())
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<StreamSession> {
    Ok(StreamSession {
        id: row.get("id")?,
        session_name: row.get("session_name")?,
        kind: parse_column::<SessionKind>(row, "kind")?,
        display_name: row.get("display_name")?,
        credential_masked: row.get("credential_masked")?,
        source_url: row.get("source_url")?,
        created_at: row.get::<_, DateTime<Utc>>("created_at")?,
        status: parse_column::<SessionStatus>(row, "status")?,
    })
}

impl RegistryBackend for SqliteRegistryBackend {
    fn list(&mut self) -> RegistryResult<Vec<StreamSession>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY seq ASC"))?;
        let mut rows = stmt.query([])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(session_from_row(row)?);
        }
        Ok(sessions)
    }

    fn get(&mut self, id: &str) -> RegistryResult<Option<StreamSession>> {
        let conn = self.connect()?;
        let session = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                [id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn insert(&mut self, session: &StreamSession) -> RegistryResult<()> {
        let conn = self.connect()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM stream_sessions WHERE id = ?1 OR session_name = ?2)",
            params![&session.id, &session.session_name],
            |row| row.get(0),
        )?;
        if exists {
            return Err(RegistryError::Duplicate(session.id.clone()));
        }
        conn.execute(
            "INSERT INTO stream_sessions (
                id, session_name, kind, display_name, credential_masked, source_url,
                created_at, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &session.id,
                &session.session_name,
                session.kind.as_str(),
                &session.display_name,
                &session.credential_masked,
                &session.source_url,
                session.created_at,
                session.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn update(&mut self, session: &StreamSession) -> RegistryResult<()> {
        let conn = self.connect()?;
        let affected = conn.execute(
            "UPDATE stream_sessions SET display_name = ?1, source_url = ?2, status = ?3 WHERE id = ?4",
            params![
                &session.display_name,
                &session.source_url,
                session.status.as_str(),
                &session.id,
            ],
        )?;
        if affected == 0 {
            return Err(RegistryError::NotFound(session.id.clone()));
        }
        Ok(())
    }

    fn remove(&mut self, id: &str) -> RegistryResult<()> {
        let conn = self.connect()?;
        let affected = conn.execute("DELETE FROM stream_sessions WHERE id = ?1", [id])?;
        if affected == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn set_statuses(&mut self, changes: &[(String, SessionStatus)]) -> RegistryResult<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for (id, status) in changes {
            tx.execute(
                "UPDATE stream_sessions SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
