use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorKind;
use crate::session::{RegistryError, SessionRegistry, SessionStatus, StreamSession};
use crate::supervisor::{ProcessSupervisor, SupervisorError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Registry(_) => ErrorKind::Internal,
            ReconcileError::Supervisor(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub id: String,
    pub session_name: String,
    pub from: SessionStatus,
    pub to: SessionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub changes: Vec<StatusChange>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Refreshes every cached status from the supervisor. The registry is only
/// written when at least one status moved.
pub async fn reconcile(
    registry: &SessionRegistry,
    supervisor: &dyn ProcessSupervisor,
) -> Result<(Vec<StreamSession>, ReconcileReport), ReconcileError> {
    let mut sessions = registry.list()?;
    let mut report = ReconcileReport {
        checked: sessions.len(),
        changes: Vec::new(),
    };
    for session in sessions.iter_mut() {
        let observed = SessionStatus::from_presence(supervisor.exists(&session.session_name).await?);
        if observed != session.status {
            report.changes.push(StatusChange {
                id: session.id.clone(),
                session_name: session.session_name.clone(),
                from: session.status,
                to: observed,
            });
            session.status = observed;
        }
    }

    if report.is_noop() {
        debug!(checked = report.checked, "reconciliation found no drift");
    } else {
        let updates: Vec<(String, SessionStatus)> = report
            .changes
            .iter()
            .map(|change| (change.id.clone(), change.to))
            .collect();
        registry.set_statuses(&updates)?;
        for change in &report.changes {
            info!(
                session_id = %change.id,
                session = %change.session_name,
                from = %change.from,
                to = %change.to,
                "session status reconciled"
            );
        }
    }
    Ok((sessions, report))
}
