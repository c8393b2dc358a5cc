use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::models::{Incident, IncidentId, IncidentStatus, MonitorId};
use crate::storage::{Repository, StorageError};

#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("incident {0} not found")]
    NotFound(IncidentId),
    #[error("incident {id} is {from}, cannot move to {to}")]
    InvalidTransition {
        id: IncidentId,
        from: IncidentStatus,
        to: IncidentStatus,
    },
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for IncidentError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound { id, .. } => IncidentError::NotFound(id),
            other => IncidentError::Storage(other),
        }
    }
}

impl IncidentError {
    pub fn kind(&self) -> &'static str {
        match self {
            IncidentError::NotFound(_) => "not_found",
            IncidentError::InvalidTransition { .. } => "invalid_transition",
            IncidentError::Storage(_) => "storage",
        }
    }
}

/// Operator acknowledgement and closure of incidents.
pub struct IncidentDesk {
    repository: Arc<dyn Repository>,
}

impl IncidentDesk {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    pub fn get(&self, id: IncidentId) -> Result<Incident, IncidentError> {
        self.repository.get_incident(id)?.ok_or(IncidentError::NotFound(id))
    }

    /// Newest first.
    pub fn list(&self, monitor_id: Option<MonitorId>, limit: usize) -> Result<Vec<Incident>, IncidentError> {
        Ok(self.repository.recent_incidents(monitor_id, limit)?)
    }

    pub fn acknowledge(&self, id: IncidentId, actor: &str) -> Result<Incident, IncidentError> {
        self.move_to(id, &[IncidentStatus::Open], IncidentStatus::Acknowledged, actor)
    }

    pub fn close(&self, id: IncidentId, actor: &str) -> Result<Incident, IncidentError> {
        self.move_to(
            id,
            &[IncidentStatus::Open, IncidentStatus::Acknowledged],
            IncidentStatus::Closed,
            actor,
        )
    }

    fn move_to(
        &self,
        id: IncidentId,
        from: &[IncidentStatus],
        to: IncidentStatus,
        actor: &str,
    ) -> Result<Incident, IncidentError> {
        match self.repository.transition_incident(id, from, to)? {
            Some(incident) => {
                info!(incident_id = id, actor, status = %to, "incident updated");
                Ok(incident)
            }
            None => Err(IncidentError::InvalidTransition {
                id,
                from: self.get(id)?.status,
                to,
            }),
        }
    }
}
