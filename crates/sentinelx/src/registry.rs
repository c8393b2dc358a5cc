use std::sync::Arc;

use ethereum_types::Address;
use thiserror::Error;
use tracing::info;

use crate::consensus::BPS_DENOMINATOR;
use crate::clock::Clock;
use crate::models::{Monitor, MonitorId, MonitorStatus, NewMonitor};
use crate::storage::{Repository, StorageError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid monitor: {0}")]
    Invalid(String),
    #[error("monitor {0} not found")]
    NotFound(MonitorId),
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for RegistryError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound { id, .. } => RegistryError::NotFound(id),
            other => RegistryError::Storage(other),
        }
    }
}

impl RegistryError {
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Invalid(_) => "invalid_monitor",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::Storage(_) => "storage",
        }
    }
}

/// Operator-side monitor management.
pub struct MonitorRegistry {
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
}

impl MonitorRegistry {
    pub fn new(repository: Arc<dyn Repository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    pub fn register(&self, new: NewMonitor) -> Result<Monitor, RegistryError> {
        validate(&new)?;
        let mut monitor = new.into_monitor(self.clock.now());
        monitor.id = self.repository.insert_monitor(&monitor)?;
        info!(
            monitor_id = monitor.id,
            tenant_id = %monitor.tenant_id,
            oracle_key = %monitor.oracle_key,
            "monitor registered"
        );
        Ok(monitor)
    }

    pub fn get(&self, id: MonitorId) -> Result<Monitor, RegistryError> {
        self.repository.get_monitor(id)?.ok_or(RegistryError::NotFound(id))
    }

    pub fn list(&self, tenant_id: Option<&str>) -> Result<Vec<Monitor>, RegistryError> {
        Ok(match tenant_id {
            Some(tenant_id) => self.repository.list_monitors_by_tenant(tenant_id)?,
            None => self.repository.list_monitors()?,
        })
    }

    /// Explicit operator status change, including lifting a pause.
    pub fn set_status(&self, id: MonitorId, status: MonitorStatus, actor: &str) -> Result<Monitor, RegistryError> {
        let monitor = self.repository.set_monitor_status(id, status)?;
        info!(monitor_id = id, actor, status = %status, "monitor status set");
        Ok(monitor)
    }

    /// Serve synthetic spikes for `duration_secs` to monitors under demo data.
    pub fn schedule_demo_spike(&self, id: MonitorId, duration_secs: u64) -> Result<Monitor, RegistryError> {
        if duration_secs == 0 {
            return Err(RegistryError::Invalid("spike duration must be positive".to_owned()));
        }
        let until = self.clock.now().saturating_add(duration_secs);
        let monitor = self.repository.set_demo_spike(id, Some(until))?;
        info!(monitor_id = id, until, "demo spike scheduled");
        Ok(monitor)
    }

    pub fn clear_demo_spike(&self, id: MonitorId) -> Result<Monitor, RegistryError> {
        Ok(self.repository.set_demo_spike(id, None)?)
    }
}

fn validate(new: &NewMonitor) -> Result<(), RegistryError> {
    let invalid = |reason: &str| Err(RegistryError::Invalid(reason.to_owned()));

    if new.tenant_id.trim().is_empty() {
        return invalid("tenant_id must not be empty");
    }
    if new.name.trim().is_empty() {
        return invalid("name must not be empty");
    }
    if new.oracle_key.trim().is_empty() {
        return invalid("oracle_key must not be empty");
    }
    if new.max_deviation_bps == 0 || u64::from(new.max_deviation_bps) > BPS_DENOMINATOR {
        return invalid("max_deviation_bps must be within 1..=10000");
    }
    if new.stale_after_seconds == 0 {
        return invalid("stale_after_seconds must be positive");
    }
    if new.guarded_contract == Address::zero() {
        return invalid("guarded_contract must not be the zero address");
    }
    if new.protofire_feed == new.dia_feed {
        return invalid("protofire_feed and dia_feed must differ");
    }
    Ok(())
}
