//! Typed repository over a keyed document store.
//!
//! Every entity is kept as a JSON document next to the columns it is queried
//! by. The SQLite implementation serialises access through one connection;
//! conditional updates run inside `BEGIN IMMEDIATE` so they also hold against
//! other processes sharing the database file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::models::{
    ActionIntent, Incident, IncidentId, IncidentStatus, IntentId, IntentState, Monitor, MonitorId,
    MonitorStatus, TelemetryId, TelemetryPoint,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

/// Storage operations the core needs, one method per entity operation.
pub trait Repository: Send + Sync {
    fn insert_monitor(&self, monitor: &Monitor) -> Result<MonitorId, StorageError>;
    fn get_monitor(&self, id: MonitorId) -> Result<Option<Monitor>, StorageError>;
    fn list_monitors(&self) -> Result<Vec<Monitor>, StorageError>;
    fn list_monitors_by_tenant(&self, tenant_id: &str) -> Result<Vec<Monitor>, StorageError>;
    /// Stamp an evaluation, optionally moving the status. Returns the stored monitor.
    fn record_evaluation(
        &self,
        id: MonitorId,
        status: Option<MonitorStatus>,
        evaluated_at: u64,
    ) -> Result<Monitor, StorageError>;
    fn set_monitor_status(&self, id: MonitorId, status: MonitorStatus) -> Result<Monitor, StorageError>;
    fn set_demo_spike(&self, id: MonitorId, until: Option<u64>) -> Result<Monitor, StorageError>;

    fn append_telemetry(&self, point: &TelemetryPoint) -> Result<TelemetryId, StorageError>;
    /// Newest first.
    fn recent_telemetry(&self, monitor_id: MonitorId, limit: usize) -> Result<Vec<TelemetryPoint>, StorageError>;

    fn insert_incident(&self, incident: &Incident) -> Result<IncidentId, StorageError>;
    fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StorageError>;
    /// Newest first, optionally scoped to one monitor.
    fn recent_incidents(&self, monitor_id: Option<MonitorId>, limit: usize) -> Result<Vec<Incident>, StorageError>;
    /// Move the incident to `to` only if its current status is one of `from`.
    fn transition_incident(
        &self,
        id: IncidentId,
        from: &[IncidentStatus],
        to: IncidentStatus,
    ) -> Result<Option<Incident>, StorageError>;
    fn set_incident_tx_hash(&self, id: IncidentId, tx_hash: &str) -> Result<(), StorageError>;

    fn insert_intent(&self, intent: &ActionIntent) -> Result<IntentId, StorageError>;
    fn get_intent(&self, id: IntentId) -> Result<Option<ActionIntent>, StorageError>;
    fn list_intents(
        &self,
        incident_id: Option<IncidentId>,
        state: Option<IntentState>,
    ) -> Result<Vec<ActionIntent>, StorageError>;
    /// Compare-and-set: replace the stored intent with `next` only while its
    /// stored state still equals `expected`. Returns whether the write happened.
    fn compare_and_set_intent(
        &self,
        expected: IntentState,
        next: &ActionIntent,
    ) -> Result<bool, StorageError>;
}

#[derive(Debug)]
pub struct SqliteRepository {
    connection: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let connection = Connection::open(path)?;
        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<Self, StorageError> {
        connection.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = connection.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let repository = Self {
            connection: Mutex::new(connection),
        };
        repository.ensure_schema()?;
        Ok(repository)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_schema(&self) -> Result<(), StorageError> {
        self.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS monitors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS monitors_by_tenant ON monitors (tenant_id);

            CREATE TABLE IF NOT EXISTS telemetry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                monitor_id INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS telemetry_by_monitor ON telemetry (monitor_id, recorded_at);

            CREATE TABLE IF NOT EXISTS incidents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                monitor_id INTEGER NOT NULL,
                opened_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS incidents_by_monitor ON incidents (monitor_id, opened_at);

            CREATE TABLE IF NOT EXISTS action_intents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS intents_by_incident ON action_intents (incident_id, state);
            ",
        )?;

        Ok(())
    }

    fn patch_monitor(
        &self,
        id: MonitorId,
        patch: impl FnOnce(&mut Monitor),
    ) -> Result<Monitor, StorageError> {
        let mut connection = self.lock();
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let doc: Option<String> = transaction
            .query_row("SELECT doc FROM monitors WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        let mut monitor: Monitor = match doc {
            Some(doc) => decode(id, &doc)?,
            None => {
                return Err(StorageError::NotFound {
                    entity: "monitor",
                    id,
                });
            }
        };

        patch(&mut monitor);
        transaction.execute(
            "UPDATE monitors SET tenant_id = ?1, doc = ?2 WHERE id = ?3",
            params![monitor.tenant_id, serde_json::to_string(&monitor)?, id],
        )?;
        transaction.commit()?;
        Ok(monitor)
    }

    fn query_docs<T, P>(&self, sql: &str, params: P) -> Result<Vec<T>, StorageError>
    where
        T: DeserializeOwned + Identified,
        P: rusqlite::Params,
    {
        let connection = self.lock();
        let mut statement = connection.prepare(sql)?;
        let rows = statement.query_map(params, |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, doc) = row?;
            documents.push(decode(id, &doc)?);
        }
        Ok(documents)
    }

    fn get_doc<T>(&self, sql: &str, id: i64) -> Result<Option<T>, StorageError>
    where
        T: DeserializeOwned + Identified,
    {
        let doc: Option<String> = self
            .lock()
            .query_row(sql, [id], |row| row.get(0))
            .optional()?;
        doc.map(|doc| decode(id, &doc)).transpose()
    }
}

/// Documents carry their row id; it is restored on read.
trait Identified {
    fn set_id(&mut self, id: i64);
}

impl Identified for Monitor {
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl Identified for TelemetryPoint {
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl Identified for Incident {
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl Identified for ActionIntent {
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

fn decode<T: DeserializeOwned + Identified>(id: i64, doc: &str) -> Result<T, StorageError> {
    let mut value: T = serde_json::from_str(doc)?;
    value.set_id(id);
    Ok(value)
}

fn encode<T: Serialize>(value: &T) -> Result<String, StorageError> {
    Ok(serde_json::to_string(value)?)
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl Repository for SqliteRepository {
    fn insert_monitor(&self, monitor: &Monitor) -> Result<MonitorId, StorageError> {
        let connection = self.lock();
        connection.execute(
            "INSERT INTO monitors (tenant_id, doc) VALUES (?1, ?2)",
            params![monitor.tenant_id, encode(monitor)?],
        )?;
        Ok(connection.last_insert_rowid())
    }

    fn get_monitor(&self, id: MonitorId) -> Result<Option<Monitor>, StorageError> {
        self.get_doc("SELECT doc FROM monitors WHERE id = ?1", id)
    }

    fn list_monitors(&self) -> Result<Vec<Monitor>, StorageError> {
        self.query_docs("SELECT id, doc FROM monitors ORDER BY id ASC", [])
    }

    fn list_monitors_by_tenant(&self, tenant_id: &str) -> Result<Vec<Monitor>, StorageError> {
        self.query_docs(
            "SELECT id, doc FROM monitors WHERE tenant_id = ?1 ORDER BY id ASC",
            [tenant_id],
        )
    }

    fn record_evaluation(
        &self,
        id: MonitorId,
        status: Option<MonitorStatus>,
        evaluated_at: u64,
    ) -> Result<Monitor, StorageError> {
        self.patch_monitor(id, |monitor| {
            if let Some(status) = status {
                monitor.status = status;
            }
            monitor.last_evaluated_at = Some(evaluated_at);
        })
    }

    fn set_monitor_status(&self, id: MonitorId, status: MonitorStatus) -> Result<Monitor, StorageError> {
        self.patch_monitor(id, |monitor| monitor.status = status)
    }

    fn set_demo_spike(&self, id: MonitorId, until: Option<u64>) -> Result<Monitor, StorageError> {
        self.patch_monitor(id, |monitor| monitor.demo_spike_until = until)
    }

    fn append_telemetry(&self, point: &TelemetryPoint) -> Result<TelemetryId, StorageError> {
        let connection = self.lock();
        connection.execute(
            "INSERT INTO telemetry (monitor_id, recorded_at, doc) VALUES (?1, ?2, ?3)",
            params![point.monitor_id, point.recorded_at, encode(point)?],
        )?;
        Ok(connection.last_insert_rowid())
    }

    fn recent_telemetry(&self, monitor_id: MonitorId, limit: usize) -> Result<Vec<TelemetryPoint>, StorageError> {
        self.query_docs(
            "
            SELECT id, doc FROM telemetry
            WHERE monitor_id = ?1
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?2
            ",
            params![monitor_id, limit_param(limit)],
        )
    }

    fn insert_incident(&self, incident: &Incident) -> Result<IncidentId, StorageError> {
        let connection = self.lock();
        connection.execute(
            "INSERT INTO incidents (monitor_id, opened_at, status, doc) VALUES (?1, ?2, ?3, ?4)",
            params![
                incident.monitor_id,
                incident.opened_at,
                incident.status.as_str(),
                encode(incident)?
            ],
        )?;
        Ok(connection.last_insert_rowid())
    }

    fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StorageError> {
        self.get_doc("SELECT doc FROM incidents WHERE id = ?1", id)
    }

    fn recent_incidents(&self, monitor_id: Option<MonitorId>, limit: usize) -> Result<Vec<Incident>, StorageError> {
        match monitor_id {
            Some(monitor_id) => self.query_docs(
                "
                SELECT id, doc FROM incidents
                WHERE monitor_id = ?1
                ORDER BY opened_at DESC, id DESC
                LIMIT ?2
                ",
                params![monitor_id, limit_param(limit)],
            ),
            None => self.query_docs(
                "SELECT id, doc FROM incidents ORDER BY opened_at DESC, id DESC LIMIT ?1",
                params![limit_param(limit)],
            ),
        }
    }

    fn transition_incident(
        &self,
        id: IncidentId,
        from: &[IncidentStatus],
        to: IncidentStatus,
    ) -> Result<Option<Incident>, StorageError> {
        let mut connection = self.lock();
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let doc: Option<String> = transaction
            .query_row("SELECT doc FROM incidents WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        let mut incident: Incident = match doc {
            Some(doc) => decode(id, &doc)?,
            None => {
                return Err(StorageError::NotFound {
                    entity: "incident",
                    id,
                });
            }
        };

        if !from.contains(&incident.status) {
            return Ok(None);
        }

        incident.status = to;
        transaction.execute(
            "UPDATE incidents SET status = ?1, doc = ?2 WHERE id = ?3",
            params![to.as_str(), encode(&incident)?, id],
        )?;
        transaction.commit()?;
        Ok(Some(incident))
    }

    fn set_incident_tx_hash(&self, id: IncidentId, tx_hash: &str) -> Result<(), StorageError> {
        let mut connection = self.lock();
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let doc: Option<String> = transaction
            .query_row("SELECT doc FROM incidents WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        let Some(doc) = doc else {
            return Err(StorageError::NotFound {
                entity: "incident",
                id,
            });
        };

        let mut incident: Incident = decode(id, &doc)?;
        incident.tx_hash = Some(tx_hash.to_owned());
        transaction.execute(
            "UPDATE incidents SET doc = ?1 WHERE id = ?2",
            params![encode(&incident)?, id],
        )?;
        transaction.commit()?;
        Ok(())
    }

    fn insert_intent(&self, intent: &ActionIntent) -> Result<IntentId, StorageError> {
        let connection = self.lock();
        connection.execute(
            "INSERT INTO action_intents (incident_id, state, doc) VALUES (?1, ?2, ?3)",
            params![intent.incident_id, intent.state.as_str(), encode(intent)?],
        )?;
        Ok(connection.last_insert_rowid())
    }

    fn get_intent(&self, id: IntentId) -> Result<Option<ActionIntent>, StorageError> {
        self.get_doc("SELECT doc FROM action_intents WHERE id = ?1", id)
    }

    fn list_intents(
        &self,
        incident_id: Option<IncidentId>,
        state: Option<IntentState>,
    ) -> Result<Vec<ActionIntent>, StorageError> {
        let state = state.map(|state| state.as_str());
        self.query_docs(
            "
            SELECT id, doc FROM action_intents
            WHERE (?1 IS NULL OR incident_id = ?1)
              AND (?2 IS NULL OR state = ?2)
            ORDER BY id ASC
            ",
            params![incident_id, state],
        )
    }

    fn compare_and_set_intent(
        &self,
        expected: IntentState,
        next: &ActionIntent,
    ) -> Result<bool, StorageError> {
        let mut connection = self.lock();
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = transaction.execute(
            "UPDATE action_intents SET state = ?1, doc = ?2 WHERE id = ?3 AND state = ?4",
            params![next.state.as_str(), encode(next)?, next.id, expected.as_str()],
        )?;
        transaction.commit()?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ActionPlan, ActionTaken, NewMonitor, Severity, TelemetryPayload, TelemetrySource,
    };
    use ethereum_types::Address;
    use tempfile::NamedTempFile;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn new_monitor(tenant: &str) -> Monitor {
        NewMonitor {
            tenant_id: tenant.to_owned(),
            name: "eth-usd".to_owned(),
            guarded_contract: Address::repeat_byte(0x01),
            guardian_hub: Some(Address::repeat_byte(0x0a)),
            router: Some(Address::repeat_byte(0x0b)),
            oracle_key: "ETH/USD".to_owned(),
            protofire_feed: Address::repeat_byte(0x02),
            dia_feed: Address::repeat_byte(0x03),
            max_deviation_bps: 150,
            stale_after_seconds: 300,
        }
        .into_monitor(1_000)
    }

    fn incident(monitor_id: MonitorId, opened_at: u64) -> Incident {
        Incident {
            id: 0,
            monitor_id,
            opened_at,
            safe: false,
            both_fresh: true,
            price: 1_900_00000000,
            deviation_bps: 540,
            action_taken: ActionTaken::PauseRecommended,
            summary: "feeds diverged".to_owned(),
            severity: Severity::High,
            root_cause: String::new(),
            mitigations: vec![],
            tags: vec![],
            tx_hash: None,
            status: IncidentStatus::Open,
        }
    }

    #[test]
    fn monitors_round_trip_through_a_database_file() -> TestResult {
        let file = NamedTempFile::new()?;
        let repository = SqliteRepository::open(file.path())?;

        let first = repository.insert_monitor(&new_monitor("acme"))?;
        let second = repository.insert_monitor(&new_monitor("globex"))?;

        let stored = repository.get_monitor(first)?.ok_or("monitor missing")?;
        assert_eq!(stored.id, first);
        assert_eq!(stored.router, Some(Address::repeat_byte(0x0b)));

        let acme = repository.list_monitors_by_tenant("acme")?;
        assert_eq!(acme.len(), 1);
        assert_eq!(repository.list_monitors()?.len(), 2);

        let updated = repository.record_evaluation(second, Some(MonitorStatus::Attention), 2_000)?;
        assert_eq!(updated.status, MonitorStatus::Attention);
        assert_eq!(updated.last_evaluated_at, Some(2_000));

        let stamped = repository.record_evaluation(second, None, 2_100)?;
        assert_eq!(stamped.status, MonitorStatus::Attention);
        assert_eq!(stamped.last_evaluated_at, Some(2_100));
        Ok(())
    }

    #[test]
    fn patching_a_missing_monitor_is_not_found() -> TestResult {
        let repository = SqliteRepository::open_in_memory()?;
        let result = repository.set_monitor_status(42, MonitorStatus::Paused);
        assert!(matches!(result, Err(StorageError::NotFound { entity: "monitor", id: 42 })));
        Ok(())
    }

    #[test]
    fn telemetry_reads_newest_first() -> TestResult {
        let repository = SqliteRepository::open_in_memory()?;
        for (recorded_at, code) in [(10, "a"), (30, "c"), (20, "b")] {
            repository.append_telemetry(&TelemetryPoint {
                id: 0,
                monitor_id: 7,
                recorded_at,
                source: TelemetrySource::Error,
                payload: TelemetryPayload::Error {
                    code: code.to_owned(),
                    message: String::new(),
                },
            })?;
        }

        let points = repository.recent_telemetry(7, 2)?;
        let codes: Vec<_> = points.iter().filter_map(TelemetryPoint::error_code).collect();
        assert_eq!(codes, vec!["c", "b"]);
        assert!(repository.recent_telemetry(8, 10)?.is_empty());
        Ok(())
    }

    #[test]
    fn incident_transitions_respect_the_allowed_sources() -> TestResult {
        let repository = SqliteRepository::open_in_memory()?;
        let id = repository.insert_incident(&incident(1, 100))?;

        let acked = repository.transition_incident(id, &[IncidentStatus::Open], IncidentStatus::Acknowledged)?;
        assert_eq!(acked.map(|incident| incident.status), Some(IncidentStatus::Acknowledged));

        let again = repository.transition_incident(id, &[IncidentStatus::Open], IncidentStatus::Acknowledged)?;
        assert!(again.is_none());

        repository.set_incident_tx_hash(id, "0xabc")?;
        let stored = repository.get_incident(id)?.ok_or("incident missing")?;
        assert_eq!(stored.tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(stored.status, IncidentStatus::Acknowledged);
        Ok(())
    }

    #[test]
    fn intent_compare_and_set_only_applies_once() -> TestResult {
        let repository = SqliteRepository::open_in_memory()?;
        let incident_id = repository.insert_incident(&incident(1, 100))?;
        let stored_incident = repository.get_incident(incident_id)?.ok_or("incident missing")?;

        let plan = ActionPlan {
            name: "pause_guarded_contract".to_owned(),
            target: "0x0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a".to_owned(),
            calldata: "0x8456cb59".to_owned(),
            arguments: serde_json::Value::Null,
        };
        let mut intent = ActionIntent::proposed(&stored_incident, "advisor", plan, "pause it", 101);
        intent.id = repository.insert_intent(&intent)?;

        let mut approved = intent.clone();
        approved.state = IntentState::Approved;
        assert!(repository.compare_and_set_intent(IntentState::Proposed, &approved)?);
        assert!(!repository.compare_and_set_intent(IntentState::Proposed, &approved)?);

        let by_state = repository.list_intents(Some(incident_id), Some(IntentState::Approved))?;
        assert_eq!(by_state.len(), 1);
        assert!(repository.list_intents(None, Some(IntentState::Proposed))?.is_empty());
        assert_eq!(repository.list_intents(None, None)?.len(), 1);
        Ok(())
    }
}
