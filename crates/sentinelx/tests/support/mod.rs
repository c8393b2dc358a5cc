#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ethereum_types::{Address, H256};
use sentinelx::advisor::{Advisor, AdvisorError, Advisory, PlanRequest, ProposedAction, RuleAdvisor, SummaryRequest};
use sentinelx::api::AppState;
use sentinelx::clock::ManualClock;
use sentinelx::consensus::FeedObservation;
use sentinelx::evaluator::{EvaluatorSettings, MonitorEvaluator};
use sentinelx::execution::{ChainWriter, ExecutionError, ExecutionGateway};
use sentinelx::incidents::IncidentDesk;
use sentinelx::intents::ActionIntentService;
use sentinelx::models::{
    ActionIntent, Incident, IncidentId, IncidentStatus, IntentId, IntentState, Monitor, MonitorId,
    MonitorStatus, NewMonitor, TelemetryId, TelemetryPoint,
};
use sentinelx::oracle::{DemoPolicy, OracleError, OracleGateway, OracleReading, OracleSource};
use sentinelx::registry::MonitorRegistry;
use sentinelx::rpc::ReceiptStatus;
use sentinelx::storage::{Repository, SqliteRepository, StorageError};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const E8: i128 = 100_000_000;
pub const START: u64 = 1_700_000_000;

pub fn new_monitor(router: Option<Address>) -> NewMonitor {
    NewMonitor {
        tenant_id: "acme".to_owned(),
        name: "eth-usd".to_owned(),
        guarded_contract: Address::repeat_byte(0x01),
        guardian_hub: None,
        router,
        oracle_key: "ETH/USD".to_owned(),
        protofire_feed: Address::repeat_byte(0x02),
        dia_feed: Address::repeat_byte(0x03),
        max_deviation_bps: 150,
        stale_after_seconds: 300,
    }
}

/// Oracle source returning whatever reading was last set.
#[derive(Default)]
pub struct StaticOracle {
    reading: Mutex<Option<OracleReading>>,
    stall: Mutex<Option<Duration>>,
    pub calls: AtomicUsize,
}

impl StaticOracle {
    pub fn set(&self, protofire: (i128, u64), dia: (i128, u64)) {
        let reading = OracleReading {
            protofire: FeedObservation::new(protofire.0, protofire.1),
            dia: FeedObservation::new(dia.0, dia.1),
            router_verdict: None,
        };
        if let Ok(mut slot) = self.reading.lock() {
            *slot = Some(reading);
        }
    }

    /// Make every read take `delay` before answering.
    pub fn stall(&self, delay: Duration) {
        if let Ok(mut slot) = self.stall.lock() {
            *slot = Some(delay);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OracleSource for StaticOracle {
    async fn latest(&self, _router: Address, _oracle_key: &str) -> Result<OracleReading, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stall = self.stall.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        self.reading
            .lock()
            .ok()
            .and_then(|slot| *slot)
            .ok_or(OracleError::ChainUnavailable)
    }
}

/// Advisor whose service is always down.
pub struct FailingAdvisor;

#[async_trait]
impl Advisor for FailingAdvisor {
    async fn summarize(&self, _request: &SummaryRequest<'_>) -> Result<Advisory, AdvisorError> {
        Err(AdvisorError::InvalidResponse("service unavailable".to_owned()))
    }

    async fn plan(&self, _request: &PlanRequest<'_>) -> Result<Vec<ProposedAction>, AdvisorError> {
        Err(AdvisorError::InvalidResponse("service unavailable".to_owned()))
    }
}

/// Advisor that never answers within any sane timeout.
pub struct StalledAdvisor;

#[async_trait]
impl Advisor for StalledAdvisor {
    async fn summarize(&self, request: &SummaryRequest<'_>) -> Result<Advisory, AdvisorError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        RuleAdvisor.summarize(request).await
    }

    async fn plan(&self, request: &PlanRequest<'_>) -> Result<Vec<ProposedAction>, AdvisorError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        RuleAdvisor.plan(request).await
    }
}

/// Advisor whose summary endpoint is down while planning still works.
pub struct SummaryOutageAdvisor;

#[async_trait]
impl Advisor for SummaryOutageAdvisor {
    async fn summarize(&self, _request: &SummaryRequest<'_>) -> Result<Advisory, AdvisorError> {
        Err(AdvisorError::InvalidResponse("summary unavailable".to_owned()))
    }

    async fn plan(&self, request: &PlanRequest<'_>) -> Result<Vec<ProposedAction>, AdvisorError> {
        RuleAdvisor.plan(request).await
    }
}

/// Chain writer with a scripted broadcast result and receipt.
pub struct ScriptedWriter {
    pub sends: AtomicUsize,
    send_delay: Duration,
    refuse_next: Mutex<Option<String>>,
    receipt: Mutex<Option<ReceiptStatus>>,
}

impl ScriptedWriter {
    pub fn mined(success: bool) -> Self {
        Self::with_receipt(Some(ReceiptStatus {
            success,
            block_number: Some(42),
        }))
    }

    pub fn never_mined() -> Self {
        Self::with_receipt(None)
    }

    fn with_receipt(receipt: Option<ReceiptStatus>) -> Self {
        Self {
            sends: AtomicUsize::new(0),
            send_delay: Duration::from_millis(20),
            refuse_next: Mutex::new(None),
            receipt: Mutex::new(receipt),
        }
    }

    pub fn refuse_next(&self, reason: &str) {
        if let Ok(mut slot) = self.refuse_next.lock() {
            *slot = Some(reason.to_owned());
        }
    }

    pub fn mine(&self, success: bool) {
        if let Ok(mut slot) = self.receipt.lock() {
            *slot = Some(ReceiptStatus {
                success,
                block_number: Some(43),
            });
        }
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

pub fn tx_hash() -> H256 {
    H256::repeat_byte(0xab)
}

#[async_trait]
impl ChainWriter for ScriptedWriter {
    async fn send_transaction(&self, _to: Address, _calldata: &[u8]) -> Result<H256, ExecutionError> {
        tokio::time::sleep(self.send_delay).await;
        let refusal = self.refuse_next.lock().ok().and_then(|mut slot| slot.take());
        if let Some(reason) = refusal {
            return Err(ExecutionError::Rejected(reason));
        }
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(tx_hash())
    }

    async fn receipt_status(&self, _tx_hash: H256) -> Result<Option<ReceiptStatus>, ExecutionError> {
        Ok(self.receipt.lock().ok().and_then(|slot| *slot))
    }
}

pub struct Harness {
    pub repository: Arc<SqliteRepository>,
    pub clock: Arc<ManualClock>,
    pub oracle: Arc<StaticOracle>,
    pub writer: Arc<ScriptedWriter>,
    pub execution: Arc<ExecutionGateway>,
    pub registry: Arc<MonitorRegistry>,
    pub evaluator: Arc<MonitorEvaluator>,
    pub intents: Arc<ActionIntentService>,
    pub incidents: Arc<IncidentDesk>,
}

pub struct HarnessOptions {
    pub demo: DemoPolicy,
    pub advisor: Arc<dyn Advisor>,
    pub writer: Option<ScriptedWriter>,
    pub default_router: Option<Address>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            demo: DemoPolicy::default(),
            advisor: Arc::new(RuleAdvisor),
            writer: Some(ScriptedWriter::mined(true)),
            default_router: None,
        }
    }
}

impl Harness {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let repository = Arc::new(SqliteRepository::open_in_memory()?);
        let clock = Arc::new(ManualClock::new(START));
        let oracle = Arc::new(StaticOracle::default());
        let has_writer = options.writer.is_some();
        let writer = Arc::new(options.writer.unwrap_or_else(ScriptedWriter::never_mined));

        let gateway = Arc::new(OracleGateway::new(
            Some(oracle.clone() as Arc<dyn OracleSource>),
            options.demo,
            options.default_router,
            Duration::from_secs(2),
        ));
        let execution = Arc::new(ExecutionGateway::new(
            has_writer.then(|| writer.clone() as Arc<dyn ChainWriter>),
            Duration::from_secs(5),
            Duration::from_millis(250),
        ));

        let evaluator = Arc::new(MonitorEvaluator::new(
            repository.clone(),
            gateway,
            options.advisor,
            clock.clone(),
            EvaluatorSettings {
                max_concurrency: 2,
                advisor_timeout: Duration::from_secs(1),
                telemetry_window: 10,
                incident_window: 5,
            },
        ));

        Ok(Self {
            registry: Arc::new(MonitorRegistry::new(repository.clone(), clock.clone())),
            intents: Arc::new(ActionIntentService::new(repository.clone(), execution.clone(), clock.clone())),
            incidents: Arc::new(IncidentDesk::new(repository.clone())),
            evaluator,
            repository,
            clock,
            oracle,
            writer,
            execution,
        })
    }

    /// Intent service over `repository` sharing this harness's clock and writer.
    pub fn intents_over(&self, repository: Arc<dyn Repository>) -> ActionIntentService {
        ActionIntentService::new(repository, self.execution.clone(), self.clock.clone())
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            evaluator: self.evaluator.clone(),
            intents: self.intents.clone(),
            incidents: self.incidents.clone(),
            registry: self.registry.clone(),
        }
    }
}

fn database_busy() -> StorageError {
    StorageError::Sqlite(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".to_owned()),
    ))
}

/// Repository delegating to SQLite with failures injected on demand.
pub struct FlakyRepository {
    inner: Arc<SqliteRepository>,
    intent_writes: AtomicUsize,
    failing_intent_writes: Mutex<HashSet<usize>>,
    fail_bookkeeping: AtomicBool,
}

impl FlakyRepository {
    pub fn new(inner: Arc<SqliteRepository>) -> Self {
        Self {
            inner,
            intent_writes: AtomicUsize::new(0),
            failing_intent_writes: Mutex::new(HashSet::new()),
            fail_bookkeeping: AtomicBool::new(false),
        }
    }

    /// Fail the `nth` (1-based) intent compare-and-set from now on.
    pub fn fail_intent_write(&self, nth: usize) {
        if let Ok(mut failing) = self.failing_intent_writes.lock() {
            failing.insert(nth);
        }
    }

    /// Fail incident tx hash and monitor status writes.
    pub fn fail_bookkeeping(&self) {
        self.fail_bookkeeping.store(true, Ordering::SeqCst);
    }

    fn bookkeeping_fails(&self) -> bool {
        self.fail_bookkeeping.load(Ordering::SeqCst)
    }
}

impl Repository for FlakyRepository {
    fn insert_monitor(&self, monitor: &Monitor) -> Result<MonitorId, StorageError> {
        self.inner.insert_monitor(monitor)
    }

    fn get_monitor(&self, id: MonitorId) -> Result<Option<Monitor>, StorageError> {
        self.inner.get_monitor(id)
    }

    fn list_monitors(&self) -> Result<Vec<Monitor>, StorageError> {
        self.inner.list_monitors()
    }

    fn list_monitors_by_tenant(&self, tenant_id: &str) -> Result<Vec<Monitor>, StorageError> {
        self.inner.list_monitors_by_tenant(tenant_id)
    }

    fn record_evaluation(
        &self,
        id: MonitorId,
        status: Option<MonitorStatus>,
        evaluated_at: u64,
    ) -> Result<Monitor, StorageError> {
        self.inner.record_evaluation(id, status, evaluated_at)
    }

    fn set_monitor_status(&self, id: MonitorId, status: MonitorStatus) -> Result<Monitor, StorageError> {
        if self.bookkeeping_fails() {
            return Err(database_busy());
        }
        self.inner.set_monitor_status(id, status)
    }

    fn set_demo_spike(&self, id: MonitorId, until: Option<u64>) -> Result<Monitor, StorageError> {
        self.inner.set_demo_spike(id, until)
    }

    fn append_telemetry(&self, point: &TelemetryPoint) -> Result<TelemetryId, StorageError> {
        self.inner.append_telemetry(point)
    }

    fn recent_telemetry(&self, monitor_id: MonitorId, limit: usize) -> Result<Vec<TelemetryPoint>, StorageError> {
        self.inner.recent_telemetry(monitor_id, limit)
    }

    fn insert_incident(&self, incident: &Incident) -> Result<IncidentId, StorageError> {
        self.inner.insert_incident(incident)
    }

    fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StorageError> {
        self.inner.get_incident(id)
    }

    fn recent_incidents(&self, monitor_id: Option<MonitorId>, limit: usize) -> Result<Vec<Incident>, StorageError> {
        self.inner.recent_incidents(monitor_id, limit)
    }

    fn transition_incident(
        &self,
        id: IncidentId,
        from: &[IncidentStatus],
        to: IncidentStatus,
    ) -> Result<Option<Incident>, StorageError> {
        self.inner.transition_incident(id, from, to)
    }

    fn set_incident_tx_hash(&self, id: IncidentId, tx_hash: &str) -> Result<(), StorageError> {
        if self.bookkeeping_fails() {
            return Err(database_busy());
        }
        self.inner.set_incident_tx_hash(id, tx_hash)
    }

    fn insert_intent(&self, intent: &ActionIntent) -> Result<IntentId, StorageError> {
        self.inner.insert_intent(intent)
    }

    fn get_intent(&self, id: IntentId) -> Result<Option<ActionIntent>, StorageError> {
        self.inner.get_intent(id)
    }

    fn list_intents(
        &self,
        incident_id: Option<IncidentId>,
        state: Option<IntentState>,
    ) -> Result<Vec<ActionIntent>, StorageError> {
        self.inner.list_intents(incident_id, state)
    }

    fn compare_and_set_intent(&self, expected: IntentState, next: &ActionIntent) -> Result<bool, StorageError> {
        let nth = self.intent_writes.fetch_add(1, Ordering::SeqCst) + 1;
        let fails = self
            .failing_intent_writes
            .lock()
            .map(|failing| failing.contains(&nth))
            .unwrap_or(false);
        if fails {
            return Err(database_busy());
        }
        self.inner.compare_and_set_intent(expected, next)
    }
}
