//! One evaluation pass over the stored monitors.
//!
//! Per monitor: fetch observations, run consensus, append telemetry, move the
//! status, and for an unhealthy verdict open an incident and persist the
//! advisor's proposals as `proposed` intents. Failures stay per monitor and are
//! recorded as `error` telemetry; they never abort the pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::advisor::{Advisor, Advisory, PlanRequest, RuleAdvisor, SummaryRequest};
use crate::clock::Clock;
use crate::config::EvaluatorConfig;
use crate::consensus::{self, Verdict};
use crate::intents::resolve_plan;
use crate::models::{
    ActionIntent, ActionTaken, Incident, IncidentId, IncidentStatus, Monitor, MonitorId,
    MonitorStatus, OracleDatapoint, Severity, TelemetryPayload, TelemetryPoint, TelemetrySource,
};
use crate::oracle::{OracleError, OracleGateway, RouterVerdict};
use crate::storage::{Repository, StorageError};

/// Proposer recorded on intents that came from the advisor.
pub const ADVISOR_PROPOSER: &str = "advisor";

/// Severity of an incident whose advisory could not be obtained.
pub const FALLBACK_SEVERITY: Severity = Severity::High;

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("monitor {0} not found")]
    MonitorNotFound(MonitorId),
}

impl EvaluationError {
    /// Stable code recorded in error telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            EvaluationError::Oracle(error) => error.code(),
            EvaluationError::Storage(_) => "storage_error",
            EvaluationError::MonitorNotFound(_) => "monitor_not_found",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub max_concurrency: usize,
    pub advisor_timeout: Duration,
    pub telemetry_window: usize,
    pub incident_window: usize,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self::from(&EvaluatorConfig::default())
    }
}

impl From<&EvaluatorConfig> for EvaluatorSettings {
    fn from(config: &EvaluatorConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            advisor_timeout: config.advisor_timeout(),
            telemetry_window: config.telemetry_window,
            incident_window: config.incident_window,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationSummary {
    pub processed: usize,
    pub anomalies: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MonitorOutcome {
    Healthy,
    Anomaly { incident_id: IncidentId, intents: usize },
    Failed { code: String },
}

pub struct MonitorEvaluator {
    repository: Arc<dyn Repository>,
    gateway: Arc<OracleGateway>,
    advisor: Arc<dyn Advisor>,
    clock: Arc<dyn Clock>,
    settings: EvaluatorSettings,
    locks: Mutex<HashMap<MonitorId, Arc<tokio::sync::Mutex<()>>>>,
}

impl MonitorEvaluator {
    pub fn new(
        repository: Arc<dyn Repository>,
        gateway: Arc<OracleGateway>,
        advisor: Arc<dyn Advisor>,
        clock: Arc<dyn Clock>,
        settings: EvaluatorSettings,
    ) -> Self {
        Self {
            repository,
            gateway,
            advisor,
            clock,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate every stored monitor.
    pub async fn evaluate_all(&self) -> Result<EvaluationSummary, StorageError> {
        let monitors = self.repository.list_monitors()?;
        Ok(self.evaluate_monitors(monitors).await)
    }

    pub async fn evaluate_monitors(&self, monitors: Vec<Monitor>) -> EvaluationSummary {
        let outcomes: Vec<MonitorOutcome> = futures::stream::iter(monitors)
            .map(|monitor| self.evaluate_one(monitor.id))
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        let summary = outcomes
            .iter()
            .fold(EvaluationSummary::default(), |mut summary, outcome| {
                summary.processed += 1;
                match outcome {
                    MonitorOutcome::Healthy => {}
                    MonitorOutcome::Anomaly { .. } => summary.anomalies += 1,
                    MonitorOutcome::Failed { .. } => summary.errors += 1,
                }
                summary
            });

        info!(
            processed = summary.processed,
            anomalies = summary.anomalies,
            errors = summary.errors,
            "evaluation pass finished"
        );
        summary
    }

    /// Evaluate a single monitor by id.
    pub async fn evaluate_monitor(&self, id: MonitorId) -> Result<MonitorOutcome, EvaluationError> {
        if self.repository.get_monitor(id)?.is_none() {
            return Err(EvaluationError::MonitorNotFound(id));
        }
        Ok(self.evaluate_one(id).await)
    }

    fn lock_for(&self, id: MonitorId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(id).or_default().clone()
    }

    async fn evaluate_one(&self, id: MonitorId) -> MonitorOutcome {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        // Re-read under the lock so an overlapping pass sees the latest status.
        let monitor = match self.repository.get_monitor(id) {
            Ok(Some(monitor)) => monitor,
            Ok(None) => {
                return MonitorOutcome::Failed {
                    code: EvaluationError::MonitorNotFound(id).code().to_owned(),
                };
            }
            Err(error) => {
                warn!(monitor_id = id, error = %error, "failed to load monitor");
                return MonitorOutcome::Failed {
                    code: EvaluationError::Storage(error).code().to_owned(),
                };
            }
        };

        let now = self.clock.now();
        match self.evaluate_locked(&monitor, now).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.record_failure(&monitor, now, &error);
                MonitorOutcome::Failed {
                    code: error.code().to_owned(),
                }
            }
        }
    }

    async fn evaluate_locked(&self, monitor: &Monitor, now: u64) -> Result<MonitorOutcome, EvaluationError> {
        let fetched = self.gateway.fetch(monitor, now).await?;
        if fetched.spike_expired {
            self.repository.set_demo_spike(monitor.id, None)?;
            debug!(monitor_id = monitor.id, "cleared expired demo spike");
        }

        let reading = fetched.reading;
        let verdict = consensus::evaluate(reading.protofire, reading.dia, now, &monitor.policy());
        if let Some(router) = reading.router_verdict {
            warn_on_router_mismatch(monitor.id, &router, &verdict);
        }

        let datapoint = OracleDatapoint::new(&verdict, reading.protofire, reading.dia);
        self.repository.append_telemetry(&TelemetryPoint {
            id: 0,
            monitor_id: monitor.id,
            recorded_at: now,
            source: fetched.source,
            payload: TelemetryPayload::Datapoint(datapoint.clone()),
        })?;

        let status = match (monitor.status, verdict.is_healthy()) {
            (MonitorStatus::Paused, _) => None,
            (_, true) => Some(MonitorStatus::Active),
            (_, false) => Some(MonitorStatus::Attention),
        };
        let monitor = self.repository.record_evaluation(monitor.id, status, now)?;

        if verdict.is_healthy() {
            debug!(monitor_id = monitor.id, price = %verdict.price, "monitor healthy");
            return Ok(MonitorOutcome::Healthy);
        }

        let incident = self.open_incident(&monitor, &datapoint, now).await?;
        let intents = self.propose_intents(&monitor, &incident, now).await;
        Ok(MonitorOutcome::Anomaly {
            incident_id: incident.id,
            intents,
        })
    }

    async fn open_incident(
        &self,
        monitor: &Monitor,
        datapoint: &OracleDatapoint,
        now: u64,
    ) -> Result<Incident, EvaluationError> {
        let recent_telemetry = self
            .repository
            .recent_telemetry(monitor.id, self.settings.telemetry_window)?;
        let recent_incidents = self
            .repository
            .recent_incidents(Some(monitor.id), self.settings.incident_window)?;

        let request = SummaryRequest {
            monitor,
            datapoint,
            recent_telemetry: &recent_telemetry,
            recent_incidents: &recent_incidents,
        };
        let advisory = match tokio::time::timeout(self.settings.advisor_timeout, self.advisor.summarize(&request)).await
        {
            Ok(Ok(advisory)) => advisory,
            Ok(Err(error)) => {
                warn!(monitor_id = monitor.id, error = %error, "advisor summary failed, using fallback");
                fallback_advisory(monitor, datapoint)
            }
            Err(_) => {
                warn!(monitor_id = monitor.id, "advisor summary timed out, using fallback");
                fallback_advisory(monitor, datapoint)
            }
        };

        let mut incident = Incident {
            id: 0,
            monitor_id: monitor.id,
            opened_at: now,
            safe: datapoint.safe,
            both_fresh: datapoint.both_fresh,
            price: datapoint.price,
            deviation_bps: datapoint.deviation_bps,
            action_taken: if datapoint.safe {
                ActionTaken::Noop
            } else {
                ActionTaken::PauseRecommended
            },
            summary: advisory.summary,
            severity: advisory.severity,
            root_cause: advisory.root_cause,
            mitigations: advisory.mitigations,
            tags: advisory.tags,
            tx_hash: None,
            status: IncidentStatus::Open,
        };
        incident.id = self.repository.insert_incident(&incident)?;

        warn!(
            monitor_id = monitor.id,
            incident_id = incident.id,
            severity = %incident.severity,
            deviation_bps = incident.deviation_bps,
            both_fresh = incident.both_fresh,
            "incident opened"
        );
        Ok(incident)
    }

    /// Best-effort: planning failures leave the incident without intents.
    async fn propose_intents(&self, monitor: &Monitor, incident: &Incident, now: u64) -> usize {
        let request = PlanRequest { monitor, incident };
        let proposals = match tokio::time::timeout(self.settings.advisor_timeout, self.advisor.plan(&request)).await {
            Ok(Ok(proposals)) => proposals,
            Ok(Err(error)) => {
                warn!(incident_id = incident.id, error = %error, "advisor plan failed");
                return 0;
            }
            Err(_) => {
                warn!(incident_id = incident.id, "advisor plan timed out");
                return 0;
            }
        };

        let mut persisted = 0;
        for proposal in proposals {
            let Some(plan) = resolve_plan(monitor, &proposal) else {
                warn!(incident_id = incident.id, plan = %proposal.name, "skipping unresolvable proposal");
                continue;
            };

            let intent = ActionIntent::proposed(incident, ADVISOR_PROPOSER, plan, proposal.rationale, now);
            match self.repository.insert_intent(&intent) {
                Ok(intent_id) => {
                    info!(incident_id = incident.id, intent_id, plan = %proposal.name, "intent proposed");
                    persisted += 1;
                }
                Err(error) => {
                    warn!(incident_id = incident.id, error = %error, "failed to persist intent");
                }
            }
        }
        persisted
    }

    fn record_failure(&self, monitor: &Monitor, now: u64, error: &EvaluationError) {
        warn!(monitor_id = monitor.id, code = error.code(), error = %error, "monitor evaluation failed");

        let point = TelemetryPoint {
            id: 0,
            monitor_id: monitor.id,
            recorded_at: now,
            source: TelemetrySource::Error,
            payload: TelemetryPayload::Error {
                code: error.code().to_owned(),
                message: error.to_string(),
            },
        };
        if let Err(storage) = self.repository.append_telemetry(&point) {
            warn!(monitor_id = monitor.id, error = %storage, "failed to record error telemetry");
        }
        if let Err(storage) = self.repository.record_evaluation(monitor.id, None, now) {
            warn!(monitor_id = monitor.id, error = %storage, "failed to stamp evaluation");
        }
    }
}

fn fallback_advisory(monitor: &Monitor, datapoint: &OracleDatapoint) -> Advisory {
    Advisory {
        summary: RuleAdvisor::summary(monitor, datapoint),
        severity: FALLBACK_SEVERITY,
        root_cause: String::new(),
        mitigations: Vec::new(),
        tags: Vec::new(),
    }
}

fn warn_on_router_mismatch(monitor_id: MonitorId, router: &RouterVerdict, verdict: &Verdict) {
    if router.safe != verdict.safe || router.both_fresh != verdict.both_fresh || router.price != verdict.price {
        warn!(
            monitor_id,
            router_price = %router.price,
            router_safe = router.safe,
            router_both_fresh = router.both_fresh,
            price = %verdict.price,
            safe = verdict.safe,
            both_fresh = verdict.both_fresh,
            "router verdict differs from off-chain consensus"
        );
    }
}
