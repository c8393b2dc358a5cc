//! Incident advisory: summaries and proposed mitigations.
//!
//! The evaluator treats every advisor as best-effort. [`HttpAdvisor`] talks to
//! an external advisory service; [`RuleAdvisor`] derives the same shapes from
//! the verdict alone and doubles as the fallback when the service is down.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::abi::format_address;
use crate::models::{Incident, Mitigation, Monitor, OracleDatapoint, Severity, TelemetryPoint};

pub const PAUSE_PLAN: &str = "pause_guarded_contract";
pub const UNPAUSE_PLAN: &str = "unpause_guarded_contract";

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("advisor returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("advisor timed out after {0:?}")]
    Timeout(Duration),
    #[error("advisor response invalid: {0}")]
    InvalidResponse(String),
}

/// Context handed to `summarize` for one anomalous evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRequest<'a> {
    pub monitor: &'a Monitor,
    pub datapoint: &'a OracleDatapoint,
    /// Newest first.
    pub recent_telemetry: &'a [TelemetryPoint],
    /// Newest first.
    pub recent_incidents: &'a [Incident],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    pub summary: String,
    pub severity: Severity,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub mitigations: Vec<Mitigation>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest<'a> {
    pub monitor: &'a Monitor,
    pub incident: &'a Incident,
}

/// One advisor proposal before it is resolved into an executable plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub rationale: String,
}

#[async_trait]
pub trait Advisor: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest<'_>) -> Result<Advisory, AdvisorError>;
    async fn plan(&self, request: &PlanRequest<'_>) -> Result<Vec<ProposedAction>, AdvisorError>;
}

#[derive(Debug, Clone)]
pub struct HttpAdvisorConfig {
    pub url: String,
    pub timeout: Duration,
}

/// JSON over HTTP: `POST {url}/summarize` and `POST {url}/plan`.
pub struct HttpAdvisor {
    client: reqwest::Client,
    config: HttpAdvisorConfig,
}

#[derive(Deserialize)]
struct PlanResponse {
    #[serde(default)]
    actions: Vec<ProposedAction>,
}

impl HttpAdvisor {
    pub fn new(config: HttpAdvisorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.url.trim_end_matches('/'))
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, AdvisorError>
    where
        B: Serialize + Sync,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    AdvisorError::Timeout(self.config.timeout)
                } else {
                    AdvisorError::Http(error)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdvisorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|error| AdvisorError::InvalidResponse(error.to_string()))
    }
}

#[async_trait]
impl Advisor for HttpAdvisor {
    async fn summarize(&self, request: &SummaryRequest<'_>) -> Result<Advisory, AdvisorError> {
        self.post("summarize", request).await
    }

    async fn plan(&self, request: &PlanRequest<'_>) -> Result<Vec<ProposedAction>, AdvisorError> {
        let response: PlanResponse = self.post("plan", request).await?;
        Ok(response.actions)
    }
}

/// Deterministic advisor working from the datapoint alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleAdvisor;

impl RuleAdvisor {
    pub fn severity(monitor: &Monitor, datapoint: &OracleDatapoint) -> Severity {
        let bound = u64::from(monitor.max_deviation_bps);
        if datapoint.both_fresh && datapoint.deviation_bps > bound.saturating_mul(2) {
            Severity::Critical
        } else if datapoint.both_fresh && !datapoint.safe {
            Severity::High
        } else if !datapoint.both_fresh {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn summary(monitor: &Monitor, datapoint: &OracleDatapoint) -> String {
        if datapoint.both_fresh {
            format!(
                "{} feeds for {} diverged by {} bps (bound {} bps)",
                monitor.name, monitor.oracle_key, datapoint.deviation_bps, monitor.max_deviation_bps
            )
        } else {
            format!(
                "{} feeds for {} are stale (older than {}s)",
                monitor.name, monitor.oracle_key, monitor.stale_after_seconds
            )
        }
    }

    pub fn advisory(monitor: &Monitor, datapoint: &OracleDatapoint) -> Advisory {
        let (root_cause, tag) = if datapoint.both_fresh {
            ("price divergence between feeds", "deviation")
        } else {
            ("at least one feed stopped updating", "staleness")
        };

        Advisory {
            summary: Self::summary(monitor, datapoint),
            severity: Self::severity(monitor, datapoint),
            root_cause: root_cause.to_owned(),
            mitigations: vec![Mitigation {
                target: format_address(&monitor.guardian_hub.unwrap_or(monitor.guarded_contract)),
                calldata: String::new(),
                rationale: "pause the guarded contract until feeds agree".to_owned(),
            }],
            tags: vec![tag.to_owned(), monitor.oracle_key.clone()],
        }
    }
}

#[async_trait]
impl Advisor for RuleAdvisor {
    async fn summarize(&self, request: &SummaryRequest<'_>) -> Result<Advisory, AdvisorError> {
        Ok(Self::advisory(request.monitor, request.datapoint))
    }

    async fn plan(&self, request: &PlanRequest<'_>) -> Result<Vec<ProposedAction>, AdvisorError> {
        if request.incident.safe && request.incident.both_fresh {
            return Ok(Vec::new());
        }

        Ok(vec![ProposedAction {
            name: PAUSE_PLAN.to_owned(),
            arguments: json!({ "contract": format_address(&request.monitor.guarded_contract) }),
            rationale: format!(
                "{} severity incident on {}",
                request.incident.severity, request.monitor.oracle_key
            ),
        }])
    }
}
