use crate::consensus::{ConsensusPolicy, FeedObservation, Verdict};
use ethereum_types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type MonitorId = i64;
pub type TelemetryId = i64;
pub type IncidentId = i64;
pub type IntentId = i64;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Active,
    Attention,
    Paused,
}

string_enum!(MonitorStatus, "monitor status", {
    Active => "active",
    Attention => "attention",
    Paused => "paused",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    #[serde(default)]
    pub id: MonitorId,
    pub tenant_id: String,
    pub name: String,
    pub guarded_contract: Address,
    pub guardian_hub: Option<Address>,
    pub router: Option<Address>,
    pub oracle_key: String,
    pub protofire_feed: Address,
    pub dia_feed: Address,
    pub max_deviation_bps: u32,
    pub stale_after_seconds: u64,
    pub status: MonitorStatus,
    pub last_evaluated_at: Option<u64>,
    pub created_at: u64,
    /// Demo data-source override: synthetic spikes until this timestamp.
    #[serde(default)]
    pub demo_spike_until: Option<u64>,
}

impl Monitor {
    pub fn policy(&self) -> ConsensusPolicy {
        ConsensusPolicy {
            max_deviation_bps: self.max_deviation_bps,
            stale_after_seconds: self.stale_after_seconds,
        }
    }

    pub fn spike_active(&self, now: u64) -> bool {
        self.demo_spike_until.is_some_and(|until| until > now)
    }
}

/// Operator registration payload for a monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMonitor {
    pub tenant_id: String,
    pub name: String,
    pub guarded_contract: Address,
    pub guardian_hub: Option<Address>,
    pub router: Option<Address>,
    pub oracle_key: String,
    pub protofire_feed: Address,
    pub dia_feed: Address,
    pub max_deviation_bps: u32,
    pub stale_after_seconds: u64,
}

impl NewMonitor {
    pub fn into_monitor(self, created_at: u64) -> Monitor {
        Monitor {
            id: 0,
            tenant_id: self.tenant_id,
            name: self.name,
            guarded_contract: self.guarded_contract,
            guardian_hub: self.guardian_hub,
            router: self.router,
            oracle_key: self.oracle_key,
            protofire_feed: self.protofire_feed,
            dia_feed: self.dia_feed,
            max_deviation_bps: self.max_deviation_bps,
            stale_after_seconds: self.stale_after_seconds,
            status: MonitorStatus::Active,
            last_evaluated_at: None,
            created_at,
            demo_spike_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetrySource {
    Live,
    Demo,
    Error,
}

string_enum!(TelemetrySource, "telemetry source", {
    Live => "live",
    Demo => "demo",
    Error => "error",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleDatapoint {
    pub price: i128,
    pub safe: bool,
    pub both_fresh: bool,
    pub deviation_bps: u64,
    pub protofire_price: i128,
    pub protofire_updated_at: u64,
    pub dia_price: i128,
    pub dia_updated_at: u64,
}

impl OracleDatapoint {
    pub fn new(verdict: &Verdict, protofire: FeedObservation, dia: FeedObservation) -> Self {
        Self {
            price: verdict.price,
            safe: verdict.safe,
            both_fresh: verdict.both_fresh,
            deviation_bps: verdict.deviation_bps,
            protofire_price: protofire.price,
            protofire_updated_at: protofire.updated_at,
            dia_price: dia.price,
            dia_updated_at: dia.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryPayload {
    Datapoint(OracleDatapoint),
    Error { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    #[serde(default)]
    pub id: TelemetryId,
    pub monitor_id: MonitorId,
    pub recorded_at: u64,
    pub source: TelemetrySource,
    pub payload: TelemetryPayload,
}

impl TelemetryPoint {
    pub fn datapoint(&self) -> Option<&OracleDatapoint> {
        match &self.payload {
            TelemetryPayload::Datapoint(point) => Some(point),
            TelemetryPayload::Error { .. } => None,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match &self.payload {
            TelemetryPayload::Error { code, .. } => Some(code),
            TelemetryPayload::Datapoint(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Closed,
}

string_enum!(IncidentStatus, "incident status", {
    Open => "open",
    Acknowledged => "acknowledged",
    Closed => "closed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    Noop,
    PauseRecommended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

string_enum!(Severity, "severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// Advisor-suggested mitigation, kept on the incident for operators to read.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mitigation {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub calldata: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    #[serde(default)]
    pub id: IncidentId,
    pub monitor_id: MonitorId,
    pub opened_at: u64,
    pub safe: bool,
    pub both_fresh: bool,
    pub price: i128,
    pub deviation_bps: u64,
    pub action_taken: ActionTaken,
    pub summary: String,
    pub severity: Severity,
    pub root_cause: String,
    pub mitigations: Vec<Mitigation>,
    pub tags: Vec<String>,
    pub tx_hash: Option<String>,
    pub status: IncidentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    Proposed,
    Approved,
    Executing,
    Executed,
    Rejected,
}

string_enum!(IntentState, "intent state", {
    Proposed => "proposed",
    Approved => "approved",
    Executing => "executing",
    Executed => "executed",
    Rejected => "rejected",
});

impl IntentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Rejected)
    }
}

/// What an intent will do on chain once approved.
///
/// `target` and `calldata` stay as hex strings until execution so plans coming
/// from the advisor can be stored verbatim and validated right before broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub name: String,
    pub target: String,
    pub calldata: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionIntent {
    #[serde(default)]
    pub id: IntentId,
    pub incident_id: IncidentId,
    pub monitor_id: MonitorId,
    pub proposed_at: u64,
    pub proposer: String,
    pub plan: ActionPlan,
    pub rationale: String,
    pub state: IntentState,
    pub approved_at: Option<u64>,
    pub approved_by: Option<String>,
    pub executed_at: Option<u64>,
    pub executed_by: Option<String>,
    pub tx_hash: Option<String>,
    pub last_error: Option<String>,
}

impl ActionIntent {
    pub fn proposed(
        incident: &Incident,
        proposer: impl Into<String>,
        plan: ActionPlan,
        rationale: impl Into<String>,
        proposed_at: u64,
    ) -> Self {
        Self {
            id: 0,
            incident_id: incident.id,
            monitor_id: incident.monitor_id,
            proposed_at,
            proposer: proposer.into(),
            plan,
            rationale: rationale.into(),
            state: IntentState::Proposed,
            approved_at: None,
            approved_by: None,
            executed_at: None,
            executed_by: None,
            tx_hash: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_their_wire_names() {
        for state in [
            IntentState::Proposed,
            IntentState::Approved,
            IntentState::Executing,
            IntentState::Executed,
            IntentState::Rejected,
        ] {
            assert_eq!(state.as_str().parse::<IntentState>(), Ok(state));
        }
        assert!("paused".parse::<MonitorStatus>().is_ok());
        assert!("resumed".parse::<MonitorStatus>().is_err());
    }

    #[test]
    fn telemetry_payload_is_keyed_by_variant() -> Result<(), serde_json::Error> {
        let payload = TelemetryPayload::Error {
            code: "router_address_missing".to_owned(),
            message: "no router".to_owned(),
        };
        let json = serde_json::to_value(&payload)?;
        assert_eq!(json["error"]["code"], "router_address_missing");
        Ok(())
    }

    #[test]
    fn spike_window_is_exclusive_at_expiry() {
        let mut monitor = NewMonitor {
            tenant_id: "t".to_owned(),
            name: "m".to_owned(),
            guarded_contract: Address::repeat_byte(1),
            guardian_hub: None,
            router: None,
            oracle_key: "ETH/USD".to_owned(),
            protofire_feed: Address::repeat_byte(2),
            dia_feed: Address::repeat_byte(3),
            max_deviation_bps: 100,
            stale_after_seconds: 300,
        }
        .into_monitor(0);
        monitor.demo_spike_until = Some(100);

        assert!(monitor.spike_active(99));
        assert!(!monitor.spike_active(100));
    }
}
