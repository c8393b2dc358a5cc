//! Action intent lifecycle.
//!
//! ```text
//! proposed -> approved -> executing -> executed
//!     |                       |
//!     v                       +--> approved (failure, last_error set)
//! rejected
//! ```
//!
//! Every transition is a compare-and-set on the stored state, so two callers
//! racing on the same intent cannot both win. Only the winner of
//! `approved -> executing` talks to the chain.

use std::sync::Arc;

use ethereum_types::Address;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::abi::{self, format_address, format_hash, parse_address, parse_h256, parse_hex_bytes, to_hex};
use crate::advisor::{PAUSE_PLAN, ProposedAction, UNPAUSE_PLAN};
use crate::clock::Clock;
use crate::execution::{ExecutionError, ExecutionGateway, ExecutionReceipt};
use crate::models::{
    ActionIntent, ActionPlan, IncidentId, IntentId, IntentState, Monitor, MonitorStatus,
};
use crate::storage::{Repository, StorageError};

#[derive(Debug, Error)]
pub enum IntentError {
    #[error("intent {0} not found")]
    NotFound(IntentId),
    #[error("incident {0} not found")]
    IncidentNotFound(IncidentId),
    #[error("intent {id} is {actual}, not {expected}")]
    InvalidState {
        id: IntentId,
        expected: IntentState,
        actual: IntentState,
    },
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    #[error("intent {0} has no transaction hash to reconcile")]
    NothingToReconcile(IntentId),
    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl IntentError {
    pub fn kind(&self) -> &'static str {
        match self {
            IntentError::NotFound(_) | IntentError::IncidentNotFound(_) => "not_found",
            IntentError::InvalidState { .. } => "invalid_state",
            IntentError::InvalidPlan(_) => "invalid_plan",
            IntentError::NothingToReconcile(_) => "nothing_to_reconcile",
            IntentError::Execution(error) => error.kind(),
            IntentError::Storage(_) => "storage",
        }
    }

    /// Caller mistakes, as opposed to chain or storage failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IntentError::NotFound(_)
                | IntentError::IncidentNotFound(_)
                | IntentError::InvalidState { .. }
                | IntentError::InvalidPlan(_)
                | IntentError::NothingToReconcile(_)
        )
    }
}

/// Result of an execute or reconcile call that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "intent", rename_all = "snake_case")]
pub enum ExecutionReport {
    Executed(ActionIntent),
    /// Broadcast, but no receipt yet. The intent stays `executing`.
    Pending(ActionIntent),
}

impl ExecutionReport {
    pub fn intent(&self) -> &ActionIntent {
        match self {
            ExecutionReport::Executed(intent) | ExecutionReport::Pending(intent) => intent,
        }
    }
}

/// Turn an advisor proposal into an executable plan for `monitor`.
///
/// Pause and unpause go through the guardian hub when the monitor has one.
/// Other proposals are kept only when they carry explicit `target` and
/// `calldata` strings.
pub fn resolve_plan(monitor: &Monitor, proposal: &ProposedAction) -> Option<ActionPlan> {
    let target = format_address(&monitor.guardian_hub.unwrap_or(monitor.guarded_contract));
    let via_hub = monitor.guardian_hub.map(|_| monitor.guarded_contract);

    let (target, calldata) = match proposal.name.as_str() {
        PAUSE_PLAN => (target, to_hex(&abi::pause_calldata(via_hub))),
        UNPAUSE_PLAN => (target, to_hex(&abi::unpause_calldata(via_hub))),
        _ => {
            let target = proposal.arguments.get("target").and_then(Value::as_str)?;
            let calldata = proposal.arguments.get("calldata").and_then(Value::as_str)?;
            (target.to_owned(), calldata.to_owned())
        }
    };

    Some(ActionPlan {
        name: proposal.name.clone(),
        target,
        calldata,
        arguments: proposal.arguments.clone(),
    })
}

/// Check a plan is executable without touching the network.
pub fn validate_plan(plan: &ActionPlan) -> Result<(Address, Vec<u8>), IntentError> {
    let target = parse_address(&plan.target).ok_or_else(|| {
        IntentError::InvalidPlan(format!("target {:?} is not a 20-byte hex address", plan.target))
    })?;
    let calldata = parse_hex_bytes(&plan.calldata)
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| IntentError::InvalidPlan("calldata must be non-empty hex".to_owned()))?;
    Ok((target, calldata))
}

pub struct ActionIntentService {
    repository: Arc<dyn Repository>,
    gateway: Arc<ExecutionGateway>,
    clock: Arc<dyn Clock>,
}

impl ActionIntentService {
    pub fn new(
        repository: Arc<dyn Repository>,
        gateway: Arc<ExecutionGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            gateway,
            clock,
        }
    }

    pub fn get(&self, id: IntentId) -> Result<ActionIntent, IntentError> {
        self.repository.get_intent(id)?.ok_or(IntentError::NotFound(id))
    }

    pub fn list(
        &self,
        incident_id: Option<IncidentId>,
        state: Option<IntentState>,
    ) -> Result<Vec<ActionIntent>, IntentError> {
        Ok(self.repository.list_intents(incident_id, state)?)
    }

    pub fn propose(
        &self,
        incident_id: IncidentId,
        proposer: &str,
        plan: ActionPlan,
        rationale: &str,
    ) -> Result<ActionIntent, IntentError> {
        let incident = self
            .repository
            .get_incident(incident_id)?
            .ok_or(IntentError::IncidentNotFound(incident_id))?;

        let mut intent = ActionIntent::proposed(&incident, proposer, plan, rationale, self.clock.now());
        intent.id = self.repository.insert_intent(&intent)?;
        info!(
            intent_id = intent.id,
            incident_id,
            plan = %intent.plan.name,
            proposer,
            "intent proposed"
        );
        Ok(intent)
    }

    pub fn approve(&self, id: IntentId, actor: &str) -> Result<ActionIntent, IntentError> {
        self.decide(id, actor, IntentState::Approved)
    }

    pub fn reject(&self, id: IntentId, actor: &str) -> Result<ActionIntent, IntentError> {
        self.decide(id, actor, IntentState::Rejected)
    }

    fn decide(&self, id: IntentId, actor: &str, to: IntentState) -> Result<ActionIntent, IntentError> {
        let intent = self.get(id)?;
        let mut next = intent.clone();
        next.state = to;
        next.approved_at = Some(self.clock.now());
        next.approved_by = Some(actor.to_owned());

        self.transition(&intent, IntentState::Proposed, &next)?;
        info!(intent_id = id, actor, state = %to, "intent decided");
        Ok(next)
    }

    /// Execute an approved intent.
    ///
    /// The plan is validated and the signer checked before anything is
    /// claimed. A receipt that does not arrive in time is reported as
    /// [`ExecutionReport::Pending`]; [`Self::reconcile`] settles it later.
    pub async fn execute(&self, id: IntentId, actor: &str) -> Result<ExecutionReport, IntentError> {
        let intent = self.get(id)?;
        if intent.state != IntentState::Approved {
            return Err(IntentError::InvalidState {
                id,
                expected: IntentState::Approved,
                actual: intent.state,
            });
        }

        let (target, calldata) = validate_plan(&intent.plan)?;
        if !self.gateway.has_signer() {
            return Err(ExecutionError::NoSigner.into());
        }

        let mut claimed = intent.clone();
        claimed.state = IntentState::Executing;
        claimed.executed_by = Some(actor.to_owned());
        claimed.last_error = None;
        self.transition(&intent, IntentState::Approved, &claimed)?;
        info!(intent_id = id, actor, target = %format_address(&target), "intent executing");

        let tx_hash = match self.gateway.broadcast(target, &calldata).await {
            Ok(tx_hash) => tx_hash,
            Err(error) => return Err(self.release(claimed, error)),
        };

        // The transaction is out: from here on the hash must not be lost, so a
        // failed write is logged and the receipt is still awaited.
        let mut in_flight = claimed.clone();
        in_flight.tx_hash = Some(format_hash(&tx_hash));
        let mut recorded = self.record_tx_hash(&claimed, &in_flight);

        match self.gateway.wait_for_receipt(tx_hash).await {
            Ok(receipt) => self.finish(in_flight, receipt).map(ExecutionReport::Executed),
            Err(ExecutionError::ReceiptTimeout { .. }) => {
                if !recorded {
                    recorded = self.record_tx_hash(&claimed, &in_flight);
                }
                warn!(
                    intent_id = id,
                    tx_hash = %format_hash(&tx_hash),
                    recorded,
                    "receipt pending, intent left executing"
                );
                Ok(ExecutionReport::Pending(in_flight))
            }
            Err(error) => Err(self.release(in_flight, error)),
        }
    }

    fn record_tx_hash(&self, claimed: &ActionIntent, in_flight: &ActionIntent) -> bool {
        match self.transition(claimed, IntentState::Executing, in_flight) {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    intent_id = in_flight.id,
                    tx_hash = in_flight.tx_hash.as_deref().unwrap_or_default(),
                    error = %error,
                    "failed to record broadcast transaction hash"
                );
                false
            }
        }
    }

    /// Settle an `executing` intent from its recorded transaction.
    pub async fn reconcile(&self, id: IntentId, actor: &str) -> Result<ExecutionReport, IntentError> {
        let intent = self.get(id)?;
        if intent.state != IntentState::Executing {
            return Err(IntentError::InvalidState {
                id,
                expected: IntentState::Executing,
                actual: intent.state,
            });
        }

        let tx_hash = intent
            .tx_hash
            .as_deref()
            .and_then(parse_h256)
            .ok_or(IntentError::NothingToReconcile(id))?;

        info!(intent_id = id, actor, tx_hash = %format_hash(&tx_hash), "reconciling intent");
        match self.gateway.check_receipt(tx_hash).await {
            Ok(Some(receipt)) => self.finish(intent, receipt).map(ExecutionReport::Executed),
            Ok(None) => Ok(ExecutionReport::Pending(intent)),
            Err(error @ ExecutionError::Reverted { .. }) => Err(self.release(intent, error)),
            Err(error) => Err(error.into()),
        }
    }

    fn finish(&self, intent: ActionIntent, receipt: ExecutionReceipt) -> Result<ActionIntent, IntentError> {
        let tx_hash = format_hash(&receipt.tx_hash);
        let mut done = intent.clone();
        done.state = IntentState::Executed;
        done.executed_at = Some(self.clock.now());
        done.tx_hash = Some(tx_hash.clone());
        done.last_error = None;
        self.transition(&intent, IntentState::Executing, &done)?;

        // The intent is executed on chain and in storage; what follows is
        // bookkeeping and must not turn that into an error.
        if let Err(error) = self.repository.set_incident_tx_hash(done.incident_id, &tx_hash) {
            warn!(incident_id = done.incident_id, tx_hash = %tx_hash, error = %error, "failed to record incident tx hash");
        }
        let status = match done.plan.name.as_str() {
            PAUSE_PLAN => Some(MonitorStatus::Paused),
            UNPAUSE_PLAN => Some(MonitorStatus::Active),
            _ => None,
        };
        if let Some(status) = status {
            if let Err(error) = self.repository.set_monitor_status(done.monitor_id, status) {
                warn!(monitor_id = done.monitor_id, status = %status, error = %error, "failed to update monitor status");
            }
        }

        info!(
            intent_id = done.id,
            incident_id = done.incident_id,
            tx_hash = %tx_hash,
            block = ?receipt.block_number,
            "intent executed"
        );
        Ok(done)
    }

    /// Return a failed execution to `approved`, keeping the reason.
    fn release(&self, intent: ActionIntent, error: ExecutionError) -> IntentError {
        let mut back = intent.clone();
        back.state = IntentState::Approved;
        back.last_error = Some(format!("{}: {error}", error.kind()));
        if let Some(tx_hash) = error.tx_hash() {
            back.tx_hash = Some(format_hash(&tx_hash));
        }

        warn!(intent_id = intent.id, kind = error.kind(), error = %error, "intent execution failed");
        if let Err(storage) = self.transition(&intent, IntentState::Executing, &back) {
            warn!(intent_id = intent.id, error = %storage, "failed to return intent to approved");
        }
        IntentError::Execution(error)
    }

    fn transition(
        &self,
        current: &ActionIntent,
        expected: IntentState,
        next: &ActionIntent,
    ) -> Result<(), IntentError> {
        if current.state != expected {
            return Err(IntentError::InvalidState {
                id: current.id,
                expected,
                actual: current.state,
            });
        }

        if self.repository.compare_and_set_intent(expected, next)? {
            return Ok(());
        }

        let actual = self
            .repository
            .get_intent(current.id)?
            .map(|stored| stored.state)
            .ok_or(IntentError::NotFound(current.id))?;
        Err(IntentError::InvalidState {
            id: current.id,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMonitor;
    use serde_json::json;

    fn monitor(guardian_hub: Option<Address>) -> Monitor {
        NewMonitor {
            tenant_id: "acme".to_owned(),
            name: "eth-usd".to_owned(),
            guarded_contract: Address::repeat_byte(0x01),
            guardian_hub,
            router: None,
            oracle_key: "ETH/USD".to_owned(),
            protofire_feed: Address::repeat_byte(0x02),
            dia_feed: Address::repeat_byte(0x03),
            max_deviation_bps: 100,
            stale_after_seconds: 300,
        }
        .into_monitor(0)
    }

    fn proposal(name: &str, arguments: Value) -> ProposedAction {
        ProposedAction {
            name: name.to_owned(),
            arguments,
            rationale: String::new(),
        }
    }

    #[test]
    fn pause_goes_through_the_hub_when_present() {
        let hub = Address::repeat_byte(0x0a);
        let plan = resolve_plan(&monitor(Some(hub)), &proposal(PAUSE_PLAN, Value::Null));
        let plan = plan.map(|plan| (plan.target, plan.calldata));
        assert_eq!(
            plan,
            Some((
                format_address(&hub),
                format!(
                    "{}{}",
                    to_hex(&abi::selector(abi::HUB_PAUSE_SIGNATURE)),
                    "0000000000000000000000000101010101010101010101010101010101010101"
                )
            ))
        );
    }

    #[test]
    fn direct_pause_and_unpause_without_hub() {
        let monitor = monitor(None);
        let pause = resolve_plan(&monitor, &proposal(PAUSE_PLAN, Value::Null));
        assert_eq!(pause.map(|plan| plan.calldata), Some("0x8456cb59".to_owned()));

        let unpause = resolve_plan(&monitor, &proposal(UNPAUSE_PLAN, Value::Null));
        assert_eq!(
            unpause.map(|plan| plan.target),
            Some(format_address(&Address::repeat_byte(0x01)))
        );
    }

    #[test]
    fn raw_proposals_need_target_and_calldata() {
        let monitor = monitor(None);
        let kept = resolve_plan(
            &monitor,
            &proposal("custom", json!({ "target": "0xabc", "calldata": "0x01" })),
        );
        assert_eq!(kept.map(|plan| plan.target), Some("0xabc".to_owned()));

        assert!(resolve_plan(&monitor, &proposal("notify_team", json!({ "channel": "ops" }))).is_none());
    }

    #[test]
    fn validation_rejects_short_targets_and_empty_calldata() {
        let plan = |target: &str, calldata: &str| ActionPlan {
            name: "custom".to_owned(),
            target: target.to_owned(),
            calldata: calldata.to_owned(),
            arguments: Value::Null,
        };

        assert!(matches!(validate_plan(&plan("0xabc", "0x01")), Err(IntentError::InvalidPlan(_))));
        let target = format_address(&Address::repeat_byte(0x01));
        assert!(matches!(validate_plan(&plan(&target, "0x")), Err(IntentError::InvalidPlan(_))));
        assert!(matches!(validate_plan(&plan(&target, "nothex")), Err(IntentError::InvalidPlan(_))));
        assert!(validate_plan(&plan(&target, "0x8456cb59")).is_ok());
    }

    #[test]
    fn client_errors_are_classified() {
        let invalid = IntentError::InvalidState {
            id: 1,
            expected: IntentState::Approved,
            actual: IntentState::Executing,
        };
        assert!(invalid.is_client_error());
        assert_eq!(invalid.kind(), "invalid_state");

        let chain = IntentError::Execution(ExecutionError::NoSigner);
        assert!(!chain.is_client_error());
        assert_eq!(chain.kind(), "no_signer");
    }
}
