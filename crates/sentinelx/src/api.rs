//! Operator HTTP surface.
//!
//! Every failure is answered with `{"error": <kind>, "reason": <message>}`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::evaluator::{EvaluationError, EvaluationSummary, MonitorEvaluator, MonitorOutcome};
use crate::execution::ExecutionError;
use crate::incidents::{IncidentDesk, IncidentError};
use crate::intents::{ActionIntentService, ExecutionReport, IntentError};
use crate::models::{
    ActionIntent, ActionPlan, Incident, IncidentId, IntentId, IntentState, Monitor, MonitorId,
    MonitorStatus, NewMonitor,
};
use crate::registry::{MonitorRegistry, RegistryError};
use crate::storage::StorageError;

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub evaluator: Arc<MonitorEvaluator>,
    pub intents: Arc<ActionIntentService>,
    pub incidents: Arc<IncidentDesk>,
    pub registry: Arc<MonitorRegistry>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    reason: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, reason: impl ToString) -> Self {
        Self {
            status,
            kind,
            reason: reason.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.kind, "reason": self.reason }));
        (self.status, body).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage", error)
    }
}

impl From<IntentError> for ApiError {
    fn from(error: IntentError) -> Self {
        let status = match &error {
            IntentError::NotFound(_) | IntentError::IncidentNotFound(_) => StatusCode::NOT_FOUND,
            IntentError::InvalidState { .. } | IntentError::NothingToReconcile(_) => StatusCode::CONFLICT,
            IntentError::InvalidPlan(_) => StatusCode::UNPROCESSABLE_ENTITY,
            IntentError::Execution(ExecutionError::NoSigner) => StatusCode::SERVICE_UNAVAILABLE,
            IntentError::Execution(_) => StatusCode::BAD_GATEWAY,
            IntentError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, error.kind(), error)
    }
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        let status = match &error {
            RegistryError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, error.kind(), error)
    }
}

impl From<IncidentError> for ApiError {
    fn from(error: IncidentError) -> Self {
        let status = match &error {
            IncidentError::NotFound(_) => StatusCode::NOT_FOUND,
            IncidentError::InvalidTransition { .. } => StatusCode::CONFLICT,
            IncidentError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, error.kind(), error)
    }
}

impl From<EvaluationError> for ApiError {
    fn from(error: EvaluationError) -> Self {
        let status = match &error {
            EvaluationError::MonitorNotFound(_) => StatusCode::NOT_FOUND,
            EvaluationError::Oracle(_) => StatusCode::BAD_GATEWAY,
            EvaluationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, error.code(), error)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/evaluate", post(evaluate_all))
        .route("/monitors", get(list_monitors).post(register_monitor))
        .route("/monitors/{id}/evaluate", post(evaluate_monitor))
        .route("/monitors/{id}/status", post(set_monitor_status))
        .route("/monitors/{id}/spike", post(schedule_spike))
        .route("/incidents", get(list_incidents))
        .route("/incidents/{id}/acknowledge", post(acknowledge_incident))
        .route("/incidents/{id}/close", post(close_incident))
        .route("/intents", get(list_intents).post(propose_intent))
        .route("/intents/{id}/approve", post(approve_intent))
        .route("/intents/{id}/reject", post(reject_intent))
        .route("/intents/{id}/execute", post(execute_intent))
        .route("/intents/{id}/reconcile", post(reconcile_intent))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ActorBody {
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub actor: String,
    pub status: MonitorStatus,
}

#[derive(Debug, Deserialize)]
pub struct SpikeBody {
    pub duration_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ProposeBody {
    pub incident_id: IncidentId,
    pub proposer: String,
    pub plan: ActionPlan,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Deserialize)]
pub struct MonitorQuery {
    pub tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IncidentQuery {
    pub monitor_id: Option<MonitorId>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct IntentQuery {
    pub incident_id: Option<IncidentId>,
    pub state: Option<IntentState>,
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn evaluate_all(State(state): State<AppState>) -> ApiResult<EvaluationSummary> {
    Ok(Json(state.evaluator.evaluate_all().await?))
}

async fn evaluate_monitor(State(state): State<AppState>, Path(id): Path<MonitorId>) -> ApiResult<MonitorOutcome> {
    Ok(Json(state.evaluator.evaluate_monitor(id).await?))
}

async fn list_monitors(State(state): State<AppState>, Query(query): Query<MonitorQuery>) -> ApiResult<Vec<Monitor>> {
    Ok(Json(state.registry.list(query.tenant_id.as_deref())?))
}

async fn register_monitor(
    State(state): State<AppState>,
    Json(body): Json<NewMonitor>,
) -> Result<(StatusCode, Json<Monitor>), ApiError> {
    Ok((StatusCode::CREATED, Json(state.registry.register(body)?)))
}

async fn set_monitor_status(
    State(state): State<AppState>,
    Path(id): Path<MonitorId>,
    Json(body): Json<StatusBody>,
) -> ApiResult<Monitor> {
    Ok(Json(state.registry.set_status(id, body.status, &body.actor)?))
}

async fn schedule_spike(
    State(state): State<AppState>,
    Path(id): Path<MonitorId>,
    Json(body): Json<SpikeBody>,
) -> ApiResult<Monitor> {
    Ok(Json(state.registry.schedule_demo_spike(id, body.duration_secs)?))
}

async fn list_incidents(State(state): State<AppState>, Query(query): Query<IncidentQuery>) -> ApiResult<Vec<Incident>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(state.incidents.list(query.monitor_id, limit)?))
}

async fn acknowledge_incident(
    State(state): State<AppState>,
    Path(id): Path<IncidentId>,
    Json(body): Json<ActorBody>,
) -> ApiResult<Incident> {
    Ok(Json(state.incidents.acknowledge(id, &body.actor)?))
}

async fn close_incident(
    State(state): State<AppState>,
    Path(id): Path<IncidentId>,
    Json(body): Json<ActorBody>,
) -> ApiResult<Incident> {
    Ok(Json(state.incidents.close(id, &body.actor)?))
}

async fn list_intents(State(state): State<AppState>, Query(query): Query<IntentQuery>) -> ApiResult<Vec<ActionIntent>> {
    Ok(Json(state.intents.list(query.incident_id, query.state)?))
}

async fn propose_intent(
    State(state): State<AppState>,
    Json(body): Json<ProposeBody>,
) -> Result<(StatusCode, Json<ActionIntent>), ApiError> {
    let intent = state
        .intents
        .propose(body.incident_id, &body.proposer, body.plan, &body.rationale)?;
    Ok((StatusCode::CREATED, Json(intent)))
}

async fn approve_intent(
    State(state): State<AppState>,
    Path(id): Path<IntentId>,
    Json(body): Json<ActorBody>,
) -> ApiResult<ActionIntent> {
    Ok(Json(state.intents.approve(id, &body.actor)?))
}

async fn reject_intent(
    State(state): State<AppState>,
    Path(id): Path<IntentId>,
    Json(body): Json<ActorBody>,
) -> ApiResult<ActionIntent> {
    Ok(Json(state.intents.reject(id, &body.actor)?))
}

async fn execute_intent(
    State(state): State<AppState>,
    Path(id): Path<IntentId>,
    Json(body): Json<ActorBody>,
) -> Result<(StatusCode, Json<ExecutionReport>), ApiError> {
    report_response(state.intents.execute(id, &body.actor).await?)
}

async fn reconcile_intent(
    State(state): State<AppState>,
    Path(id): Path<IntentId>,
    Json(body): Json<ActorBody>,
) -> Result<(StatusCode, Json<ExecutionReport>), ApiError> {
    report_response(state.intents.reconcile(id, &body.actor).await?)
}

fn report_response(report: ExecutionReport) -> Result<(StatusCode, Json<ExecutionReport>), ApiError> {
    let status = match report {
        ExecutionReport::Executed(_) => StatusCode::OK,
        ExecutionReport::Pending(_) => StatusCode::ACCEPTED,
    };
    Ok((status, Json(report)))
}
