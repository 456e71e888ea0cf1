use super::{parse_inline_workflow, ApiError, ApiKeyInput, ApiResult};
use crate::config::AppState;
use crate::middleware::CurrentUser;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rustmake_core::{
    storage::{CredentialInfo, CredentialStore, StoredWorkflow, WorkflowStore},
    workflow::{RunState, ValidatedGraph},
    CredentialRef, RunId, RunSummary, WorkflowId, WorkflowSpec,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn parse_run_id(raw: &str) -> ApiResult<RunId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid run id '{}'", raw)))
}

fn parse_workflow_id(raw: &str) -> ApiResult<WorkflowId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid workflow id '{}'", raw)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    pub dag: serde_json::Value,
}

/// Save a workflow for the caller. The DAG is validated before it is stored.
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<StoredWorkflow>)> {
    let spec = WorkflowSpec::from_value(req.name.clone(), req.dag.clone())?;
    let graph = ValidatedGraph::validate(spec)?;

    let workflow = StoredWorkflow::new(user_id, req.name, req.dag);
    state.store.save_workflow(&workflow)?;

    tracing::info!(
        "Created workflow: {} ({}, {} nodes)",
        workflow.name,
        workflow.id,
        graph.len()
    );

    Ok((StatusCode::CREATED, Json(workflow)))
}

/// List the caller's workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<Vec<StoredWorkflow>>> {
    Ok(Json(state.store.list_workflows(&user_id)?))
}

/// Get one of the caller's workflows
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<StoredWorkflow>> {
    let workflow_id = parse_workflow_id(&workflow_id)?;

    let workflow = state
        .store
        .load_workflow(&workflow_id)?
        .filter(|w| w.user_id == user_id)
        .ok_or_else(|| ApiError::not_found(format!("workflow {} not found", workflow_id)))?;

    Ok(Json(workflow))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutKeyResponse {
    pub success: bool,
    pub service: String,
}

/// Store an API key for one service, replacing any previous key
pub async fn put_key(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<ApiKeyInput>,
) -> ApiResult<Json<PutKeyResponse>> {
    if req.service.trim().is_empty() {
        return Err(ApiError::bad_request("service must not be empty"));
    }

    let service = req.service.clone();
    state
        .store
        .put_credential(&user_id, CredentialRef::from(req))?;

    Ok(Json(PutKeyResponse {
        success: true,
        service,
    }))
}

/// List the services the caller holds keys for
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<Vec<CredentialInfo>>> {
    Ok(Json(state.store.list_services(&user_id)?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunAccepted {
    pub run_id: RunId,
}

/// Start one of the caller's stored workflows
pub async fn start_stored_run(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(workflow_id): Path<String>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    let workflow_id = parse_workflow_id(&workflow_id)?;
    let run_id = state
        .coordinator
        .start_workflow(&user_id, workflow_id)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InlineRunRequest {
    pub workflow: serde_json::Value,
    #[serde(default, alias = "apiKeys")]
    pub api_keys: Vec<ApiKeyInput>,
}

/// Run a workflow submitted with the request, using only the keys sent with it
pub async fn start_inline_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InlineRunRequest>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    let (spec, credentials) = parse_inline_workflow(req.workflow, req.api_keys)?;
    let run_id = state.coordinator.start_run(spec, credentials).await?;

    Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id })))
}

/// Live status of an active or recently finished run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunState>> {
    let run_id = parse_run_id(&run_id)?;

    let run = state
        .coordinator
        .get_status(run_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("run {} not found", run_id)))?;

    Ok(Json(run))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub run_id: RunId,
    pub message: String,
}

/// Request cancellation of a running run
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    let run_id = parse_run_id(&run_id)?;
    state.coordinator.cancel(run_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            run_id,
            message: "Cancellation requested".to_string(),
        }),
    ))
}

/// Summary of a run, falling back to the persisted copy
pub async fn get_run_summary(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSummary>> {
    let run_id = parse_run_id(&run_id)?;

    let summary = state
        .coordinator
        .run_summary(run_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run {} not found", run_id)))?;

    Ok(Json(summary))
}
