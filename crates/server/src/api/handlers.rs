use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use dsflow_core::{
    events::{Event, EventLog},
    storage::WorkflowStore,
    workflow::{preview_order, PlanEntry},
    Edge, ProjectId, RunId, RunReport, Step, WorkflowDefinition, WorkflowId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// One node as produced by the authoring canvas
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub input: Value,
}

fn to_steps(workflow_id: &WorkflowId, nodes: Vec<NodeSpec>) -> ApiResult<Vec<Step>> {
    let mut names = HashSet::new();
    let mut ids = HashSet::new();
    let mut steps = Vec::with_capacity(nodes.len());

    for node in nodes {
        if !names.insert(node.name.clone()) {
            return Err(ApiError::unprocessable(format!(
                "duplicate step name '{}'",
                node.name
            )));
        }
        let id = node
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !ids.insert(id.clone()) {
            return Err(ApiError::unprocessable(format!("duplicate step id '{}'", id)));
        }
        steps.push(Step::new(
            id,
            node.name,
            workflow_id.clone(),
            node.step_type,
            node.input,
        ));
    }

    Ok(steps)
}

fn parse_run_id(raw: &str) -> ApiResult<RunId> {
    raw.parse::<uuid::Uuid>()
        .map(RunId)
        .map_err(|_| ApiError::bad_request(format!("Invalid run ID: {}", raw)))
}

/// Save (or replace) an authored workflow
pub async fn save_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveWorkflowRequest>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let id = WorkflowId::new(
        req.id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    );
    let workflow = WorkflowDefinition {
        steps: to_steps(&id, req.nodes)?,
        id,
        project_id: ProjectId::new(req.project_id),
        name: req.name,
        edges: req.edges,
    };

    state.store.save_workflow(&workflow)?;
    tracing::info!(
        "Saved workflow: {} ({} steps, {} edges)",
        workflow.id,
        workflow.steps.len(),
        workflow.edges.len()
    );

    Ok(Json(workflow))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveWorkflowRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub project_id: String,
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Get a stored workflow
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let workflow = state
        .store
        .load_workflow(&WorkflowId::new(workflow_id.clone()))?
        .ok_or_else(|| ApiError::not_found(format!("Workflow not found: {}", workflow_id)))?;

    Ok(Json(workflow))
}

/// Execution order for an unsaved graph
pub async fn preview_workflow(
    Json(req): Json<PreviewRequest>,
) -> ApiResult<Json<PreviewResponse>> {
    let steps = to_steps(&WorkflowId::new("preview"), req.nodes)?;
    let order = preview_order(&steps, &req.edges)?;
    Ok(Json(PreviewResponse { order }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub order: Vec<PlanEntry>,
}

/// Start a run of a stored workflow in the background
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<(StatusCode, Json<StartRunResponse>)> {
    let run_id = state
        .orchestrator
        .submit(&WorkflowId::new(workflow_id))
        .await?;

    tracing::info!("Started workflow execution: run_id={}", run_id);

    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { run_id })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub run_id: RunId,
}

/// List all runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListRunsResponse>> {
    let runs = state.store.list_runs()?;
    Ok(Json(ListRunsResponse { runs }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunReport>,
}

/// Get a specific run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunReport>> {
    let run_id = parse_run_id(&run_id)?;

    let run = state
        .store
        .get_run(&run_id)?
        .ok_or_else(|| ApiError::not_found(format!("Run not found: {}", run_id)))?;

    Ok(Json(run))
}

/// Get events for a run
pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunEventsResponse>> {
    let run_id = parse_run_id(&run_id)?;

    let events = state.event_log.get_run_events(run_id).await?;

    Ok(Json(GetRunEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRunEventsResponse {
    pub events: Vec<Event>,
}

/// Cancel a running workflow at its next layer boundary
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<StatusCode> {
    let run_id = parse_run_id(&run_id)?;
    state.orchestrator.cancel(run_id).await?;
    Ok(StatusCode::ACCEPTED)
}
