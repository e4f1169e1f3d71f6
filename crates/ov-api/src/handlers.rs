//! HTTP API handlers

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ov_core::store::{
    ActiveSessionRow, Agent, AgentPerformanceRow, AutomationCandidate, UserCommand,
};
use ov_core::{AgentInsight, ExperimentEvaluation};
use ov_supervisor::{CostReport, JobHandle, JobRequest, JobStatus, PatternScan, Submission};

use crate::error::{ApiError, Result};
use crate::server::AppState;

const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 5_000;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub job_id: String,
    /// None when the job produced no output
    pub logs: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub job_id: String,
    /// False when the job had already finished or was already stopping
    pub stopped: bool,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub team: String,
}

#[derive(Debug, Serialize)]
pub struct ApprovalResponse {
    pub candidate: AutomationCandidate,
    pub agent: Agent,
}

// ============================================================================
// Handler functions
// ============================================================================

pub async fn health() -> &'static str {
    "OK"
}

pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> Result<(StatusCode, Json<Submission>)> {
    debug!("Job submission: {:?}", req);
    let submission = state.plane.submit(req).await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobHandle>>> {
    Ok(Json(state.plane.list_jobs().await?))
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatus>> {
    Ok(Json(state.plane.status(&job_id).await?))
}

pub async fn stop_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<StopResponse>> {
    // unknown ids are a 404 rather than a quiet false
    state.plane.status(&job_id).await?;
    let stopped = state.plane.stop(&job_id).await?;
    info!(job_id = %job_id, stopped, "Stop requested over HTTP");
    Ok(Json(StopResponse { job_id, stopped }))
}

pub async fn job_logs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>> {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    if lines == 0 || lines > MAX_LOG_LINES {
        return Err(ApiError::InvalidRequest(format!(
            "lines must be between 1 and {}",
            MAX_LOG_LINES
        )));
    }
    let logs = state.plane.logs(&job_id, lines).await?;
    Ok(Json(LogsResponse { job_id, logs }))
}

pub async fn evaluate_experiments(
    State(state): State<AppState>,
) -> Result<Json<Vec<ExperimentEvaluation>>> {
    Ok(Json(state.plane.evaluate_experiments()?))
}

pub async fn detect_patterns(State(state): State<AppState>) -> Result<Json<PatternScan>> {
    Ok(Json(state.plane.run_pattern_detection()?))
}

pub async fn log_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<(StatusCode, Json<UserCommand>)> {
    let command = state.plane.log_command(&req.command)?;
    Ok((StatusCode::CREATED, Json(command)))
}

pub async fn approve_candidate(
    State(state): State<AppState>,
    Path(candidate_id): Path<i64>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<ApprovalResponse>> {
    let (candidate, agent) = state.plane.approve_candidate(candidate_id, &req.team)?;
    info!(candidate_id, agent = %agent.name, "Automation candidate approved");
    Ok(Json(ApprovalResponse { candidate, agent }))
}

pub async fn dismiss_candidate(
    State(state): State<AppState>,
    Path(candidate_id): Path<i64>,
) -> Result<Json<AutomationCandidate>> {
    Ok(Json(state.plane.dismiss_candidate(candidate_id)?))
}

pub async fn active_sessions(State(state): State<AppState>) -> Result<Json<Vec<ActiveSessionRow>>> {
    Ok(Json(state.plane.active_sessions()?))
}

pub async fn agent_performance(
    State(state): State<AppState>,
) -> Result<Json<Vec<AgentPerformanceRow>>> {
    Ok(Json(state.plane.agent_performance()?))
}

pub async fn agent_insights(State(state): State<AppState>) -> Result<Json<Vec<AgentInsight>>> {
    Ok(Json(state.plane.agent_insights()?))
}

pub async fn costs(State(state): State<AppState>) -> Result<Json<CostReport>> {
    Ok(Json(state.plane.costs()?))
}
