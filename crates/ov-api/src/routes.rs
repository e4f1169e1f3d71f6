//! Route definitions

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::handlers::{
    active_sessions, agent_insights, agent_performance, approve_candidate, costs, detect_patterns,
    dismiss_candidate, evaluate_experiments, health, job_logs, job_status, list_jobs, log_command,
    stop_job, submit_job,
};
use crate::middleware::auth::auth_middleware;
use crate::server::AppState;

/// Create the API router. `/health` stays open; `/api/*` requires the key.
pub fn routes(state: AppState) -> Router<AppState> {
    let api = Router::new()
        // Jobs
        .route("/api/jobs", post(submit_job).get(list_jobs))
        .route("/api/jobs/{id}", get(job_status))
        .route("/api/jobs/{id}/stop", post(stop_job))
        .route("/api/jobs/{id}/logs", get(job_logs))
        // Learning
        .route("/api/experiments/evaluate", post(evaluate_experiments))
        .route("/api/patterns/detect", post(detect_patterns))
        .route("/api/commands", post(log_command))
        .route("/api/candidates/{id}/approve", post(approve_candidate))
        .route("/api/candidates/{id}/dismiss", post(dismiss_candidate))
        // Views
        .route("/api/sessions/active", get(active_sessions))
        .route("/api/agents/performance", get(agent_performance))
        .route("/api/agents/insights", get(agent_insights))
        .route("/api/costs", get(costs))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().route("/health", get(health)).merge(api)
}
