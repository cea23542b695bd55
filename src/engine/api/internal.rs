//! Worker callbacks. Run routes carry the job token minted at dispatch as a
//! bearer token; it must be scoped to the run in the path. Job intake routes
//! carry the shared worker secret instead.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};

use serde::Deserialize;

use crate::AppState;
use crate::engine::queue::JobOutcome;
use crate::engine::runtime::manager::{EffectReport, PlanReport, StatusReport};
use crate::engine::runtime::state_machine::StepReport;
use crate::engine::security::middleware::bearer_token;
use crate::error::{EngineError, Result};

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/runs/{id}/plan", post(persist_plan))
        .route("/runs/{id}/status", post(report_status))
        .route("/runs/{id}/steps/{step_id}", post(report_step))
        .route("/runs/{id}/effects", post(record_effect))
        .route("/jobs/claim", post(claim_jobs))
        .route("/jobs/{job_id}/finish", post(finish_job))
}

const DEFAULT_CLAIM_LIMIT: usize = 10;
const MAX_CLAIM_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
struct ClaimRequest {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FinishRequest {
    outcome: JobOutcome,
}

fn job_token(headers: &HeaderMap) -> Result<&str> {
    bearer_token(headers).ok_or_else(|| EngineError::Unauthorized("missing job token".into()))
}

fn require_worker(state: &AppState, headers: &HeaderMap) -> Result<()> {
    match bearer_token(headers) {
        Some(secret) if secret == state.config.security.worker_secret => Ok(()),
        _ => Err(EngineError::Unauthorized("invalid worker secret".into())),
    }
}

async fn claim_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ClaimRequest>,
) -> Result<impl IntoResponse> {
    require_worker(&state, &headers)?;
    let limit = request.limit.unwrap_or(DEFAULT_CLAIM_LIMIT).clamp(1, MAX_CLAIM_LIMIT);
    let jobs = state.run_manager.claim_jobs(limit).await?;
    Ok(Json(jobs))
}

async fn finish_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<FinishRequest>,
) -> Result<impl IntoResponse> {
    require_worker(&state, &headers)?;
    state.run_manager.finish_job(&job_id, request.outcome).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn persist_plan(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Json(report): Json<PlanReport>,
) -> Result<impl IntoResponse> {
    let token = job_token(&headers)?;
    let run = state.run_manager.persist_plan(token, &run_id, report).await?;
    Ok(Json(run))
}

async fn report_status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Json(report): Json<StatusReport>,
) -> Result<impl IntoResponse> {
    let token = job_token(&headers)?;
    let run = state.run_manager.report_status(token, &run_id, report).await?;
    Ok(Json(run))
}

async fn report_step(
    State(state): State<AppState>,
    Path((run_id, step_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(report): Json<StepReport>,
) -> Result<impl IntoResponse> {
    let token = job_token(&headers)?;
    let step = state
        .run_manager
        .report_step(token, &run_id, &step_id, report)
        .await?;
    Ok(Json(step))
}

async fn record_effect(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Json(report): Json<EffectReport>,
) -> Result<impl IntoResponse> {
    let token = job_token(&headers)?;
    let effect = state.run_manager.record_effect(token, &run_id, report).await?;
    Ok((StatusCode::CREATED, Json(effect)))
}
