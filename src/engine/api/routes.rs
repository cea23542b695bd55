use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::internal;
use super::sse::build_sse_response;
use crate::AppState;
use crate::engine::runtime::manager::CreateRunRequest;
use crate::engine::security::claims::UserClaims;
use crate::engine::security::middleware::auth_middleware;
use crate::error::Result;

/// Full router: user API behind the JWT middleware, worker callbacks behind
/// job tokens, plus health and metrics.
pub fn build_router(state: AppState) -> Router<AppState> {
    let api = Router::new()
        .route("/runs", post(create_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/steps", get(list_steps))
        .route("/runs/{id}/approve", post(approve_run))
        .route("/runs/{id}/answers", post(submit_answers))
        .route("/runs/{id}/undo", post(undo_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/credentials/refresh", post(refresh_credentials))
        .route("/runs/{id}/chat-item", get(get_chat_item))
        .route("/runs/{id}/stream", get(stream_run))
        .route("/queue/counts", get(queue_counts))
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .nest("/api", api)
        .nest("/internal", internal::build_router())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveRequest {
    #[serde(default)]
    approved_steps: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AnswersRequest {
    answers: Map<String, Value>,
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn create_run(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse> {
    let run = state.run_manager.create_run(&claims, req).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.run_manager.get_run(&claims, &run_id).await?))
}

async fn list_steps(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.run_manager.list_steps(&claims, &run_id).await?))
}

async fn approve_run(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    Path(run_id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> Result<impl IntoResponse> {
    let run = state
        .run_manager
        .approve(&claims, &run_id, req.approved_steps)
        .await?;
    Ok(Json(run))
}

async fn submit_answers(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    Path(run_id): Path<String>,
    Json(req): Json<AnswersRequest>,
) -> Result<impl IntoResponse> {
    let run = state
        .run_manager
        .submit_answers(&claims, &run_id, req.answers)
        .await?;
    Ok(Json(run))
}

async fn undo_run(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.run_manager.undo(&claims, &run_id).await?))
}

async fn cancel_run(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.run_manager.cancel(&claims, &run_id).await?))
}

async fn refresh_credentials(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse> {
    let report = state
        .run_manager
        .refresh_credentials(&claims, &run_id)
        .await?;
    Ok(Json(report))
}

async fn get_chat_item(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.run_manager.chat_item(&claims, &run_id).await?))
}

async fn stream_run(
    State(state): State<AppState>,
    Extension(claims): Extension<UserClaims>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse> {
    let stream = state.run_manager.subscribe(&claims, &run_id).await?;
    Ok(build_sse_response(stream))
}

async fn queue_counts(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.run_manager.queue_counts().await?))
}
