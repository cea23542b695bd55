use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::config::{AppConfig, SeedConfig};
use crate::engine::api;
use crate::engine::domain::identity::User;
use crate::engine::persistence::providers::memory::MemoryStore;
use crate::engine::queue::memory::MemoryQueue;
use crate::engine::runtime::manager::RunManager;
use crate::engine::tools::ToolRegistry;

const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

/// Routes plus the cross-cutting layers: body limit, request timeout, tracing.
pub fn build_app(state: AppState) -> Router {
    let timeout_duration = Duration::from_secs(state.config.server.request_timeout_secs);

    api::build_router(state.clone())
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| async move {
                match tokio::time::timeout(timeout_duration, next.run(req)).await {
                    Ok(res) => res,
                    Err(_) => (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response(),
                }
            },
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Load configured users into a fresh in-memory store.
pub async fn seed_store(store: &MemoryStore, seed: &SeedConfig) {
    for (index, user) in seed.users.iter().enumerate() {
        store
            .insert_user(User {
                id: index as i64 + 1,
                subject: user.subject.clone(),
                email: user.email.clone(),
                timezone: user.timezone.clone(),
            })
            .await;
    }
    if !seed.users.is_empty() {
        info!(users = seed.users.len(), "seed users loaded");
    }
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    seed_store(&store, &config.seed).await;
    let queue = Arc::new(MemoryQueue::with_capacity(config.dispatch.queue_capacity));

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder not installed");
            None
        }
    };

    let run_manager = Arc::new(RunManager::new(&config, store, queue, ToolRegistry::new()));
    info!(
        name: "bus.ready",
        origin = %run_manager.bus().origin(),
        "Event bus ready"
    );

    let state = AppState {
        run_manager,
        config: Arc::clone(&config),
        metrics,
    };
    let app = build_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
