//! actionflow server entry point.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use actionflow::{config::AppConfig, server, telemetry};
use dotenvy::dotenv;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present) before reading env-backed config
    let _ = dotenv();

    telemetry::init();

    let config = Arc::new(AppConfig::load()?);
    tracing::info!(
        name: "config.loaded",
        port = config.server.port,
        serialize_dispatch = config.dispatch.serialize_per_run,
        "Configuration loaded"
    );

    server::start_server(config).await
}
