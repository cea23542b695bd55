//! actionflow
//!
//! Orchestrates user-initiated agent runs: each run moves through a guarded
//! lifecycle, is handed to background workers as idempotent jobs carrying
//! short-lived scoped tokens, and streams its progress to subscribers.
//!
//! # Modules
//!
//! - [`engine`]: run state machine, dispatcher, tokens, policy, event bus,
//!   credential resolver and undo ledger
//! - [`config`]: layered configuration (defaults, file, env, CLI)
//! - [`server`]: HTTP surface and process wiring
//! - [`telemetry`]: logging setup

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod telemetry;

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::AppConfig;
use crate::engine::runtime::manager::RunManager;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Run lifecycle facade.
    pub run_manager: Arc<RunManager>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
    /// Prometheus render handle, absent when no recorder was installed.
    pub metrics: Option<PrometheusHandle>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
