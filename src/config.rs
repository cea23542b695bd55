use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

/// Prefix for environment overrides, e.g. `ACTIONFLOW_SERVER__PORT=8000`.
pub const ENV_PREFIX: &str = "ACTIONFLOW";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Auto-enroll users into teams they reference
    #[arg(long, env = "AUTO_ENROLL_TEAM_MEMBERS")]
    pub auto_enroll_team_members: Option<bool>,

    /// Serialize dispatches per run
    #[arg(long, env = "SERIALIZE_DISPATCH")]
    pub serialize_dispatch: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub tokens: TokenConfig,
    pub dispatch: DispatchConfig,
    pub bus: BusConfig,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    /// HS256 secret for inbound user JWTs.
    pub jwt_secret: String,
    /// Bearer secret workers present to claim and finish jobs.
    pub worker_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    /// HS256 secret for job tokens handed to workers.
    pub signing_secret: String,
    pub issuer: String,
    pub base_ttl_secs: u64,
    pub default_timezone: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    pub job_name: String,
    pub attempts: u32,
    pub backoff_ms: u64,
    pub keep_completed: usize,
    pub keep_failed: usize,
    pub serialize_per_run: bool,
    /// Longest client-requested dispatch delay.
    pub max_delay_ms: u64,
    /// Jobs the in-memory queue holds, waiting plus active.
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    /// Process identity stamped on published envelopes. Random when unset.
    #[serde(default)]
    pub origin: Option<String>,
    pub local_dedup_ms: u64,
    pub remote_dedup_ms: u64,
    pub ignore_own_origin: bool,
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    /// Create a `member` row when a non-member references an existing team.
    pub auto_enroll_team_members: bool,
}

/// Users loaded into the in-memory store at startup.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SeedConfig {
    #[serde(default)]
    pub users: Vec<SeedUser>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SeedUser {
    pub subject: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        // 1. Defaults
        let mut builder = Self::with_defaults(Config::builder())?;

        // 2. Config file: explicit path, else ./config.yaml when present
        if let Some(path) = cli.config.as_deref() {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
        } else if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::new("config.yaml", FileFormat::Yaml));
        }

        // 3. Environment variables (ACTIONFLOW_SERVER__PORT=8000)
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI flags (and their clap-level env vars) win
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(enroll) = cli.auto_enroll_team_members {
            builder = builder.set_override("policy.auto_enroll_team_members", enroll)?;
        }
        if let Some(serialize) = cli.serialize_dispatch {
            builder = builder.set_override("dispatch.serialize_per_run", serialize)?;
        }

        builder.build()?.try_deserialize()
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        builder
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.request_timeout_secs", 30)?
            .set_default("security.jwt_secret", "change-me")?
            .set_default("security.worker_secret", "change-me-worker")?
            .set_default("tokens.signing_secret", "change-me-too")?
            .set_default("tokens.issuer", "actionflow")?
            .set_default("tokens.base_ttl_secs", 900)?
            .set_default("tokens.default_timezone", "UTC")?
            .set_default("dispatch.job_name", "run")?
            .set_default("dispatch.attempts", 3)?
            .set_default("dispatch.backoff_ms", 5000)?
            .set_default("dispatch.keep_completed", 100)?
            .set_default("dispatch.keep_failed", 500)?
            .set_default("dispatch.serialize_per_run", false)?
            .set_default("dispatch.max_delay_ms", 30 * 24 * 3_600_000_i64)?
            .set_default("dispatch.queue_capacity", 10_000)?
            .set_default("bus.local_dedup_ms", 250)?
            .set_default("bus.remote_dedup_ms", 10_000)?
            .set_default("bus.ignore_own_origin", false)?
            .set_default("bus.max_entries", 10_000)?
            .set_default("policy.auto_enroll_team_members", true)
    }

    /// Defaults only, no file/env/CLI layers. Used by tests and embedders.
    pub fn defaults() -> Result<Self, config::ConfigError> {
        Self::with_defaults(Config::builder())?
            .build()?
            .try_deserialize()
    }
}
