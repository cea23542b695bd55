use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::TokenConfig;
use crate::error::{EngineError, Result};

/// Scope every dispatched job carries.
pub const RUNS_EXECUTE_SCOPE: &str = "runs:execute";

/// Claims of a scoped, short-lived job token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobTokenClaims {
    pub sub: String,
    pub run_id: String,
    pub user_id: i64,
    #[serde(default)]
    pub team_id: Option<i64>,
    pub scopes: BTreeSet<String>,
    pub trace_id: String,
    pub tz: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
}

impl JobTokenClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

/// Everything a token is minted from.
#[derive(Debug, Clone)]
pub struct MintParams {
    pub run_id: String,
    pub user_sub: String,
    pub user_id: i64,
    pub team_id: Option<i64>,
    pub scopes: BTreeSet<String>,
    pub trace_id: String,
    pub meta: Map<String, Value>,
    /// Stored user preference, consulted when `meta.tz` is absent.
    pub user_timezone: Option<String>,
    pub dispatch_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: JobTokenClaims,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenIssuer {
    config: TokenConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.config.issuer)
            .field("base_ttl_secs", &self.config.base_ttl_secs)
            .finish_non_exhaustive()
    }
}

/// Base TTL plus the dispatch delay rounded up to whole seconds, so a
/// delayed job's token is still valid when the job starts.
pub fn expires_in_seconds(base_ttl_secs: u64, dispatch_delay_ms: u64) -> u64 {
    base_ttl_secs.saturating_add(dispatch_delay_ms.div_ceil(1000))
}

impl TokenIssuer {
    pub fn new(config: TokenConfig) -> Self {
        let secret = config.signing_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            config,
        }
    }

    pub fn default_timezone(&self) -> &str {
        &self.config.default_timezone
    }

    /// `meta.tz`, then the stored preference, then the configured fallback.
    pub fn resolve_timezone(&self, meta: &Map<String, Value>, user_timezone: Option<&str>) -> String {
        meta.get("tz")
            .and_then(Value::as_str)
            .filter(|tz| !tz.is_empty())
            .or(user_timezone.filter(|tz| !tz.is_empty()))
            .unwrap_or(&self.config.default_timezone)
            .to_string()
    }

    pub fn mint(&self, params: MintParams) -> Result<IssuedToken> {
        let now = Utc::now();
        let ttl = expires_in_seconds(self.config.base_ttl_secs, params.dispatch_delay_ms);
        let expires_at = i64::try_from(ttl)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| {
                EngineError::BadRequest(format!(
                    "dispatch delay of {} ms puts token expiry out of range",
                    params.dispatch_delay_ms
                ))
            })?;
        let tz = self.resolve_timezone(&params.meta, params.user_timezone.as_deref());

        let claims = JobTokenClaims {
            sub: params.user_sub,
            run_id: params.run_id,
            user_id: params.user_id,
            team_id: params.team_id,
            scopes: params.scopes,
            trace_id: params.trace_id,
            tz,
            meta: params.meta,
            iss: self.config.issuer.clone(),
            iat: unix_seconds(now),
            exp: unix_seconds(expires_at),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| EngineError::Internal(anyhow::Error::new(e).context("token encoding")))?;

        Ok(IssuedToken {
            token,
            claims,
            expires_at,
        })
    }

    /// Decode a job token presented by a worker.
    pub fn verify(&self, token: &str) -> Result<JobTokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        decode::<JobTokenClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| EngineError::Unauthorized(format!("invalid job token: {e}")))
    }

    /// Verify and require the token to be scoped to `run_id` with
    /// `runs:execute`.
    pub fn verify_for_run(&self, token: &str, run_id: &str) -> Result<JobTokenClaims> {
        let claims = self.verify(token)?;
        if claims.run_id != run_id {
            return Err(EngineError::Forbidden(format!(
                "job token is scoped to run `{}`, not `{run_id}`",
                claims.run_id
            )));
        }
        if !claims.has_scope(RUNS_EXECUTE_SCOPE) {
            return Err(EngineError::Forbidden(format!(
                "job token lacks `{RUNS_EXECUTE_SCOPE}`"
            )));
        }
        Ok(claims)
    }
}

fn unix_seconds(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp()).unwrap_or_default()
}
