use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{DecodingKey, Validation, decode};

use super::claims::UserClaims;
use crate::AppState;
use crate::error::EngineError;

/// Pull the bearer token out of an `Authorization` header value.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authenticates end-user requests. There is no anonymous fallback: a
/// missing or invalid token is a 401.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()) else {
        return EngineError::Unauthorized("missing bearer token".into()).into_response();
    };

    let key = DecodingKey::from_secret(state.config.security.jwt_secret.as_bytes());
    match decode::<UserClaims>(token, &key, &Validation::default()) {
        Ok(token_data) => {
            request.extensions_mut().insert(token_data.claims);
            next.run(request).await
        }
        Err(e) => {
            tracing::debug!(error = %e, "rejected user token");
            EngineError::Unauthorized("invalid bearer token".into()).into_response()
        }
    }
}
