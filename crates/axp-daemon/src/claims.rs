//! Verified tenant claims.
//!
//! The fronting authorizer validates the caller's identity and installs a
//! base64url JSON claims payload as the bearer token this service sees.
//! Tenancy and account access are derived ONLY from that payload. Any
//! tenant or account identifier arriving in plain headers or query strings
//! is matched against the claims, never trusted on its own.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use base64::Engine;
use serde::Deserialize;

use crate::api_types::ErrorResponse;

#[derive(Debug, Clone, Deserialize)]
pub struct TenantClaims {
    pub tenant_id: String,
    #[serde(default)]
    pub account_ids: Vec<String>,
}

impl TenantClaims {
    pub fn allows_account(&self, account_id: &str) -> bool {
        self.account_ids.iter().any(|a| a == account_id)
    }
}

fn unauthorized(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for TenantClaims
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("missing Authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("Authorization header is not a bearer token"))?;

        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| unauthorized("malformed claims token"))?;

        let claims: TenantClaims = serde_json::from_slice(&payload)
            .map_err(|_| unauthorized("malformed claims payload"))?;

        if claims.tenant_id.is_empty() {
            return Err(unauthorized("claims missing tenant"));
        }

        Ok(claims)
    }
}
