//! API-key authentication middleware and key utilities.
//!
//! Producers authenticate with an opaque key in the `x-api-key` header.
//! Keys are never stored raw: the credential store indexes SHA-256 hashes,
//! and this middleware hashes the presented key before lookup. A key that
//! is unknown, revoked or expired is rejected with `INVALID_API_KEY`
//! without distinguishing which, so probing reveals nothing.
//!
//! On success the credential's `user_id` is attached to the request as
//! [`SourceUser`] and becomes the event's audit identity.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Literal prefix of every issued API key.
pub const API_KEY_PREFIX: &str = "evp_";

/// The authenticated key owner, injected into request extensions.
#[derive(Debug, Clone)]
pub struct SourceUser(pub String);

/// SHA-256 of a raw API key, lowercase hex (the credential-store index).
pub fn hash_api_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

/// Generate a fresh API key: `evp_` + 32 random bytes, base64url, no pad.
pub fn generate_api_key() -> String {
    let raw: [u8; 32] = rand::random();
    format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw))
}

/// Middleware that requires a valid API key for all requests.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(raw_key) = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    else {
        tracing::debug!("request without api key");
        return Err(ApiError::MissingApiKey);
    };

    let hash = hash_api_key(raw_key);
    let credential = state
        .credentials
        .lookup_by_hash(&hash)
        .await
        .map_err(|err| ApiError::Ingestion(format!("credential store: {err}")))?;

    match credential {
        Some(credential) if credential.is_active(Utc::now()) => {
            request
                .extensions_mut()
                .insert(SourceUser(credential.user_id));
            Ok(next.run(request).await)
        }
        Some(_) => {
            tracing::debug!("revoked or expired api key");
            Err(ApiError::InvalidApiKey)
        }
        None => {
            tracing::debug!("unknown api key");
            Err(ApiError::InvalidApiKey)
        }
    }
}
