use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::state::AppState;

/// Pull the presented key from `Authorization: Bearer <key>` or `X-API-Key`.
fn presented_key(req: &Request) -> Option<&str> {
    if let Some(bearer) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer);
    }
    req.headers().get("x-api-key").and_then(|v| v.to_str().ok())
}

/// Constant-time membership test over precomputed SHA-256 digests: every
/// configured digest is compared in full regardless of earlier matches.
fn verify_key(presented: &str, accepted: &[[u8; 32]]) -> bool {
    let digest: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
    let mut found = 0u8;
    for candidate in accepted {
        let mut diff = 0u8;
        for (a, b) in candidate.iter().zip(digest.iter()) {
            diff |= a ^ b;
        }
        found |= u8::from(diff == 0);
    }
    found == 1
}

fn reject(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "message": message,
                "type": "authentication_error",
                "code": "invalid_api_key"
            }
        })),
    )
        .into_response()
}

/// Middleware guarding the client surfaces. With no client keys configured
/// the gateway runs open (flagged at startup).
pub async fn client_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.client_key_hashes.is_empty() {
        return next.run(req).await;
    }

    match presented_key(&req) {
        Some(key) if verify_key(key, &state.client_key_hashes) => next.run(req).await,
        _ => reject(
            StatusCode::UNAUTHORIZED,
            "Invalid API key. Use X-API-Key or Authorization: Bearer <key>",
        ),
    }
}

/// Middleware guarding the admin surface. No admin keys configured means the
/// surface is locked out entirely.
pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.admin_key_hashes.is_empty() {
        return reject(StatusCode::FORBIDDEN, "Admin API keys not configured");
    }

    match presented_key(&req) {
        Some(key) if verify_key(key, &state.admin_key_hashes) => next.run(req).await,
        _ => reject(StatusCode::FORBIDDEN, "Invalid admin API key"),
    }
}
