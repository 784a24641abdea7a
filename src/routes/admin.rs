//! Credential administration, cache control and observability endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::services::translate::unix_now;
use crate::state::AppState;

/// GET /health — liveness plus key availability, 503 when nothing is Active.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let counts = state.pool.counts();
    let healthy = counts.active > 0;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "timestamp": unix_now(),
            "keys": counts,
        })),
    )
        .into_response()
}

/// GET /stats — pool snapshot, cache counters and uptime.
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "timestamp": unix_now(),
        "uptime_s": state.started_at.elapsed().as_secs(),
        "keys": {
            "counts": state.pool.counts(),
            "detail": state.pool.snapshot(),
        },
        "cache": state.cache.stats(),
    }))
}

// ── Key administration ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AddKeyRequest {
    key: String,
}

/// GET /admin/keys — per-key state, counters and remaining cooldown.
async fn list_keys(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "timestamp": unix_now(),
        "keys": state.pool.snapshot(),
        "counts": state.pool.counts(),
    }))
}

/// POST /admin/keys — register a new upstream key at runtime.
async fn add_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddKeyRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    if body.key.trim().is_empty() {
        return Err(GatewayError::Validation("\"key\" is required".to_string()));
    }
    let Some(id) = state.pool.add(body.key.trim()) else {
        return Err(GatewayError::Validation(
            "key is already registered".to_string(),
        ));
    };
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// DELETE /admin/keys/{id}
async fn remove_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    if state.pool.remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::NotFound(format!("key \"{id}\"")))
    }
}

/// POST /admin/keys/{id}/disable — withdraw a key from selection.
async fn disable_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    mutate_key(&state, &id, |s, id| s.pool.disable(id))
}

/// POST /admin/keys/{id}/enable
async fn enable_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    mutate_key(&state, &id, |s, id| s.pool.enable(id))
}

/// POST /admin/keys/{id}/reset — back to Active; counters preserved,
/// failure streak and cooldown cleared.
async fn reset_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    mutate_key(&state, &id, |s, id| s.pool.reset(id))
}

fn mutate_key(
    state: &AppState,
    id: &str,
    op: impl Fn(&AppState, &str) -> bool,
) -> Result<Json<serde_json::Value>, GatewayError> {
    if !op(state, id) {
        return Err(GatewayError::NotFound(format!("key \"{id}\"")));
    }
    let snapshot = state.pool.snapshot().into_iter().find(|k| k.id == id);
    Ok(Json(json!({ "key": snapshot })))
}

/// POST /admin/cache/clear
async fn clear_cache(State(state): State<Arc<AppState>>) -> StatusCode {
    state.cache.invalidate_all();
    StatusCode::NO_CONTENT
}

/// Build the admin router (to be nested under /admin).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/keys", get(list_keys).post(add_key))
        .route("/keys/{id}", delete(remove_key))
        .route("/keys/{id}/enable", post(enable_key))
        .route("/keys/{id}/disable", post(disable_key))
        .route("/keys/{id}/reset", post(reset_key))
        .route("/cache/clear", post(clear_cache))
}
