//! Native Gemini surface: request bodies and responses pass through the
//! gateway verbatim; only key rotation and retry sit in between.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{Path, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::GatewayError;
use crate::models::gemini::{NativeModel, NativeModelList};
use crate::services::cache;
use crate::services::dispatcher::Dispatched;
use crate::state::AppState;

/// GET /gemini/health — liveness for the native surface.
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
            "keys": counts,
        })),
    )
        .into_response()
}

/// GET /gemini/v1beta/models — upstream model names known to the gateway.
async fn list_models(State(state): State<Arc<AppState>>) -> Json<NativeModelList> {
    let mut names: Vec<&String> = state.config.model_mapping.values().collect();
    names.push(&state.config.default_upstream_model);
    names.sort();
    names.dedup();

    Json(NativeModelList {
        models: names
            .into_iter()
            .map(|name| NativeModel {
                name: format!("models/{name}"),
                supported_generation_methods: vec![
                    "generateContent".to_string(),
                    "streamGenerateContent".to_string(),
                ],
            })
            .collect(),
    })
}

/// Validation mirroring the upstream contract, applied before any credential
/// is consumed. Works on the raw payload so unknown fields survive untouched.
fn validate_request(body: &Value) -> Result<(), GatewayError> {
    let invalid = |msg: &str| Err(GatewayError::Validation(msg.to_string()));

    let Some(contents) = body.get("contents").and_then(|c| c.as_array()) else {
        return invalid("\"contents\" must be a non-empty array");
    };
    if contents.is_empty() {
        return invalid("\"contents\" must be a non-empty array");
    }
    for (i, content) in contents.iter().enumerate() {
        let parts = content.get("parts").and_then(|p| p.as_array());
        if parts.is_none_or(|p| p.is_empty()) {
            return Err(GatewayError::Validation(format!(
                "contents[{i}].parts must be a non-empty array"
            )));
        }
        if let Some(role) = content.get("role").and_then(|r| r.as_str()) {
            if role != "user" && role != "model" {
                return Err(GatewayError::Validation(format!(
                    "contents[{i}].role must be \"user\" or \"model\""
                )));
            }
        }
    }

    if let Some(config) = body.get("generationConfig") {
        if let Some(t) = config.get("temperature").and_then(|v| v.as_f64()) {
            if !(0.0..=2.0).contains(&t) {
                return invalid("temperature must be between 0.0 and 2.0");
            }
        }
        if let Some(p) = config.get("topP").and_then(|v| v.as_f64()) {
            if !(0.0..=1.0).contains(&p) {
                return invalid("topP must be between 0.0 and 1.0");
            }
        }
        if let Some(m) = config.get("maxOutputTokens").and_then(|v| v.as_i64()) {
            if m <= 0 {
                return invalid("maxOutputTokens must be positive");
            }
        }
        if let Some(c) = config.get("candidateCount").and_then(|v| v.as_i64()) {
            if !(1..=8).contains(&c) {
                return invalid("candidateCount must be between 1 and 8");
            }
        }
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        for (i, tool) in tools.iter().enumerate() {
            if tool.get("functionDeclarations").is_none() {
                return Err(GatewayError::Validation(format!(
                    "tools[{i}] must carry functionDeclarations"
                )));
            }
        }
    }

    Ok(())
}

/// POST /gemini/v1beta/models/{model}:{action}
///
/// Axum cannot split the `{model}:action` segment, so the route captures the
/// whole tail and splits on the colon here.
async fn generate(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let (model, action) = match model_action.split_once(':') {
        Some(pair) => pair,
        None => return Err(GatewayError::NotFound(format!("\"{model_action}\""))),
    };
    if model.is_empty() {
        return Err(GatewayError::Validation("model name is required".to_string()));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Validation(format!("invalid request body: {e}")))?;
    validate_request(&payload)?;

    let deadline = Instant::now() + state.config.overall_deadline;
    match action {
        "generateContent" => generate_buffered(&state, model, &payload, deadline).await,
        "streamGenerateContent" => {
            generate_streamed(&state, model, query.as_deref(), &payload, deadline).await
        }
        _ => Err(GatewayError::NotFound(format!("action \"{action}\""))),
    }
}

async fn generate_buffered(
    state: &AppState,
    model: &str,
    payload: &Value,
    deadline: Instant,
) -> Result<Response, GatewayError> {
    let compute = || async {
        let Dispatched { key_id, response } =
            state.dispatcher.execute(model, payload, deadline).await?;
        debug!(key = %key_id, model, "generateContent served");
        Ok(response)
    };

    let response = if state.cache.enabled() && cache::cacheable_native(payload) {
        let fingerprint = cache::fingerprint_native(payload, model);
        state.cache.get_or_compute(&fingerprint, compute).await?
    } else {
        compute().await?
    };

    Ok(Json(response).into_response())
}

async fn generate_streamed(
    state: &AppState,
    model: &str,
    query: Option<&str>,
    payload: &Value,
    deadline: Instant,
) -> Result<Response, GatewayError> {
    let Dispatched {
        key_id,
        response: (content_type, upstream),
    } = state
        .dispatcher
        .execute_stream_raw(model, query, payload, deadline)
        .await?;
    debug!(key = %key_id, model, "streamGenerateContent committed");

    // Chunks flow through untouched; a mid-stream failure simply truncates
    // the body, exactly as it would have from the upstream directly.
    let bytes = upstream.filter_map(|item| async move {
        match item {
            Ok(chunk) => Some(Ok::<_, Infallible>(chunk)),
            Err(err) => {
                tracing::warn!("native stream failed after commit: {err}");
                None
            }
        }
    });

    let response = Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(bytes))
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(response)
}

/// Build the native-surface router (to be nested under /gemini/v1beta).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/{*model_action}", post(generate))
}
