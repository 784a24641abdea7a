//! OpenAI-compatible surface: model listing and chat completions, buffered
//! (optionally cached) or streamed as SSE.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::models::gemini::GenerateContentResponse;
use crate::models::openai::{ChatCompletionRequest, ModelEntry, ModelList};
use crate::services::dispatcher::Dispatched;
use crate::services::translate::{self, StreamTranslator};
use crate::services::upstream::UpstreamError;
use crate::services::cache;
use crate::state::AppState;

/// GET /v1/models — static list derived from the configured model mapping.
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let created = translate::unix_now();
    let mut ids: Vec<&String> = state.config.model_mapping.keys().collect();
    ids.sort();

    Json(ModelList {
        object: "list".to_string(),
        data: ids
            .into_iter()
            .map(|id| ModelEntry {
                id: id.clone(),
                object: "model".to_string(),
                created,
                owned_by: "openai-emulated".to_string(),
            })
            .collect(),
    })
}

/// POST /v1/chat/completions
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let req: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Validation(format!("invalid request body: {e}")))?;
    if req.model.is_empty() {
        return Err(GatewayError::Validation("\"model\" is required".to_string()));
    }
    if req.messages.is_empty() {
        return Err(GatewayError::Validation(
            "\"messages\" must not be empty".to_string(),
        ));
    }

    let model = translate::resolve_model(&state.config, &req.model);
    let native = translate::openai_to_native(&req)?;
    let native_body =
        serde_json::to_value(&native).map_err(|e| GatewayError::Internal(e.to_string()))?;
    let deadline = Instant::now() + state.config.overall_deadline;

    if req.stream {
        return stream_chat(&state, &req.model, &model, &native_body, deadline).await;
    }

    let artifact = if state.cache.enabled() && cache::cacheable(&req) {
        let fingerprint = cache::fingerprint(&req, &model);
        state
            .cache
            .get_or_compute(&fingerprint, || {
                dispatch_buffered(&state, &model, &native_body, &req.model, deadline)
            })
            .await?
    } else {
        dispatch_buffered(&state, &model, &native_body, &req.model, deadline).await?
    };

    Ok(Json(artifact).into_response())
}

/// Dispatch one buffered completion and translate it back to OpenAI shape.
async fn dispatch_buffered(
    state: &AppState,
    model: &str,
    native_body: &Value,
    requested_model: &str,
    deadline: Instant,
) -> Result<Value, GatewayError> {
    let Dispatched { key_id, response } =
        state.dispatcher.execute(model, native_body, deadline).await?;
    debug!(key = %key_id, model, "chat completion served");

    let native: GenerateContentResponse = serde_json::from_value(response)
        .map_err(|e| GatewayError::Internal(format!("unexpected upstream response shape: {e}")))?;
    let completion = translate::native_to_openai(&native, requested_model);
    serde_json::to_value(completion).map_err(|e| GatewayError::Internal(e.to_string()))
}

fn sse_frame<T: Serialize>(payload: &T) -> Bytes {
    let json = serde_json::to_string(payload).unwrap_or_default();
    Bytes::from(format!("data: {json}\n\n"))
}

fn sse_error_frame(err: &UpstreamError) -> Bytes {
    let payload = json!({
        "error": {
            "message": err.to_string(),
            "type": "upstream_error",
            "code": "stream_interrupted"
        }
    });
    Bytes::from(format!("data: {payload}\n\n"))
}

const SSE_DONE: &str = "data: [DONE]\n\n";

/// Dispatch a streaming completion and pipe translated chunks to the client.
/// The channel is small on purpose: a slow reader back-pressures the
/// upstream read loop instead of buffering the stream.
async fn stream_chat(
    state: &AppState,
    requested_model: &str,
    model: &str,
    native_body: &Value,
    deadline: Instant,
) -> Result<Response, GatewayError> {
    let Dispatched {
        key_id,
        response: mut native_stream,
    } = state
        .dispatcher
        .execute_stream(model, native_body, deadline)
        .await?;
    debug!(key = %key_id, model, "chat completion stream committed");

    let mut translator = StreamTranslator::new(requested_model);
    let (tx, rx) = mpsc::channel::<Bytes>(8);

    tokio::spawn(async move {
        while let Some(item) = native_stream.next().await {
            match item {
                Ok(value) => {
                    let chunk: GenerateContentResponse = match serde_json::from_value(value) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!("skipping malformed upstream chunk: {e}");
                            continue;
                        }
                    };
                    for out in translator.on_chunk(&chunk) {
                        if tx.send(sse_frame(&out)).await.is_err() {
                            // Client went away; dropping the stream aborts
                            // the upstream request.
                            return;
                        }
                    }
                    if translator.is_finished() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(key = %key_id, "stream failed after commit: {err}");
                    let _ = tx.send(sse_error_frame(&err)).await;
                    let _ = tx.send(Bytes::from(SSE_DONE)).await;
                    return;
                }
            }
        }

        if let Some(fin) = translator.finish() {
            if tx.send(sse_frame(&fin)).await.is_err() {
                return;
            }
        }
        let _ = tx.send(Bytes::from(SSE_DONE)).await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let response = Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(response)
}

/// Build the OpenAI-surface router (to be nested under /v1).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/chat/completions", post(chat_completions))
}
