//! One HTTP round-trip against the Gemini API: URL construction, key
//! attachment, response classification, and streaming bodies (parsed SSE
//! chunks for the translated surface, raw bytes for the pass-through).

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::header;
use serde_json::Value;

use crate::config::Config;
use crate::error::FailureKind;

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream attempt timed out")]
    Timeout,
}

/// What the dispatcher should do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Cool the key and try the next one.
    Retryable(FailureKind),
    /// Request-level error; surface verbatim, no retry, no cooling.
    BadRequest(String),
    /// Unknown model; surface as 404, no retry, no cooling.
    ModelNotFound(String),
}

pub fn classify(err: &UpstreamError) -> Classification {
    match err {
        UpstreamError::Timeout | UpstreamError::Transport(_) => {
            Classification::Retryable(FailureKind::TransientUpstream)
        }
        UpstreamError::Status { status, body } => {
            let lower = body.to_lowercase();
            if lower.contains("resource_exhausted") || lower.contains("quota") {
                return Classification::Retryable(FailureKind::QuotaExceeded);
            }
            match *status {
                429 => Classification::Retryable(FailureKind::QuotaExceeded),
                401 | 403 => Classification::Retryable(FailureKind::AuthRejected),
                404 => Classification::ModelNotFound(body.clone()),
                400 => Classification::BadRequest(body.clone()),
                _ => Classification::Retryable(FailureKind::TransientUpstream),
            }
        }
    }
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

impl UpstreamClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if let Some(proxy) = &config.outbound_proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
            base_url: config.upstream_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn transport(err: reqwest::Error) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }

    /// Turn a non-2xx response into `UpstreamError::Status` with a body excerpt.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(512).collect();
        Err(UpstreamError::Status {
            status: status.as_u16(),
            body: excerpt,
        })
    }

    fn request(&self, url: &str, body: &Value, secret: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header("x-goog-api-key", secret)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
    }

    /// Buffered `generateContent` call. The response JSON is returned
    /// untouched so the native surface stays verbatim.
    pub async fn generate(
        &self,
        model: &str,
        body: &Value,
        secret: &str,
        timeout: Duration,
    ) -> Result<Value, UpstreamError> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let resp = self
            .request(&url, body, secret)
            .timeout(timeout)
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check_status(resp)
            .await?
            .json::<Value>()
            .await
            .map_err(Self::transport)
    }

    /// Streaming `streamGenerateContent` call with SSE framing requested.
    /// Yields one parsed JSON chunk per upstream event, in order.
    pub async fn stream(
        &self,
        model: &str,
        body: &Value,
        secret: &str,
    ) -> Result<BoxStream<'static, Result<Value, UpstreamError>>, UpstreamError> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let resp = self
            .request(&url, body, secret)
            .send()
            .await
            .map_err(Self::transport)?;
        let resp = Self::check_status(resp).await?;
        Ok(SseJsonStream::new(Box::pin(resp.bytes_stream())).boxed())
    }

    /// Streaming call forwarded bit-for-bit: the caller's query string is
    /// preserved and the upstream body bytes and content type are returned
    /// untouched, whatever framing the upstream chose.
    pub async fn stream_raw(
        &self,
        model: &str,
        query: Option<&str>,
        body: &Value,
        secret: &str,
    ) -> Result<(String, BoxStream<'static, Result<Bytes, UpstreamError>>), UpstreamError> {
        let mut url = format!(
            "{}/v1beta/models/{}:streamGenerateContent",
            self.base_url, model
        );
        if let Some(q) = query {
            url.push('?');
            url.push_str(q);
        }
        let resp = self
            .request(&url, body, secret)
            .send()
            .await
            .map_err(Self::transport)?;
        let resp = Self::check_status(resp).await?;
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let bytes = resp.bytes_stream().map(|r| r.map_err(Self::transport));
        Ok((content_type, bytes.boxed()))
    }
}

// ── SSE parsing ───────────────────────────────────────────────────────

/// Incremental SSE line buffer: feed body fragments, get complete `data:`
/// payloads out. Comment lines and event names are skipped; multi-line data
/// is joined with newlines per the SSE spec.
#[derive(Debug, Default)]
pub struct SseDataBuffer {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseDataBuffer {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    payloads.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }

        payloads
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buffer);
        let tail = tail.trim_end_matches('\r');
        if let Some(value) = tail.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        }
        if self.data_lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_lines).join("\n"))
        }
    }
}

/// Adapts an upstream byte stream into a stream of parsed JSON chunk objects.
struct SseJsonStream {
    inner: ByteStream,
    parser: SseDataBuffer,
    pending: VecDeque<Value>,
    done: bool,
}

impl SseJsonStream {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            parser: SseDataBuffer::default(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn enqueue(pending: &mut VecDeque<Value>, payload: &str) {
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => pending.push_back(value),
            Err(e) => tracing::warn!("discarding unparseable upstream event: {e}"),
        }
    }
}

impl Stream for SseJsonStream {
    type Item = Result<Value, UpstreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(value) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(value)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let text = String::from_utf8_lossy(&chunk);
                    for payload in this.parser.push(&text) {
                        Self::enqueue(&mut this.pending, &payload);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(UpstreamClient::transport(e))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if let Some(payload) = this.parser.finish() {
                        Self::enqueue(&mut this.pending, &payload);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sse_buffer_emits_complete_events() {
        let mut buf = SseDataBuffer::default();
        let events = buf.push("data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(events, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn sse_buffer_handles_split_frames() {
        let mut buf = SseDataBuffer::default();
        assert!(buf.push("data: {\"a\"").is_empty());
        assert!(buf.push(":1}\n").is_empty());
        let events = buf.push("\n");
        assert_eq!(events, vec!["{\"a\":1}"]);
    }

    #[test]
    fn sse_buffer_skips_comments_and_joins_data_lines() {
        let mut buf = SseDataBuffer::default();
        let events = buf.push(": keepalive\ndata: line1\ndata: line2\n\n");
        assert_eq!(events, vec!["line1\nline2"]);
    }

    #[test]
    fn sse_buffer_strips_carriage_returns() {
        let mut buf = SseDataBuffer::default();
        let events = buf.push("data: {\"a\":1}\r\n\r\n");
        assert_eq!(events, vec!["{\"a\":1}"]);
    }

    #[test]
    fn sse_buffer_flushes_unterminated_tail() {
        let mut buf = SseDataBuffer::default();
        assert!(buf.push("data: {\"a\":1}").is_empty());
        assert_eq!(buf.finish().unwrap(), "{\"a\":1}");
        assert!(buf.finish().is_none());
    }

    #[test]
    fn classify_maps_statuses_to_kinds() {
        let status = |code: u16, body: &str| UpstreamError::Status {
            status: code,
            body: body.to_string(),
        };

        assert_eq!(
            classify(&status(401, "API key not valid")),
            Classification::Retryable(FailureKind::AuthRejected)
        );
        assert_eq!(
            classify(&status(403, "permission denied")),
            Classification::Retryable(FailureKind::AuthRejected)
        );
        assert_eq!(
            classify(&status(429, "slow down")),
            Classification::Retryable(FailureKind::QuotaExceeded)
        );
        assert_eq!(
            classify(&status(500, "boom")),
            Classification::Retryable(FailureKind::TransientUpstream)
        );
        assert_eq!(
            classify(&UpstreamError::Timeout),
            Classification::Retryable(FailureKind::TransientUpstream)
        );
        assert_eq!(
            classify(&UpstreamError::Transport("connection reset".into())),
            Classification::Retryable(FailureKind::TransientUpstream)
        );

        assert!(matches!(
            classify(&status(400, "bad field")),
            Classification::BadRequest(_)
        ));
        assert!(matches!(
            classify(&status(404, "no such model")),
            Classification::ModelNotFound(_)
        ));
    }

    #[test]
    fn classify_prefers_quota_body_over_status() {
        let err = UpstreamError::Status {
            status: 403,
            body: json!({"error": {"status": "RESOURCE_EXHAUSTED"}}).to_string(),
        };
        assert_eq!(
            classify(&err),
            Classification::Retryable(FailureKind::QuotaExceeded)
        );
    }
}
