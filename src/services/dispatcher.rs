//! Executes one logical request against the upstream, rotating keys until it
//! succeeds, hits a terminal error, or runs out of attempts or time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FailureKind, GatewayError};
use crate::services::key_pool::{KeyPool, LeasedKey};
use crate::services::upstream::{classify, Classification, UpstreamClient, UpstreamError};

/// A successful dispatch and the key that served it.
pub struct Dispatched<T> {
    pub key_id: String,
    pub response: T,
}

pub type NativeChunkStream = BoxStream<'static, Result<Value, UpstreamError>>;
pub type RawByteStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

pub struct Dispatcher {
    pool: Arc<KeyPool>,
    upstream: UpstreamClient,
    max_attempts: u32,
    per_attempt_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<KeyPool>,
        upstream: UpstreamClient,
        max_attempts: u32,
        per_attempt_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            upstream,
            max_attempts: max_attempts.max(1),
            per_attempt_timeout,
        }
    }

    fn lease_next(&self, tried: &HashSet<String>) -> Result<LeasedKey, GatewayError> {
        self.pool.lease(tried).ok_or_else(|| {
            GatewayError::NoHealthyCredential {
                retry_after_s: self
                    .pool
                    .soonest_recovery()
                    .map(|d| d.as_secs().max(1)),
            }
        })
    }

    fn attempt_timeout(&self, deadline: Instant) -> Result<Duration, GatewayError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GatewayError::DeadlineExceeded);
        }
        Ok(self.per_attempt_timeout.min(remaining))
    }

    /// Terminal classifications become gateway errors returned verbatim;
    /// retryable ones are reported to the pool and the loop continues.
    fn handle_failure(
        &self,
        lease: &LeasedKey,
        attempt: usize,
        err: UpstreamError,
    ) -> Result<(FailureKind, String), GatewayError> {
        match classify(&err) {
            Classification::Retryable(kind) => {
                warn!(
                    key = %lease.id,
                    attempt,
                    kind = kind.as_str(),
                    "upstream attempt failed: {err}"
                );
                self.pool.report_failure(&lease.id, kind);
                Ok((kind, err.to_string()))
            }
            Classification::BadRequest(message) => {
                Err(GatewayError::UpstreamRejected {
                    status: 400,
                    message,
                })
            }
            Classification::ModelNotFound(message) => Err(GatewayError::ModelNotFound(message)),
        }
    }

    fn exhausted(last: Option<(FailureKind, String)>) -> GatewayError {
        match last {
            Some((kind, message)) => GatewayError::AllCredentialsExhausted { kind, message },
            // No attempt ever ran; treat as an empty pool.
            None => GatewayError::NoHealthyCredential {
                retry_after_s: None,
            },
        }
    }

    /// Buffered dispatch. Returns the upstream JSON untouched.
    pub async fn execute(
        &self,
        model: &str,
        body: &Value,
        deadline: Instant,
    ) -> Result<Dispatched<Value>, GatewayError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last: Option<(FailureKind, String)> = None;

        while (tried.len() as u32) < self.max_attempts {
            let timeout = self.attempt_timeout(deadline)?;
            let lease = self.lease_next(&tried)?;
            tried.insert(lease.id.clone());
            let attempt = tried.len();
            debug!(key = %lease.id, attempt, model, "dispatching generateContent");

            match self
                .upstream
                .generate(model, body, &lease.secret, timeout)
                .await
            {
                Ok(response) => {
                    self.pool.report_success(&lease.id);
                    return Ok(Dispatched {
                        key_id: lease.id,
                        response,
                    });
                }
                Err(err) => last = Some(self.handle_failure(&lease, attempt, err)?),
            }
        }

        Err(Self::exhausted(last))
    }

    /// Streaming dispatch on the translated surface. The attempt commits on
    /// the first parsed chunk; anything earlier is retryable, anything later
    /// is the caller's to surface in-band.
    pub async fn execute_stream(
        &self,
        model: &str,
        body: &Value,
        deadline: Instant,
    ) -> Result<Dispatched<NativeChunkStream>, GatewayError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last: Option<(FailureKind, String)> = None;

        while (tried.len() as u32) < self.max_attempts {
            let timeout = self.attempt_timeout(deadline)?;
            let lease = self.lease_next(&tried)?;
            tried.insert(lease.id.clone());
            let attempt = tried.len();
            debug!(key = %lease.id, attempt, model, "dispatching streamGenerateContent");

            let open = async {
                let mut stream = self.upstream.stream(model, body, &lease.secret).await?;
                let first = stream.next().await;
                Ok::<_, UpstreamError>((stream, first))
            };

            let outcome = match tokio::time::timeout(timeout, open).await {
                Err(_) => Err(UpstreamError::Timeout),
                Ok(Err(err)) => Err(err),
                Ok(Ok((_, None))) => {
                    Err(UpstreamError::Transport("upstream closed stream before any chunk".into()))
                }
                Ok(Ok((_, Some(Err(err))))) => Err(err),
                Ok(Ok((rest, Some(Ok(first))))) => Ok((rest, first)),
            };

            match outcome {
                Ok((rest, first)) => {
                    self.pool.report_success(&lease.id);
                    let stream = futures::stream::once(async move { Ok(first) })
                        .chain(rest)
                        .boxed();
                    return Ok(Dispatched {
                        key_id: lease.id,
                        response: stream,
                    });
                }
                Err(err) => last = Some(self.handle_failure(&lease, attempt, err)?),
            }
        }

        Err(Self::exhausted(last))
    }

    /// Streaming dispatch on the pass-through surface: commits on the first
    /// body chunk and forwards bytes and content type untouched.
    pub async fn execute_stream_raw(
        &self,
        model: &str,
        query: Option<&str>,
        body: &Value,
        deadline: Instant,
    ) -> Result<Dispatched<(String, RawByteStream)>, GatewayError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last: Option<(FailureKind, String)> = None;

        while (tried.len() as u32) < self.max_attempts {
            let timeout = self.attempt_timeout(deadline)?;
            let lease = self.lease_next(&tried)?;
            tried.insert(lease.id.clone());
            let attempt = tried.len();
            debug!(key = %lease.id, attempt, model, "dispatching raw stream");

            let open = async {
                let (content_type, mut stream) = self
                    .upstream
                    .stream_raw(model, query, body, &lease.secret)
                    .await?;
                let first = stream.next().await;
                Ok::<_, UpstreamError>((content_type, stream, first))
            };

            let outcome = match tokio::time::timeout(timeout, open).await {
                Err(_) => Err(UpstreamError::Timeout),
                Ok(Err(err)) => Err(err),
                Ok(Ok((_, _, None))) => {
                    Err(UpstreamError::Transport("upstream closed stream before any chunk".into()))
                }
                Ok(Ok((_, _, Some(Err(err))))) => Err(err),
                Ok(Ok((content_type, rest, Some(Ok(first))))) => Ok((content_type, rest, first)),
            };

            match outcome {
                Ok((content_type, rest, first)) => {
                    self.pool.report_success(&lease.id);
                    let stream = futures::stream::once(async move { Ok(first) })
                        .chain(rest)
                        .boxed();
                    return Ok(Dispatched {
                        key_id: lease.id,
                        response: (content_type, stream),
                    });
                }
                Err(err) => last = Some(self.handle_failure(&lease, attempt, err)?),
            }
        }

        Err(Self::exhausted(last))
    }
}
