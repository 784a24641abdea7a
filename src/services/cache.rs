//! Response cache for buffered completions: canonical fingerprints, TTL and
//! exact-LRU bounds, and per-fingerprint single-flight so concurrent
//! identical requests hit the upstream once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::GatewayError;
use crate::models::openai::ChatCompletionRequest;

// ── Eligibility & fingerprinting ──────────────────────────────────────

/// Only deterministic buffered completions are cacheable: no streaming, no
/// tools, temperature absent or zero.
pub fn cacheable(req: &ChatCompletionRequest) -> bool {
    !req.stream && req.temperature.unwrap_or(0.0) == 0.0 && req.tools.is_none()
}

/// Same rules applied to a native `generateContent` payload.
pub fn cacheable_native(body: &Value) -> bool {
    let temperature = body
        .pointer("/generationConfig/temperature")
        .and_then(|t| t.as_f64())
        .unwrap_or(0.0);
    temperature == 0.0 && body.get("tools").is_none()
}

/// Whole floats collapse to integers so `1` and `1.0` fingerprint alike;
/// object keys are already sorted by serde_json's default map.
fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if n.as_i64().is_none()
                    && f.is_finite()
                    && f.fract() == 0.0
                    && f.abs() < i64::MAX as f64
                {
                    return Value::Number((f as i64).into());
                }
            }
            Value::Number(n)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

fn digest(value: &Value) -> String {
    let canonical = normalize_numbers(value.clone());
    let serialized = canonical.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint an OpenAI chat request under its resolved upstream model.
pub fn fingerprint(req: &ChatCompletionRequest, resolved_model: &str) -> String {
    let mut tools = req.tools.clone().unwrap_or_default();
    tools.sort_by(|a, b| a.function.name.cmp(&b.function.name));

    let canonical = json!({
        "model": resolved_model,
        "messages": req.messages,
        "tools": tools,
        "tool_choice": req.tool_choice,
        "temperature": req.temperature.unwrap_or(0.0),
        "top_p": req.top_p,
        "top_k": req.top_k,
        "max_tokens": req.max_tokens,
        "stop": req.stop,
        "response_format": req.response_format,
    });
    digest(&canonical)
}

/// Fingerprint a native payload under its model.
pub fn fingerprint_native(body: &Value, model: &str) -> String {
    digest(&json!({ "model": model, "body": body }))
}

// ── Cache ─────────────────────────────────────────────────────────────

struct CacheEntry {
    artifact: Value,
    expires_at: Instant,
    last_access: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    access_tick: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub ttl_s: u64,
}

pub struct ResponseCache {
    enabled: bool,
    max_size: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
    /// Per-fingerprint guards coordinating single-flight computes.
    pending: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResponseCache {
    pub fn new(enabled: bool, max_size: usize, ttl: Duration) -> Self {
        Self {
            enabled,
            max_size: max_size.max(1),
            ttl,
            inner: Mutex::new(CacheInner::default()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn get(&self, fingerprint: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        inner.access_tick += 1;
        let tick = inner.access_tick;
        let now = Instant::now();

        let mut expired = false;
        let mut artifact = None;
        if let Some(entry) = inner.entries.get_mut(fingerprint) {
            if entry.expires_at > now {
                entry.last_access = tick;
                artifact = Some(entry.artifact.clone());
            } else {
                expired = true;
            }
        }

        if expired {
            inner.entries.remove(fingerprint);
        }
        if artifact.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        artifact
    }

    fn insert(&self, fingerprint: &str, artifact: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.access_tick += 1;
        let tick = inner.access_tick;
        inner.entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                artifact,
                expires_at: Instant::now() + self.ttl,
                last_access: tick,
            },
        );

        while inner.entries.len() > self.max_size {
            let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            inner.entries.remove(&lru_key);
        }
    }

    /// Return a live entry, await an in-flight compute for the same
    /// fingerprint, or run `compute` under the fingerprint's guard. Failed
    /// computes cache nothing; each waiter retries on its own.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        compute: F,
    ) -> Result<Value, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, GatewayError>>,
    {
        if !self.enabled {
            return compute().await;
        }

        if let Some(hit) = self.get(fingerprint) {
            return Ok(hit);
        }

        let gate = {
            let mut pending = self.pending.lock().unwrap();
            pending
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // A racing caller may have finished while we waited for the guard.
        if let Some(hit) = self.get(fingerprint) {
            return Ok(hit);
        }

        let result = compute().await;
        if let Ok(artifact) = &result {
            self.insert(fingerprint, artifact.clone());
        }

        self.pending.lock().unwrap().remove(fingerprint);
        result
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            enabled: self.enabled,
            size: inner.entries.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            ttl_s: self.ttl.as_secs(),
        }
    }
}
