use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    /// Comma-separated list of allowed CORS origins, or "*" for any.
    pub cors_origin: String,
    /// Upstream Gemini API keys, rotated by the pool.
    pub gemini_api_keys: Vec<String>,
    /// Keys accepted on the client surfaces. Empty = insecure mode (allow all).
    pub client_api_keys: Vec<String>,
    /// Keys accepted on the admin surface. Empty = admin surface locked out.
    pub admin_api_keys: Vec<String>,
    pub upstream_base_url: String,
    pub outbound_proxy_url: Option<String>,
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub overall_deadline: Duration,
    pub max_failures_before_cool: u32,
    pub cooling_auth: Duration,
    pub cooling_quota: Duration,
    pub cooling_transient: Duration,
    pub cache_enabled: bool,
    pub cache_max_size: usize,
    pub cache_ttl: Duration,
    /// Upstream model used for OpenAI-style names without an explicit mapping.
    pub default_upstream_model: String,
    /// OpenAI-style name -> upstream model name.
    pub model_mapping: HashMap<String, String>,
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn parse_list_env(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_env(key: &str, default: u64) -> Duration {
    Duration::from_secs(parse_u64_env(key, default))
}

/// Built-in OpenAI-style name table. Entries can be overridden or extended
/// through `MODEL_MAPPING` ("gpt-4o=gemini-1.5-pro-latest,..." pairs).
fn default_model_mapping() -> HashMap<String, String> {
    [
        ("gpt-4o", "gemini-1.5-pro-latest"),
        ("gpt-4-turbo", "gemini-1.5-pro-latest"),
        ("gpt-4", "gemini-pro"),
        ("gpt-3.5-turbo", "gemini-1.5-flash-latest"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let gemini_api_keys = parse_list_env("GEMINI_API_KEYS");
        if gemini_api_keys.is_empty() {
            return Err(anyhow::anyhow!("GEMINI_API_KEYS is required"));
        }

        let mut model_mapping = default_model_mapping();
        for pair in parse_list_env("MODEL_MAPPING") {
            match pair.split_once('=') {
                Some((name, target)) if !name.is_empty() && !target.is_empty() => {
                    model_mapping.insert(name.trim().to_string(), target.trim().to_string());
                }
                _ => return Err(anyhow::anyhow!("invalid MODEL_MAPPING entry: {pair}")),
            }
        }

        Ok(Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into()),
            cors_origin: env::var("CORS_ORIGIN").unwrap_or_else(|_| "*".into()),
            gemini_api_keys,
            client_api_keys: parse_list_env("CLIENT_API_KEYS"),
            admin_api_keys: parse_list_env("ADMIN_API_KEYS"),
            upstream_base_url: env::var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".into()),
            outbound_proxy_url: env::var("OUTBOUND_PROXY_URL").ok().filter(|s| !s.is_empty()),
            max_attempts: parse_u64_env("MAX_ATTEMPTS", 3) as u32,
            per_attempt_timeout: secs_env("PER_ATTEMPT_TIMEOUT_S", 45),
            overall_deadline: secs_env("OVERALL_DEADLINE_S", 120),
            max_failures_before_cool: parse_u64_env("MAX_FAILURES_BEFORE_COOL", 3) as u32,
            cooling_auth: secs_env("COOLING_AUTH_S", 3600),
            cooling_quota: secs_env("COOLING_QUOTA_S", 300),
            cooling_transient: secs_env("COOLING_TRANSIENT_S", 30),
            cache_enabled: parse_bool_env("CACHE_ENABLED", true),
            cache_max_size: parse_u64_env("CACHE_MAX_SIZE", 1000) as usize,
            cache_ttl: secs_env("CACHE_TTL_S", 300),
            default_upstream_model: env::var("DEFAULT_UPSTREAM_MODEL")
                .unwrap_or_else(|_| "gemini-1.5-pro-latest".into()),
            model_mapping,
        })
    }
}
