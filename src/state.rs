use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::services::cache::ResponseCache;
use crate::services::dispatcher::Dispatcher;
use crate::services::key_pool::{CoolingPolicy, KeyPool};
use crate::services::upstream::UpstreamClient;

pub struct AppState {
    pub config: Config,
    pub pool: Arc<KeyPool>,
    pub cache: ResponseCache,
    pub dispatcher: Dispatcher,
    pub started_at: Instant,
    /// SHA-256 digests of the accepted client / admin keys, precomputed so
    /// auth compares fixed-length digests instead of variable-length secrets.
    pub client_key_hashes: Vec<[u8; 32]>,
    pub admin_key_hashes: Vec<[u8; 32]>,
}

fn hash_keys(keys: &[String]) -> Vec<[u8; 32]> {
    keys.iter()
        .map(|k| Sha256::digest(k.as_bytes()).into())
        .collect()
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let pool = Arc::new(KeyPool::new(
            &config.gemini_api_keys,
            CoolingPolicy {
                max_failures: config.max_failures_before_cool,
                auth: config.cooling_auth,
                quota: config.cooling_quota,
                transient: config.cooling_transient,
            },
        ));

        let upstream = UpstreamClient::new(&config)?;
        let dispatcher = Dispatcher::new(
            pool.clone(),
            upstream,
            config.max_attempts,
            config.per_attempt_timeout,
        );

        let cache = ResponseCache::new(
            config.cache_enabled,
            config.cache_max_size,
            config.cache_ttl,
        );

        Ok(Self {
            client_key_hashes: hash_keys(&config.client_api_keys),
            admin_key_hashes: hash_keys(&config.admin_api_keys),
            pool,
            cache,
            dispatcher,
            started_at: Instant::now(),
            config,
        })
    }
}
