//! Upstream API key pool: selection, failure accounting and cooling.
//!
//! All mutations run under one pool-wide mutex with short critical sections;
//! no upstream I/O ever happens while the lock is held.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Cooling,
    Disabled,
}

#[derive(Debug)]
struct KeyEntry {
    id: String,
    secret: String,
    status: KeyStatus,
    consecutive_failures: u32,
    total_requests: u64,
    total_failures: u64,
    last_used_at: Option<Instant>,
    cooling_until: Option<Instant>,
}

impl KeyEntry {
    fn new(id: String, secret: String) -> Self {
        Self {
            id,
            secret,
            status: KeyStatus::Active,
            consecutive_failures: 0,
            total_requests: 0,
            total_failures: 0,
            last_used_at: None,
            cooling_until: None,
        }
    }
}

/// How long a key cools for each failure class, and how many consecutive
/// transient failures force cooling.
#[derive(Debug, Clone)]
pub struct CoolingPolicy {
    pub max_failures: u32,
    pub auth: Duration,
    pub quota: Duration,
    pub transient: Duration,
}

impl CoolingPolicy {
    pub fn period(&self, kind: FailureKind) -> Duration {
        match kind {
            FailureKind::AuthRejected => self.auth,
            FailureKind::QuotaExceeded => self.quota,
            FailureKind::TransientUpstream => self.transient,
        }
    }
}

/// A key handed out for one upstream attempt.
#[derive(Debug, Clone)]
pub struct LeasedKey {
    pub id: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub id: String,
    pub status: KeyStatus,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub cooling_remaining_s: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct KeyCounts {
    pub total: usize,
    pub active: usize,
    pub cooling: usize,
    pub disabled: usize,
}

pub struct KeyPool {
    keys: Mutex<Vec<KeyEntry>>,
    policy: CoolingPolicy,
}

/// Display id for a secret: a short stable prefix, never the full value.
fn display_id(secret: &str) -> String {
    secret.chars().take(8).collect()
}

impl KeyPool {
    pub fn new(secrets: &[String], policy: CoolingPolicy) -> Self {
        let mut entries: Vec<KeyEntry> = Vec::with_capacity(secrets.len());
        for secret in secrets {
            if entries.iter().any(|e| e.secret == *secret) {
                warn!("duplicate upstream key ignored");
                continue;
            }
            let mut id = display_id(secret);
            let mut n = 1;
            while entries.iter().any(|e| e.id == id) {
                n += 1;
                id = format!("{}-{n}", display_id(secret));
            }
            entries.push(KeyEntry::new(id, secret.clone()));
        }
        info!("key pool initialized with {} upstream keys", entries.len());
        Self {
            keys: Mutex::new(entries),
            policy,
        }
    }

    /// Move expired cooling entries back to Active, failures reset.
    fn sweep(keys: &mut [KeyEntry], now: Instant) {
        for key in keys.iter_mut() {
            if key.status == KeyStatus::Cooling
                && key.cooling_until.is_none_or(|until| until <= now)
            {
                key.status = KeyStatus::Active;
                key.consecutive_failures = 0;
                key.cooling_until = None;
                info!(key = %key.id, "key recovered from cooling");
            }
        }
    }

    /// Lease the least-recently-used Active key outside `exclude`.
    /// Never-used keys sort oldest; ties break lexicographically by id.
    pub fn lease(&self, exclude: &HashSet<String>) -> Option<LeasedKey> {
        let mut keys = self.keys.lock().unwrap();
        let now = Instant::now();
        Self::sweep(&mut keys, now);

        let mut best: Option<usize> = None;
        for (i, key) in keys.iter().enumerate() {
            if key.status != KeyStatus::Active || exclude.contains(&key.id) {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(j) => {
                    let older = match (key.last_used_at, keys[j].last_used_at) {
                        (None, None) => key.id < keys[j].id,
                        (None, Some(_)) => true,
                        (Some(_), None) => false,
                        (Some(a), Some(b)) => a < b || (a == b && key.id < keys[j].id),
                    };
                    if older { Some(i) } else { Some(j) }
                }
            };
        }

        let key = &mut keys[best?];
        key.last_used_at = Some(now);
        key.total_requests += 1;
        Some(LeasedKey {
            id: key.id.clone(),
            secret: key.secret.clone(),
        })
    }

    pub fn report_success(&self, id: &str) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(key) = keys.iter_mut().find(|k| k.id == id) {
            key.consecutive_failures = 0;
        }
    }

    pub fn report_failure(&self, id: &str, kind: FailureKind) {
        let mut keys = self.keys.lock().unwrap();
        let Some(key) = keys.iter_mut().find(|k| k.id == id) else {
            return;
        };
        if key.status == KeyStatus::Disabled {
            return;
        }

        key.consecutive_failures += 1;
        key.total_failures += 1;

        let force = matches!(
            kind,
            FailureKind::AuthRejected | FailureKind::QuotaExceeded
        );
        if force || key.consecutive_failures >= self.policy.max_failures {
            let period = self.policy.period(kind);
            key.status = KeyStatus::Cooling;
            key.cooling_until = Some(Instant::now() + period);
            warn!(
                key = %key.id,
                kind = kind.as_str(),
                failures = key.consecutive_failures,
                cooling_s = period.as_secs(),
                "key moved to cooling"
            );
        }
    }

    // ── Admin surface ─────────────────────────────────────────────────

    /// Register a new key at runtime. Returns its id, or None if already present.
    pub fn add(&self, secret: &str) -> Option<String> {
        let mut keys = self.keys.lock().unwrap();
        if keys.iter().any(|k| k.secret == secret) {
            return None;
        }
        let mut id = display_id(secret);
        let mut n = 1;
        while keys.iter().any(|k| k.id == id) {
            n += 1;
            id = format!("{}-{n}", display_id(secret));
        }
        keys.push(KeyEntry::new(id.clone(), secret.to_string()));
        info!(key = %id, "key added");
        Some(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut keys = self.keys.lock().unwrap();
        let before = keys.len();
        keys.retain(|k| k.id != id);
        keys.len() != before
    }

    pub fn disable(&self, id: &str) -> bool {
        self.set_status(id, KeyStatus::Disabled)
    }

    pub fn enable(&self, id: &str) -> bool {
        self.set_status(id, KeyStatus::Active)
    }

    fn set_status(&self, id: &str, status: KeyStatus) -> bool {
        let mut keys = self.keys.lock().unwrap();
        let Some(key) = keys.iter_mut().find(|k| k.id == id) else {
            return false;
        };
        key.status = status;
        if status == KeyStatus::Active {
            key.consecutive_failures = 0;
            key.cooling_until = None;
        }
        true
    }

    /// Back to Active with counters preserved; failure streak and cooling cleared.
    pub fn reset(&self, id: &str) -> bool {
        let mut keys = self.keys.lock().unwrap();
        let Some(key) = keys.iter_mut().find(|k| k.id == id) else {
            return false;
        };
        key.status = KeyStatus::Active;
        key.consecutive_failures = 0;
        key.cooling_until = None;
        true
    }

    // ── Observability ─────────────────────────────────────────────────

    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        let mut keys = self.keys.lock().unwrap();
        let now = Instant::now();
        Self::sweep(&mut keys, now);
        keys.iter()
            .map(|k| KeySnapshot {
                id: k.id.clone(),
                status: k.status,
                consecutive_failures: k.consecutive_failures,
                total_requests: k.total_requests,
                total_failures: k.total_failures,
                cooling_remaining_s: k
                    .cooling_until
                    .filter(|_| k.status == KeyStatus::Cooling)
                    .map(|until| until.saturating_duration_since(now).as_secs()),
            })
            .collect()
    }

    pub fn counts(&self) -> KeyCounts {
        let mut keys = self.keys.lock().unwrap();
        Self::sweep(&mut keys, Instant::now());
        let mut counts = KeyCounts {
            total: keys.len(),
            active: 0,
            cooling: 0,
            disabled: 0,
        };
        for key in keys.iter() {
            match key.status {
                KeyStatus::Active => counts.active += 1,
                KeyStatus::Cooling => counts.cooling += 1,
                KeyStatus::Disabled => counts.disabled += 1,
            }
        }
        counts
    }

    /// Seconds until the soonest cooling key recovers, for Retry-After hints.
    pub fn soonest_recovery(&self) -> Option<Duration> {
        let keys = self.keys.lock().unwrap();
        let now = Instant::now();
        keys.iter()
            .filter(|k| k.status == KeyStatus::Cooling)
            .filter_map(|k| k.cooling_until)
            .map(|until| until.saturating_duration_since(now))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CoolingPolicy {
        CoolingPolicy {
            max_failures: 3,
            auth: Duration::from_secs(3600),
            quota: Duration::from_secs(300),
            transient: Duration::from_millis(20),
        }
    }

    fn pool(secrets: &[&str]) -> KeyPool {
        let secrets: Vec<String> = secrets.iter().map(|s| s.to_string()).collect();
        KeyPool::new(&secrets, policy())
    }

    #[test]
    fn lease_prefers_least_recently_used() {
        let pool = pool(&["alpha-key-000001", "bravo-key-000002"]);

        // Fresh pool: tie-break is lexicographic by id.
        let first = pool.lease(&HashSet::new()).unwrap();
        assert_eq!(first.id, "alpha-ke");

        // alpha was just used, so bravo is now oldest.
        let second = pool.lease(&HashSet::new()).unwrap();
        assert_eq!(second.id, "bravo-ke");

        let third = pool.lease(&HashSet::new()).unwrap();
        assert_eq!(third.id, "alpha-ke");
    }

    #[test]
    fn lease_honors_exclusion() {
        let pool = pool(&["alpha-key-000001", "bravo-key-000002"]);
        let mut exclude = HashSet::new();
        exclude.insert("alpha-ke".to_string());

        let leased = pool.lease(&exclude).unwrap();
        assert_eq!(leased.id, "bravo-ke");

        exclude.insert("bravo-ke".to_string());
        assert!(pool.lease(&exclude).is_none());
    }

    #[test]
    fn lease_counts_requests() {
        let pool = pool(&["alpha-key-000001"]);
        pool.lease(&HashSet::new()).unwrap();
        pool.lease(&HashSet::new()).unwrap();

        let snap = pool.snapshot();
        assert_eq!(snap[0].total_requests, 2);
    }

    #[test]
    fn auth_failure_cools_immediately() {
        let pool = pool(&["alpha-key-000001", "bravo-key-000002"]);
        pool.report_failure("alpha-ke", FailureKind::AuthRejected);

        let snap = pool.snapshot();
        let alpha = snap.iter().find(|k| k.id == "alpha-ke").unwrap();
        assert_eq!(alpha.status, KeyStatus::Cooling);
        // Long cooldown for rejected keys.
        assert!(alpha.cooling_remaining_s.unwrap() > 3500);
        assert_eq!(alpha.consecutive_failures, 1);
    }

    #[test]
    fn quota_failure_cools_immediately() {
        let pool = pool(&["alpha-key-000001"]);
        pool.report_failure("alpha-ke", FailureKind::QuotaExceeded);

        let snap = pool.snapshot();
        assert_eq!(snap[0].status, KeyStatus::Cooling);
        let remaining = snap[0].cooling_remaining_s.unwrap();
        assert!(remaining > 290 && remaining <= 300);
    }

    #[test]
    fn transient_failures_cool_after_threshold() {
        let pool = pool(&["alpha-key-000001"]);
        pool.report_failure("alpha-ke", FailureKind::TransientUpstream);
        pool.report_failure("alpha-ke", FailureKind::TransientUpstream);
        assert_eq!(pool.snapshot()[0].status, KeyStatus::Active);

        pool.report_failure("alpha-ke", FailureKind::TransientUpstream);
        assert_eq!(pool.snapshot()[0].status, KeyStatus::Cooling);
        assert_eq!(pool.snapshot()[0].total_failures, 3);
    }

    #[test]
    fn cooling_key_recovers_after_period() {
        let pool = pool(&["alpha-key-000001"]);
        for _ in 0..3 {
            pool.report_failure("alpha-ke", FailureKind::TransientUpstream);
        }
        assert!(pool.lease(&HashSet::new()).is_none());

        std::thread::sleep(Duration::from_millis(30));

        let leased = pool.lease(&HashSet::new()).unwrap();
        assert_eq!(leased.id, "alpha-ke");
        assert_eq!(pool.snapshot()[0].consecutive_failures, 0);
    }

    #[test]
    fn success_resets_failure_streak() {
        let pool = pool(&["alpha-key-000001"]);
        pool.report_failure("alpha-ke", FailureKind::TransientUpstream);
        pool.report_failure("alpha-ke", FailureKind::TransientUpstream);
        pool.report_success("alpha-ke");

        let snap = pool.snapshot();
        assert_eq!(snap[0].consecutive_failures, 0);
        // Streak reset does not rewrite history.
        assert_eq!(snap[0].total_failures, 2);
    }

    #[test]
    fn disabled_key_is_never_leased() {
        let pool = pool(&["alpha-key-000001", "bravo-key-000002"]);
        assert!(pool.disable("alpha-ke"));

        let leased = pool.lease(&HashSet::new()).unwrap();
        assert_eq!(leased.id, "bravo-ke");

        // Failure accounting must not touch disabled keys.
        pool.report_failure("alpha-ke", FailureKind::AuthRejected);
        let snap = pool.snapshot();
        let alpha = snap.iter().find(|k| k.id == "alpha-ke").unwrap();
        assert_eq!(alpha.status, KeyStatus::Disabled);
    }

    #[test]
    fn reset_reactivates_and_preserves_counters() {
        let pool = pool(&["alpha-key-000001"]);
        pool.lease(&HashSet::new()).unwrap();
        pool.report_failure("alpha-ke", FailureKind::QuotaExceeded);

        assert!(pool.reset("alpha-ke"));
        let snap = pool.snapshot();
        assert_eq!(snap[0].status, KeyStatus::Active);
        assert_eq!(snap[0].consecutive_failures, 0);
        assert_eq!(snap[0].total_requests, 1);
        assert_eq!(snap[0].total_failures, 1);
        assert!(snap[0].cooling_remaining_s.is_none());
    }

    #[test]
    fn status_counts_partition_the_pool() {
        let pool = pool(&[
            "alpha-key-000001",
            "bravo-key-000002",
            "charlie-key-0003",
        ]);
        pool.disable("charlie-");
        pool.report_failure("alpha-ke", FailureKind::QuotaExceeded);

        let counts = pool.counts();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.active + counts.cooling + counts.disabled, counts.total);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.cooling, 1);
        assert_eq!(counts.disabled, 1);
    }

    #[test]
    fn admin_add_and_remove() {
        let pool = pool(&["alpha-key-000001"]);
        let id = pool.add("delta-key-000004").unwrap();
        assert_eq!(id, "delta-ke");
        // Duplicate secrets are rejected.
        assert!(pool.add("delta-key-000004").is_none());

        assert!(pool.remove(&id));
        assert!(!pool.remove(&id));
        assert_eq!(pool.counts().total, 1);
    }

    #[test]
    fn soonest_recovery_tracks_shortest_cooldown() {
        let pool = pool(&["alpha-key-000001", "bravo-key-000002"]);
        pool.report_failure("alpha-ke", FailureKind::QuotaExceeded);
        for _ in 0..3 {
            pool.report_failure("bravo-ke", FailureKind::TransientUpstream);
        }

        // bravo's transient cooldown (20ms) is far shorter than quota cooling.
        let soonest = pool.soonest_recovery().unwrap();
        assert!(soonest <= Duration::from_millis(20));
    }
}
