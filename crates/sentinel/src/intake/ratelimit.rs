//! Per-project hourly rate limiting.
//!
//! 64 shards, each a mutex-guarded map keyed by project. Shard selection
//! is FNV-1a of the project key mod 64, so contention stays local to a
//! project's shard.

use std::collections::HashMap;
use std::hash::Hasher as _;
use std::sync::Mutex;

use fnv::FnvHasher;

const SHARD_COUNT: usize = 64;

#[derive(Debug, Clone, Copy)]
struct HourWindow {
    hour_bucket: i64,
    count: u32,
}

/// Sharded hourly counter.
pub struct RateLimiter {
    shards: Vec<Mutex<HashMap<String, HourWindow>>>,
    limit: u32,
}

impl RateLimiter {
    /// `limit` of zero disables the limiter.
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            limit,
        }
    }

    fn shard_index(project_key: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(project_key.as_bytes());
        (hasher.finish() % SHARD_COUNT as u64) as usize
    }

    /// Count one admission attempt. Returns `false` when the project's
    /// hourly budget is spent.
    pub fn allow(&self, project_key: &str) -> bool {
        self.allow_at(project_key, chrono::Utc::now().timestamp())
    }

    fn allow_at(&self, project_key: &str, now_secs: i64) -> bool {
        if self.limit == 0 {
            return true;
        }
        let hour_bucket = now_secs / 3600;

        let mut shard = self.shards[Self::shard_index(project_key)]
            .lock()
            .expect("rate limit shard poisoned");
        let window = shard
            .entry(project_key.to_string())
            .or_insert(HourWindow { hour_bucket, count: 0 });

        if window.hour_bucket != hour_bucket {
            window.hour_bucket = hour_bucket;
            window.count = 0;
        }
        if window.count >= self.limit {
            return false;
        }
        window.count += 1;
        true
    }
}
