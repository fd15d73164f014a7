//! Per-client token bucket rate limiting.
//!
//! One bucket per client address, refilled continuously at the
//! configured rate up to the burst ceiling. The same type backs the
//! global limiter and per-rule policy limiters; they differ only in
//! their label and configured action.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_derive::{Deserialize, Serialize};

use crate::metrics::recorder;

/// Buckets untouched for this long get swept.
const IDLE_BUCKET_LIFETIME: Duration = Duration::from_secs(600);

/// What to do with a query that exceeded its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitAction {
    /// Refuse the query outright.
    Drop,
    /// Answer NXDOMAIN instead of refusing.
    Nxdomain,
}

impl Default for LimitAction {
    fn default() -> Self {
        LimitAction::Drop
    }
}

/// The verdict for one query. `allowed == false && limited == true`
/// means this very call tripped the limit.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limited: bool,
    pub action: LimitAction,
    pub label: String,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    rate: f64,
    burst: f64,
    action: LimitAction,
    label: String,
    buckets: DashMap<IpAddr, TokenBucket>,
    violations: AtomicU64,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64, action: LimitAction, label: &str) -> RateLimiter {
        RateLimiter {
            rate: rate.max(0.0),
            burst: burst.max(1.0),
            action,
            label: label.to_string(),
            buckets: DashMap::new(),
            violations: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Takes one token from the client's bucket, or reports the limit as
    /// exceeded. The entry lock of the client's map shard is the only
    /// synchronization involved.
    pub fn allow(&self, client: IpAddr) -> RateDecision {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(client).or_insert_with(|| TokenBucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision {
                allowed: true,
                limited: false,
                action: self.action,
                label: self.label.clone(),
            }
        } else {
            drop(bucket);
            self.violations.fetch_add(1, Ordering::Relaxed);
            recorder::rate_limit_violation(&self.label);
            RateDecision {
                allowed: false,
                limited: true,
                action: self.action,
                label: self.label.clone(),
            }
        }
    }

    /// Evicts buckets that have not been touched for a while. Run on a
    /// schedule alongside cache cleanup.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            now.saturating_duration_since(bucket.last_refill) < IDLE_BUCKET_LIFETIME
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}
