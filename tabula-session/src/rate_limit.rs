//! Per-identity sliding-window rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::clock::{system_clock, Clock};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Request admitted; `remaining` more fit in the current window.
    Allowed { remaining: usize },
    /// Request rejected until the oldest retained request leaves the window.
    Limited { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Sliding-window limiter keyed by client identity.
///
/// Each identity owns an ordered bucket of admission timestamps. A check prunes
/// timestamps that left the trailing window and admits the request only while the
/// bucket holds fewer than `max_requests` entries. Rejected requests are not recorded.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
    window: Duration,
    max_requests: usize,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self::with_clock(window, max_requests, system_clock())
    }

    pub fn with_clock(window: Duration, max_requests: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            window,
            max_requests,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune(bucket: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&oldest) = bucket.front() {
            if now.saturating_duration_since(oldest) >= window {
                bucket.pop_front();
            } else {
                break;
            }
        }
    }

    /// Checks and, if admitted, records a request for `identity`.
    pub fn check(&self, identity: &str) -> RateDecision {
        let now = self.clock.now();
        let mut buckets = self.lock();
        let bucket = buckets.entry(identity.to_string()).or_default();
        Self::prune(bucket, now, self.window);

        if bucket.len() < self.max_requests {
            bucket.push_back(now);
            return RateDecision::Allowed {
                remaining: self.max_requests - bucket.len(),
            };
        }

        let retry_after_secs = bucket
            .front()
            .map(|&oldest| {
                let leaves_at = oldest + self.window;
                let wait = leaves_at.saturating_duration_since(now);
                let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                secs.max(1)
            })
            .unwrap_or(1);

        debug!(identity, retry_after_secs, "Rate limit exceeded");
        RateDecision::Limited { retry_after_secs }
    }

    /// Returns true if the request is admitted.
    pub fn allow(&self, identity: &str) -> bool {
        self.check(identity).is_allowed()
    }

    /// Prunes every bucket and drops identities with no requests left in the window.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            Self::prune(bucket, now, self.window);
            !bucket.is_empty()
        });
        before - buckets.len()
    }

    /// Number of identities currently holding a bucket.
    pub fn tracked_identities(&self) -> usize {
        self.lock().len()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }
}
