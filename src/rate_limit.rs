/// Per-IP rate limiting for guest authorization attempts
///
/// Rolling-window limiter: each IP may make `max_attempts` attempts within
/// `window_seconds`. Attempt timestamps are kept in memory; stale entries
/// are swept lazily at most once every five minutes.
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

const CLEANUP_INTERVAL_SECS: i64 = 300;

/// Outcome of a rate-limit check
#[derive(Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Limited, with the seconds until the oldest attempt ages out
    Limited { retry_after_seconds: i64 },
}

pub struct RateLimiter {
    max_attempts: usize,
    window: Duration,
    inner: Mutex<LimiterState>,
}

struct LimiterState {
    attempts: HashMap<IpAddr, Vec<DateTime<Utc>>>,
    last_cleanup: DateTime<Utc>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window_seconds: u32) -> Self {
        Self {
            max_attempts: max_attempts as usize,
            window: Duration::seconds(window_seconds as i64),
            inner: Mutex::new(LimiterState {
                attempts: HashMap::new(),
                last_cleanup: Utc::now(),
            }),
        }
    }

    /// Record an attempt from `ip` at `now` and decide whether it passes.
    pub fn check(&self, ip: IpAddr, now: DateTime<Utc>) -> RateDecision {
        self.check_limits(ip, now, self.max_attempts, self.window)
    }

    /// Check against explicit limits. The portal settings row can change
    /// at runtime, so the guest route passes its current values through
    /// here.
    pub fn check_with(&self, ip: IpAddr, now: DateTime<Utc>, max_attempts: u32, window_seconds: u32) -> RateDecision {
        self.check_limits(
            ip,
            now,
            max_attempts as usize,
            Duration::seconds(window_seconds as i64),
        )
    }

    fn check_limits(
        &self,
        ip: IpAddr,
        now: DateTime<Utc>,
        max_attempts: usize,
        window: Duration,
    ) -> RateDecision {
        let mut state = self.inner.lock().expect("rate limiter lock poisoned");

        if now - state.last_cleanup > Duration::seconds(CLEANUP_INTERVAL_SECS) {
            state.attempts.retain(|_, stamps| {
                stamps.retain(|t| now - *t < window);
                !stamps.is_empty()
            });
            state.last_cleanup = now;
        }

        let stamps = state.attempts.entry(ip).or_default();
        stamps.retain(|t| now - *t < window);

        if stamps.len() < max_attempts {
            stamps.push(now);
            return RateDecision::Allowed;
        }

        let oldest = stamps.iter().min().copied().unwrap_or(now);
        let retry_at = oldest + window;
        let remaining = (retry_at - now).num_seconds() + 1;
        RateDecision::Limited {
            retry_after_seconds: remaining.max(1),
        }
    }

    /// Drop the attempt history for an IP, used after a successful
    /// authorization so the guest is not penalized for earlier typos.
    pub fn clear(&self, ip: IpAddr) {
        let mut state = self.inner.lock().expect("rate limiter lock poisoned");
        state.attempts.remove(&ip);
    }
}
