// Sliding-window-plus-token-bucket rate limiter.
//
// Scopes (global / per-credential / per-user) are independent windows of
// `(timestamp, tokens)` samples over the last 60 seconds. `acquire` never
// rejects outright: it returns the delay the caller must sleep before the
// request would no longer violate RPM/TPM/burst.

use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

const WINDOW_SECS: f64 = 60.0;

/// A rate-limit scope: global traffic, one credential, or one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Credential(String),
    User(String),
}

impl Scope {
    fn key(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Credential(id) => format!("credential:{id}"),
            Scope::User(id) => format!("user:{id}"),
        }
    }
}

/// Limits for one scope. Zero means unlimited for that dimension.
#[derive(Debug, Clone, Copy)]
pub struct ScopeLimits {
    pub rpm: u32,
    pub tpm: u32,
    pub burst_size: u32,
    pub min_interval_ms: u64,
}

impl ScopeLimits {
    pub fn unlimited() -> Self {
        Self {
            rpm: 0,
            tpm: 0,
            burst_size: 0,
            min_interval_ms: 0,
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Token-bucket-plus-sliding-window rate limiter, one window per scope.
pub struct RateLimiter {
    windows: DashMap<String, Vec<(f64, u32)>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Returns the delay (seconds) the caller must wait before issuing the
    /// request, and records the request as having happened `delay` seconds
    /// from now (i.e. the caller is expected to actually wait).
    pub fn acquire(&self, scope: &Scope, limits: &ScopeLimits, estimated_tokens: u32) -> f64 {
        let now = now_secs();
        let key = scope.key();
        let mut entry = self.windows.entry(key).or_default();

        entry.retain(|(ts, _)| now - *ts < WINDOW_SECS);

        let mut delay = 0.0_f64;

        if limits.rpm > 0 && entry.len() as u32 >= limits.rpm {
            let oldest = entry.first().map(|(ts, _)| *ts).unwrap_or(now);
            delay = delay.max((oldest + WINDOW_SECS - now).max(0.0));
        }

        if limits.tpm > 0 {
            let total: u32 = entry.iter().map(|(_, t)| *t).sum();
            if total + estimated_tokens > limits.tpm {
                let oldest = entry.first().map(|(ts, _)| *ts).unwrap_or(now);
                delay = delay.max((oldest + WINDOW_SECS - now).max(0.0));
            }
        }

        if limits.burst_size > 0 {
            let recent_1s = entry.iter().filter(|(ts, _)| now - *ts < 1.0).count() as u32;
            if recent_1s >= limits.burst_size {
                delay = delay.max(1.0);
            }
        }

        if limits.min_interval_ms > 0 {
            if let Some((last_ts, _)) = entry.last() {
                let min_interval = limits.min_interval_ms as f64 / 1000.0;
                let elapsed = now - last_ts;
                if elapsed < min_interval {
                    delay = delay.max(min_interval - elapsed);
                }
            }
        }

        entry.push((now + delay, estimated_tokens));
        delay
    }

    /// Drop windows with no samples left in the last 60 seconds. Intended to
    /// be run periodically so idle scopes don't accumulate empty entries.
    pub fn cleanup(&self) {
        let now = now_secs();
        self.windows.retain(|_, samples| {
            samples.retain(|(ts, _)| now - *ts < WINDOW_SECS);
            !samples.is_empty()
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_scope_never_delays() {
        let limiter = RateLimiter::new();
        let scope = Scope::Global;
        let limits = ScopeLimits::unlimited();
        for _ in 0..10 {
            assert_eq!(limiter.acquire(&scope, &limits, 100), 0.0);
        }
    }

    #[test]
    fn test_rpm_limit_triggers_delay() {
        let limiter = RateLimiter::new();
        let scope = Scope::Credential("c1".to_string());
        let limits = ScopeLimits {
            rpm: 2,
            tpm: 0,
            burst_size: 0,
            min_interval_ms: 0,
        };

        assert_eq!(limiter.acquire(&scope, &limits, 10), 0.0);
        assert_eq!(limiter.acquire(&scope, &limits, 10), 0.0);
        // Third request within the same second should see a positive delay.
        let delay = limiter.acquire(&scope, &limits, 10);
        assert!(delay > 0.0, "expected positive delay, got {delay}");
    }

    #[test]
    fn test_tpm_limit_triggers_delay() {
        let limiter = RateLimiter::new();
        let scope = Scope::User("u1".to_string());
        let limits = ScopeLimits {
            rpm: 0,
            tpm: 150,
            burst_size: 0,
            min_interval_ms: 0,
        };

        assert_eq!(limiter.acquire(&scope, &limits, 100), 0.0);
        let delay = limiter.acquire(&scope, &limits, 100);
        assert!(delay > 0.0);
    }

    #[test]
    fn test_scopes_are_independent() {
        let limiter = RateLimiter::new();
        let limits = ScopeLimits {
            rpm: 1,
            tpm: 0,
            burst_size: 0,
            min_interval_ms: 0,
        };
        assert_eq!(
            limiter.acquire(&Scope::Credential("a".to_string()), &limits, 0),
            0.0
        );
        // A different credential scope should not be affected by "a"'s usage.
        assert_eq!(
            limiter.acquire(&Scope::Credential("b".to_string()), &limits, 0),
            0.0
        );
    }

    #[test]
    fn test_min_interval_enforced() {
        let limiter = RateLimiter::new();
        let scope = Scope::Global;
        let limits = ScopeLimits {
            rpm: 0,
            tpm: 0,
            burst_size: 0,
            min_interval_ms: 5000,
        };
        assert_eq!(limiter.acquire(&scope, &limits, 0), 0.0);
        let delay = limiter.acquire(&scope, &limits, 0);
        assert!(delay > 0.0 && delay <= 5.0);
    }

    #[test]
    fn test_cleanup_removes_empty_scopes() {
        let limiter = RateLimiter::new();
        let limits = ScopeLimits {
            rpm: 100,
            tpm: 0,
            burst_size: 0,
            min_interval_ms: 0,
        };
        limiter.acquire(&Scope::Global, &limits, 0);
        assert_eq!(limiter.windows.len(), 1);
        limiter.cleanup();
        // Still within the 60s window, so cleanup should not remove it yet.
        assert_eq!(limiter.windows.len(), 1);
    }
}
