// Risk-control fabric: fingerprinting, rate limiting, health monitoring, and
// outbound proxy selection, composed by the relay orchestrator on every
// outbound call.

pub mod fingerprint;
pub mod health_monitor;
pub mod proxy_pool;
pub mod rate_limiter;

pub use fingerprint::FingerprintPool;
pub use health_monitor::{ErrorKind, HealthMonitor, HealthStatus, RiskLevel};
pub use proxy_pool::{BindingStrategy, ProxyConfig, ProxyPool};
pub use rate_limiter::{RateLimiter, Scope, ScopeLimits};

/// Aggregate risk-control surface handed to the relay orchestrator. Each
/// facet is independently lockable/shardable; this struct only groups them.
pub struct RiskControl {
    pub fingerprints: FingerprintPool,
    pub rate_limiter: RateLimiter,
    pub health: HealthMonitor,
    pub proxies: ProxyPool,
}

impl RiskControl {
    pub fn new(fingerprint_pool_size: usize, proxy_strategy: BindingStrategy, proxies: Vec<ProxyConfig>) -> Self {
        Self {
            fingerprints: FingerprintPool::new(fingerprint_pool_size),
            rate_limiter: RateLimiter::new(),
            health: HealthMonitor::new(),
            proxies: ProxyPool::new(proxy_strategy, proxies),
        }
    }
}
