// Outbound proxy pool with pluggable binding strategies and health checks.

use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingStrategy {
    Random,
    Sticky,
    RoundRobin,
    LeastUsed,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub url: String,
    pub country: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Default)]
struct ProxyStats {
    total_requests: u64,
    failed_requests: u64,
    total_response_time_secs: f64,
    consecutive_failures: u32,
    is_alive: bool,
}

impl ProxyStats {
    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        1.0 - (self.failed_requests as f64 / self.total_requests as f64)
    }
}

struct Proxy {
    config: ProxyConfig,
    stats: Mutex<ProxyStats>,
}

impl Proxy {
    fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(ProxyStats {
                is_alive: true,
                ..Default::default()
            }),
        }
    }

    fn record_request(&self, response_time_secs: f64, success: bool) {
        let mut stats = self.stats.lock().unwrap();
        stats.total_requests += 1;
        stats.total_response_time_secs += response_time_secs;

        if success {
            stats.consecutive_failures = 0;
        } else {
            stats.failed_requests += 1;
            stats.consecutive_failures += 1;
            if stats.consecutive_failures >= 3 {
                stats.is_alive = false;
                tracing::warn!(proxy = %self.config.url, "proxy marked dead after 3 consecutive failures");
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.stats.lock().unwrap().is_alive
    }

    async fn check_health(&self, client: &reqwest::Client, timeout_secs: u64) -> bool {
        let start = SystemTime::now();
        let result = client
            .get("https://api.ipify.org?format=json")
            .proxy(match reqwest::Proxy::all(&self.config.url) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(proxy = %self.config.url, error = %e, "invalid proxy url");
                    self.stats.lock().unwrap().is_alive = false;
                    return false;
                }
            })
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await;

        let alive = matches!(&result, Ok(resp) if resp.status().is_success());
        let elapsed = start.elapsed().unwrap_or_default().as_secs_f64();
        let mut stats = self.stats.lock().unwrap();
        stats.is_alive = alive;
        if alive {
            stats.consecutive_failures = 0;
            tracing::info!(proxy = %self.config.url, elapsed, "proxy health check passed");
        } else {
            tracing::error!(proxy = %self.config.url, "proxy health check failed");
        }
        alive
    }
}

/// Pool of outbound proxies selected per-request according to a binding
/// strategy. `STICKY` pins a credential to the least-bound alive proxy and
/// keeps it there until that proxy dies.
pub struct ProxyPool {
    proxies: Vec<Proxy>,
    strategy: BindingStrategy,
    credential_binding: DashMap<String, usize>,
    round_robin_index: AtomicU64,
}

impl ProxyPool {
    pub fn new(strategy: BindingStrategy, configs: Vec<ProxyConfig>) -> Self {
        let proxies = configs.into_iter().map(Proxy::new).collect();
        Self {
            proxies,
            strategy,
            credential_binding: DashMap::new(),
            round_robin_index: AtomicU64::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    fn alive_indices(&self) -> Vec<usize> {
        self.proxies
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_alive())
            .map(|(i, _)| i)
            .collect()
    }

    /// Select a proxy URL for this credential per the pool's binding
    /// strategy. Returns `None` if no proxy is alive, meaning direct
    /// (no-proxy) egress should be used.
    pub fn acquire(&self, credential_id: &str) -> Option<&str> {
        if self.proxies.is_empty() {
            return None;
        }
        let alive = self.alive_indices();
        if alive.is_empty() {
            tracing::warn!("no alive proxies available");
            return None;
        }

        let idx = match self.strategy {
            BindingStrategy::Sticky => {
                if let Some(bound) = self.credential_binding.get(credential_id) {
                    if alive.contains(&*bound) {
                        *bound
                    } else {
                        self.bind_least_used(credential_id, &alive)
                    }
                } else {
                    self.bind_least_used(credential_id, &alive)
                }
            }
            BindingStrategy::Random => *alive.choose(&mut rand::thread_rng()).unwrap(),
            BindingStrategy::RoundRobin => {
                let i = self.round_robin_index.fetch_add(1, Ordering::Relaxed) as usize;
                alive[i % alive.len()]
            }
            BindingStrategy::LeastUsed => *alive
                .iter()
                .min_by_key(|&&i| self.proxies[i].stats.lock().unwrap().total_requests)
                .unwrap(),
        };

        Some(self.proxies[idx].config.url.as_str())
    }

    fn bind_least_used(&self, credential_id: &str, alive: &[usize]) -> usize {
        let bound_counts: std::collections::HashMap<usize, usize> = {
            let mut counts = std::collections::HashMap::new();
            for entry in self.credential_binding.iter() {
                *counts.entry(*entry.value()).or_insert(0) += 1;
            }
            counts
        };
        let idx = *alive
            .iter()
            .min_by_key(|&&i| bound_counts.get(&i).copied().unwrap_or(0))
            .unwrap();
        self.credential_binding.insert(credential_id.to_string(), idx);
        idx
    }

    pub fn record_request(&self, proxy_url: &str, response_time_secs: f64, success: bool) {
        if let Some(proxy) = self.proxies.iter().find(|p| p.config.url == proxy_url) {
            proxy.record_request(response_time_secs, success);
        }
    }

    pub async fn health_check_all(&self, client: &reqwest::Client, timeout_secs: u64) {
        tracing::info!(count = self.proxies.len(), "starting proxy health check");
        let mut alive_count = 0;
        for proxy in &self.proxies {
            if proxy.check_health(client, timeout_secs).await {
                alive_count += 1;
            }
        }
        tracing::info!(alive_count, total = self.proxies.len(), "proxy health check completed");
    }

    pub fn stats_summary(&self) -> (usize, usize) {
        let alive = self.alive_indices().len();
        (alive, self.proxies.len() - alive)
    }
}

#[allow(dead_code)]
fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs(n: usize) -> Vec<ProxyConfig> {
        (0..n)
            .map(|i| ProxyConfig {
                url: format!("http://proxy{i}.example:8080"),
                country: None,
                region: None,
            })
            .collect()
    }

    #[test]
    fn test_empty_pool_acquires_none() {
        let pool = ProxyPool::new(BindingStrategy::Random, vec![]);
        assert_eq!(pool.acquire("c1"), None);
    }

    #[test]
    fn test_sticky_binding_is_stable() {
        let pool = ProxyPool::new(BindingStrategy::Sticky, configs(3));
        let first = pool.acquire("c1").unwrap().to_string();
        let second = pool.acquire("c1").unwrap().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn test_round_robin_cycles() {
        let pool = ProxyPool::new(BindingStrategy::RoundRobin, configs(3));
        let a = pool.acquire("x").unwrap().to_string();
        let b = pool.acquire("x").unwrap().to_string();
        let c = pool.acquire("x").unwrap().to_string();
        let d = pool.acquire("x").unwrap().to_string();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, d);
    }

    #[test]
    fn test_three_consecutive_failures_mark_dead() {
        let pool = ProxyPool::new(BindingStrategy::Random, configs(1));
        let url = pool.proxies[0].config.url.clone();
        for _ in 0..3 {
            pool.record_request(&url, 0.1, false);
        }
        assert_eq!(pool.stats_summary(), (0, 1));
        assert_eq!(pool.acquire("c1"), None);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let pool = ProxyPool::new(BindingStrategy::Random, configs(1));
        let url = pool.proxies[0].config.url.clone();
        pool.record_request(&url, 0.1, false);
        pool.record_request(&url, 0.1, false);
        pool.record_request(&url, 0.1, true);
        pool.record_request(&url, 0.1, false);
        assert_eq!(pool.stats_summary(), (1, 0));
    }

    #[test]
    fn test_sticky_rebinds_after_proxy_dies() {
        let pool = ProxyPool::new(BindingStrategy::Sticky, configs(2));
        let first = pool.acquire("c1").unwrap().to_string();
        for _ in 0..3 {
            pool.record_request(&first, 0.1, false);
        }
        let rebound = pool.acquire("c1").unwrap().to_string();
        assert_ne!(first, rebound);
    }
}
