// Per-credential health tracking: request outcomes feed a state machine that
// auto-degrades or auto-bans a credential, and recovers it once the penalty
// window elapses.

use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const BAN_DURATION_SECS: f64 = 86_400.0;
const DEGRADE_DURATION_SECS: f64 = 3_600.0;
const RECENT_WINDOW_SECS: f64 = 3_600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Banned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorKind {
    RateLimit,
    Auth,
    Server,
    Timeout,
    Other,
}

#[derive(Debug, Default)]
struct HealthMetrics {
    total_requests: u64,
    failed_requests: u64,
    rate_limit_errors: u64,
    auth_errors: u64,
    server_errors: u64,
    timeout_errors: u64,
    consecutive_failures: u64,
    consecutive_rate_limits: u64,
    total_response_time_secs: f64,
    last_success_at: f64,
    last_failure_at: f64,
    recent_requests: Vec<f64>,
    recent_failures: Vec<f64>,
}

impl HealthMetrics {
    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        1.0 - (self.failed_requests as f64 / self.total_requests as f64)
    }

    fn avg_response_time_secs(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_response_time_secs / self.total_requests as f64
    }

    fn recent_failure_rate(&mut self, now: f64) -> f64 {
        let cutoff = now - RECENT_WINDOW_SECS;
        self.recent_requests.retain(|t| *t > cutoff);
        self.recent_failures.retain(|t| *t > cutoff);
        if self.recent_requests.is_empty() {
            return 0.0;
        }
        self.recent_failures.len() as f64 / self.recent_requests.len() as f64
    }
}

#[derive(Debug)]
pub struct CredentialHealth {
    metrics: HealthMetrics,
    status: HealthStatus,
    risk_level: RiskLevel,
    degraded_until: f64,
    banned_until: f64,
}

impl Default for CredentialHealth {
    fn default() -> Self {
        Self {
            metrics: HealthMetrics::default(),
            status: HealthStatus::Healthy,
            risk_level: RiskLevel::Low,
            degraded_until: 0.0,
            banned_until: 0.0,
        }
    }
}

impl CredentialHealth {
    fn record_request(&mut self, success: bool, response_time_secs: f64, error_kind: Option<ErrorKind>) {
        let now = now_secs();
        self.metrics.total_requests += 1;
        self.metrics.total_response_time_secs += response_time_secs;
        self.metrics.recent_requests.push(now);

        if success {
            self.metrics.consecutive_failures = 0;
            self.metrics.consecutive_rate_limits = 0;
            self.metrics.last_success_at = now;
        } else {
            self.metrics.failed_requests += 1;
            self.metrics.consecutive_failures += 1;
            self.metrics.last_failure_at = now;
            self.metrics.recent_failures.push(now);

            match error_kind {
                Some(ErrorKind::RateLimit) => {
                    self.metrics.rate_limit_errors += 1;
                    self.metrics.consecutive_rate_limits += 1;
                }
                Some(ErrorKind::Auth) => self.metrics.auth_errors += 1,
                Some(ErrorKind::Server) => self.metrics.server_errors += 1,
                Some(ErrorKind::Timeout) => self.metrics.timeout_errors += 1,
                _ => {}
            }
        }

        self.update_status(now);
    }

    fn update_status(&mut self, now: f64) {
        if self.banned_until > now {
            self.status = HealthStatus::Banned;
            self.risk_level = RiskLevel::Critical;
            return;
        }
        if self.degraded_until > now {
            self.status = HealthStatus::Degraded;
            self.risk_level = RiskLevel::High;
            return;
        }

        if self.metrics.auth_errors >= 3 {
            self.status = HealthStatus::Banned;
            self.risk_level = RiskLevel::Critical;
            self.banned_until = now + BAN_DURATION_SECS;
            tracing::error!("credential marked BANNED after repeated auth errors");
            return;
        }

        if self.metrics.consecutive_rate_limits >= 5 {
            self.status = HealthStatus::Degraded;
            self.risk_level = RiskLevel::Critical;
            self.degraded_until = now + DEGRADE_DURATION_SECS;
            tracing::warn!("credential degraded after repeated rate limits");
            return;
        }

        if self.metrics.consecutive_failures >= 10 {
            self.status = HealthStatus::Unhealthy;
            self.risk_level = RiskLevel::High;
            tracing::warn!("credential marked UNHEALTHY after repeated failures");
            return;
        }

        let recent_failure_rate = self.metrics.recent_failure_rate(now);
        if recent_failure_rate > 0.5 {
            self.status = HealthStatus::Degraded;
            self.risk_level = RiskLevel::High;
        } else if recent_failure_rate > 0.3 {
            self.status = HealthStatus::Degraded;
            self.risk_level = RiskLevel::Medium;
        } else if recent_failure_rate > 0.1 {
            self.status = HealthStatus::Healthy;
            self.risk_level = RiskLevel::Medium;
        } else {
            self.status = HealthStatus::Healthy;
            self.risk_level = RiskLevel::Low;
        }
    }

    fn recover(&mut self) {
        self.status = HealthStatus::Healthy;
        self.risk_level = RiskLevel::Low;
        self.degraded_until = 0.0;
        self.banned_until = 0.0;
        self.metrics.consecutive_failures = 0;
        self.metrics.consecutive_rate_limits = 0;
    }

    fn is_available(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Priority weight in [0, 1] used to bias load-balancer selection away
    /// from degraded credentials without fully excluding them.
    fn priority_weight(&self) -> f64 {
        match self.status {
            HealthStatus::Banned => 0.0,
            HealthStatus::Unhealthy => 0.1,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Healthy => 1.0,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn success_rate(&self) -> f64 {
        self.metrics.success_rate()
    }

    pub fn avg_response_time_secs(&self) -> f64 {
        self.metrics.avg_response_time_secs()
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Tracks per-credential health, backing the risk-control fabric's
/// "is this credential still safe to use" decisions.
pub struct HealthMonitor {
    credentials: DashMap<String, Mutex<CredentialHealth>>,
    enabled: std::sync::atomic::AtomicBool,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            credentials: DashMap::new(),
            enabled: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn record_request(
        &self,
        credential_id: &str,
        success: bool,
        response_time_secs: f64,
        error_kind: Option<ErrorKind>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let entry = self
            .credentials
            .entry(credential_id.to_string())
            .or_default();
        let mut health = entry.lock().unwrap();
        health.record_request(success, response_time_secs, error_kind);
    }

    pub fn status(&self, credential_id: &str) -> HealthStatus {
        self.credentials
            .entry(credential_id.to_string())
            .or_default()
            .lock()
            .unwrap()
            .status()
    }

    /// Candidate credentials that are currently usable, sorted by descending
    /// priority weight (healthiest first).
    pub fn available(&self, credential_ids: &[String]) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = credential_ids
            .iter()
            .filter_map(|id| {
                let entry = self.credentials.entry(id.clone()).or_default();
                let health = entry.lock().unwrap();
                if health.is_available() {
                    Some((id.clone(), health.priority_weight()))
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(id, _)| id).collect()
    }

    pub fn manual_degrade(&self, credential_id: &str, duration_secs: f64) {
        let entry = self.credentials.entry(credential_id.to_string()).or_default();
        let mut health = entry.lock().unwrap();
        health.status = HealthStatus::Degraded;
        health.risk_level = RiskLevel::High;
        health.degraded_until = now_secs() + duration_secs;
    }

    pub fn manual_ban(&self, credential_id: &str, duration_secs: f64) {
        let entry = self.credentials.entry(credential_id.to_string()).or_default();
        let mut health = entry.lock().unwrap();
        health.status = HealthStatus::Banned;
        health.risk_level = RiskLevel::Critical;
        health.banned_until = now_secs() + duration_secs;
    }

    /// Restore any credential whose degrade/ban window has elapsed. Intended
    /// to run on a periodic background tick.
    pub fn auto_recover(&self) {
        let now = now_secs();
        for entry in self.credentials.iter() {
            let mut health = entry.value().lock().unwrap();
            let expired_degrade = health.status == HealthStatus::Degraded && health.degraded_until < now;
            let expired_ban = health.status == HealthStatus::Banned && health.banned_until < now;
            if expired_degrade || expired_ban {
                health.recover();
                tracing::info!(credential_id = %entry.key(), "credential auto-recovered");
            }
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
