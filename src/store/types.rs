// Domain types backing the persistence contract: credentials, tokens,
// users, and the two dynamic config rows (cache, risk-control).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub provider_type: String,
    pub enabled: bool,
    pub credit_balance: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Provider-specific auth blob (e.g. the Kiro credential JSON in §6).
    pub payload: serde_json::Value,
}

/// Partial update applied to a credential row; `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub enabled: Option<bool>,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    Disabled,
    Exhausted,
    Expired,
}

/// A client-issued token ("sk-prx-..."), the unit of multi-tenant auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientToken {
    pub id: String,
    pub user_id: String,
    pub status: TokenStatus,
    pub key_hash: String,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub cross_group_retry: bool,
    /// Epoch seconds after which the token is rejected regardless of `status`.
    pub expires_at: Option<i64>,
    /// `None` means no IP restriction; otherwise the caller's address must match exactly.
    pub ip_allowlist: Option<Vec<String>>,
    /// `None` means no model restriction; otherwise the requested model must be listed.
    pub model_allowlist: Option<Vec<String>>,
}

impl ClientToken {
    pub fn is_usable(&self, now: i64) -> bool {
        self.status == TokenStatus::Active && !self.is_expired(now)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    pub fn allows_ip(&self, ip: Option<&str>) -> bool {
        match &self.ip_allowlist {
            None => true,
            Some(list) if list.is_empty() => true,
            Some(list) => ip.is_some_and(|addr| list.iter().any(|allowed| allowed == addr)),
        }
    }

    pub fn allows_model(&self, model: Option<&str>) -> bool {
        match &self.model_allowlist {
            None => true,
            Some(list) if list.is_empty() => true,
            Some(list) => model.is_some_and(|m| list.iter().any(|allowed| allowed == m)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    /// `None` means unlimited quota.
    pub remaining_quota: Option<f64>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRow {
    pub user_id: String,
    pub provider_type: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_create_tokens: u64,
    pub duration_ms: u64,
    pub status: u16,
    pub error: Option<String>,
    pub compressed: bool,
    pub original_tokens: u64,
    pub compressed_tokens: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    SlidingWindow,
    Summary,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub prompt_cache_enabled: bool,
    pub context_compression_enabled: bool,
    pub context_compression_threshold: u32,
    pub context_compression_target: u32,
    pub context_compression_strategy: CompressionStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskControlConfig {
    pub proxy_binding_strategy: String,
    pub proxy_health_check_timeout_secs: u64,
    pub fingerprint_pool_size: usize,
    pub rate_limit_global_rpm: u32,
    pub rate_limit_global_tpm: u32,
    pub rate_limit_burst_size: u32,
    pub rate_limit_min_interval_ms: u64,
}
