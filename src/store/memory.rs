// In-memory Store for unit tests that don't want real SQLite I/O.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::IteratorRandom;
use std::collections::HashMap;

use super::{
    CacheConfig, ClientToken, Credential, CredentialUpdate, LogRow, RiskControlConfig, Store, User,
};

#[derive(Default)]
struct State {
    credentials: HashMap<String, Credential>,
    tokens: HashMap<String, ClientToken>,
    users: HashMap<String, User>,
    logs: Vec<LogRow>,
    cache_config: Option<CacheConfig>,
    risk_control_config: Option<RiskControlConfig>,
}

pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn insert_credential(&self, credential: Credential) {
        self.state
            .lock()
            .unwrap()
            .credentials
            .insert(credential.id.clone(), credential);
    }

    pub fn insert_token(&self, token: ClientToken) {
        self.state.lock().unwrap().tokens.insert(token.key_hash.clone(), token);
    }

    pub fn insert_user(&self, user: User) {
        self.state.lock().unwrap().users.insert(user.id.clone(), user);
    }

    pub fn set_cache_config(&self, config: CacheConfig) {
        self.state.lock().unwrap().cache_config = Some(config);
    }

    pub fn set_risk_control_config(&self, config: RiskControlConfig) {
        self.state.lock().unwrap().risk_control_config = Some(config);
    }

    pub fn logs(&self) -> Vec<LogRow> {
        self.state.lock().unwrap().logs.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_available_credential(&self, provider_type: &str) -> Result<Option<Credential>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .credentials
            .values()
            .filter(|c| c.provider_type == provider_type && c.enabled)
            .choose(&mut rand::thread_rng())
            .cloned())
    }

    async fn get_token(&self, key_hash: &str) -> Result<Option<ClientToken>> {
        Ok(self.state.lock().unwrap().tokens.get(key_hash).cloned())
    }

    async fn increment_token_usage(&self, token_id: &str, input: u64, output: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(token) = state.tokens.values_mut().find(|t| t.id == token_id) {
            token.total_input_tokens += input;
            token.total_output_tokens += output;
        }
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.state.lock().unwrap().users.get(id).cloned())
    }

    async fn decrement_user_quota(&self, user_id: &str, amount: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.get_mut(user_id) {
            if let Some(quota) = user.remaining_quota.as_mut() {
                *quota -= amount;
            }
        }
        Ok(())
    }

    async fn add_user_tokens(&self, user_id: &str, input: u64, output: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.get_mut(user_id) {
            user.total_input_tokens += input;
            user.total_output_tokens += output;
        }
        Ok(())
    }

    async fn update_credential(&self, id: &str, update: CredentialUpdate) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(cred) = state.credentials.get_mut(id) {
            if let Some(enabled) = update.enabled {
                cred.enabled = enabled;
            }
            if let Some(payload) = update.payload {
                cred.payload = payload;
            }
        }
        Ok(())
    }

    async fn add_credential_credit(&self, id: &str, delta: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(cred) = state.credentials.get_mut(id) {
            cred.credit_balance += delta;
        }
        Ok(())
    }

    async fn add_credential_tokens(&self, id: &str, input: u64, output: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(cred) = state.credentials.get_mut(id) {
            cred.total_input_tokens += input;
            cred.total_output_tokens += output;
        }
        Ok(())
    }

    async fn write_log(&self, row: LogRow) -> Result<()> {
        self.state.lock().unwrap().logs.push(row);
        Ok(())
    }

    async fn get_cache_config(&self) -> Result<CacheConfig> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .cache_config
            .clone()
            .unwrap_or(CacheConfig {
                prompt_cache_enabled: true,
                context_compression_enabled: false,
                context_compression_threshold: 60_000,
                context_compression_target: 30_000,
                context_compression_strategy: super::CompressionStrategy::SlidingWindow,
            }))
    }

    async fn get_risk_control_config(&self) -> Result<RiskControlConfig> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .risk_control_config
            .clone()
            .unwrap_or(RiskControlConfig {
                proxy_binding_strategy: "STICKY".to_string(),
                proxy_health_check_timeout_secs: 10,
                fingerprint_pool_size: 50,
                rate_limit_global_rpm: 600,
                rate_limit_global_tpm: 1_000_000,
                rate_limit_burst_size: 10,
                rate_limit_min_interval_ms: 0,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(id: &str, provider: &str, enabled: bool) -> Credential {
        Credential {
            id: id.to_string(),
            provider_type: provider.to_string(),
            enabled,
            credit_balance: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_get_available_credential_filters_disabled() {
        let store = MemoryStore::new();
        store.insert_credential(credential("c1", "kiro", false));
        store.insert_credential(credential("c2", "kiro", true));
        let cred = store.get_available_credential("kiro").await.unwrap().unwrap();
        assert_eq!(cred.id, "c2");
    }

    #[tokio::test]
    async fn test_add_credential_tokens_accumulates() {
        let store = MemoryStore::new();
        store.insert_credential(credential("c1", "kiro", true));
        store.add_credential_tokens("c1", 10, 20).await.unwrap();
        store.add_credential_tokens("c1", 1, 2).await.unwrap();
        let cred = store.get_available_credential("kiro").await.unwrap().unwrap();
        assert_eq!(cred.total_input_tokens, 11);
        assert_eq!(cred.total_output_tokens, 22);
    }

    #[tokio::test]
    async fn test_decrement_user_quota() {
        let store = MemoryStore::new();
        store.insert_user(User {
            id: "u1".to_string(),
            name: "alice".to_string(),
            remaining_quota: Some(100.0),
            total_input_tokens: 0,
            total_output_tokens: 0,
        });
        store.decrement_user_quota("u1", 30.0).await.unwrap();
        let user = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.remaining_quota, Some(70.0));
    }

    #[tokio::test]
    async fn test_unlimited_quota_untouched() {
        let store = MemoryStore::new();
        store.insert_user(User {
            id: "u1".to_string(),
            name: "alice".to_string(),
            remaining_quota: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
        });
        store.decrement_user_quota("u1", 30.0).await.unwrap();
        let user = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.remaining_quota, None);
    }

    #[tokio::test]
    async fn test_write_log_appends() {
        let store = MemoryStore::new();
        assert_eq!(store.logs().len(), 0);
        store
            .write_log(LogRow {
                user_id: "u1".to_string(),
                provider_type: "kiro".to_string(),
                model: "m".to_string(),
                input_tokens: 1,
                output_tokens: 1,
                cache_read_tokens: 0,
                cache_create_tokens: 0,
                duration_ms: 1,
                status: 200,
                error: None,
                compressed: false,
                original_tokens: 0,
                compressed_tokens: 0,
                created_at: 0,
            })
            .await
            .unwrap();
        assert_eq!(store.logs().len(), 1);
    }

    #[tokio::test]
    async fn test_default_configs_returned_when_unset() {
        let store = MemoryStore::new();
        let cache = store.get_cache_config().await.unwrap();
        assert!(cache.prompt_cache_enabled);
        let risk = store.get_risk_control_config().await.unwrap();
        assert_eq!(risk.proxy_binding_strategy, "STICKY");
    }
}
