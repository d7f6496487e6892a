// Persistence contract: the core never talks to SQLite directly, only to
// this trait, so tests can swap in an in-memory store.

pub mod memory;
pub mod sqlite;
pub mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_available_credential(&self, provider_type: &str) -> Result<Option<Credential>>;
    async fn get_token(&self, key_hash: &str) -> Result<Option<ClientToken>>;
    async fn increment_token_usage(&self, token_id: &str, input: u64, output: u64) -> Result<()>;

    async fn get_user(&self, id: &str) -> Result<Option<User>>;
    async fn decrement_user_quota(&self, user_id: &str, amount: f64) -> Result<()>;
    async fn add_user_tokens(&self, user_id: &str, input: u64, output: u64) -> Result<()>;

    async fn update_credential(&self, id: &str, update: CredentialUpdate) -> Result<()>;
    async fn add_credential_credit(&self, id: &str, delta: f64) -> Result<()>;
    async fn add_credential_tokens(&self, id: &str, input: u64, output: u64) -> Result<()>;

    async fn write_log(&self, row: LogRow) -> Result<()>;

    async fn get_cache_config(&self) -> Result<CacheConfig>;
    async fn get_risk_control_config(&self) -> Result<RiskControlConfig>;
}
