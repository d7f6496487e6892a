// SQLite-backed Store implementation. One connection guarded by a mutex,
// per the "per-call connection, not a pool" design decision — contention is
// bounded by how much I/O per request actually touches persistence.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    CacheConfig, ClientToken, CompressionStrategy, Credential, CredentialUpdate, LogRow,
    RiskControlConfig, Store, TokenStatus, User,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open gateway database: {}", path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize gateway database schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    id TEXT PRIMARY KEY,
    provider_type TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    credit_balance REAL NOT NULL DEFAULT 0,
    total_input_tokens INTEGER NOT NULL DEFAULT 0,
    total_output_tokens INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS client_tokens (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    key_hash TEXT NOT NULL UNIQUE,
    total_input_tokens INTEGER NOT NULL DEFAULT 0,
    total_output_tokens INTEGER NOT NULL DEFAULT 0,
    cross_group_retry INTEGER NOT NULL DEFAULT 0,
    expires_at INTEGER,
    ip_allowlist TEXT,
    model_allowlist TEXT
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    remaining_quota REAL,
    total_input_tokens INTEGER NOT NULL DEFAULT 0,
    total_output_tokens INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    provider_type TEXT NOT NULL,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cache_read_tokens INTEGER NOT NULL,
    cache_create_tokens INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    status INTEGER NOT NULL,
    error TEXT,
    compressed INTEGER NOT NULL,
    original_tokens INTEGER NOT NULL,
    compressed_tokens INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    prompt_cache_enabled INTEGER NOT NULL DEFAULT 1,
    context_compression_enabled INTEGER NOT NULL DEFAULT 0,
    context_compression_threshold INTEGER NOT NULL DEFAULT 60000,
    context_compression_target INTEGER NOT NULL DEFAULT 30000,
    context_compression_strategy TEXT NOT NULL DEFAULT 'sliding_window'
);

CREATE TABLE IF NOT EXISTS risk_control_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    proxy_binding_strategy TEXT NOT NULL DEFAULT 'STICKY',
    proxy_health_check_timeout_secs INTEGER NOT NULL DEFAULT 10,
    fingerprint_pool_size INTEGER NOT NULL DEFAULT 50,
    rate_limit_global_rpm INTEGER NOT NULL DEFAULT 600,
    rate_limit_global_tpm INTEGER NOT NULL DEFAULT 1000000,
    rate_limit_burst_size INTEGER NOT NULL DEFAULT 10,
    rate_limit_min_interval_ms INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO cache_config (id) VALUES (1);
INSERT OR IGNORE INTO risk_control_config (id) VALUES (1);
"#;

fn token_status_to_str(status: TokenStatus) -> &'static str {
    match status {
        TokenStatus::Active => "active",
        TokenStatus::Disabled => "disabled",
        TokenStatus::Exhausted => "exhausted",
        TokenStatus::Expired => "expired",
    }
}

fn token_status_from_str(s: &str) -> TokenStatus {
    match s {
        "disabled" => TokenStatus::Disabled,
        "exhausted" => TokenStatus::Exhausted,
        "expired" => TokenStatus::Expired,
        _ => TokenStatus::Active,
    }
}

fn strategy_from_str(s: &str) -> CompressionStrategy {
    match s {
        "summary" => CompressionStrategy::Summary,
        "hybrid" => CompressionStrategy::Hybrid,
        _ => CompressionStrategy::SlidingWindow,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_available_credential(&self, provider_type: &str) -> Result<Option<Credential>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, provider_type, enabled, credit_balance, total_input_tokens, total_output_tokens, payload \
             FROM credentials WHERE provider_type = ?1 AND enabled = 1 ORDER BY RANDOM() LIMIT 1",
            params![provider_type],
            |row| {
                Ok(Credential {
                    id: row.get(0)?,
                    provider_type: row.get(1)?,
                    enabled: row.get::<_, i64>(2)? != 0,
                    credit_balance: row.get(3)?,
                    total_input_tokens: row.get::<_, i64>(4)? as u64,
                    total_output_tokens: row.get::<_, i64>(5)? as u64,
                    payload: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
                })
            },
        )
        .optional()
        .context("get_available_credential failed")
    }

    async fn get_token(&self, key_hash: &str) -> Result<Option<ClientToken>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, status, key_hash, total_input_tokens, total_output_tokens, cross_group_retry, \
             expires_at, ip_allowlist, model_allowlist \
             FROM client_tokens WHERE key_hash = ?1",
            params![key_hash],
            |row| {
                Ok(ClientToken {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    status: token_status_from_str(&row.get::<_, String>(2)?),
                    key_hash: row.get(3)?,
                    total_input_tokens: row.get::<_, i64>(4)? as u64,
                    total_output_tokens: row.get::<_, i64>(5)? as u64,
                    cross_group_retry: row.get::<_, i64>(6)? != 0,
                    expires_at: row.get(7)?,
                    ip_allowlist: row
                        .get::<_, Option<String>>(8)?
                        .and_then(|s| serde_json::from_str(&s).ok()),
                    model_allowlist: row
                        .get::<_, Option<String>>(9)?
                        .and_then(|s| serde_json::from_str(&s).ok()),
                })
            },
        )
        .optional()
        .context("get_token failed")
    }

    async fn increment_token_usage(&self, token_id: &str, input: u64, output: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE client_tokens SET total_input_tokens = total_input_tokens + ?2, \
             total_output_tokens = total_output_tokens + ?3 WHERE id = ?1",
            params![token_id, input as i64, output as i64],
        )
        .context("increment_token_usage failed")?;
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, remaining_quota, total_input_tokens, total_output_tokens FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    remaining_quota: row.get(2)?,
                    total_input_tokens: row.get::<_, i64>(3)? as u64,
                    total_output_tokens: row.get::<_, i64>(4)? as u64,
                })
            },
        )
        .optional()
        .context("get_user failed")
    }

    async fn decrement_user_quota(&self, user_id: &str, amount: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET remaining_quota = remaining_quota - ?2 \
             WHERE id = ?1 AND remaining_quota IS NOT NULL",
            params![user_id, amount],
        )
        .context("decrement_user_quota failed")?;
        Ok(())
    }

    async fn add_user_tokens(&self, user_id: &str, input: u64, output: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET total_input_tokens = total_input_tokens + ?2, \
             total_output_tokens = total_output_tokens + ?3 WHERE id = ?1",
            params![user_id, input as i64, output as i64],
        )
        .context("add_user_tokens failed")?;
        Ok(())
    }

    async fn update_credential(&self, id: &str, update: CredentialUpdate) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if let Some(enabled) = update.enabled {
            conn.execute(
                "UPDATE credentials SET enabled = ?2 WHERE id = ?1",
                params![id, enabled as i64],
            )
            .context("update_credential(enabled) failed")?;
        }
        if let Some(payload) = update.payload {
            conn.execute(
                "UPDATE credentials SET payload = ?2 WHERE id = ?1",
                params![id, payload.to_string()],
            )
            .context("update_credential(payload) failed")?;
        }
        Ok(())
    }

    async fn add_credential_credit(&self, id: &str, delta: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE credentials SET credit_balance = credit_balance + ?2 WHERE id = ?1",
            params![id, delta],
        )
        .context("add_credential_credit failed")?;
        Ok(())
    }

    async fn add_credential_tokens(&self, id: &str, input: u64, output: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE credentials SET total_input_tokens = total_input_tokens + ?2, \
             total_output_tokens = total_output_tokens + ?3 WHERE id = ?1",
            params![id, input as i64, output as i64],
        )
        .context("add_credential_tokens failed")?;
        Ok(())
    }

    async fn write_log(&self, row: LogRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO logs (user_id, provider_type, model, input_tokens, output_tokens, \
             cache_read_tokens, cache_create_tokens, duration_ms, status, error, compressed, \
             original_tokens, compressed_tokens, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                row.user_id,
                row.provider_type,
                row.model,
                row.input_tokens as i64,
                row.output_tokens as i64,
                row.cache_read_tokens as i64,
                row.cache_create_tokens as i64,
                row.duration_ms as i64,
                row.status as i64,
                row.error,
                row.compressed as i64,
                row.original_tokens as i64,
                row.compressed_tokens as i64,
                row.created_at,
            ],
        )
        .context("write_log failed")?;
        Ok(())
    }

    async fn get_cache_config(&self) -> Result<CacheConfig> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT prompt_cache_enabled, context_compression_enabled, context_compression_threshold, \
             context_compression_target, context_compression_strategy FROM cache_config WHERE id = 1",
            [],
            |row| {
                Ok(CacheConfig {
                    prompt_cache_enabled: row.get::<_, i64>(0)? != 0,
                    context_compression_enabled: row.get::<_, i64>(1)? != 0,
                    context_compression_threshold: row.get::<_, i64>(2)? as u32,
                    context_compression_target: row.get::<_, i64>(3)? as u32,
                    context_compression_strategy: strategy_from_str(&row.get::<_, String>(4)?),
                })
            },
        )
        .context("get_cache_config failed")
    }

    async fn get_risk_control_config(&self) -> Result<RiskControlConfig> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT proxy_binding_strategy, proxy_health_check_timeout_secs, fingerprint_pool_size, \
             rate_limit_global_rpm, rate_limit_global_tpm, rate_limit_burst_size, rate_limit_min_interval_ms \
             FROM risk_control_config WHERE id = 1",
            [],
            |row| {
                Ok(RiskControlConfig {
                    proxy_binding_strategy: row.get(0)?,
                    proxy_health_check_timeout_secs: row.get::<_, i64>(1)? as u64,
                    fingerprint_pool_size: row.get::<_, i64>(2)? as usize,
                    rate_limit_global_rpm: row.get::<_, i64>(3)? as u32,
                    rate_limit_global_tpm: row.get::<_, i64>(4)? as u32,
                    rate_limit_burst_size: row.get::<_, i64>(5)? as u32,
                    rate_limit_min_interval_ms: row.get::<_, i64>(6)? as u64,
                })
            },
        )
        .context("get_risk_control_config failed")
    }
}
