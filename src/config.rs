// Configuration module
// Loads and validates configuration from CLI args, environment variables, and defaults

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Kiro Gateway - Rust Implementation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Authentication
    pub proxy_api_key: String,

    // Kiro credentials
    pub kiro_region: String,
    /// Local Kiro CLI auth database, used only to import a bootstrap credential into the pool.
    /// Optional: deployments that seed credentials directly into `sqlite_path` don't need this.
    pub kiro_cli_db_file: Option<PathBuf>,

    // Timeouts
    #[allow(dead_code)]
    pub streaming_timeout: u64,
    pub token_refresh_threshold: u64,
    pub first_token_timeout: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Debug
    pub debug_mode: DebugMode,
    pub log_level: String,

    // Converter settings
    pub tool_description_max_length: usize,
    pub fake_reasoning_enabled: bool,
    pub fake_reasoning_max_tokens: u32,
    #[allow(dead_code)]
    pub fake_reasoning_handling: FakeReasoningHandling,

    // Gateway's own persistence (client tokens, credential pool, logs, risk-control config)
    pub sqlite_path: PathBuf,

    // Risk-control fabric defaults, overridable per-call by the persisted risk-control config row
    pub proxy_binding_strategy: String,
    pub proxy_health_check_timeout: u64,
    pub fingerprint_pool_size: usize,
    pub rate_limit_global_rpm: u32,
    pub rate_limit_global_tpm: u32,
    pub rate_limit_burst_size: u32,
    pub rate_limit_min_interval_ms: u64,

    // Relay orchestrator
    pub upstream_timeout: u64,
    pub relay_max_attempts: u32,
    pub relay_retry_delay_ms: u64,

    // Context compression defaults, overridable per-call by the persisted cache-config row
    pub context_compression_enabled: bool,
    pub context_compression_threshold: u32,
    pub context_compression_target: u32,
    pub prompt_cache_enabled: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FakeReasoningHandling {
    AsReasoningContent,  // Extract to reasoning_content field (OpenAI-compatible)
    Remove,              // Remove thinking block completely
    Pass,                // Pass through with original tags
    StripTags,           // Remove tags but keep content
}

#[derive(Clone, Debug, PartialEq)]
pub enum DebugMode {
    Off,
    Errors,
    All,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        // Parse CLI arguments
        let args = CliArgs::parse();

        // Build config with priority handling
        let config = Config {
            // Server settings (CLI > ENV > default)
            server_host: args
                .host
                .or_else(|| std::env::var("SERVER_HOST").ok())
                .unwrap_or_else(|| "0.0.0.0".to_string()),

            server_port: args
                .port
                .or_else(|| std::env::var("SERVER_PORT").ok().and_then(|s| s.parse().ok()))
                .unwrap_or(8000),

            // Authentication (required)
            proxy_api_key: std::env::var("PROXY_API_KEY")
                .context("PROXY_API_KEY environment variable is required")?,

            // Kiro credentials
            kiro_region: std::env::var("KIRO_REGION").unwrap_or_else(|_| "us-east-1".to_string()),

            kiro_cli_db_file: std::env::var("KIRO_CLI_DB_FILE")
                .ok()
                .map(|s| expand_tilde(&s)),

            // Timeouts
            streaming_timeout: std::env::var("STREAMING_READ_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),

            token_refresh_threshold: std::env::var("TOKEN_REFRESH_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),

            first_token_timeout: std::env::var("FIRST_TOKEN_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(15),

            // HTTP client
            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            http_request_timeout: std::env::var("HTTP_REQUEST_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),

            http_max_retries: std::env::var("HTTP_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),

            // Debug
            debug_mode: parse_debug_mode(&std::env::var("DEBUG_MODE").unwrap_or_default()),

            log_level: args
                .log_level
                .or_else(|| std::env::var("LOG_LEVEL").ok())
                .unwrap_or_else(|| "info".to_string()),

            // Converter settings
            tool_description_max_length: std::env::var("TOOL_DESCRIPTION_MAX_LENGTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10000),

            // Fake reasoning - enabled by default (like Python)
            // FAKE_REASONING env var: empty/"true"/"1"/"yes" = enabled, "false"/"0"/"no"/"disabled"/"off" = disabled
            fake_reasoning_enabled: {
                let raw = std::env::var("FAKE_REASONING").unwrap_or_default().to_lowercase();
                // Default is true - only disable if explicitly set to false/0/no/disabled/off
                !matches!(raw.as_str(), "false" | "0" | "no" | "disabled" | "off")
            },

            fake_reasoning_max_tokens: std::env::var("FAKE_REASONING_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4000),

            fake_reasoning_handling: parse_fake_reasoning_handling(
                &std::env::var("FAKE_REASONING_HANDLING").unwrap_or_default()
            ),

            sqlite_path: std::env::var("GATEWAY_DB_FILE")
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(|_| PathBuf::from("gateway.db")),

            proxy_binding_strategy: std::env::var("PROXY_BINDING_STRATEGY")
                .unwrap_or_else(|_| "STICKY".to_string()),

            proxy_health_check_timeout: std::env::var("PROXY_HEALTH_CHECK_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            fingerprint_pool_size: std::env::var("FINGERPRINT_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50),

            rate_limit_global_rpm: std::env::var("RATE_LIMIT_GLOBAL_RPM")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(600),

            rate_limit_global_tpm: std::env::var("RATE_LIMIT_GLOBAL_TPM")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1_000_000),

            rate_limit_burst_size: std::env::var("RATE_LIMIT_BURST_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            rate_limit_min_interval_ms: std::env::var("RATE_LIMIT_MIN_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),

            upstream_timeout: std::env::var("UPSTREAM_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),

            relay_max_attempts: std::env::var("RELAY_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),

            relay_retry_delay_ms: std::env::var("RELAY_RETRY_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),

            context_compression_enabled: std::env::var("CONTEXT_COMPRESSION_ENABLED")
                .ok()
                .map(|s| !matches!(s.to_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(false),

            context_compression_threshold: std::env::var("CONTEXT_COMPRESSION_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60_000),

            context_compression_target: std::env::var("CONTEXT_COMPRESSION_TARGET")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30_000),

            prompt_cache_enabled: std::env::var("PROMPT_CACHE_ENABLED")
                .ok()
                .map(|s| !matches!(s.to_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(true),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // If a Kiro CLI auth database was configured for bootstrap import, it must exist.
        if let Some(path) = &self.kiro_cli_db_file {
            if !path.exists() {
                anyhow::bail!("KIRO_CLI_DB_FILE does not exist: {}", path.display());
            }
        }

        if self.relay_max_attempts == 0 {
            anyhow::bail!("RELAY_MAX_ATTEMPTS must be at least 1");
        }

        Ok(())
    }

    /// A fully-populated config for tests, so test modules don't each hand-roll
    /// a `Config` literal that drifts out of sync with this struct.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 8000,
            proxy_api_key: "test-key-123".to_string(),
            kiro_region: "us-east-1".to_string(),
            kiro_cli_db_file: None,
            streaming_timeout: 300,
            token_refresh_threshold: 300,
            first_token_timeout: 15,
            http_max_connections: 20,
            http_connect_timeout: 30,
            http_request_timeout: 300,
            http_max_retries: 3,
            debug_mode: DebugMode::Off,
            log_level: "info".to_string(),
            tool_description_max_length: 10_000,
            fake_reasoning_enabled: false,
            fake_reasoning_max_tokens: 10_000,
            fake_reasoning_handling: FakeReasoningHandling::AsReasoningContent,
            sqlite_path: PathBuf::from(":memory:"),
            proxy_binding_strategy: "STICKY".to_string(),
            proxy_health_check_timeout: 10,
            fingerprint_pool_size: 4,
            rate_limit_global_rpm: 0,
            rate_limit_global_tpm: 0,
            rate_limit_burst_size: 0,
            rate_limit_min_interval_ms: 0,
            upstream_timeout: 300,
            relay_max_attempts: 3,
            relay_retry_delay_ms: 1000,
            context_compression_enabled: false,
            context_compression_threshold: 60_000,
            context_compression_target: 30_000,
            prompt_cache_enabled: false,
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&path[2..]);
        }
    }
    PathBuf::from(path)
}

/// Parse debug mode from string
fn parse_debug_mode(s: &str) -> DebugMode {
    match s.to_lowercase().as_str() {
        "errors" => DebugMode::Errors,
        "all" => DebugMode::All,
        _ => DebugMode::Off,
    }
}

/// Parse fake reasoning handling mode from string
fn parse_fake_reasoning_handling(s: &str) -> FakeReasoningHandling {
    match s.to_lowercase().as_str() {
        "remove" => FakeReasoningHandling::Remove,
        "pass" => FakeReasoningHandling::Pass,
        "strip_tags" => FakeReasoningHandling::StripTags,
        _ => FakeReasoningHandling::AsReasoningContent, // default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_relative_path() {
        let path = expand_tilde("relative/path");
        assert_eq!(path, PathBuf::from("relative/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_parse_debug_mode() {
        assert_eq!(parse_debug_mode("off"), DebugMode::Off);
        assert_eq!(parse_debug_mode("errors"), DebugMode::Errors);
        assert_eq!(parse_debug_mode("all"), DebugMode::All);
        assert_eq!(parse_debug_mode("invalid"), DebugMode::Off);
        assert_eq!(parse_debug_mode(""), DebugMode::Off);
    }

    #[test]
    fn test_parse_debug_mode_case_insensitive() {
        assert_eq!(parse_debug_mode("ERRORS"), DebugMode::Errors);
        assert_eq!(parse_debug_mode("Errors"), DebugMode::Errors);
        assert_eq!(parse_debug_mode("ALL"), DebugMode::All);
        assert_eq!(parse_debug_mode("All"), DebugMode::All);
        assert_eq!(parse_debug_mode("OFF"), DebugMode::Off);
    }

    #[test]
    fn test_parse_fake_reasoning_handling() {
        assert_eq!(
            parse_fake_reasoning_handling(""),
            FakeReasoningHandling::AsReasoningContent
        );
        assert_eq!(
            parse_fake_reasoning_handling("remove"),
            FakeReasoningHandling::Remove
        );
        assert_eq!(
            parse_fake_reasoning_handling("pass"),
            FakeReasoningHandling::Pass
        );
        assert_eq!(
            parse_fake_reasoning_handling("strip_tags"),
            FakeReasoningHandling::StripTags
        );
    }

    #[test]
    fn test_parse_fake_reasoning_handling_case_insensitive() {
        assert_eq!(
            parse_fake_reasoning_handling("REMOVE"),
            FakeReasoningHandling::Remove
        );
        assert_eq!(
            parse_fake_reasoning_handling("Remove"),
            FakeReasoningHandling::Remove
        );
        assert_eq!(
            parse_fake_reasoning_handling("PASS"),
            FakeReasoningHandling::Pass
        );
        assert_eq!(
            parse_fake_reasoning_handling("STRIP_TAGS"),
            FakeReasoningHandling::StripTags
        );
    }

    #[test]
    fn test_parse_fake_reasoning_handling_default() {
        // Unknown values should default to AsReasoningContent
        assert_eq!(
            parse_fake_reasoning_handling("unknown"),
            FakeReasoningHandling::AsReasoningContent
        );
        assert_eq!(
            parse_fake_reasoning_handling("invalid"),
            FakeReasoningHandling::AsReasoningContent
        );
    }

    #[test]
    fn test_debug_mode_equality() {
        assert_eq!(DebugMode::Off, DebugMode::Off);
        assert_eq!(DebugMode::Errors, DebugMode::Errors);
        assert_eq!(DebugMode::All, DebugMode::All);
        assert_ne!(DebugMode::Off, DebugMode::Errors);
        assert_ne!(DebugMode::Errors, DebugMode::All);
    }

    #[test]
    fn test_fake_reasoning_handling_equality() {
        assert_eq!(
            FakeReasoningHandling::AsReasoningContent,
            FakeReasoningHandling::AsReasoningContent
        );
        assert_eq!(FakeReasoningHandling::Remove, FakeReasoningHandling::Remove);
        assert_eq!(FakeReasoningHandling::Pass, FakeReasoningHandling::Pass);
        assert_eq!(
            FakeReasoningHandling::StripTags,
            FakeReasoningHandling::StripTags
        );
        assert_ne!(FakeReasoningHandling::Remove, FakeReasoningHandling::Pass);
    }
}
