use std::env;

/// Environment-driven configuration for the whole relay, read once at
/// startup via `from_env()`.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub storage_backend: StorageBackend,
    pub database_path: String,

    pub api_key_required: bool,
    pub master_api_key: Option<String>,
    pub require_http_signatures: bool,

    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,

    pub message_ttl_sec: i64,
    pub cleanup_interval_ms: u64,
    pub lease_reclaim_interval_sec: u64,

    pub max_message_size_kb: u64,
    pub max_messages_per_agent: usize,

    pub registration_policy: RegistrationPolicy,

    pub default_visibility_timeout_secs: u64,
    pub max_attempts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPolicy {
    Open,
    ApprovalRequired,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let storage_backend = match env::var("STORAGE_BACKEND").as_deref() {
            Ok("sqlite") => StorageBackend::Sqlite,
            Ok("durable") => StorageBackend::Sqlite,
            _ => StorageBackend::Memory,
        };

        let registration_policy = match env::var("REGISTRATION_POLICY").as_deref() {
            Ok("open") => RegistrationPolicy::Open,
            _ => RegistrationPolicy::ApprovalRequired,
        };

        Self {
            port: env_parse("PORT", 8000),
            storage_backend,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "data/admp.db".to_string()),

            api_key_required: env_parse("API_KEY_REQUIRED", false),
            master_api_key: env::var("MASTER_API_KEY").ok(),
            require_http_signatures: env_parse("REQUIRE_HTTP_SIGNATURES", false),

            heartbeat_interval_ms: env_parse("HEARTBEAT_INTERVAL_MS", 30_000),
            heartbeat_timeout_ms: env_parse("HEARTBEAT_TIMEOUT_MS", 60_000),

            message_ttl_sec: env_parse("MESSAGE_TTL_SEC", 24 * 3600),
            cleanup_interval_ms: env_parse("CLEANUP_INTERVAL_MS", 60_000),
            lease_reclaim_interval_sec: env_parse("LEASE_RECLAIM_INTERVAL_SEC", 30),

            max_message_size_kb: env_parse("MAX_MESSAGE_SIZE_KB", 256),
            max_messages_per_agent: env_parse("MAX_MESSAGES_PER_AGENT", 10_000),

            registration_policy,

            default_visibility_timeout_secs: env_parse("DEFAULT_VISIBILITY_TIMEOUT_SECS", 30),
            max_attempts: env_parse("MAX_LEASE_ATTEMPTS", 5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            storage_backend: StorageBackend::Memory,
            database_path: "data/admp.db".to_string(),
            api_key_required: false,
            master_api_key: None,
            require_http_signatures: false,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            message_ttl_sec: 24 * 3600,
            cleanup_interval_ms: 60_000,
            lease_reclaim_interval_sec: 30,
            max_message_size_kb: 256,
            max_messages_per_agent: 10_000,
            registration_policy: RegistrationPolicy::ApprovalRequired,
            default_visibility_timeout_secs: 30,
            max_attempts: 5,
        }
    }
}
