//! Notifier configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides apart
//! from `LOG_LEVEL`.  Default config path: `/etc/notifier/notifier.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `auth.secret_file`
//! - `cors.allowed_origins` when `environment = "production"`
//!
//! # Secret file format
//! Raw HMAC secret on a single line; trimmed on read.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level notifier configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub schema_version: u32,
    pub bind: String,
    pub environment: Environment,
    /// Hub capacity; registrations beyond this are rejected with 503.
    pub max_connections: usize,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub websocket: WebsocketConfig,
    pub subscriber: SubscriberConfig,
    pub webhook: WebhookConfig,
    pub cors: CorsConfig,
    pub shutdown_deadline: Duration,
}

/// Deployment environment; selects the origin policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// The HMAC secret (read from the secret file, not the file path).
    pub secret: String,
    /// Cookie used as the token fallback when the query param is absent.
    pub cookie_name: String,
}

#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    /// Writer's ping cadence.
    pub ping_interval: Duration,
    /// Reader's read deadline, re-armed on every inbound frame.
    pub pong_wait: Duration,
    /// Deadline applied to every socket write.
    pub write_wait: Duration,
    /// Inbound frame size limit in bytes.
    pub max_message_size: usize,
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Crisis alert sink; alerts are dropped with a debug log when unset.
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    bind: Option<String>,
    environment: Option<String>,
    max_connections: Option<usize>,
    redis: Option<RawRedisConfig>,
    auth: Option<RawAuthConfig>,
    websocket: Option<RawWebsocketConfig>,
    subscriber: Option<RawSubscriberConfig>,
    webhook: Option<RawWebhookConfig>,
    cors: Option<RawCorsConfig>,
    shutdown: Option<RawShutdownConfig>,
}

#[derive(Debug, Deserialize)]
struct RawRedisConfig {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    secret_file: Option<String>,
    cookie_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWebsocketConfig {
    ping_interval_secs: Option<u64>,
    pong_wait_secs: Option<u64>,
    write_wait_secs: Option<u64>,
    max_message_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawSubscriberConfig {
    max_retries: Option<u32>,
    retry_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawWebhookConfig {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCorsConfig {
    allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawShutdownConfig {
    deadline_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load notifier config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load notifier config from the default path `/etc/notifier/notifier.toml`.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/notifier/notifier.toml"))
}

/// Load notifier config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let environment = match raw.environment.as_deref() {
        None | Some("development") => Environment::Development,
        Some("production") => Environment::Production,
        Some(other) => {
            return Err(ConfigError::InvalidValue(format!(
                "environment must be 'development' or 'production', got '{other}'"
            )));
        }
    };

    let max_connections = raw.max_connections.unwrap_or(10_000);
    if max_connections == 0 {
        return Err(ConfigError::InvalidValue(
            "max_connections must be at least 1".to_owned(),
        ));
    }

    let redis = RedisConfig {
        url: raw
            .redis
            .and_then(|r| r.url)
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_owned()),
    };

    let raw_auth = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let secret_file = raw_auth
        .secret_file
        .ok_or_else(|| ConfigError::MissingField("auth.secret_file".to_owned()))?;
    let auth = AuthConfig {
        secret: read_secret_file(&secret_file)?,
        cookie_name: raw_auth
            .cookie_name
            .unwrap_or_else(|| "auth_token".to_owned()),
    };

    let websocket = match raw.websocket {
        Some(w) => WebsocketConfig {
            ping_interval: Duration::from_secs(w.ping_interval_secs.unwrap_or(30)),
            pong_wait: Duration::from_secs(w.pong_wait_secs.unwrap_or(60)),
            write_wait: Duration::from_secs(w.write_wait_secs.unwrap_or(10)),
            max_message_size: w.max_message_size.unwrap_or(512),
        },
        None => WebsocketConfig {
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 512,
        },
    };
    if websocket.pong_wait <= websocket.ping_interval {
        return Err(ConfigError::InvalidValue(format!(
            "websocket.pong_wait_secs ({}) must exceed ping_interval_secs ({})",
            websocket.pong_wait.as_secs(),
            websocket.ping_interval.as_secs()
        )));
    }
    if websocket.max_message_size == 0 {
        return Err(ConfigError::InvalidValue(
            "websocket.max_message_size must be at least 1".to_owned(),
        ));
    }

    let subscriber = match raw.subscriber {
        Some(s) => SubscriberConfig {
            max_retries: s.max_retries.unwrap_or(10),
            retry_delay: Duration::from_secs(s.retry_delay_secs.unwrap_or(5)),
        },
        None => SubscriberConfig {
            max_retries: 10,
            retry_delay: Duration::from_secs(5),
        },
    };

    let webhook = WebhookConfig {
        url: raw.webhook.and_then(|w| w.url),
    };

    let cors = CorsConfig {
        allowed_origins: raw.cors.and_then(|c| c.allowed_origins).unwrap_or_default(),
    };
    if environment == Environment::Production && cors.allowed_origins.is_empty() {
        return Err(ConfigError::InvalidValue(
            "cors.allowed_origins is required when environment = 'production'".to_owned(),
        ));
    }

    let shutdown_deadline =
        Duration::from_secs(raw.shutdown.and_then(|s| s.deadline_secs).unwrap_or(10));

    Ok(Config {
        schema_version,
        bind: raw.bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
        environment,
        max_connections,
        redis,
        auth,
        websocket,
        subscriber,
        webhook,
        cors,
        shutdown_deadline,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Secret file reader
// ---------------------------------------------------------------------------

fn read_secret_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading secret file '{path}': {e}")))?;
    let secret = content.trim().to_owned();
    if secret.is_empty() {
        return Err(ConfigError::InvalidValue(format!(
            "secret file '{path}' is empty"
        )));
    }
    Ok(secret)
}
