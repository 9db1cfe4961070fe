//! Status client configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `<config dir>/status-client/config.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.ws_url`
//! - `auth.token_file`
//!
//! # Secret files
//! The token and the optional shared secret are read from files holding the
//! raw value on a single line; trimmed on read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sc_protocol::SubscriptionType;
use serde::Deserialize;

use crate::connection::{
    ConnectOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_MAX_RECONNECT_INTERVAL, DEFAULT_RECONNECT_INTERVAL,
};
use crate::reconciler::{DEFAULT_VERIFY_TIMEOUT, ReconcilerConfig};
use crate::verifier::{PRODUCTION_URL, SANDBOX_URL, VerifyOptions};

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub schema_version: u32,
    pub log_level: Option<String>,
    pub server: ServerConfig,
    /// The bearer token (read from the token file, not the file path).
    pub token: String,
    pub connection: ConnectionConfig,
    pub verification: VerificationConfig,
    pub products: Vec<ProductConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ws_url: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: bool,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub max_reconnect_interval: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub production_url: String,
    pub sandbox_url: String,
    pub shared_secret: Option<String>,
    pub exclude_sandbox: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductConfig {
    pub id: String,
    pub kind: SubscriptionType,
}

impl ClientConfig {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            token: self.token.clone(),
            reconnect: self.connection.reconnect,
            reconnect_interval: self.connection.reconnect_interval,
            max_reconnect_attempts: self.connection.max_reconnect_attempts,
            max_reconnect_interval: self.connection.max_reconnect_interval,
            connect_timeout: self.connection.connect_timeout,
        }
    }

    /// Receipt verification needs at least one recognized product; with none,
    /// every receipt would derive as unsubscribed.
    pub fn check_receipt_verification(&self) -> Result<(), ConfigError> {
        if self.products.is_empty() {
            return Err(ConfigError::MissingField(
                "products (at least one [[products]] entry is required to verify receipts)"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            products: self
                .products
                .iter()
                .map(|p| (p.id.clone(), p.kind))
                .collect::<HashMap<_, _>>(),
            options: VerifyOptions {
                secret: self.verification.shared_secret.clone(),
                exclude_sandbox: self.verification.exclude_sandbox,
            },
            timeout: self.verification.timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    log_level: Option<String>,
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    connection: Option<RawConnectionConfig>,
    verification: Option<RawVerificationConfig>,
    products: Option<Vec<RawProductConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    ws_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    token_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConnectionConfig {
    reconnect: Option<bool>,
    reconnect_interval_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    max_reconnect_interval_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVerificationConfig {
    production_url: Option<String>,
    sandbox_url: Option<String>,
    shared_secret_file: Option<String>,
    exclude_sandbox: Option<bool>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawProductConfig {
    id: Option<String>,
    kind: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// `<config dir>/status-client/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("status-client").join("config.toml"))
}

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    let path = default_config_path()
        .ok_or_else(|| ConfigError::Io("no platform config directory".to_owned()))?;
    load_config_from_path(&path)
}

/// Load config from a TOML string. Secret file paths are used as written.
pub fn load_config_from_str(toml_str: &str) -> Result<ClientConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let ws_url = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?
        .ws_url
        .ok_or_else(|| ConfigError::MissingField("server.ws_url".to_owned()))?;
    if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
        return Err(ConfigError::InvalidValue(format!(
            "server.ws_url must start with ws:// or wss://, got '{ws_url}'"
        )));
    }

    let token_file = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?
        .token_file
        .ok_or_else(|| ConfigError::MissingField("auth.token_file".to_owned()))?;
    let token = read_secret_file(&token_file, "token")?;
    if token.is_empty() {
        return Err(ConfigError::InvalidValue(format!(
            "token file '{token_file}' is empty"
        )));
    }

    let c = raw.connection.unwrap_or_default();
    let connection = ConnectionConfig {
        reconnect: c.reconnect.unwrap_or(true),
        reconnect_interval: c
            .reconnect_interval_ms
            .map_or(DEFAULT_RECONNECT_INTERVAL, Duration::from_millis),
        max_reconnect_attempts: c
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        max_reconnect_interval: c
            .max_reconnect_interval_ms
            .map_or(DEFAULT_MAX_RECONNECT_INTERVAL, Duration::from_millis),
        connect_timeout: c
            .connect_timeout_ms
            .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis),
    };
    if connection.reconnect_interval.is_zero() {
        return Err(ConfigError::InvalidValue(
            "connection.reconnect_interval_ms must be greater than 0".to_owned(),
        ));
    }
    if connection.connect_timeout.is_zero() {
        return Err(ConfigError::InvalidValue(
            "connection.connect_timeout_ms must be greater than 0".to_owned(),
        ));
    }
    if connection.max_reconnect_interval < connection.reconnect_interval {
        return Err(ConfigError::InvalidValue(
            "connection.max_reconnect_interval_ms must be >= reconnect_interval_ms".to_owned(),
        ));
    }

    let v = raw.verification.unwrap_or_default();
    let shared_secret = v
        .shared_secret_file
        .as_deref()
        .map(|path| read_secret_file(path, "shared secret"))
        .transpose()?;
    let verification = VerificationConfig {
        production_url: v.production_url.unwrap_or_else(|| PRODUCTION_URL.to_owned()),
        sandbox_url: v.sandbox_url.unwrap_or_else(|| SANDBOX_URL.to_owned()),
        shared_secret,
        exclude_sandbox: v.exclude_sandbox.unwrap_or(false),
        timeout: v
            .timeout_ms
            .map_or(DEFAULT_VERIFY_TIMEOUT, Duration::from_millis),
    };
    if verification.timeout.is_zero() {
        return Err(ConfigError::InvalidValue(
            "verification.timeout_ms must be greater than 0".to_owned(),
        ));
    }

    let raw_products = raw.products.unwrap_or_default();
    let mut products = Vec::with_capacity(raw_products.len());
    for (i, p) in raw_products.into_iter().enumerate() {
        let id = p
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("products[{i}].id")))?;
        let kind = match p.kind.as_deref() {
            Some("monthly") => SubscriptionType::Monthly,
            Some("annual") => SubscriptionType::Annual,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "products[{i}].kind must be \"monthly\" or \"annual\", got '{other}'"
                )));
            }
            None => return Err(ConfigError::MissingField(format!("products[{i}].kind"))),
        };
        if products.iter().any(|existing: &ProductConfig| existing.id == id) {
            return Err(ConfigError::InvalidValue(format!(
                "products[{i}].id '{id}' is listed more than once"
            )));
        }
        products.push(ProductConfig { id, kind });
    }

    Ok(ClientConfig {
        schema_version,
        log_level: raw.log_level,
        server: ServerConfig { ws_url },
        token,
        connection,
        verification,
        products,
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

fn read_secret_file(path: &str, what: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading {what} file '{path}': {e}")))?;
    Ok(content.trim().to_owned())
}
