//! Configuration module
//!
//! `AppConfig` is read from a TOML file. Every section and field has a
//! default, so a missing file or a partial file is valid.
//!
//! Lookup order for the file: explicit path, `OCPP_GATEWAY_CONFIG`, then
//! `<user config dir>/ocpp-gateway/config.toml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::domain::OcppVersion;

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "OCPP_GATEWAY_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Default config file location under the user config directory.
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .map(|dir| dir.join("ocpp-gateway").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

/// Resolve the config file path: explicit, then env var, then default.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(default_config_path)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    #[validate(nested)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate the config at `path`. A missing file yields the
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.check()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Write the config as pretty TOML, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, content).map_err(io_err)
    }

    /// Field-level validation plus cross-field checks.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Invalid(describe(&e)))?;

        if self.security.require_auth && self.security.charge_points.is_empty() {
            return Err(ConfigError::Invalid(
                "security.require_auth is set but no charge point credentials are configured"
                    .into(),
            ));
        }

        // Registry writes run inside BootNotification and Heartbeat.
        let gw = &self.gateway;
        if gw.registry_write_timeout_ms >= gw.message_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "gateway.registry_write_timeout_ms ({}) must be below gateway.message_timeout_ms ({})",
                gw.registry_write_timeout_ms, gw.message_timeout_ms
            )));
        }
        Ok(())
    }
}

fn describe(errors: &ValidationErrors) -> String {
    errors.to_string().replace('\n', "; ")
}

fn validate_version(value: &str) -> Result<(), ValidationError> {
    value
        .parse::<OcppVersion>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("unknown_ocpp_version"))
}

fn validate_log_format(value: &str) -> Result<(), ValidationError> {
    match value.to_lowercase().as_str() {
        "text" | "json" => Ok(()),
        _ => Err(ValidationError::new("unknown_log_format")),
    }
}

// ── [server] ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    pub ws_host: String,
    /// 0 binds an ephemeral port
    pub ws_port: u16,
    pub api_host: String,
    pub api_port: u16,
    /// Seconds allowed for graceful shutdown
    #[validate(range(min = 1, max = 600))]
    pub shutdown_timeout: u64,
    /// Identity of this gateway instance in the connection registry
    #[validate(length(min = 1, max = 64))]
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".to_string(),
            ws_port: 9000,
            api_host: "0.0.0.0".to_string(),
            api_port: 8080,
            shutdown_timeout: 30,
            instance_id: "gateway-local".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn ws_address(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }

    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

// ── [gateway] ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GatewayConfig {
    #[validate(range(min = 1))]
    pub max_connections: usize,
    /// Frames buffered per connection before sends are dropped
    #[validate(range(min = 1, max = 65536))]
    pub send_queue_capacity: usize,
    /// Largest accepted inbound frame in bytes
    #[validate(range(min = 512, max = 16777216))]
    pub max_message_size: usize,
    #[validate(range(min = 1, max = 600000))]
    pub message_timeout_ms: u64,
    #[validate(range(min = 1, max = 600000))]
    pub write_timeout_ms: u64,
    /// Deadline for the WebSocket upgrade after TCP accept
    #[validate(range(min = 1, max = 600000))]
    pub handshake_timeout_ms: u64,
    #[validate(range(min = 1, max = 3600))]
    pub ping_interval_secs: u64,
    #[validate(range(min = 1))]
    pub idle_timeout_secs: u64,
    #[validate(range(min = 1, max = 3600))]
    pub idle_sweep_interval_secs: u64,
    /// Interval returned in BootNotification responses
    #[validate(range(min = 1, max = 86400))]
    pub heartbeat_interval: u32,
    #[validate(range(min = 1, max = 3600))]
    pub pending_timeout_secs: u64,
    #[validate(range(min = 10, max = 60000))]
    pub pending_sweep_interval_ms: u64,
    #[validate(range(min = 1))]
    pub event_queue_capacity: usize,
    #[validate(custom(function = "validate_version"))]
    pub default_version: String,
    #[validate(range(min = 1))]
    pub registry_ttl_secs: u64,
    #[validate(range(min = 1, max = 60000))]
    pub registry_write_timeout_ms: u64,
    /// Id tags answered with `Blocked`
    pub blocked_id_tags: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            send_queue_capacity: 64,
            max_message_size: 65_536,
            message_timeout_ms: 30_000,
            write_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            ping_interval_secs: 30,
            idle_timeout_secs: 600,
            idle_sweep_interval_secs: 30,
            heartbeat_interval: 300,
            pending_timeout_secs: 30,
            pending_sweep_interval_ms: 1_000,
            event_queue_capacity: 1_024,
            default_version: "ocpp1.6".to_string(),
            registry_ttl_secs: 900,
            registry_write_timeout_ms: 500,
            blocked_id_tags: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn default_version(&self) -> OcppVersion {
        self.default_version.parse().unwrap_or(OcppVersion::V16)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }

    pub fn pending_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.pending_sweep_interval_ms)
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_secs)
    }

    pub fn registry_write_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_write_timeout_ms)
    }
}

// ── [security] ─────────────────────────────────────────────────

/// Charge point authentication (OCPP 1.6 security profile 1)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub require_auth: bool,
    /// charge point id -> SHA-256 hex digest of its password
    pub charge_points: HashMap<String, String>,
}

// ── [logging] ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[validate(length(min = 1))]
    pub level: String,
    /// `text` or `json`
    #[validate(custom(function = "validate_log_format"))]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.ws_port, 9000);
        assert_eq!(config.gateway.heartbeat_interval, 300);
        assert_eq!(config.gateway.default_version(), OcppVersion::V16);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [server]
            ws_port = 9100

            [gateway]
            max_connections = 5
            blocked_id_tags = ["BAD"]
            "#,
        )
        .unwrap();
        config.check().unwrap();
        assert_eq!(config.server.ws_port, 9100);
        assert_eq!(config.server.api_port, 8080);
        assert_eq!(config.gateway.max_connections, 5);
        assert_eq!(config.gateway.send_queue_capacity, 64);
        assert_eq!(config.gateway.blocked_id_tags, vec!["BAD".to_string()]);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let config = AppConfig::from_toml("[gateway]\nsend_queue_capacity = 0\n").unwrap();
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));

        let config = AppConfig::from_toml("[gateway]\ndefault_version = \"ocpp9\"\n").unwrap();
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));

        let config = AppConfig::from_toml("[logging]\nformat = \"xml\"\n").unwrap();
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn registry_write_timeout_must_fit_in_message_timeout() {
        let config = AppConfig::from_toml(
            "[gateway]\nmessage_timeout_ms = 100\nregistry_write_timeout_ms = 1000\n",
        )
        .unwrap();
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));

        let config = AppConfig::from_toml(
            "[gateway]\nmessage_timeout_ms = 1000\nregistry_write_timeout_ms = 100\n",
        )
        .unwrap();
        assert!(config.check().is_ok());
    }

    #[test]
    fn heartbeat_interval_is_capped() {
        let config = AppConfig::from_toml("[gateway]\nheartbeat_interval = 86401\n").unwrap();
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));

        let config = AppConfig::from_toml("[gateway]\nheartbeat_interval = 86400\n").unwrap();
        assert!(config.check().is_ok());
    }

    #[test]
    fn auth_without_credentials_is_rejected() {
        let config = AppConfig::from_toml("[security]\nrequire_auth = true\n").unwrap();
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AppConfig::default();
        config.server.instance_id = "gw-7".into();
        config
            .security
            .charge_points
            .insert("CP001".into(), "ab".repeat(32));
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.server.instance_id, "gw-7");
        assert_eq!(loaded.security.charge_points.len(), 1);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            AppConfig::from_toml("[server\nws_port = "),
            Err(ConfigError::Parse(_))
        ));
    }
}
