//! Agent configuration: structs, parsing, and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_METRICS_PORT, DEFAULT_POLICY_MAP_PIN_DIR, DEFAULT_PROXY_PORT_MAX,
    DEFAULT_PROXY_PORT_MIN, DEFAULT_RECONCILE_INTERVAL, GENERATION_TIMEOUT,
};

// ── Config errors ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("validation error: {field}: {message}")]
    Validation { field: String, message: String },
}

impl From<serde_yaml_ng::Error> for ConfigError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        Self::Yaml(e.to_string())
    }
}

fn validation(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub agent: AgentInfo,

    #[serde(default)]
    pub policy: PolicyConfig,
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: AgentConfig = serde_yaml_ng::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate()
    }
}

// ── Agent info ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

// ── Policy engine config ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Insert the sticky ingress allow for the local host into every
    /// endpoint policy.
    #[serde(default = "default_true")]
    pub allow_localhost_ingress: bool,

    /// Seconds between dump-based reconciliations of each endpoint map.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Range the proxy controller allocates listener ports from.
    #[serde(default = "default_proxy_port_min")]
    pub proxy_port_min: u16,
    #[serde(default = "default_proxy_port_max")]
    pub proxy_port_max: u16,

    /// Upper bound in seconds on one endpoint regeneration.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    /// Directory the per-endpoint policy maps are pinned under.
    #[serde(default = "default_pin_dir")]
    pub map_pin_dir: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_localhost_ingress: true,
            reconcile_interval_secs: default_reconcile_interval_secs(),
            proxy_port_min: default_proxy_port_min(),
            proxy_port_max: default_proxy_port_max(),
            generation_timeout_secs: default_generation_timeout_secs(),
            map_pin_dir: default_pin_dir(),
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_port_min >= self.proxy_port_max {
            return Err(validation(
                "policy.proxy_port_min",
                format!(
                    "proxy port range {}..{} is empty",
                    self.proxy_port_min, self.proxy_port_max
                ),
            ));
        }
        if self.proxy_port_min < 1024 {
            return Err(validation(
                "policy.proxy_port_min",
                "proxy ports must not fall into the privileged range",
            ));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(validation(
                "policy.reconcile_interval_secs",
                "reconciliation interval must be positive",
            ));
        }
        if self.generation_timeout_secs == 0 {
            return Err(validation(
                "policy.generation_timeout_secs",
                "generation timeout must be positive",
            ));
        }
        if self.map_pin_dir.is_empty() {
            return Err(validation("policy.map_pin_dir", "pin directory must be set"));
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn generation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.generation_timeout_secs)
    }
}

// ── Serde defaults ─────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_log_format() -> LogFormat {
    LogFormat::Json
}
fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}
fn default_reconcile_interval_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL.as_secs()
}
fn default_proxy_port_min() -> u16 {
    DEFAULT_PROXY_PORT_MIN
}
fn default_proxy_port_max() -> u16 {
    DEFAULT_PROXY_PORT_MAX
}
fn default_generation_timeout_secs() -> u64 {
    GENERATION_TIMEOUT.as_secs()
}
fn default_pin_dir() -> String {
    DEFAULT_POLICY_MAP_PIN_DIR.to_string()
}

// ── Log level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Log format ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}
