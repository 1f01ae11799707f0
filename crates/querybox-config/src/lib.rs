#![warn(missing_docs)]

//! # querybox-config
//!
//! Configuration loading for the querybox script sandbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_secs = 30
//! grace_secs = 5
//! max_heap_mb = 128
//! max_concurrent = 8
//! execution_mode = "child_process"
//!
//! [instances.analytics-pg]
//! kind = "relational"
//! host = "db.internal"
//! port = 5432
//! credentials_env_prefix = "ANALYTICS_PG"
//!
//! [instances.events-mongo]
//! kind = "document"
//! uri = "${EVENTS_MONGO_URI}"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "QUERYBOX_CONFIG";

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "querybox.toml";

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level querybox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryboxConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Database instances, keyed by instance identifier.
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,
}

/// Sandbox configuration overrides. Unset values keep the executor defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Default script timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Extra seconds before a worker is killed.
    #[serde(default)]
    pub grace_secs: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum script size in kilobytes.
    #[serde(default)]
    pub max_code_size_kb: Option<usize>,

    /// Rows/documents per data preview.
    #[serde(default)]
    pub preview_rows: Option<usize>,

    /// Cap on documents returned by a single read.
    #[serde(default)]
    pub max_documents: Option<usize>,

    /// Execution mode: "child_process" (default) or "in_process".
    #[serde(default)]
    pub execution_mode: Option<String>,

    /// Worker binary path (absolute).
    #[serde(default)]
    pub worker_bin: Option<PathBuf>,
}

/// One database instance.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// "relational" or "document".
    pub kind: String,

    /// Relational host.
    #[serde(default)]
    pub host: Option<String>,

    /// Relational port.
    #[serde(default)]
    pub port: Option<u16>,

    /// Relational user.
    #[serde(default)]
    pub user: Option<String>,

    /// Relational password. Prefer `credentials_env_prefix`.
    #[serde(default)]
    pub password: Option<String>,

    /// Document-store connection URI.
    #[serde(default)]
    pub uri: Option<String>,

    /// Prefix for `_USER`, `_PASSWORD`, and `_CONNECTION_STRING` variables.
    #[serde(default)]
    pub credentials_env_prefix: Option<String>,
}

impl std::fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("uri", &self.uri.as_ref().map(|_| "***"))
            .field("credentials_env_prefix", &self.credentials_env_prefix)
            .finish()
    }
}

impl QueryboxConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: QueryboxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        Self::from_toml(&expand_env_vars(toml_str))
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sandbox;
        if let Some(mode) = &s.execution_mode {
            if mode != "child_process" && mode != "in_process" {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.execution_mode '{mode}' is not one of: child_process, in_process"
                )));
            }
        }
        for (key, value) in [
            ("timeout_secs", s.timeout_secs.map(|v| v as usize)),
            ("max_heap_mb", s.max_heap_mb),
            ("max_concurrent", s.max_concurrent),
            ("max_code_size_kb", s.max_code_size_kb),
            ("preview_rows", s.preview_rows),
            ("max_documents", s.max_documents),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("sandbox.{key} must be positive")));
            }
        }
        if let Some(bin) = &s.worker_bin {
            if !bin.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.worker_bin must be an absolute path, got '{}'",
                    bin.display()
                )));
            }
        }

        for (name, instance) in &self.instances {
            match instance.kind.as_str() {
                "relational" => {
                    if instance.host.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "instance '{name}': relational instances require 'host'"
                        )));
                    }
                }
                "document" => {
                    if instance.uri.is_none() && instance.credentials_env_prefix.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "instance '{name}': document instances require 'uri' or 'credentials_env_prefix'"
                        )));
                    }
                }
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "instance '{name}': unsupported kind '{other}', supported: relational, document"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Locate the config file: `explicit`, then `$QUERYBOX_CONFIG`, then
/// `./querybox.toml`. `None` when nothing is configured or present.
pub fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.exists().then_some(local)
}

fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unresolved placeholders stay as written.
                Err(_) => result.push_str(&format!("${{{var_name}}}")),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
