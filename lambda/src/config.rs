// Function configuration
//
// Everything the provisioner needs is read from the function's environment exactly once per
// invocation, validated, and passed down as a `ProvisionerConfig`. Nothing below the handler
// touches `std::env`.

use log::LevelFilter;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::database::connection::ConnectionConfig;
use crate::database::engine::EngineKind;
use crate::utils::logging::REDACTED;
use crate::utils::validation::{
    validate_identifier, validate_password, MAX_IDENTIFIER_LEN, MAX_MYSQL_USER_LEN,
};

/// Errors raised while building the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is missing or could not be converted (e.g. `DB_PORT=abc`).
    #[error("Configuration error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Unsupported DB_ENGINE '{0}' (expected 'aurora-postgresql' or 'aurora-mysql')")]
    UnsupportedEngine(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("Invalid {field}: {reason}")]
    InvalidIdentifier { field: &'static str, reason: String },

    #[error("Invalid {field}: {reason}")]
    InvalidPassword { field: &'static str, reason: String },
}

/// Raw environment as seen through the `config` crate (keys are lowercased).
#[derive(Deserialize)]
struct FunctionEnv {
    db_engine: String,
    db_cluster_endpoint: String,
    db_port: u16,
    db_name: String,
    db_master_username: String,
    db_master_password: String,
    db_readonly_user: String,
    db_readonly_pass: String,
    db_readwrite_user: String,
    db_readwrite_pass: String,
    #[serde(default)]
    db_ssl: bool,
}

/// Credentials of one application-facing role.
#[derive(Clone, PartialEq, Eq)]
pub struct RoleCredentials {
    pub username: String,
    pub password: String,
}

impl RoleCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for RoleCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleCredentials")
            .field("username", &self.username)
            .field("password", &REDACTED)
            .finish()
    }
}

/// Validated configuration for one provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub engine: EngineKind,
    /// Master connection; `database` is always set to the target database.
    pub connection: ConnectionConfig,
    pub readonly: RoleCredentials,
    pub readwrite: RoleCredentials,
}

impl ProvisionerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from an explicit variable map (same names as the environment, e.g. `DB_ENGINE`).
    pub fn from_map(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::load(Some(vars.into_iter().collect()))
    }

    fn load(source: Option<config::Map<String, String>>) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::default().source(source))
            .build()?;
        let env: FunctionEnv = settings.try_deserialize()?;
        Self::from_function_env(env)
    }

    fn from_function_env(env: FunctionEnv) -> Result<Self, ConfigError> {
        let engine = EngineKind::parse(&env.db_engine)
            .ok_or_else(|| ConfigError::UnsupportedEngine(env.db_engine.clone()))?;

        if env.db_cluster_endpoint.trim().is_empty() {
            return Err(ConfigError::Empty("DB_CLUSTER_ENDPOINT"));
        }

        let user_limit = match engine {
            EngineKind::MySql => MAX_MYSQL_USER_LEN,
            EngineKind::Postgres => MAX_IDENTIFIER_LEN,
        };

        check_identifier("DB_NAME", &env.db_name, MAX_IDENTIFIER_LEN)?;
        check_identifier("DB_MASTER_USERNAME", &env.db_master_username, user_limit)?;
        check_identifier("DB_READONLY_USER", &env.db_readonly_user, user_limit)?;
        check_identifier("DB_READWRITE_USER", &env.db_readwrite_user, user_limit)?;
        check_password("DB_READONLY_PASS", &env.db_readonly_pass)?;
        check_password("DB_READWRITE_PASS", &env.db_readwrite_pass)?;

        // The master password is only sent over the wire, never interpolated into SQL.
        if env.db_master_password.is_empty() {
            return Err(ConfigError::Empty("DB_MASTER_PASSWORD"));
        }

        let connection = ConnectionConfig {
            engine,
            host: env.db_cluster_endpoint.trim().to_string(),
            port: env.db_port,
            database: Some(env.db_name),
            username: env.db_master_username,
            password: env.db_master_password,
            tls: env.db_ssl,
        };

        Ok(Self {
            engine,
            connection,
            readonly: RoleCredentials::new(env.db_readonly_user, env.db_readonly_pass),
            readwrite: RoleCredentials::new(env.db_readwrite_user, env.db_readwrite_pass),
        })
    }

    /// Target database name.
    pub fn database(&self) -> &str {
        self.connection.database.as_deref().unwrap_or_default()
    }

    /// Every secret that must never reach a log line.
    pub fn secrets(&self) -> Vec<&str> {
        vec![
            self.connection.password.as_str(),
            self.readonly.password.as_str(),
            self.readwrite.password.as_str(),
        ]
    }
}

fn check_identifier(field: &'static str, value: &str, max_len: usize) -> Result<(), ConfigError> {
    validate_identifier(value, max_len).map_err(|e| ConfigError::InvalidIdentifier {
        field,
        reason: e.to_string(),
    })
}

fn check_password(field: &'static str, value: &str) -> Result<(), ConfigError> {
    validate_password(value).map_err(|e| ConfigError::InvalidPassword {
        field,
        reason: e.to_string(),
    })
}

/// Logging knobs. Loaded before anything else, so it never fails: bad values fall back to
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    /// JSON lines (default) or human-readable text.
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            json: true,
        }
    }
}

#[derive(Deserialize, Default)]
struct LogEnv {
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    log_format: Option<String>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::load(None)
    }

    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self::load(Some(vars.into_iter().collect()))
    }

    fn load(source: Option<config::Map<String, String>>) -> Self {
        let env: LogEnv = config::Config::builder()
            .add_source(config::Environment::default().source(source))
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap_or_default();

        let defaults = Self::default();
        let level = env
            .log_level
            .as_deref()
            .and_then(|l| LevelFilter::from_str(l.trim()).ok())
            .unwrap_or(defaults.level);
        let json = match env.log_format.as_deref().map(str::trim) {
            Some(f) if f.eq_ignore_ascii_case("text") => false,
            Some(f) if f.eq_ignore_ascii_case("json") => true,
            _ => defaults.json,
        };

        Self { level, json }
    }
}
