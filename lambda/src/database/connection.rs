// Database connection management
//
// DbConnector / DbSession traits keep the provisioning flow testable without a real cluster:
// production uses RealDbConnector (one sqlx connection per acquisition, no pool), tests use stubs
// that record every execute and close.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn, LevelFilter};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Connection};
use std::fmt;
use std::time::Duration;

use crate::database::engine::EngineKind;
use crate::utils::logging::REDACTED;

// =============================================================================
// Connection parameters
// =============================================================================

/// Where and as whom to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    /// `None` connects to the server without selecting a database.
    pub database: Option<String>,
    pub username: String,
    pub password: String,
    pub tls: bool,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &REDACTED)
            .field("tls", &self.tls)
            .finish()
    }
}

impl ConnectionConfig {
    /// Same server and credentials, no database selected.
    pub fn without_database(&self) -> Self {
        Self {
            database: None,
            ..self.clone()
        }
    }

    /// Same server and credentials, `database` selected.
    pub fn with_database(&self, database: &str) -> Self {
        Self {
            database: Some(database.to_string()),
            ..self.clone()
        }
    }

    /// `user@host:port/db` for log lines (no password).
    pub fn describe(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username,
            self.host,
            self.port,
            self.database.as_deref().unwrap_or("")
        )
    }

    fn pg_options(&self) -> PgConnectOptions {
        // Every field read from PG* variables is overwritten below, including the database.
        let opts = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .ssl_mode(if self.tls {
                PgSslMode::Require
            } else {
                PgSslMode::Disable
            });
        // PostgreSQL always connects to some database. With none selected the server falls back
        // to the one named after the user; pin that explicitly so PGDATABASE cannot leak in.
        let opts = opts.database(self.database.as_deref().unwrap_or(&self.username));
        // Statements embed role passwords; keep them out of the driver's own logging.
        opts.log_statements(LevelFilter::Off)
            .log_slow_statements(LevelFilter::Off, Duration::default())
    }

    fn mysql_options(&self) -> MySqlConnectOptions {
        let mut opts = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .ssl_mode(if self.tls {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Disabled
            });
        if let Some(db) = &self.database {
            opts = opts.database(db);
        }
        opts.log_statements(LevelFilter::Off)
            .log_slow_statements(LevelFilter::Off, Duration::default())
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// One open connection.
#[async_trait]
pub trait DbSession: Send {
    /// Run one statement over the simple (text) protocol. DDL/DCL such as GRANT and
    /// FLUSH PRIVILEGES is not preparable on every server version.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Close gracefully. Consumes the session so it cannot be closed twice.
    async fn close(self: Box<Self>) -> Result<()>;

    /// Release without the close handshake. Used from `Drop`, where nothing can be awaited.
    fn abandon(self: Box<Self>) {}
}

pub struct PostgresSession {
    conn: PgConnection,
}

#[async_trait]
impl DbSession for PostgresSession {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

pub struct MySqlSession {
    conn: MySqlConnection,
}

#[async_trait]
impl DbSession for MySqlSession {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Owns one session and guarantees it is released exactly once.
///
/// `close` is the normal path. If the guard is dropped while still holding a session (future
/// cancelled, panic unwinding), `Drop` releases it without the close handshake.
pub struct ScopedSession {
    label: &'static str,
    session: Option<Box<dyn DbSession>>,
}

impl ScopedSession {
    pub fn new(label: &'static str, session: Box<dyn DbSession>) -> Self {
        Self {
            label,
            session: Some(session),
        }
    }

    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        match self.session.as_mut() {
            Some(session) => session.execute(sql).await,
            None => Err(anyhow::anyhow!("{} connection is already closed", self.label)),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        let label = self.label;
        match self.session.take() {
            Some(session) => {
                debug!("[PHASE: connect] [STEP: {}] Closing connection", label);
                session
                    .close()
                    .await
                    .with_context(|| format!("Failed to close {} connection", label))
            }
            None => Ok(()),
        }
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(
                "[PHASE: connect] [STEP: {}] Connection released without close",
                self.label
            );
            session.abandon();
        }
    }
}

// =============================================================================
// Connectors
// =============================================================================

/// Error returned by connection attempts.
/// Keeps user-friendly messages separate from internal details.
#[derive(Debug, Clone)]
pub struct ConnectError {
    /// User-friendly message (safe to surface as the invocation error)
    pub user_message: String,
    /// Internal details for logging (driver error, target without password)
    pub internal_details: String,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message)
    }
}

impl std::error::Error for ConnectError {}

/// Trait for opening database sessions.
/// Production code uses RealDbConnector; tests use stub connectors.
#[async_trait]
pub trait DbConnector: Send + Sync {
    /// Open a session exactly as described by `config`.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DbSession>, ConnectError>;

    /// Open a session with no database selected (it may not exist yet).
    async fn connect_initial(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn DbSession>, ConnectError> {
        self.connect(&config.without_database()).await
    }

    /// Open a session with the target database selected.
    async fn connect_scoped(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn DbSession>, ConnectError> {
        if config.database.is_none() {
            return Err(ConnectError {
                user_message: "No target database configured.".to_string(),
                internal_details: format!("connect_scoped called for {}", config.describe()),
            });
        }
        self.connect(config).await
    }
}

/// Production connector that actually connects to the cluster.
pub struct RealDbConnector;

#[async_trait]
impl DbConnector for RealDbConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DbSession>, ConnectError> {
        debug!(
            "[PHASE: connect] [STEP: open] Opening {} connection to {}",
            config.engine,
            config.describe()
        );

        let result: std::result::Result<Box<dyn DbSession>, sqlx::Error> = match config.engine {
            EngineKind::Postgres => PgConnection::connect_with(&config.pg_options())
                .await
                .map(|conn| Box::new(PostgresSession { conn }) as Box<dyn DbSession>),
            EngineKind::MySql => MySqlConnection::connect_with(&config.mysql_options())
                .await
                .map(|conn| Box::new(MySqlSession { conn }) as Box<dyn DbSession>),
        };

        result.map_err(|e| ConnectError {
            user_message: "Unable to connect. Verify host, credentials, and network access."
                .to_string(),
            internal_details: format!(
                "{} connection to {} failed: {}",
                config.engine,
                config.describe(),
                e
            ),
        })
    }
}

// =============================================================================
// Test Module
// =============================================================================
