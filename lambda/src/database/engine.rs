// Engine tag and per-engine SQL generation
//
// Supports:
// - Aurora MySQL: CREATE DATABASE IF NOT EXISTS, master grants, CREATE USER IF NOT EXISTS
// - Aurora PostgreSQL: database assumed to exist; users created through a DO block guarded by
//   pg_user, since CREATE USER has no IF NOT EXISTS form
//
// Key design decisions:
// - Every statement is safe to re-run, so a partially provisioned cluster converges on retry
// - Identifiers are quoted (double quotes / backticks), literals escaped; inputs are validated in
//   config before reaching this module
// - Each statement carries a redacted rendering; only that form is ever logged

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RoleCredentials;
use crate::utils::logging::REDACTED;
use crate::utils::validation::PG_DO_BLOCK_TAG;

// =============================================================================
// Types
// =============================================================================

/// Aurora engine family, as named by `DB_ENGINE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    #[serde(rename = "aurora-postgresql")]
    Postgres,
    #[serde(rename = "aurora-mysql")]
    MySql,
}

impl EngineKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "aurora-postgresql" => Some(Self::Postgres),
            "aurora-mysql" => Some(Self::MySql),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "aurora-postgresql",
            Self::MySql => "aurora-mysql",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which application-facing role a statement set is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    ReadOnly,
    ReadWrite,
}

impl RoleKind {
    /// Table privileges granted on the target database.
    pub fn privileges(&self) -> &'static str {
        match self {
            Self::ReadOnly => "SELECT",
            Self::ReadWrite => "SELECT, INSERT, UPDATE, DELETE",
        }
    }

    fn create_step(&self) -> &'static str {
        match self {
            Self::ReadOnly => "create_readonly_user",
            Self::ReadWrite => "create_readwrite_user",
        }
    }

    fn connect_step(&self) -> &'static str {
        match self {
            Self::ReadOnly => "grant_readonly_connect",
            Self::ReadWrite => "grant_readwrite_connect",
        }
    }

    fn grant_step(&self) -> &'static str {
        match self {
            Self::ReadOnly => "grant_readonly_select",
            Self::ReadWrite => "grant_readwrite_dml",
        }
    }
}

/// One SQL statement to run, plus what may be logged about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Stable label used as the log `[STEP: ...]` and in the run report.
    pub step: &'static str,
    pub sql: String,
    /// `sql` with any password replaced by `***`.
    pub redacted: String,
}

impl Statement {
    pub fn new(step: &'static str, sql: String) -> Self {
        Self {
            step,
            redacted: sql.clone(),
            sql,
        }
    }

    /// Build a statement that embeds a secret literal. `render` is called twice: once with the
    /// escaped secret, once with the redaction placeholder.
    pub fn with_secret<F>(step: &'static str, secret: &str, render: F) -> Self
    where
        F: Fn(&str) -> String,
    {
        Self {
            step,
            sql: render(secret),
            redacted: render(REDACTED),
        }
    }
}

// =============================================================================
// Dialect interface
// =============================================================================

/// Engine-specific statement generation.
pub trait SqlDialect: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Statements run on the initial connection (no database selected).
    fn statements_for_database_setup(&self, database: &str, master_user: &str) -> Vec<Statement>;

    /// Create one role and grant it `role_kind` privileges on `database`.
    fn statements_for_role(
        &self,
        database: &str,
        role: &RoleCredentials,
        role_kind: RoleKind,
    ) -> Vec<Statement>;

    fn statements_for_readonly_user(
        &self,
        database: &str,
        role: &RoleCredentials,
    ) -> Vec<Statement> {
        self.statements_for_role(database, role, RoleKind::ReadOnly)
    }

    fn statements_for_readwrite_user(
        &self,
        database: &str,
        role: &RoleCredentials,
    ) -> Vec<Statement> {
        self.statements_for_role(database, role, RoleKind::ReadWrite)
    }
}

pub struct PostgresDialect;
pub struct MySqlDialect;

static POSTGRES: PostgresDialect = PostgresDialect;
static MYSQL: MySqlDialect = MySqlDialect;

/// Dialect implementation for an engine.
pub fn dialect_for(kind: EngineKind) -> &'static dyn SqlDialect {
    match kind {
        EngineKind::Postgres => &POSTGRES,
        EngineKind::MySql => &MYSQL,
    }
}

// =============================================================================
// PostgreSQL SQL Generation
// =============================================================================

/// Double-quote a PostgreSQL identifier
fn pg_quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape a PostgreSQL string literal body (standard_conforming_strings = on)
fn pg_escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

impl SqlDialect for PostgresDialect {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    fn statements_for_database_setup(&self, _database: &str, _master_user: &str) -> Vec<Statement> {
        // The cluster is created with its database; nothing to do before reconnecting.
        Vec::new()
    }

    fn statements_for_role(
        &self,
        database: &str,
        role: &RoleCredentials,
        role_kind: RoleKind,
    ) -> Vec<Statement> {
        let ident = pg_quote_ident(&role.username);
        let user_literal = pg_escape_literal(&role.username);
        let password = pg_escape_literal(&role.password);

        vec![
            Statement::with_secret(role_kind.create_step(), &password, |pw| {
                format!(
                    "DO {tag}\nBEGIN\n    IF NOT EXISTS (SELECT FROM pg_catalog.pg_user WHERE usename = '{user}') THEN\n        CREATE USER {ident} WITH PASSWORD '{pw}';\n    END IF;\nEND\n{tag};",
                    tag = PG_DO_BLOCK_TAG,
                    user = user_literal,
                    ident = ident,
                    pw = pw,
                )
            }),
            Statement::new(
                role_kind.connect_step(),
                format!(
                    "GRANT CONNECT ON DATABASE {} TO {};",
                    pg_quote_ident(database),
                    ident
                ),
            ),
            Statement::new(
                role_kind.grant_step(),
                format!(
                    "GRANT {} ON ALL TABLES IN SCHEMA public TO {};",
                    role_kind.privileges(),
                    ident
                ),
            ),
        ]
    }
}

// =============================================================================
// MySQL SQL Generation
// =============================================================================

/// Backtick-quote a MySQL identifier
fn mysql_quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Escape a MySQL string literal body.
///
/// Only quotes are doubled. Backslashes are rejected during validation, so the literal reads the
/// same with or without NO_BACKSLASH_ESCAPES in the server's sql_mode.
fn mysql_escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// `'user'@'%'` account name
fn mysql_account(user: &str) -> String {
    format!("'{}'@'%'", mysql_escape_literal(user))
}

impl SqlDialect for MySqlDialect {
    fn kind(&self) -> EngineKind {
        EngineKind::MySql
    }

    fn statements_for_database_setup(&self, database: &str, master_user: &str) -> Vec<Statement> {
        let db = mysql_quote_ident(database);
        let master = mysql_account(master_user);

        vec![
            Statement::new(
                "create_database",
                format!("CREATE DATABASE IF NOT EXISTS {};", db),
            ),
            Statement::new(
                "grant_master_global",
                format!(
                    "GRANT ALL PRIVILEGES ON *.* TO {} WITH GRANT OPTION;",
                    master
                ),
            ),
            Statement::new(
                "grant_master_database",
                format!("GRANT ALL PRIVILEGES ON {}.* TO {};", db, master),
            ),
            Statement::new("flush_privileges", "FLUSH PRIVILEGES;".to_string()),
        ]
    }

    fn statements_for_role(
        &self,
        database: &str,
        role: &RoleCredentials,
        role_kind: RoleKind,
    ) -> Vec<Statement> {
        let account = mysql_account(&role.username);
        let password = mysql_escape_literal(&role.password);

        vec![
            Statement::with_secret(role_kind.create_step(), &password, |pw| {
                format!("CREATE USER IF NOT EXISTS {} IDENTIFIED BY '{}';", account, pw)
            }),
            Statement::new(
                role_kind.grant_step(),
                format!(
                    "GRANT {} ON {}.* TO {};",
                    role_kind.privileges(),
                    mysql_quote_ident(database),
                    account
                ),
            ),
        ]
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
