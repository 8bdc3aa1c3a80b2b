// User provisioning flow
//
// 1. Connect without selecting a database
// 2. MySQL only: create the database, grant the master user global + database privileges
// 3. Reconnect with the database selected
// 4. Create the read-only and read-write roles with their grants
//
// Statement failures are logged and skipped; connection failures abort the run.

use anyhow::Result;
use log::{debug, error, info};

use crate::config::ProvisionerConfig;
use crate::database::connection::{ConnectError, DbConnector, ScopedSession};
use crate::database::engine::{dialect_for, SqlDialect, Statement};
use crate::models::responses::ProvisionReport;
use crate::utils::logging::{mask_sensitive, redact_secrets};

pub struct Provisioner<C: DbConnector> {
    config: ProvisionerConfig,
    connector: C,
}

impl<C: DbConnector> Provisioner<C> {
    pub fn new(config: ProvisionerConfig, connector: C) -> Self {
        Provisioner { config, connector }
    }

    fn dialect(&self) -> &'static dyn SqlDialect {
        dialect_for(self.config.engine)
    }

    /// Statements for the initial (no database) connection.
    fn setup_statements(&self) -> Vec<Statement> {
        self.dialect().statements_for_database_setup(
            self.config.database(),
            &self.config.connection.username,
        )
    }

    /// Statements for the database-scoped connection: read-only role first, then read-write.
    fn user_statements(&self) -> Vec<Statement> {
        let dialect = self.dialect();
        let database = self.config.database();
        let mut statements = dialect.statements_for_readonly_user(database, &self.config.readonly);
        statements.extend(dialect.statements_for_readwrite_user(database, &self.config.readwrite));
        statements
    }

    /// Full ordered statement list, without connecting.
    pub fn plan(&self) -> Vec<Statement> {
        let mut statements = self.setup_statements();
        statements.extend(self.user_statements());
        statements
    }

    /// Run the whole provisioning sequence.
    ///
    /// Returns an error only for connection-level failures. Every opened connection is closed
    /// before this returns, on success and on failure.
    pub async fn run(&self) -> Result<ProvisionReport> {
        let engine = self.config.engine;
        let mut report = ProvisionReport::new(engine, self.config.database());

        info!(
            "[PHASE: provision] [STEP: start] Provisioning users on {} ({}), master user {}",
            self.config.connection.host,
            engine,
            mask_sensitive(&self.config.connection.username)
        );

        let session = self
            .connector
            .connect_initial(&self.config.connection)
            .await
            .map_err(|e| log_connect_error("initial", e))?;
        let mut initial = ScopedSession::new("initial", session);

        for statement in self.setup_statements() {
            self.execute_statement(&mut initial, &statement, &mut report)
                .await;
        }
        initial.close().await?;

        let session = self
            .connector
            .connect_scoped(&self.config.connection)
            .await
            .map_err(|e| log_connect_error("scoped", e))?;
        let mut scoped = ScopedSession::new("scoped", session);

        for statement in self.user_statements() {
            self.execute_statement(&mut scoped, &statement, &mut report)
                .await;
        }
        scoped.close().await?;

        if report.is_clean() {
            info!(
                "[PHASE: provision] [STEP: done] {} statements executed",
                report.executed.len()
            );
        } else {
            error!(
                "[PHASE: provision] [STEP: done] {} statements executed, {} failed: {}",
                report.executed.len(),
                report.failed.len(),
                report.failed.join(", ")
            );
        }
        debug!(
            "[PHASE: provision] [STEP: report] {}",
            serde_json::to_string(&report).unwrap_or_default()
        );

        Ok(report)
    }

    /// Run one statement. Failures are logged and recorded, never returned: one bad statement
    /// (e.g. a concurrent "user already exists") must not abort the rest of the sequence.
    ///
    /// NOTE: this also swallows genuine authorization and syntax errors. The report's `failed`
    /// list is the only trace they leave.
    pub async fn execute_statement(
        &self,
        session: &mut ScopedSession,
        statement: &Statement,
        report: &mut ProvisionReport,
    ) {
        debug!(
            "[PHASE: provision] [STEP: {}] Executing: {}",
            statement.step, statement.redacted
        );

        match session.execute(&statement.sql).await {
            Ok(()) => report.record_success(statement.step),
            Err(e) => {
                let details = redact_secrets(&format!("{:#}", e), &self.config.secrets());
                error!(
                    "[PHASE: provision] [STEP: {}] Error executing SQL: {} ({})",
                    statement.step, statement.redacted, details
                );
                info!(
                    "[PHASE: provision] [STEP: {}] Continuing despite error",
                    statement.step
                );
                report.record_failure(statement.step);
            }
        }
    }
}

fn log_connect_error(label: &str, e: ConnectError) -> anyhow::Error {
    error!(
        "[PHASE: connect] [STEP: {}] {} ({})",
        label, e.user_message, e.internal_details
    );
    anyhow::Error::new(e)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::env_map;
    use crate::database::connection::{ConnectionConfig, DbSession};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    // -------------------------------------------------------------------------
    // Stub connector / session
    // -------------------------------------------------------------------------

    /// Shared record of everything the stubs saw.
    #[derive(Default)]
    struct Recorder {
        opened: AtomicU32,
        closed: AtomicU32,
        abandoned: AtomicU32,
        /// (database selected on the connection, sql)
        executed: Mutex<Vec<(Option<String>, String)>>,
    }

    impl Recorder {
        fn executed_sql(&self) -> Vec<String> {
            self.executed
                .lock()
                .unwrap()
                .iter()
                .map(|(_, sql)| sql.clone())
                .collect()
        }

        fn open_connections(&self) -> u32 {
            self.opened.load(Ordering::SeqCst)
                - self.closed.load(Ordering::SeqCst)
                - self.abandoned.load(Ordering::SeqCst)
        }
    }

    #[derive(Clone, Default)]
    struct Behavior {
        /// Statements containing any of these substrings fail.
        fail_sql: Vec<&'static str>,
        /// Connection attempts numbered here (0-based) fail.
        fail_connect_attempt: Option<u32>,
        fail_close: bool,
    }

    struct StubConnector {
        recorder: Arc<Recorder>,
        behavior: Behavior,
        attempts: AtomicU32,
    }

    impl StubConnector {
        fn new(behavior: Behavior) -> (Self, Arc<Recorder>) {
            let recorder = Arc::new(Recorder::default());
            (
                StubConnector {
                    recorder: recorder.clone(),
                    behavior,
                    attempts: AtomicU32::new(0),
                },
                recorder,
            )
        }
    }

    #[async_trait]
    impl DbConnector for StubConnector {
        async fn connect(
            &self,
            config: &ConnectionConfig,
        ) -> std::result::Result<Box<dyn DbSession>, ConnectError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.behavior.fail_connect_attempt == Some(attempt) {
                return Err(ConnectError {
                    user_message: "Unable to connect. Verify host, credentials, and network access."
                        .to_string(),
                    internal_details: "stub refused connection".to_string(),
                });
            }

            self.recorder.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubSession {
                recorder: self.recorder.clone(),
                database: config.database.clone(),
                behavior: self.behavior.clone(),
            }))
        }
    }

    struct StubSession {
        recorder: Arc<Recorder>,
        database: Option<String>,
        behavior: Behavior,
    }

    #[async_trait]
    impl DbSession for StubSession {
        async fn execute(&mut self, sql: &str) -> Result<()> {
            self.recorder
                .executed
                .lock()
                .unwrap()
                .push((self.database.clone(), sql.to_string()));

            if let Some(pattern) = self.behavior.fail_sql.iter().find(|p| sql.contains(*p)) {
                return Err(anyhow::anyhow!("stub failure on '{}'", pattern));
            }
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            self.recorder.closed.fetch_add(1, Ordering::SeqCst);
            if self.behavior.fail_close {
                return Err(anyhow::anyhow!("stub close failure"));
            }
            Ok(())
        }

        fn abandon(self: Box<Self>) {
            self.recorder.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(engine: &str) -> ProvisionerConfig {
        ProvisionerConfig::from_map(env_map(engine)).unwrap()
    }

    // -------------------------------------------------------------------------
    // Sequence per engine
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn mysql_run_executes_full_sequence_in_order() {
        let (connector, recorder) = StubConnector::new(Behavior::default());
        let provisioner = Provisioner::new(config("aurora-mysql"), connector);

        let report = provisioner.run().await.unwrap();

        let executed = recorder.executed.lock().unwrap().clone();
        let expected: Vec<(Option<String>, String)> = vec![
            (None, "CREATE DATABASE IF NOT EXISTS `appdb`;"),
            (None, "GRANT ALL PRIVILEGES ON *.* TO 'admin'@'%' WITH GRANT OPTION;"),
            (None, "GRANT ALL PRIVILEGES ON `appdb`.* TO 'admin'@'%';"),
            (None, "FLUSH PRIVILEGES;"),
            (
                Some("appdb"),
                "CREATE USER IF NOT EXISTS 'ro'@'%' IDENTIFIED BY 'ro-secret';",
            ),
            (Some("appdb"), "GRANT SELECT ON `appdb`.* TO 'ro'@'%';"),
            (
                Some("appdb"),
                "CREATE USER IF NOT EXISTS 'rw'@'%' IDENTIFIED BY 'rw-secret';",
            ),
            (
                Some("appdb"),
                "GRANT SELECT, INSERT, UPDATE, DELETE ON `appdb`.* TO 'rw'@'%';",
            ),
        ]
        .into_iter()
        .map(|(db, sql)| (db.map(str::to_string), sql.to_string()))
        .collect();
        assert_eq!(executed, expected);

        assert_eq!(report.executed.len(), 8);
        assert!(report.is_clean());
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.open_connections(), 0);
    }

    #[tokio::test]
    async fn postgres_run_skips_database_setup() {
        let (connector, recorder) = StubConnector::new(Behavior::default());
        let provisioner = Provisioner::new(config("aurora-postgresql"), connector);

        let report = provisioner.run().await.unwrap();

        let executed = recorder.executed.lock().unwrap().clone();
        assert_eq!(executed.len(), 6);
        assert!(
            executed.iter().all(|(db, _)| db.as_deref() == Some("appdb")),
            "All PostgreSQL statements run on the database-scoped connection"
        );
        assert_eq!(
            report.executed,
            vec![
                "create_readonly_user",
                "grant_readonly_connect",
                "grant_readonly_select",
                "create_readwrite_user",
                "grant_readwrite_connect",
                "grant_readwrite_dml",
            ]
        );
        // Initial connection is still opened and closed even with nothing to run on it.
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.open_connections(), 0);
    }

    #[test]
    fn plan_matches_run_order() {
        let (connector, _recorder) = StubConnector::new(Behavior::default());
        let provisioner = Provisioner::new(config("aurora-mysql"), connector);

        let steps: Vec<&str> = provisioner.plan().iter().map(|s| s.step).collect();
        assert_eq!(
            steps,
            vec![
                "create_database",
                "grant_master_global",
                "grant_master_database",
                "flush_privileges",
                "create_readonly_user",
                "grant_readonly_select",
                "create_readwrite_user",
                "grant_readwrite_dml",
            ]
        );
    }

    // -------------------------------------------------------------------------
    // Best-effort statement execution
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn failed_statement_does_not_stop_sequence() {
        let (connector, recorder) = StubConnector::new(Behavior {
            fail_sql: vec!["CREATE USER IF NOT EXISTS 'ro'"],
            ..Default::default()
        });
        let provisioner = Provisioner::new(config("aurora-mysql"), connector);

        let report = provisioner.run().await.expect("statement errors are not fatal");

        assert_eq!(recorder.executed_sql().len(), 8, "Every statement was attempted");
        assert_eq!(report.failed, vec!["create_readonly_user"]);
        assert_eq!(report.executed.len(), 7);
        assert!(recorder
            .executed_sql()
            .iter()
            .any(|sql| sql.starts_with("GRANT SELECT, INSERT, UPDATE, DELETE")));
        assert_eq!(recorder.open_connections(), 0);
    }

    #[tokio::test]
    async fn every_statement_failing_still_succeeds() {
        let (connector, recorder) = StubConnector::new(Behavior {
            fail_sql: vec![""],
            ..Default::default()
        });
        let provisioner = Provisioner::new(config("aurora-postgresql"), connector);

        let report = provisioner.run().await.unwrap();

        assert!(report.executed.is_empty());
        assert_eq!(report.failed.len(), 6);
        assert_eq!(recorder.open_connections(), 0);
    }

    #[tokio::test]
    async fn rerun_is_safe_and_repeats_same_statements() {
        let (connector, recorder) = StubConnector::new(Behavior::default());
        let provisioner = Provisioner::new(config("aurora-mysql"), connector);

        let first = provisioner.run().await.unwrap();
        let first_sql = recorder.executed_sql();
        let second = provisioner.run().await.unwrap();
        let all_sql = recorder.executed_sql();

        assert_eq!(first, second);
        assert_eq!(&all_sql[first_sql.len()..], first_sql.as_slice());
        // Every creation statement is guarded so the re-run is a no-op server-side.
        assert!(first_sql
            .iter()
            .filter(|sql| sql.starts_with("CREATE"))
            .all(|sql| sql.contains("IF NOT EXISTS")));
        assert_eq!(recorder.open_connections(), 0);
    }

    // -------------------------------------------------------------------------
    // Connection-level failures
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn initial_connect_failure_is_propagated() {
        let (connector, recorder) = StubConnector::new(Behavior {
            fail_connect_attempt: Some(0),
            ..Default::default()
        });
        let provisioner = Provisioner::new(config("aurora-mysql"), connector);

        let err = provisioner.run().await.unwrap_err();

        assert!(err.to_string().contains("Unable to connect"), "{}", err);
        assert!(err.downcast_ref::<ConnectError>().is_some());
        assert!(recorder.executed_sql().is_empty());
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scoped_connect_failure_closes_initial_connection() {
        let (connector, recorder) = StubConnector::new(Behavior {
            fail_connect_attempt: Some(1),
            ..Default::default()
        });
        let provisioner = Provisioner::new(config("aurora-mysql"), connector);

        assert!(provisioner.run().await.is_err());

        // Database setup ran on the initial connection, user creation never started.
        assert_eq!(recorder.executed_sql().len(), 4);
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.open_connections(), 0);
    }

    #[tokio::test]
    async fn close_failure_is_propagated_after_closing_once() {
        let (connector, recorder) = StubConnector::new(Behavior {
            fail_close: true,
            ..Default::default()
        });
        let provisioner = Provisioner::new(config("aurora-mysql"), connector);

        let err = provisioner.run().await.unwrap_err();

        assert!(
            format!("{:#}", err).contains("Failed to close initial connection"),
            "{:#}",
            err
        );
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.abandoned.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.open_connections(), 0);
    }

    #[tokio::test]
    async fn cancelled_run_releases_connection() {
        /// Session whose statements never complete.
        struct HangingSession {
            recorder: Arc<Recorder>,
        }

        #[async_trait]
        impl DbSession for HangingSession {
            async fn execute(&mut self, _sql: &str) -> Result<()> {
                std::future::pending::<()>().await;
                Ok(())
            }

            async fn close(self: Box<Self>) -> Result<()> {
                self.recorder.closed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            fn abandon(self: Box<Self>) {
                self.recorder.abandoned.fetch_add(1, Ordering::SeqCst);
            }
        }

        struct HangingConnector {
            recorder: Arc<Recorder>,
        }

        #[async_trait]
        impl DbConnector for HangingConnector {
            async fn connect(
                &self,
                _config: &ConnectionConfig,
            ) -> std::result::Result<Box<dyn DbSession>, ConnectError> {
                self.recorder.opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(HangingSession {
                    recorder: self.recorder.clone(),
                }))
            }
        }

        let recorder = Arc::new(Recorder::default());
        let provisioner = Provisioner::new(
            config("aurora-mysql"),
            HangingConnector {
                recorder: recorder.clone(),
            },
        );

        let outcome =
            tokio::time::timeout(std::time::Duration::from_millis(50), provisioner.run()).await;

        assert!(outcome.is_err(), "Run should still be hanging");
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.abandoned.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.open_connections(), 0);
    }
}
