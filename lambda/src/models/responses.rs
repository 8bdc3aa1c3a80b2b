// Invocation response models

use serde::{Deserialize, Serialize};

use crate::database::engine::EngineKind;

/// Body returned when every step ran (statement-level failures included).
pub const SUCCESS_BODY: &str = "Users created successfully";

/// Payload returned to the invoking platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResponse {
    pub status_code: u16,
    pub body: String,
}

impl HandlerResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            body: body.into(),
        }
    }
}

/// Outcome of one provisioning run, logged at the end of the run.
///
/// Failed steps do not make the run fail; they are listed here so the log shows what to look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    pub engine: EngineKind,
    pub database: String,
    pub executed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed: Vec<String>,
}

impl ProvisionReport {
    pub fn new(engine: EngineKind, database: impl Into<String>) -> Self {
        Self {
            engine,
            database: database.into(),
            executed: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn record_success(&mut self, step: &str) {
        self.executed.push(step.to_string());
    }

    pub fn record_failure(&mut self, step: &str) {
        self.failed.push(step.to_string());
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
