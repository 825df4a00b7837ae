use crate::error::Result;
use crate::{now_utc_rfc3339, StageOutcome};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub at_utc: String,
    pub operation: String,
    pub target: String,
    pub success: bool,
    pub message: String,
}

/// In-memory history of destructive driver operations for the life of the process.
#[derive(Debug, Default)]
pub struct OperationLog {
    records: Mutex<Vec<OperationRecord>>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of `result` and passes it through unchanged.
    pub fn track(&self, operation: &str, target: &str, result: Result<StageOutcome>) -> Result<StageOutcome> {
        let (success, message) = match &result {
            Ok(outcome) => (true, outcome.message.clone()),
            Err(error) => (false, error.to_string()),
        };
        info!(operation, target, success, "partition operation finished");
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(OperationRecord {
                at_utc: now_utc_rfc3339(),
                operation: operation.to_string(),
                target: target.to_string(),
                success,
                message,
            });
        result
    }

    pub fn records(&self) -> Vec<OperationRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
