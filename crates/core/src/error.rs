//! Error taxonomy shared by every layer of the migration engine.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{program} failed with {}: {stderr}", exit_label(.code))]
    ToolExecution {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {timeout_secs}s")]
    ToolTimeout { program: String, timeout_secs: u64 },

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Image not mounted: {}", .0.display())]
    NotMounted(PathBuf),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("A migration is already in progress")]
    Busy,

    #[error("Migration cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, MigrateError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    ToolExecution,
    Mount,
    NotFound,
    Io,
    Conflict,
    Cancelled,
}

impl MigrateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Validation(_) | MigrateError::Parse(_) => ErrorKind::Validation,
            MigrateError::ToolExecution { .. } | MigrateError::ToolTimeout { .. } => {
                ErrorKind::ToolExecution
            }
            MigrateError::Mount(_) | MigrateError::NotMounted(_) => ErrorKind::Mount,
            MigrateError::NotFound(_) => ErrorKind::NotFound,
            MigrateError::Io(_) => ErrorKind::Io,
            MigrateError::Busy => ErrorKind::Conflict,
            MigrateError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        MigrateError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        MigrateError::NotFound(message.into())
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(error: serde_json::Error) -> Self {
        MigrateError::Parse(error.to_string())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ToolExecution => "tool_execution",
            ErrorKind::Mount => "mount",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Io => "io",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_mentions_program_and_code() {
        let error = MigrateError::ToolExecution {
            program: "mkfs.ext4".to_string(),
            code: Some(1),
            stderr: "device busy".to_string(),
        };
        assert_eq!(error.to_string(), "mkfs.ext4 failed with exit code 1: device busy");
        assert_eq!(error.kind(), ErrorKind::ToolExecution);
    }

    #[test]
    fn not_mounted_is_a_mount_error() {
        let error = MigrateError::NotMounted(PathBuf::from("/images/a.iso"));
        assert_eq!(error.kind(), ErrorKind::Mount);
        assert!(error.to_string().contains("/images/a.iso"));
    }

    #[test]
    fn io_errors_convert() {
        let error: MigrateError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(error.kind(), ErrorKind::Io);
    }
}
