//! Custom error types for backup and restore operations.

use crate::capture::ComponentKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Pre-flight failure: runtime unreachable, bad name, missing tool.
    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Capture of {kind} failed: {message}")]
    ComponentCapture { kind: ComponentKind, message: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Service transition error: {0}")]
    ServiceTransition(String),

    #[error("Database restore failed: {0}")]
    DatabaseRestore(String),

    #[error("Verification error: {0}")]
    Verification(String),

    /// An external collaborator (docker, pg_dump, ...) returned an error.
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Restore aborted: {0}")]
    RestoreAborted(String),

    #[error("Backup directory is locked: {0}")]
    Locked(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
