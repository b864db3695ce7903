//! Utility modules shared by the backup and restore paths.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{BackupError, Result};
