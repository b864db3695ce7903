//! Deployment Backup Library
//!
//! Backup and restore of a docker compose deployment: configuration,
//! certificates, the database, named volumes and recent logs, packed into a
//! single archive with a manifest.

pub mod archive;
pub mod capture;
pub mod config;
pub mod executor;
pub mod fs;
pub mod lock;
pub mod retention;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub use utils::Result;
