//! Backup and restore orchestration.
//!
//! Both orchestrators run their steps strictly in sequence on the calling
//! task; archive work is pushed to the blocking pool.

pub mod backup;
pub mod manifest;
pub mod restore;

pub use backup::{Backup, BackupKind, BackupOrchestrator, BackupState};
pub use manifest::{BackupOutcome, Manifest, ManifestBuilder};
pub use restore::{
    ConfirmRestore, RestoreOptions, RestoreOrchestrator, RestoreOutcome, RestorePlan, RestoreReport,
    RestoreStep, StepOutcome,
};
