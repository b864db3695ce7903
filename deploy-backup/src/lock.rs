//! Advisory lock over the backup directory.

use crate::utils::{BackupError, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use tracing::debug;

pub const LOCK_FILE: &str = ".deploy-backup.lock";

/// Held for the duration of a backup, restore or prune. Released on drop.
#[derive(Debug)]
pub struct BackupLock {
    _flock: Flock<File>,
}

impl BackupLock {
    /// Take the lock without waiting; fails with `Locked` if another run holds it.
    pub fn acquire(backup_dir: &Path) -> Result<Self> {
        fs::create_dir_all(backup_dir)?;
        let path = backup_dir.join(LOCK_FILE);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            BackupError::Locked(format!(
                "{} is held by another backup or restore ({})",
                path.display(),
                errno
            ))
        })?;

        debug!("Acquired {}", path.display());
        Ok(Self { _flock: flock })
    }
}
