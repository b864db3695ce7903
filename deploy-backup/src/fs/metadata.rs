//! File permission handling for captures and restores.
//!
//! Certificates and keys must come back with the modes they were backed up
//! with; archives and key bundles are tightened to owner-only.

use std::fs;
use std::path::Path;

/// Owner read/write, nothing for group and others.
pub const OWNER_ONLY: u32 = 0o600;

/// Metadata carried across a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    /// Unix mode bits (None on other platforms)
    pub permissions: Option<u32>,
}

impl FileMetadata {
    /// Extract metadata from a file path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode() & 0o7777)
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self { permissions })
    }

    /// Apply the recorded permissions to `path`
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        match self.permissions {
            Some(mode) => set_mode(path, mode),
            None => Ok(()),
        }
    }
}

/// Set Unix mode bits; a no-op elsewhere.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Restrict a file to its owner (0600).
pub fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    set_mode(path, OWNER_ONLY)
}
