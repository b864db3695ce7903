//! Scoped scratch directories, removed on drop.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A directory that exists for the lifetime of this value.
///
/// Any leftover at the same path is cleared on creation, so an interrupted
/// earlier run does not leak into this one.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_removed_on_drop() -> std::io::Result<()> {
        let parent = TempDir::new()?;
        let path = parent.path().join("staging");

        {
            let scratch = ScratchDir::create(&path)?;
            fs::write(scratch.path().join("file"), b"x")?;
            assert!(path.exists());
        }

        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_clears_leftovers() -> std::io::Result<()> {
        let parent = TempDir::new()?;
        let path = parent.path().join("staging");
        fs::create_dir_all(&path)?;
        fs::write(path.join("stale"), b"old run")?;

        let scratch = ScratchDir::create(&path)?;
        assert!(!scratch.path().join("stale").exists());
        Ok(())
    }
}
