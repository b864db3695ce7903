//! Directory traversal and tree copying with metadata preservation.
//!
//! Captures and restores move whole subtrees between the live deployment and
//! a staging directory; everything here walks in sorted order so the result
//! does not depend on readdir order.

use crate::fs::metadata::FileMetadata;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// File or directory names skipped entirely (exact match)
    pub exclude_names: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_names: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                ".DS_Store".to_string(),
            ],
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// Symlinks resolve to their target; links to directories and broken
    /// links yield None.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let is_symlink = raw_metadata.is_symlink();

        let metadata = if is_symlink {
            match fs::metadata(&path) {
                Ok(resolved) if resolved.is_dir() => return Ok(None),
                Ok(resolved) => resolved,
                Err(_) => return Ok(None),
            }
        } else {
            raw_metadata
        };

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
            modified: metadata.modified()?,
            is_symlink,
        }))
    }
}

/// Totals of a copy operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub bytes: u64,
}

impl CopyStats {
    pub fn add(&mut self, other: CopyStats) {
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

fn walker(root: &Path, options: &WalkOptions) -> WalkDir {
    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }
    walker
}

/// Walk a directory tree and collect all files, sorted by path.
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let entries = walker(root, &options)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.exclude_names));

    for entry in entries {
        let entry = entry?;

        if entry.file_type().is_dir() {
            continue;
        }

        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            files.push(file_info);
        }
    }

    Ok(files)
}

/// Files under `root` modified at or after `cutoff`.
pub fn files_modified_since(
    root: &Path,
    cutoff: SystemTime,
    options: WalkOptions,
) -> std::io::Result<Vec<FileInfo>> {
    Ok(walk_directory(root, options)?
        .into_iter()
        .filter(|f| f.modified >= cutoff)
        .collect())
}

/// Calculate total size of all files in a directory (0 if it does not exist)
pub fn calculate_total_size(root: &Path) -> std::io::Result<u64> {
    if !root.exists() {
        return Ok(0);
    }
    let options = WalkOptions {
        exclude_names: Vec::new(),
        ..WalkOptions::default()
    };
    Ok(walk_directory(root, options)?.iter().map(|f| f.size).sum())
}

/// Copy a single file, creating parent directories and keeping its mode.
pub fn copy_file(src: &Path, dst: &Path) -> std::io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = fs::copy(src, dst)?;
    FileMetadata::from_path(src)?.apply_to_path(dst)?;
    Ok(bytes)
}

/// Recursively copy `src` into `dst`, preserving file and directory modes.
///
/// `dst` is created if needed; existing files are overwritten. An existing
/// `dst` keeps its own mode.
pub fn copy_tree(src: &Path, dst: &Path, options: &WalkOptions) -> std::io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    let mut dirs = Vec::new();
    let keep_root_mode = dst.is_dir();

    let entries = walker(src, options)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.exclude_names));

    for entry in entries {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            if !(entry.depth() == 0 && keep_root_mode) {
                dirs.push((entry.path().to_path_buf(), target));
            }
            continue;
        }

        if let Some(info) = FileInfo::from_entry(&entry, src)? {
            stats.bytes += copy_file(&info.path, &target)?;
            stats.files += 1;
        }
    }

    // Directory modes last, a read-only dir would block copying its children
    for (source_dir, target_dir) in dirs.iter().rev() {
        FileMetadata::from_path(source_dir)?.apply_to_path(target_dir)?;
    }

    Ok(stats)
}

/// Check if a directory entry should be excluded by name
fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|n| *n == file_name)
}
