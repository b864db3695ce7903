//! Archive packing, two-phase manifest injection and verification.
//!
//! A backup archive is a zstd-compressed tar with a single top-level
//! directory named after the backup:
//!
//! ```text
//! <name>/configs/...
//! <name>/certs/...
//! <name>/database/...
//! <name>/volumes/...
//! <name>/logs/...
//! <name>/backup-info.txt   <- always the final entry
//! ```
//!
//! The manifest records facts about the packed archive (its size, what each
//! component weighs once packed), so it cannot be written before packing.
//! [`ArchiveManager::pack`] builds the archive without it, then
//! [`ArchiveManager::reopen`] extracts that archive, renders the manifest from
//! what was actually packed and re-seals it with the manifest appended last.

use crate::fs::metadata::{restrict_to_owner, set_mode, OWNER_ONLY};
use crate::fs::scratch::ScratchDir;
use crate::fs::walker::calculate_total_size;
use crate::utils::{BackupError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Manifest file name at the archive's top level.
pub const MANIFEST_FILE: &str = "backup-info.txt";

/// Extension of backup archives in the backup directory.
pub const ARCHIVE_EXT: &str = ".tar.zst";

/// Entry required for an archive to be considered restorable.
const REQUIRED_ENTRY: &str = "configs";

/// zstd level used unless configured otherwise.
pub const DEFAULT_LEVEL: i32 = 3;

/// Facts gathered from a packed archive, handed to the manifest renderer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedFacts {
    /// Size of the archive as packed, before the manifest was added
    pub archive_bytes: u64,

    /// Uncompressed bytes per top-level directory (`configs`, `certs`, ...)
    pub component_bytes: BTreeMap<String, u64>,
}

/// Result of [`ArchiveManager::verify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// The single top-level directory (the backup name)
    pub top_level: String,
    pub entries: usize,
    /// Top-level subdirectories present (`configs`, `certs`, ...)
    pub sections: BTreeSet<String>,
    pub has_manifest: bool,
    /// Whether the manifest is the final entry
    pub manifest_last: bool,
}

#[derive(Debug, Clone)]
pub struct ArchiveManager {
    level: i32,
}

impl Default for ArchiveManager {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
        }
    }
}

/// Archive file path for a backup name.
pub fn archive_path(backup_dir: &Path, name: &str) -> PathBuf {
    backup_dir.join(format!("{}{}", name, ARCHIVE_EXT))
}

fn archive_err(action: &str, path: &Path, e: impl std::fmt::Display) -> BackupError {
    BackupError::Archive(format!("{} {} failed: {}", action, path.display(), e))
}

type ArchiveReader = Archive<zstd::stream::Decoder<'static, std::io::BufReader<File>>>;

fn open_archive(path: &Path) -> std::io::Result<ArchiveReader> {
    let decoder = zstd::stream::Decoder::new(File::open(path)?)?;
    Ok(Archive::new(decoder))
}

/// Split an entry path into normal components, rejecting anything that could
/// escape the extraction directory.
fn entry_components(path: &Path) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts)
}

impl ArchiveManager {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    /// Pack `staging` into `archive`, entries under `<staging dir name>/`.
    ///
    /// Entries are added in sorted order and a top-level manifest is never
    /// picked up from the tree. Returns the archive size.
    pub fn pack(&self, staging: &Path, archive: &Path) -> Result<u64> {
        let prefix = staging
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| archive_err("pack", staging, "staging path has no name"))?;

        let size = self
            .pack_tree(staging, &prefix, archive, None)
            .map_err(|e| {
                let _ = fs::remove_file(archive);
                archive_err("pack", archive, e)
            })?;

        info!("Packed {} ({} bytes)", archive.display(), size);
        Ok(size)
    }

    /// Re-seal `archive` with a manifest rendered from its packed contents.
    ///
    /// The archive is extracted next to itself, `render` receives the facts of
    /// the packed archive, and its output is appended as the final entry. The
    /// new archive replaces the old one atomically. On failure the archive is
    /// removed.
    pub fn reopen<F>(&self, archive: &Path, render: F) -> Result<u64>
    where
        F: FnOnce(&PackedFacts) -> String,
    {
        let result = self.reopen_inner(archive, render);
        if result.is_err() {
            let _ = fs::remove_file(archive);
        }
        result
    }

    fn reopen_inner<F>(&self, archive: &Path, render: F) -> Result<u64>
    where
        F: FnOnce(&PackedFacts) -> String,
    {
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| archive_err("reopen", archive, "invalid archive path"))?;
        let archive_bytes = fs::metadata(archive)
            .map_err(|e| archive_err("reopen", archive, e))?
            .len();

        let scratch = ScratchDir::create(archive.with_file_name(format!(".reopen-{}", file_name)))
            .map_err(|e| archive_err("reopen", archive, e))?;
        let tree = self.extract(archive, scratch.path())?;
        let top = tree
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut facts = PackedFacts {
            archive_bytes,
            component_bytes: BTreeMap::new(),
        };
        for entry in fs::read_dir(&tree).map_err(|e| archive_err("reopen", archive, e))? {
            let entry = entry.map_err(|e| archive_err("reopen", archive, e))?;
            if entry.path().is_dir() {
                let size = calculate_total_size(&entry.path())
                    .map_err(|e| archive_err("reopen", archive, e))?;
                facts
                    .component_bytes
                    .insert(entry.file_name().to_string_lossy().to_string(), size);
            }
        }

        let manifest = render(&facts);

        let sealed = archive.with_file_name(format!(".{}.tmp", file_name));
        let size = self
            .pack_tree(&tree, &top, &sealed, Some(&manifest))
            .map_err(|e| {
                let _ = fs::remove_file(&sealed);
                archive_err("repack", archive, e)
            })?;
        fs::rename(&sealed, archive).map_err(|e| archive_err("replace", archive, e))?;

        debug!("Re-sealed {} with manifest ({} bytes)", archive.display(), size);
        Ok(size)
    }

    fn pack_tree(
        &self,
        root: &Path,
        prefix: &str,
        dest: &Path,
        manifest: Option<&str>,
    ) -> std::io::Result<u64> {
        let file = File::create(dest)?;
        let encoder = zstd::stream::Encoder::new(file, self.level)?;
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);

        builder.append_dir(prefix, root)?;

        let walker = WalkDir::new(root).min_depth(1).sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if relative == Path::new(MANIFEST_FILE) {
                continue;
            }

            let name = Path::new(prefix).join(relative);
            if entry.file_type().is_dir() {
                builder.append_dir(&name, entry.path())?;
            } else {
                builder.append_path_with_name(entry.path(), &name)?;
            }
        }

        if let Some(manifest) = manifest {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(manifest.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
            builder.append_data(
                &mut header,
                Path::new(prefix).join(MANIFEST_FILE),
                manifest.as_bytes(),
            )?;
        }

        builder.into_inner()?.finish()?;
        Ok(fs::metadata(dest)?.len())
    }

    /// Open an archive and check its layout.
    ///
    /// Requires exactly one top-level directory containing a `configs/` entry,
    /// and no entry that would escape the extraction directory.
    pub fn verify(&self, archive: &Path) -> Result<ArchiveSummary> {
        if !archive.is_file() {
            return Err(BackupError::Archive(format!(
                "{} does not exist",
                archive.display()
            )));
        }

        let mut reader = open_archive(archive).map_err(|e| archive_err("open", archive, e))?;
        let mut top_level: Option<String> = None;
        let mut sections = BTreeSet::new();
        let mut entries = 0;
        let mut has_manifest = false;
        let mut manifest_last = false;

        for entry in reader.entries().map_err(|e| archive_err("read", archive, e))? {
            let entry = entry.map_err(|e| archive_err("read", archive, e))?;
            let path = entry
                .path()
                .map_err(|e| archive_err("read", archive, e))?
                .into_owned();
            let parts = entry_components(&path).ok_or_else(|| {
                BackupError::Archive(format!("unsafe entry path {}", path.display()))
            })?;
            entries += 1;

            let Some(first) = parts.first() else { continue };
            match &top_level {
                None => top_level = Some(first.clone()),
                Some(top) if top != first => {
                    return Err(BackupError::Archive(format!(
                        "{} has more than one top-level entry ({} and {})",
                        archive.display(),
                        top,
                        first
                    )))
                }
                Some(_) => {}
            }

            let is_manifest = parts.len() == 2 && parts[1] == MANIFEST_FILE;
            manifest_last = is_manifest;
            if is_manifest {
                has_manifest = true;
            } else if parts.len() >= 2 {
                if parts.len() > 2 || entry.header().entry_type().is_dir() {
                    sections.insert(parts[1].clone());
                }
            }
        }

        let top_level = top_level
            .ok_or_else(|| BackupError::Archive(format!("{} is empty", archive.display())))?;
        if !sections.contains(REQUIRED_ENTRY) {
            return Err(BackupError::Archive(format!(
                "{} has no {}/{}/ entry",
                archive.display(),
                top_level,
                REQUIRED_ENTRY
            )));
        }

        Ok(ArchiveSummary {
            top_level,
            entries,
            sections,
            has_manifest,
            manifest_last,
        })
    }

    /// Extract into `dest`, returning the path of the top-level directory.
    pub fn extract(&self, archive: &Path, dest: &Path) -> Result<PathBuf> {
        let summary = self.verify(archive)?;

        let mut reader = open_archive(archive).map_err(|e| archive_err("open", archive, e))?;
        reader.set_preserve_permissions(true);
        reader
            .unpack(dest)
            .map_err(|e| archive_err("extract", archive, e))?;

        Ok(dest.join(summary.top_level))
    }

    /// Read the embedded manifest text, if the archive carries one.
    pub fn read_manifest(&self, archive: &Path) -> Result<Option<String>> {
        let mut reader = open_archive(archive).map_err(|e| archive_err("open", archive, e))?;

        for entry in reader.entries().map_err(|e| archive_err("read", archive, e))? {
            let mut entry = entry.map_err(|e| archive_err("read", archive, e))?;
            let path = entry
                .path()
                .map_err(|e| archive_err("read", archive, e))?
                .into_owned();
            let is_manifest = entry_components(&path)
                .map(|parts| parts.len() == 2 && parts[1] == MANIFEST_FILE)
                .unwrap_or(false);
            if is_manifest {
                let mut text = String::new();
                entry
                    .read_to_string(&mut text)
                    .map_err(|e| archive_err("read manifest of", archive, e))?;
                return Ok(Some(text));
            }
        }
        Ok(None)
    }
}

/// Bundle `files` (absolute path, name in bundle) into an owner-only
/// sub-archive whose entries are also stored at 0600.
pub fn write_owner_only_bundle(files: &[(PathBuf, PathBuf)], dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    restrict_to_owner(dest)?;

    let encoder = zstd::stream::Encoder::new(file, DEFAULT_LEVEL)?;
    let mut builder = Builder::new(encoder);

    for (source, name) in files {
        let mut header = Header::new_gnu();
        header.set_metadata(&fs::metadata(source)?);
        header.set_mode(OWNER_ONLY);
        builder.append_data(&mut header, name, File::open(source)?)?;
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

/// Unpack an owner-only bundle into `dest`, forcing 0600 on every file.
/// Returns the number of files written.
pub fn extract_owner_only_bundle(bundle: &Path, dest: &Path) -> Result<usize> {
    let mut reader = open_archive(bundle).map_err(|e| archive_err("open", bundle, e))?;
    let mut count = 0;

    for entry in reader.entries().map_err(|e| archive_err("read", bundle, e))? {
        let mut entry = entry.map_err(|e| archive_err("read", bundle, e))?;
        let path = entry
            .path()
            .map_err(|e| archive_err("read", bundle, e))?
            .into_owned();
        if entry_components(&path).is_none() {
            return Err(BackupError::Archive(format!(
                "unsafe entry path {} in {}",
                path.display(),
                bundle.display()
            )));
        }
        if !entry.header().entry_type().is_file() {
            continue;
        }

        entry
            .unpack_in(dest)
            .map_err(|e| archive_err("extract", bundle, e))?;
        set_mode(&dest.join(&path), OWNER_ONLY)?;
        count += 1;
    }
    Ok(count)
}
