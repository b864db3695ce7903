//! Age and count based pruning of the backup directory.
//!
//! Entries are `<name>.tar.zst` archives plus legacy uncompressed backup
//! directories (recognised by their `backup-info.txt`). Every entry is subject
//! to the age limit; automated entries (`auto_` prefix) are additionally capped
//! to the newest `max_count`.

use crate::archive::{ARCHIVE_EXT, MANIFEST_FILE};
use crate::config::BackupConfig;
use crate::fs::walker::calculate_total_size;
use crate::utils::Result;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Name prefix of backups created by the scheduler.
pub const AUTOMATED_PREFIX: &str = "auto_";

/// Prefix of the safety copies taken before a restore.
pub const PRE_RESTORE_PREFIX: &str = "pre-restore_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: u64,
    /// Cap on automated backups; manual ones are only pruned by age
    pub max_count: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_count: 7,
        }
    }
}

impl From<&BackupConfig> for RetentionPolicy {
    fn from(config: &BackupConfig) -> Self {
        Self {
            max_age_days: config.retention_days,
            max_count: config.max_automated,
        }
    }
}

/// One backup found in the backup directory.
#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    #[serde(with = "system_time_secs")]
    pub modified: SystemTime,
    pub automated: bool,
}

mod system_time_secs {
    use serde::Serializer;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let secs = time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        serializer.serialize_u64(secs)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub removed: Vec<BackupEntry>,
    pub kept: Vec<BackupEntry>,
    /// Pre-restore snapshots past the age limit
    pub snapshots_removed: Vec<PathBuf>,
}

impl BackupEntry {
    /// Age relative to `now`, zero for entries from the future.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.modified).unwrap_or_default()
    }

    fn remove(&self) -> std::io::Result<()> {
        if self.path.is_dir() {
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_file(&self.path)
        }
    }
}

fn entry_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_string_lossy().to_string();
    if file_name.starts_with('.') || file_name.starts_with(PRE_RESTORE_PREFIX) {
        return None;
    }

    if path.is_dir() {
        path.join(MANIFEST_FILE).is_file().then_some(file_name)
    } else {
        file_name.strip_suffix(ARCHIVE_EXT).map(str::to_string)
    }
}

/// All backups in `dir`, newest first. A missing directory has none.
pub fn list_backups(dir: &Path) -> Result<Vec<BackupEntry>> {
    let mut entries = Vec::new();
    if !dir.is_dir() {
        return Ok(entries);
    }

    for item in fs::read_dir(dir)? {
        let item = item?;
        let path = item.path();
        let Some(name) = entry_name(&path) else { continue };

        let metadata = item.metadata()?;
        let size = if metadata.is_dir() {
            calculate_total_size(&path)?
        } else {
            metadata.len()
        };

        entries.push(BackupEntry {
            automated: name.starts_with(AUTOMATED_PREFIX),
            name,
            path,
            size,
            modified: metadata.modified()?,
        });
    }

    entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    Ok(entries)
}

/// Entries `policy` would remove at `now`, never including `exclude`.
pub fn select_expired(
    entries: &[BackupEntry],
    policy: &RetentionPolicy,
    now: SystemTime,
    exclude: Option<&str>,
) -> Vec<BackupEntry> {
    let max_age = Duration::from_secs(policy.max_age_days * 86_400);
    let mut expired = Vec::new();

    // the excluded backup always holds one automated slot
    let mut automated_kept = entries
        .iter()
        .filter(|e| e.automated && exclude == Some(e.name.as_str()))
        .count();

    // entries are newest first, so the count cap keeps the newest
    for entry in entries {
        if exclude == Some(entry.name.as_str()) {
            continue;
        }

        if entry.age(now) > max_age {
            expired.push(entry.clone());
        } else if entry.automated {
            if automated_kept >= policy.max_count {
                expired.push(entry.clone());
            } else {
                automated_kept += 1;
            }
        }
    }
    expired
}

/// Pre-restore snapshot directories in `dir` older than the age limit.
pub fn expired_snapshots(
    dir: &Path,
    policy: &RetentionPolicy,
    now: SystemTime,
) -> Result<Vec<PathBuf>> {
    let mut expired = Vec::new();
    if !dir.is_dir() {
        return Ok(expired);
    }

    let max_age = Duration::from_secs(policy.max_age_days * 86_400);
    for item in fs::read_dir(dir)? {
        let item = item?;
        let is_snapshot = item.file_name().to_string_lossy().starts_with(PRE_RESTORE_PREFIX);
        let metadata = item.metadata()?;
        if !is_snapshot || !metadata.is_dir() {
            continue;
        }

        let age = now.duration_since(metadata.modified()?).unwrap_or_default();
        if age > max_age {
            expired.push(item.path());
        }
    }
    expired.sort();
    Ok(expired)
}

/// Prune `dir` against the current time.
pub fn prune(dir: &Path, policy: &RetentionPolicy, exclude: Option<&str>) -> Result<PruneReport> {
    prune_at(dir, policy, SystemTime::now(), exclude, false)
}

/// Prune `dir` as of `now`. With `dry_run` nothing is deleted and the report
/// lists what would be.
pub fn prune_at(
    dir: &Path,
    policy: &RetentionPolicy,
    now: SystemTime,
    exclude: Option<&str>,
    dry_run: bool,
) -> Result<PruneReport> {
    let entries = list_backups(dir)?;
    let expired = select_expired(&entries, policy, now, exclude);

    let mut report = PruneReport::default();
    for entry in entries {
        if !expired.iter().any(|e| e.path == entry.path) {
            report.kept.push(entry);
            continue;
        }

        if dry_run {
            info!(backup = %entry.name, "Would remove expired backup");
            report.removed.push(entry);
            continue;
        }

        match entry.remove() {
            Ok(()) => {
                info!(backup = %entry.name, path = %entry.path.display(), "Removed expired backup");
                report.removed.push(entry);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(backup = %entry.name, "Failed to remove expired backup: {}", e);
                report.kept.push(entry);
            }
        }
    }

    for snapshot in expired_snapshots(dir, policy, now)? {
        if dry_run {
            info!(path = %snapshot.display(), "Would remove expired pre-restore snapshot");
            report.snapshots_removed.push(snapshot);
            continue;
        }

        match fs::remove_dir_all(&snapshot) {
            Ok(()) => {
                info!(path = %snapshot.display(), "Removed expired pre-restore snapshot");
                report.snapshots_removed.push(snapshot);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %snapshot.display(), "Failed to remove snapshot: {}", e),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    const DAY: u64 = 86_400;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000 * DAY)
    }

    fn backup_aged(dir: &Path, name: &str, days: u64) {
        let path = dir.join(format!("{}{}", name, ARCHIVE_EXT));
        fs::write(&path, b"archive").unwrap();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(now() - Duration::from_secs(days * DAY)).unwrap();
    }

    fn names(entries: &[BackupEntry]) -> Vec<String> {
        let mut names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_age_pruning() {
        let dir = TempDir::new().unwrap();
        backup_aged(dir.path(), "backup_a", 5);
        backup_aged(dir.path(), "backup_b", 35);
        backup_aged(dir.path(), "backup_c", 40);

        let policy = RetentionPolicy {
            max_age_days: 30,
            max_count: 7,
        };
        let report = prune_at(dir.path(), &policy, now(), None, false).unwrap();

        assert_eq!(names(&report.removed), vec!["backup_b", "backup_c"]);
        assert_eq!(names(&list_backups(dir.path()).unwrap()), vec!["backup_a"]);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let dir = TempDir::new().unwrap();
        backup_aged(dir.path(), "backup_a", 5);
        backup_aged(dir.path(), "backup_b", 35);

        let policy = RetentionPolicy::default();
        prune_at(dir.path(), &policy, now(), None, false).unwrap();
        let second = prune_at(dir.path(), &policy, now(), None, false).unwrap();

        assert!(second.removed.is_empty());
        assert_eq!(names(&second.kept), vec!["backup_a"]);
    }

    #[test]
    fn test_count_cap_applies_to_automated_only() {
        let dir = TempDir::new().unwrap();
        for day in 1..=5 {
            backup_aged(dir.path(), &format!("auto_backup_{}", day), day);
            backup_aged(dir.path(), &format!("backup_{}", day), day);
        }

        let policy = RetentionPolicy {
            max_age_days: 30,
            max_count: 2,
        };
        let report = prune_at(dir.path(), &policy, now(), None, false).unwrap();

        assert_eq!(
            names(&report.removed),
            vec!["auto_backup_3", "auto_backup_4", "auto_backup_5"]
        );
        let remaining = names(&list_backups(dir.path()).unwrap());
        assert_eq!(remaining.len(), 7);
        assert!(remaining.contains(&"auto_backup_1".to_string()));
        assert!(remaining.contains(&"backup_5".to_string()));
    }

    #[test]
    fn test_exclude_is_never_removed() {
        let dir = TempDir::new().unwrap();
        backup_aged(dir.path(), "backup_old", 90);

        let policy = RetentionPolicy::default();
        let report = prune_at(dir.path(), &policy, now(), Some("backup_old"), false).unwrap();

        assert!(report.removed.is_empty());
        assert!(dir.path().join("backup_old.tar.zst").exists());
    }

    #[test]
    fn test_excluded_automated_backup_takes_a_slot() {
        let dir = TempDir::new().unwrap();
        backup_aged(dir.path(), "auto_a", 1);
        backup_aged(dir.path(), "auto_b", 2);
        backup_aged(dir.path(), "auto_current", 3);

        let policy = RetentionPolicy {
            max_age_days: 30,
            max_count: 2,
        };
        let report = prune_at(dir.path(), &policy, now(), Some("auto_current"), false).unwrap();

        assert_eq!(names(&report.removed), vec!["auto_b"]);
    }

    #[test]
    fn test_dry_run_deletes_nothing() {
        let dir = TempDir::new().unwrap();
        backup_aged(dir.path(), "backup_old", 90);

        let report = prune_at(dir.path(), &RetentionPolicy::default(), now(), None, true).unwrap();

        assert_eq!(names(&report.removed), vec!["backup_old"]);
        assert!(dir.path().join("backup_old.tar.zst").exists());
    }

    #[test]
    fn test_listing_recognises_legacy_dirs_and_ignores_the_rest() {
        let dir = TempDir::new().unwrap();
        backup_aged(dir.path(), "auto_backup_1", 1);

        let legacy = dir.path().join("backup_legacy");
        fs::create_dir_all(&legacy).unwrap();
        fs::write(legacy.join(MANIFEST_FILE), b"Backup Information").unwrap();

        fs::create_dir_all(dir.path().join("random_dir")).unwrap();
        fs::create_dir_all(dir.path().join(".staging/backup_x")).unwrap();
        fs::create_dir_all(dir.path().join("pre-restore_20260101_000000")).unwrap();
        fs::write(dir.path().join(".deploy-backup.lock"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let entries = list_backups(dir.path()).unwrap();
        assert_eq!(names(&entries), vec!["auto_backup_1", "backup_legacy"]);
        assert!(entries.iter().find(|e| e.name == "auto_backup_1").unwrap().automated);
    }

    fn snapshot_aged(dir: &Path, name: &str, days: u64) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(".env"), b"KEY=1\n").unwrap();
        let modified = now() - Duration::from_secs(days * DAY);
        File::open(&path).unwrap().set_modified(modified).unwrap();
        path
    }

    #[test]
    fn test_old_pre_restore_snapshots_are_pruned() {
        let dir = TempDir::new().unwrap();
        backup_aged(dir.path(), "backup_a", 5);
        let old = snapshot_aged(dir.path(), "pre-restore_20260101_000000", 40);
        let recent = snapshot_aged(dir.path(), "pre-restore_20260901_000000", 2);

        let policy = RetentionPolicy::default();
        let dry = prune_at(dir.path(), &policy, now(), None, true).unwrap();
        assert_eq!(dry.snapshots_removed, vec![old.clone()]);
        assert!(old.exists());

        let report = prune_at(dir.path(), &policy, now(), None, false).unwrap();
        assert_eq!(report.snapshots_removed, vec![old.clone()]);
        assert!(report.removed.is_empty());
        assert!(!old.exists());
        assert!(recent.exists());
    }

    #[test]
    fn test_missing_dir_lists_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(list_backups(&dir.path().join("nope")).unwrap().is_empty());
    }
}
