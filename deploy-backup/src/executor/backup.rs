//! Backup orchestration: capture, manifest, archive, prune.

use super::manifest::{BackupOutcome, Manifest, ManifestBuilder};
use crate::archive::{archive_path, ArchiveManager};
use crate::capture::{capture_all, CaptureContext, ComponentResult};
use crate::config::Config;
use crate::fs::metadata::restrict_to_owner;
use crate::fs::scratch::ScratchDir;
use crate::lock::BackupLock;
use crate::retention::{self, RetentionPolicy, AUTOMATED_PREFIX, PRE_RESTORE_PREFIX};
use crate::runtime::Collaborators;
use crate::utils::format::name_timestamp;
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Longest accepted backup name, in bytes.
pub const MAX_NAME_LEN: usize = 128;

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Manual,
    /// Scheduled run, subject to the automated count cap
    Automated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Init,
    Capturing,
    Manifesting,
    Archiving,
    Pruning,
    Done,
    Failed,
}

/// A finished backup
#[derive(Debug, Clone)]
pub struct Backup {
    pub name: String,
    /// Where the components were staged; gone once the backup returns
    pub staging_path: PathBuf,
    pub archive_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub components: Vec<ComponentResult>,
    pub outcome: BackupOutcome,
    /// Final archive size, manifest included
    pub archive_bytes: u64,
    pub manifest: Manifest,
    /// Names of backups removed by retention afterwards
    pub pruned: Vec<String>,
}

impl BackupKind {
    pub fn default_name(self, at: DateTime<Utc>) -> String {
        match self {
            BackupKind::Manual => format!("backup_{}", name_timestamp(at)),
            BackupKind::Automated => format!("{}backup_{}", AUTOMATED_PREFIX, name_timestamp(at)),
        }
    }

    /// Final name for an operator-supplied or generated name.
    pub fn resolve_name(self, name: Option<&str>, at: DateTime<Utc>) -> String {
        match (self, name) {
            (_, None) => self.default_name(at),
            (BackupKind::Automated, Some(name)) if !name.starts_with(AUTOMATED_PREFIX) => {
                format!("{}{}", AUTOMATED_PREFIX, name)
            }
            (_, Some(name)) => name.to_string(),
        }
    }
}

/// Names become file names, so only a conservative character set is accepted.
pub fn validate_backup_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BackupError::Environment("backup name is empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(BackupError::Environment(format!(
            "backup name is longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    if name.starts_with('.') || name.starts_with(PRE_RESTORE_PREFIX) {
        return Err(BackupError::Environment(format!(
            "backup name '{}' uses a reserved prefix",
            name
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(BackupError::Environment(format!(
            "backup name '{}' contains '{}'; use letters, digits, '.', '_' or '-'",
            name, bad
        )));
    }
    Ok(())
}

pub struct BackupOrchestrator {
    config: Config,
    collaborators: Collaborators,
    archive: ArchiveManager,
    state: BackupState,
}

impl BackupOrchestrator {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self {
            archive: ArchiveManager::new(config.backup.compression_level),
            config,
            collaborators,
            state: BackupState::Init,
        }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    fn transition(&mut self, to: BackupState) {
        debug!("Backup state {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    /// Run one backup end to end.
    ///
    /// On failure no archive and no staging directory remain.
    pub async fn create_backup(&mut self, name: Option<&str>, kind: BackupKind) -> Result<Backup> {
        let start_time = Instant::now();
        let created_at = Utc::now();
        let name = kind.resolve_name(name, created_at);
        self.state = BackupState::Init;

        info!(backup = %name, ?kind, "Starting backup");

        match self.run(&name, kind, created_at).await {
            Ok(backup) => {
                self.transition(BackupState::Done);
                info!(
                    backup = %backup.name,
                    outcome = backup.outcome.as_str(),
                    bytes = backup.archive_bytes,
                    "Backup completed in {}s",
                    start_time.elapsed().as_secs()
                );
                Ok(backup)
            }
            Err(e) => {
                self.transition(BackupState::Failed);
                error!(backup = %name, "Backup failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run(
        &mut self,
        name: &str,
        kind: BackupKind,
        created_at: DateTime<Utc>,
    ) -> Result<Backup> {
        validate_backup_name(name)?;

        let backup_dir = self.config.backup_dir();
        let _lock = BackupLock::acquire(&backup_dir)?;

        let archive = archive_path(&backup_dir, name);
        if archive.exists() || backup_dir.join(name).exists() {
            return Err(BackupError::Environment(format!(
                "backup '{}' already exists in {}",
                name,
                backup_dir.display()
            )));
        }

        self.collaborators
            .services
            .ping()
            .await
            .map_err(|e| {
                BackupError::Environment(format!("container runtime unavailable: {}", e))
            })?;

        let staging = ScratchDir::create(backup_dir.join(STAGING_DIR).join(name))?;
        let staging_path = staging.path().to_path_buf();

        let service_status = match self.collaborators.services.status_snapshot().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Could not record service status: {}", e);
                format!("unavailable: {}", e)
            }
        };
        let tool_versions = self.collaborators.services.tool_versions().await;

        self.transition(BackupState::Capturing);
        let components = {
            let ctx = CaptureContext {
                config: &self.config,
                collaborators: &self.collaborators,
                staging: &staging_path,
                now: SystemTime::now(),
            };
            capture_all(&ctx).await
        };
        check_failure_policy(&components)?;

        self.transition(BackupState::Manifesting);
        let builder = ManifestBuilder::new(&self.config, tool_versions);

        self.transition(BackupState::Archiving);
        let (archive_bytes, manifest) = {
            let manager = self.archive.clone();
            let staging_path = staging_path.clone();
            let archive = archive.clone();
            let name = name.to_string();
            let components = components.clone();

            tokio::task::spawn_blocking(move || {
                seal_archive(&manager, &staging_path, &archive, |facts| {
                    builder.build(&name, created_at, facts, &components, &service_status)
                })
            })
            .await
            .map_err(|e| BackupError::Archive(format!("archive task failed: {}", e)))??
        };

        drop(staging);
        let _ = fs::remove_dir(backup_dir.join(STAGING_DIR));

        self.transition(BackupState::Pruning);
        let policy = RetentionPolicy::from(&self.config.backup);
        let pruned = match retention::prune(&backup_dir, &policy, Some(name)) {
            Ok(report) => report.removed.into_iter().map(|e| e.name).collect(),
            Err(e) => {
                warn!("Retention pruning failed: {}", e);
                Vec::new()
            }
        };

        Ok(Backup {
            name: name.to_string(),
            staging_path,
            archive_path: archive,
            created_at,
            outcome: manifest.outcome,
            components: manifest.components.clone(),
            archive_bytes,
            manifest,
            pruned,
        })
    }
}

/// Database failure, or nothing captured at all, fails the backup.
fn check_failure_policy(components: &[ComponentResult]) -> Result<()> {
    if let Some(essential) = components
        .iter()
        .find(|c| c.is_failed() && c.kind.aborts_on_failure())
    {
        return Err(BackupError::ComponentCapture {
            kind: essential.kind,
            message: essential.detail.clone(),
        });
    }

    if !components.iter().any(ComponentResult::is_success) {
        return Err(BackupError::Validation(
            "no component was captured successfully".to_string(),
        ));
    }

    for failed in components.iter().filter(|c| c.is_failed()) {
        warn!(component = %failed.kind, "Continuing without {}: {}", failed.kind, failed.detail);
    }
    Ok(())
}

/// Pack, inject the manifest, verify and restrict the archive. Any failure
/// leaves no archive behind.
fn seal_archive<F>(
    manager: &ArchiveManager,
    staging: &Path,
    archive: &Path,
    build: F,
) -> Result<(u64, Manifest)>
where
    F: FnOnce(&crate::archive::PackedFacts) -> Manifest,
{
    manager.pack(staging, archive)?;

    let mut manifest = None;
    let size = manager.reopen(archive, |facts| {
        let built = build(facts);
        let text = built.render();
        manifest = Some(built);
        text
    })?;

    let finish = || -> Result<Manifest> {
        let summary = manager.verify(archive)?;
        if !summary.manifest_last {
            return Err(BackupError::Archive(format!(
                "{} does not end with its manifest",
                archive.display()
            )));
        }
        restrict_to_owner(archive)?;
        manifest.ok_or_else(|| BackupError::Archive("manifest was not generated".to_string()))
    };

    match finish() {
        Ok(manifest) => Ok((size, manifest)),
        Err(e) => {
            let _ = fs::remove_file(archive);
            Err(e)
        }
    }
}
