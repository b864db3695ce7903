//! Restore orchestration.
//!
//! A restore validates the archive before touching anything, asks for
//! confirmation unless forced, snapshots the current configuration into
//! `pre-restore_<timestamp>/` and then replaces live state step by step:
//!
//! ```text
//! Validate -> SnapshotCurrent -> StopServices -> RestoreConfig -> RestoreCerts
//!   -> RestoreDatabase -> RestoreVolumes -> StartServices -> Verify
//! ```
//!
//! Only validation, refusal, the snapshot and the database replay end the
//! run. Everything else is recorded as a warning on the report. Nothing is
//! rolled back automatically; the snapshot is there for manual recovery.

use super::manifest::Manifest;
use crate::archive::{self, ArchiveManager, ArchiveSummary, ARCHIVE_EXT};
use crate::capture::{ComponentKind, KEY_BUNDLE, VOLUME_ARCHIVE_EXT};
use crate::config::Config;
use crate::fs::scratch::ScratchDir;
use crate::fs::walker::{copy_file, copy_tree, CopyStats, WalkOptions};
use crate::lock::BackupLock;
use crate::retention::PRE_RESTORE_PREFIX;
use crate::runtime::Collaborators;
use crate::utils::format::name_timestamp;
use crate::utils::{BackupError, Result};
use chrono::Utc;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Skip the confirmation prompt
    pub force: bool,
    /// Neither stop nor start services
    pub skip_service_restart: bool,
}

/// What is about to be restored, shown to the operator before confirming.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub backup_name: String,
    pub archive: PathBuf,
    pub summary: ArchiveSummary,
    /// `None` for archives without a readable manifest
    pub manifest: Option<Manifest>,
    pub skip_service_restart: bool,
}

/// Operator confirmation before live state is replaced.
pub trait ConfirmRestore: Sync {
    fn confirm(&self, plan: &RestorePlan) -> bool;
}

impl<F> ConfirmRestore for F
where
    F: Fn(&RestorePlan) -> bool + Sync,
{
    fn confirm(&self, plan: &RestorePlan) -> bool {
        self(plan)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStep {
    Validate,
    SnapshotCurrent,
    StopServices,
    RestoreConfig,
    RestoreCerts,
    RestoreDatabase,
    RestoreVolumes,
    StartServices,
    Verify,
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStep::Validate => "validate",
            RestoreStep::SnapshotCurrent => "snapshot current state",
            RestoreStep::StopServices => "stop services",
            RestoreStep::RestoreConfig => "restore configuration",
            RestoreStep::RestoreCerts => "restore certificates",
            RestoreStep::RestoreDatabase => "restore database",
            RestoreStep::RestoreVolumes => "restore volumes",
            RestoreStep::StartServices => "start services",
            RestoreStep::Verify => "verify",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Skipped,
    Warning,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: RestoreStep,
    pub outcome: StepOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    RestoredWithWarnings,
}

/// Paths and switches of one restore run.
#[derive(Debug, Clone)]
pub struct RestoreSession {
    pub source_archive: PathBuf,
    /// Scratch extraction directory, removed when the run ends
    pub extract_path: PathBuf,
    pub pre_restore_snapshot: Option<PathBuf>,
    pub force: bool,
    pub skip_service_restart: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub backup_name: String,
    pub session: RestoreSession,
    pub steps: Vec<StepRecord>,
    pub warnings: Vec<String>,
    pub outcome: RestoreOutcome,
}

impl RestoreReport {
    pub fn step(&self, step: RestoreStep) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step == step)
    }
}

/// Find the archive for `name`: a path, `<name>` or `<name>.tar.zst` in the
/// backup directory.
pub fn resolve_archive(backup_dir: &Path, name: &str) -> Result<PathBuf> {
    let as_path = Path::new(name);
    let candidates = [
        backup_dir.join(format!("{}{}", name, ARCHIVE_EXT)),
        backup_dir.join(name),
        as_path.to_path_buf(),
    ];

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| {
            BackupError::Validation(format!(
                "no backup archive named '{}' in {}",
                name,
                backup_dir.display()
            ))
        })
}

fn backup_name_of(archive: &Path) -> String {
    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    file_name
        .strip_suffix(ARCHIVE_EXT)
        .map(str::to_string)
        .unwrap_or(file_name)
}

struct StepLog {
    steps: Vec<StepRecord>,
    warnings: Vec<String>,
}

impl StepLog {
    fn done(&mut self, step: RestoreStep, detail: impl Into<String>) {
        let detail = detail.into();
        info!(%step, "{}", detail);
        self.steps.push(StepRecord {
            step,
            outcome: StepOutcome::Done,
            detail,
        });
    }

    fn skipped(&mut self, step: RestoreStep, detail: impl Into<String>) {
        let detail = detail.into();
        info!(%step, "Skipped: {}", detail);
        self.steps.push(StepRecord {
            step,
            outcome: StepOutcome::Skipped,
            detail,
        });
    }

    fn warning(&mut self, step: RestoreStep, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(%step, "{}", detail);
        self.warnings.push(format!("{}: {}", step, detail));
        self.steps.push(StepRecord {
            step,
            outcome: StepOutcome::Warning,
            detail,
        });
    }
}

pub struct RestoreOrchestrator {
    config: Config,
    collaborators: Collaborators,
    archive: ArchiveManager,
}

impl RestoreOrchestrator {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            archive: ArchiveManager::default(),
        }
    }

    /// Inspect an archive without changing anything.
    pub async fn plan(&self, name: &str, options: RestoreOptions) -> Result<RestorePlan> {
        let archive = resolve_archive(&self.config.backup_dir(), name)?;
        let manager = self.archive.clone();
        let path = archive.clone();

        let (summary, manifest) = tokio::task::spawn_blocking(move || {
            let summary = manager.verify(&path)?;
            let manifest = manager
                .read_manifest(&path)
                .ok()
                .flatten()
                .and_then(|text| Manifest::parse(&text).ok());
            Ok::<_, BackupError>((summary, manifest))
        })
        .await
        .map_err(|e| BackupError::Validation(format!("validation task failed: {}", e)))?
        .map_err(|e| {
            BackupError::Validation(format!(
                "{} is not a usable backup: {}",
                archive.display(),
                e
            ))
        })?;

        Ok(RestorePlan {
            backup_name: backup_name_of(&archive),
            archive,
            summary,
            manifest,
            skip_service_restart: options.skip_service_restart,
        })
    }

    pub async fn restore(
        &self,
        name: &str,
        options: RestoreOptions,
        confirm: &dyn ConfirmRestore,
    ) -> Result<RestoreReport> {
        let backup_dir = self.config.backup_dir();
        let _lock = BackupLock::acquire(&backup_dir)?;

        info!(backup = %name, "Starting restore");
        let mut log = StepLog {
            steps: Vec::new(),
            warnings: Vec::new(),
        };

        let plan = self.plan(name, options).await?;
        if plan.manifest.is_none() {
            log.warning(RestoreStep::Validate, "archive has no readable manifest");
        } else {
            log.done(
                RestoreStep::Validate,
                format!("{} entries under {}/", plan.summary.entries, plan.summary.top_level),
            );
        }

        if !options.force && !confirm.confirm(&plan) {
            info!(backup = %plan.backup_name, "Restore declined");
            return Err(BackupError::RestoreAborted(
                "restore was not confirmed".to_string(),
            ));
        }

        let scratch_path = backup_dir.join(format!(".restore-{}", plan.backup_name));
        let scratch = ScratchDir::create(scratch_path)?;
        let tree = {
            let manager = self.archive.clone();
            let archive = plan.archive.clone();
            let dest = scratch.path().to_path_buf();
            tokio::task::spawn_blocking(move || manager.extract(&archive, &dest))
                .await
                .map_err(|e| BackupError::Archive(format!("extract task failed: {}", e)))??
        };

        let mut session = RestoreSession {
            source_archive: plan.archive.clone(),
            extract_path: scratch.path().to_path_buf(),
            pre_restore_snapshot: None,
            force: options.force,
            skip_service_restart: options.skip_service_restart,
        };

        let snapshot = self.snapshot_current(&backup_dir)?;
        log.done(RestoreStep::SnapshotCurrent, format!("saved to {}", snapshot.display()));
        session.pre_restore_snapshot = Some(snapshot);

        if options.skip_service_restart {
            log.skipped(RestoreStep::StopServices, "service transitions skipped on request");
        } else {
            match self.collaborators.services.stop_all().await {
                Ok(()) => log.done(RestoreStep::StopServices, "services stopped"),
                Err(e) => log.warning(
                    RestoreStep::StopServices,
                    BackupError::ServiceTransition(e.to_string()).to_string(),
                ),
            }
        }

        let config_restored = self.restore_config(&tree, &mut log);
        self.restore_certs(&tree, &mut log);

        if let Err(e) = self.restore_database(&tree, &mut log).await {
            // the replay brings the database service up on its own
            if !options.skip_service_restart {
                match self.collaborators.services.stop_all().await {
                    Ok(()) => info!("Services left stopped"),
                    Err(stop_err) => {
                        warn!("Could not stop services after the failed replay: {}", stop_err)
                    }
                }
            }
            error!(
                "Database restore failed; no further steps were run. Pre-restore snapshot: {}",
                session
                    .pre_restore_snapshot
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
            return Err(e);
        }

        self.restore_volumes(&tree, &mut log).await;

        let started = if options.skip_service_restart {
            log.skipped(RestoreStep::StartServices, "service transitions skipped on request");
            false
        } else {
            self.start_services(&mut log).await
        };

        self.verify(config_restored, started, &mut log).await;

        drop(scratch);

        let outcome = if log.warnings.is_empty() {
            RestoreOutcome::Restored
        } else {
            RestoreOutcome::RestoredWithWarnings
        };
        info!(
            backup = %plan.backup_name,
            ?outcome,
            warnings = log.warnings.len(),
            "Restore finished"
        );

        Ok(RestoreReport {
            backup_name: plan.backup_name,
            session,
            steps: log.steps,
            warnings: log.warnings,
            outcome,
        })
    }

    /// Copy the live configuration and certificates aside before overwriting.
    fn snapshot_current(&self, backup_dir: &Path) -> Result<PathBuf> {
        let deployment = &self.config.deployment;
        let base = format!("{}{}", PRE_RESTORE_PREFIX, name_timestamp(Utc::now()));
        let snapshot = create_unique_dir(&backup_dir.join(base))?;

        let mut stats = CopyStats::default();
        for file in [&deployment.descriptor, &deployment.env_file] {
            let source = deployment.project_root.join(file);
            if source.is_file() {
                stats.bytes += copy_file(&source, &snapshot.join(file))?;
                stats.files += 1;
            }
        }

        let mut trees: Vec<&String> = deployment.config_dirs.iter().collect();
        trees.push(&deployment.certs_dir);
        for dir in trees {
            let source = deployment.project_root.join(dir);
            if source.is_dir() {
                stats.add(copy_tree(&source, &snapshot.join(dir), &all_files())?);
            }
        }

        debug!("Snapshot holds {} files ({} bytes)", stats.files, stats.bytes);
        Ok(snapshot)
    }

    fn restore_config(&self, tree: &Path, log: &mut StepLog) -> bool {
        let source = tree.join(ComponentKind::Config.dir_name());
        if !source.is_dir() {
            log.skipped(RestoreStep::RestoreConfig, "archive has no configuration");
            return false;
        }

        match copy_tree(&source, &self.config.deployment.project_root, &all_files()) {
            Ok(stats) if stats.files == 0 => {
                log.skipped(RestoreStep::RestoreConfig, "archive configuration is empty");
                false
            }
            Ok(stats) => {
                log.done(RestoreStep::RestoreConfig, format!("{} files restored", stats.files));
                true
            }
            Err(e) => {
                log.warning(
                    RestoreStep::RestoreConfig,
                    format!("configuration copy failed: {}", e),
                );
                false
            }
        }
    }

    fn restore_certs(&self, tree: &Path, log: &mut StepLog) {
        let source = tree.join(ComponentKind::Certificates.dir_name());
        if !source.is_dir() {
            log.skipped(RestoreStep::RestoreCerts, "archive has no certificates");
            return;
        }

        let dest = self.config.deployment.certs_path();
        let options = WalkOptions {
            exclude_names: vec![KEY_BUNDLE.to_string()],
            ..WalkOptions::default()
        };

        let result = copy_tree(&source, &dest, &options)
            .map_err(BackupError::from)
            .and_then(|stats| {
                let bundle = source.join(KEY_BUNDLE);
                let keys = if bundle.is_file() {
                    archive::extract_owner_only_bundle(&bundle, &dest)?
                } else {
                    0
                };
                Ok((stats, keys))
            });

        match result {
            Ok((stats, keys)) => log.done(
                RestoreStep::RestoreCerts,
                format!("{} files restored, {} private keys at 0600", stats.files, keys),
            ),
            Err(e) => log.warning(
                RestoreStep::RestoreCerts,
                format!("certificate restore failed: {}", e),
            ),
        }
    }

    async fn restore_database(&self, tree: &Path, log: &mut StepLog) -> Result<()> {
        let dir = tree.join(ComponentKind::Database.dir_name());
        let Some(dump) = find_dump(&dir, &self.config.database.name) else {
            log.warning(RestoreStep::RestoreDatabase, "archive has no database dump");
            return Ok(());
        };

        self.collaborators
            .database
            .restore(&dump)
            .await
            .map_err(|e| BackupError::DatabaseRestore(e.to_string()))?;

        let file_name = dump
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        log.done(RestoreStep::RestoreDatabase, format!("replayed {}", file_name));
        Ok(())
    }

    async fn restore_volumes(&self, tree: &Path, log: &mut StepLog) {
        let dir = tree.join(ComponentKind::Volumes.dir_name());
        let archives = volume_archives(&dir);
        if archives.is_empty() {
            log.skipped(RestoreStep::RestoreVolumes, "archive has no volumes");
            return;
        }

        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for (volume, path) in archives {
            let runtime_name = self.config.deployment.volume_name(&volume);
            match self.collaborators.volumes.import(&runtime_name, &path).await {
                Ok(()) => restored.push(volume),
                Err(e) => failed.push(format!("{} ({})", volume, e)),
            }
        }

        if failed.is_empty() {
            log.done(RestoreStep::RestoreVolumes, format!("restored: {}", restored.join(", ")));
        } else {
            log.warning(
                RestoreStep::RestoreVolumes,
                format!("restored: {}; failed: {}", restored.join(", "), failed.join(", ")),
            );
        }
    }

    async fn start_services(&self, log: &mut StepLog) -> bool {
        if let Err(e) = self.collaborators.services.start_all().await {
            log.warning(
                RestoreStep::StartServices,
                BackupError::ServiceTransition(e.to_string()).to_string(),
            );
            return false;
        }

        let grace = self.config.restore.start_grace_secs;
        if grace > 0 {
            info!("Waiting {}s for services to settle", grace);
            tokio::time::sleep(Duration::from_secs(grace)).await;
        }
        log.done(RestoreStep::StartServices, "services started");
        true
    }

    async fn verify(&self, config_restored: bool, started: bool, log: &mut StepLog) {
        let deployment = &self.config.deployment;
        let mut problems = Vec::new();

        if config_restored {
            for path in [deployment.descriptor_path(), deployment.env_path()] {
                if !path.is_file() {
                    problems.push(format!("{} is missing", path.display()));
                }
            }
        }

        if started {
            match self.collaborators.services.not_running().await {
                Ok(down) if !down.is_empty() => {
                    problems.push(format!("not running: {}", down.join(", ")))
                }
                Ok(_) => {}
                Err(e) => problems.push(format!("service check failed: {}", e)),
            }
        }

        if problems.is_empty() {
            log.done(RestoreStep::Verify, "restored state looks healthy");
        } else {
            log.warning(
                RestoreStep::Verify,
                BackupError::Verification(problems.join("; ")).to_string(),
            );
        }
    }
}

fn all_files() -> WalkOptions {
    WalkOptions {
        exclude_names: Vec::new(),
        ..WalkOptions::default()
    }
}

/// `<db>.sql` if present, otherwise the first dump in the directory.
fn find_dump(dir: &Path, db_name: &str) -> Option<PathBuf> {
    let preferred = dir.join(format!("{}.sql", db_name));
    if preferred.is_file() {
        return Some(preferred);
    }

    let mut dumps: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    dumps.sort();
    dumps.into_iter().next()
}

/// `(short volume name, archive path)` for every volume archive, sorted.
fn volume_archives(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut archives: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().to_string();
            let volume = name.strip_suffix(VOLUME_ARCHIVE_EXT)?.to_string();
            Some((volume, path))
        })
        .collect();
    archives.sort();
    archives
}

/// Create `base`, or `base_2`, `base_3`, ... when it already exists.
fn create_unique_dir(base: &Path) -> std::io::Result<PathBuf> {
    if let Some(parent) = base.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut candidate = base.to_path_buf();
    let mut n = 1;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                n += 1;
                candidate = PathBuf::from(format!("{}_{}", base.display(), n));
            }
            Err(e) => return Err(e),
        }
    }
}
