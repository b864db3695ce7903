//! deploy-backup - Main entry point
//!
//! Backup, restore and retention for a docker compose deployment.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use deploy_backup::archive::{ArchiveManager, MANIFEST_FILE};
use deploy_backup::executor::restore::resolve_archive;
use deploy_backup::executor::{
    BackupKind, BackupOrchestrator, Manifest, RestoreOptions, RestoreOrchestrator, RestoreOutcome,
    RestorePlan, StepOutcome,
};
use deploy_backup::lock::BackupLock;
use deploy_backup::retention::{self, RetentionPolicy};
use deploy_backup::runtime::{Collaborators, DockerRuntime};
use deploy_backup::utils::format::{format_age, format_bytes};
use deploy_backup::{utils, Config};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a backup archive
    Backup {
        /// Backup name (defaults to a timestamped name)
        name: Option<String>,

        /// Mark as a scheduled backup, subject to the automated count cap
        #[arg(long)]
        automated: bool,
    },

    /// Restore the deployment from a backup
    Restore {
        /// Backup name or archive path
        name: String,

        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,

        /// Do not stop or start services
        #[arg(long)]
        skip_services: bool,
    },

    /// List available backups
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a backup's manifest
    Info { name: String },

    /// Check that an archive is complete and restorable
    Verify { name: String },

    /// Apply the retention policy
    Prune {
        /// Only show what would be removed
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!(
        "deploy-backup v{} (project: {}, backups: {})",
        env!("CARGO_PKG_VERSION"),
        config.deployment.project_name,
        config.backup_dir().display()
    );

    match args.command {
        Command::Backup { name, automated } => run_backup(config, name, automated).await,
        Command::Restore { name, force, skip_services } => {
            run_restore(config, &name, force, skip_services).await
        }
        Command::List { json } => list(&config, json),
        Command::Info { name } => info(&config, &name),
        Command::Verify { name } => verify(&config, &name),
        Command::Prune { dry_run } => prune(&config, dry_run),
    }
}

fn collaborators(config: &Config) -> Result<Collaborators> {
    let runtime = DockerRuntime::connect(config)?;
    Ok(Collaborators::from_runtime(Arc::new(runtime)))
}

async fn run_backup(config: Config, name: Option<String>, automated: bool) -> Result<()> {
    let kind = if automated { BackupKind::Automated } else { BackupKind::Manual };
    let collaborators = collaborators(&config)?;
    let mut orchestrator = BackupOrchestrator::new(config, collaborators);

    let backup = orchestrator.create_backup(name.as_deref(), kind).await?;

    println!("Backup {} created", backup.name);
    println!(
        "  Archive: {} ({})",
        backup.archive_path.display(),
        format_bytes(backup.archive_bytes)
    );
    for component in &backup.components {
        println!(
            "  {:<14}{:<9}{}",
            component.kind.as_str(),
            component.status.as_str(),
            component.detail
        );
    }
    println!("  Outcome: {}", backup.outcome.as_str());
    if !backup.pruned.is_empty() {
        println!("  Pruned:  {}", backup.pruned.join(", "));
    }
    Ok(())
}

/// Ask on stdin; only an explicit `yes` continues.
fn prompt_confirmation(plan: &RestorePlan) -> bool {
    println!("About to restore {} from {}", plan.backup_name, plan.archive.display());
    if let Some(manifest) = &plan.manifest {
        println!("  Created: {}", manifest.created_at.to_rfc3339());
        println!("  Host:    {}", manifest.host);
    }
    println!("Current configuration, certificates, database and volumes will be replaced.");
    if !plan.skip_service_restart {
        println!("All services will be stopped and restarted.");
    }
    print!("Type 'yes' to continue: ");
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => answer.trim() == "yes",
        Err(_) => false,
    }
}

async fn run_restore(config: Config, name: &str, force: bool, skip_services: bool) -> Result<()> {
    let collaborators = collaborators(&config)?;
    let orchestrator = RestoreOrchestrator::new(config, collaborators);
    let options = RestoreOptions {
        force,
        skip_service_restart: skip_services,
    };

    let report = orchestrator.restore(name, options, &prompt_confirmation).await?;

    println!("Restored {}", report.backup_name);
    for record in &report.steps {
        let marker = match record.outcome {
            StepOutcome::Done => "ok",
            StepOutcome::Skipped => "skip",
            StepOutcome::Warning => "WARN",
        };
        println!("  [{:<4}] {}: {}", marker, record.step, record.detail);
    }
    if let Some(snapshot) = &report.session.pre_restore_snapshot {
        println!("  Previous configuration saved to {}", snapshot.display());
    }
    if report.outcome == RestoreOutcome::RestoredWithWarnings {
        println!("Completed with {} warning(s)", report.warnings.len());
    }
    Ok(())
}

fn list(config: &Config, json: bool) -> Result<()> {
    let backups = retention::list_backups(&config.backup_dir())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&backups)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups in {}", config.backup_dir().display());
        return Ok(());
    }

    let now = SystemTime::now();
    println!("{:<40} {:>12} {:>10}  {}", "NAME", "SIZE", "AGE", "TYPE");
    for backup in &backups {
        println!(
            "{:<40} {:>12} {:>10}  {}",
            backup.name,
            format_bytes(backup.size),
            format_age(backup.age(now).as_secs()),
            if backup.automated { "automated" } else { "manual" }
        );
    }
    Ok(())
}

fn info(config: &Config, name: &str) -> Result<()> {
    let backup_dir = config.backup_dir();

    // Legacy uncompressed backups keep the manifest as a plain file
    let legacy = backup_dir.join(name).join(MANIFEST_FILE);
    let text = if legacy.is_file() {
        std::fs::read_to_string(&legacy)?
    } else {
        let archive = resolve_archive(&backup_dir, name)?;
        ArchiveManager::default()
            .read_manifest(&archive)?
            .with_context(|| format!("{} has no manifest", archive.display()))?
    };

    match Manifest::parse(&text) {
        Ok(manifest) => print!("{}", manifest.render()),
        Err(_) => print!("{}", text),
    }
    Ok(())
}

fn verify(config: &Config, name: &str) -> Result<()> {
    let archive = resolve_archive(&config.backup_dir(), name)?;
    let summary = ArchiveManager::default().verify(&archive)?;

    println!("{}: {} entries under {}/", archive.display(), summary.entries, summary.top_level);
    println!(
        "  Sections: {}",
        summary.sections.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    if !summary.has_manifest {
        bail!("{} has no {}", archive.display(), MANIFEST_FILE);
    }
    if !summary.manifest_last {
        bail!("{} is not the last entry of {}", MANIFEST_FILE, archive.display());
    }
    println!("  Manifest: present");
    Ok(())
}

fn prune(config: &Config, dry_run: bool) -> Result<()> {
    let backup_dir = config.backup_dir();
    let _lock = BackupLock::acquire(&backup_dir)?;
    let policy = RetentionPolicy::from(&config.backup);

    let report = retention::prune_at(&backup_dir, &policy, SystemTime::now(), None, dry_run)?;

    let verb = if dry_run { "Would remove" } else { "Removed" };
    for entry in &report.removed {
        println!("{} {} ({})", verb, entry.name, format_bytes(entry.size));
    }
    for snapshot in &report.snapshots_removed {
        println!("{} snapshot {}", verb, snapshot.display());
    }
    println!("{} backup(s) kept", report.kept.len());
    Ok(())
}
