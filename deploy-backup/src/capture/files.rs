//! Host-file components: configuration, certificates and recent logs.

use super::{CaptureContext, ComponentKind, ComponentResult, KEY_BUNDLE};
use crate::archive;
use crate::fs::walker::{
    copy_file, copy_tree, files_modified_since, walk_directory, CopyStats, WalkOptions,
};
use crate::utils::Result;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Private key naming used by the TLS generator and ACME clients.
pub fn is_private_key(path: &Path) -> bool {
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().to_lowercase(),
        None => return false,
    };
    name.ends_with(".key")
        || name.ends_with("-key.pem")
        || name.ends_with("_key.pem")
        || (name.starts_with("privkey") && name.ends_with(".pem"))
}

fn all_files() -> WalkOptions {
    WalkOptions {
        exclude_names: Vec::new(),
        ..WalkOptions::default()
    }
}

/// Descriptor, env file and the configured subtrees into `configs/`.
pub(super) fn capture_config(ctx: &CaptureContext<'_>) -> Result<ComponentResult> {
    let deployment = &ctx.config.deployment;
    let dest = ctx.component_dir(ComponentKind::Config);
    fs::create_dir_all(&dest)?;

    let mut stats = CopyStats::default();
    let mut missing = Vec::new();

    for file in [&deployment.descriptor, &deployment.env_file] {
        let source = deployment.project_root.join(file);
        if source.is_file() {
            stats.bytes += copy_file(&source, &dest.join(file))?;
            stats.files += 1;
        } else {
            missing.push(file.clone());
        }
    }

    for dir in &deployment.config_dirs {
        let source = deployment.project_root.join(dir);
        if source.is_dir() {
            stats.add(copy_tree(&source, &dest.join(dir), &WalkOptions::default())?);
        } else {
            debug!("Config subtree {} not present", dir);
            missing.push(dir.clone());
        }
    }

    if stats.files == 0 {
        return Ok(ComponentResult::skipped(
            ComponentKind::Config,
            "no configuration files found",
        ));
    }

    let mut detail = format!("{} files", stats.files);
    if !missing.is_empty() {
        detail.push_str(&format!("; skipped: {}", missing.join(", ")));
    }
    Ok(ComponentResult::success(ComponentKind::Config, stats.bytes, detail))
}

/// Certificate directory into `certs/`, keys additionally bundled at 0600.
pub(super) fn capture_certificates(ctx: &CaptureContext<'_>) -> Result<ComponentResult> {
    let source = ctx.config.deployment.certs_path();
    if !source.is_dir() {
        return Ok(ComponentResult::skipped(
            ComponentKind::Certificates,
            format!("{} does not exist", source.display()),
        ));
    }

    let dest = ctx.component_dir(ComponentKind::Certificates);
    let stats = copy_tree(&source, &dest, &all_files())?;

    let keys: Vec<_> = walk_directory(&source, all_files())?
        .into_iter()
        .filter(|f| is_private_key(&f.path))
        .map(|f| (f.path, f.relative_path))
        .collect();

    if !keys.is_empty() {
        archive::write_owner_only_bundle(&keys, &dest.join(KEY_BUNDLE))?;
    }

    Ok(ComponentResult::success(
        ComponentKind::Certificates,
        stats.bytes,
        format!("{} files, {} private keys bundled", stats.files, keys.len()),
    ))
}

/// Log files modified inside the configured window into `logs/`.
pub(super) fn capture_logs(ctx: &CaptureContext<'_>) -> Result<ComponentResult> {
    let source = ctx.config.deployment.logs_path();
    if !source.is_dir() {
        return Ok(ComponentResult::skipped(ComponentKind::Logs, "no log directory"));
    }

    let days = ctx.config.backup.log_max_age_days;
    let cutoff = ctx
        .now
        .checked_sub(Duration::from_secs(days * 86_400))
        .unwrap_or(std::time::UNIX_EPOCH);
    let recent = files_modified_since(&source, cutoff, all_files())?;

    if recent.is_empty() {
        return Ok(ComponentResult::skipped(
            ComponentKind::Logs,
            format!("no logs modified in the last {} days", days),
        ));
    }

    let dest = ctx.component_dir(ComponentKind::Logs);
    let mut bytes = 0;
    for file in &recent {
        bytes += copy_file(&file.path, &dest.join(&file.relative_path))?;
    }

    Ok(ComponentResult::success(
        ComponentKind::Logs,
        bytes,
        format!("{} files from the last {} days", recent.len(), days),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_private_key_detection() {
        assert!(is_private_key(&PathBuf::from("certs/server.key")));
        assert!(is_private_key(&PathBuf::from("certs/tls-key.pem")));
        assert!(is_private_key(&PathBuf::from("live/privkey1.pem")));
        assert!(!is_private_key(&PathBuf::from("certs/server.crt")));
        assert!(!is_private_key(&PathBuf::from("certs/fullchain.pem")));
    }
}
