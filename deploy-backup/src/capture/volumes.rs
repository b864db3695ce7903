//! Named runtime volumes, one helper-produced archive each.

use super::{CaptureContext, ComponentKind, ComponentResult, VOLUME_ARCHIVE_EXT};
use crate::utils::Result;
use std::fs;
use tracing::{info, warn};

pub(super) async fn capture_volumes(ctx: &CaptureContext<'_>) -> Result<ComponentResult> {
    let dest = ctx.component_dir(ComponentKind::Volumes);
    fs::create_dir_all(&dest)?;

    let mut captured = Vec::new();
    let mut skipped = Vec::new();
    let mut failed = Vec::new();

    for volume in &ctx.config.volumes.names {
        let runtime_name = ctx.config.deployment.volume_name(volume);

        match ctx.collaborators.volumes.volume_exists(&runtime_name).await {
            Ok(true) => {}
            Ok(false) => {
                info!(volume = %runtime_name, "Volume not found, skipping");
                skipped.push(volume.clone());
                continue;
            }
            Err(e) => {
                warn!(volume = %runtime_name, "Volume lookup failed: {}", e);
                failed.push(format!("{} ({})", volume, e));
                continue;
            }
        }

        let archive = dest.join(format!("{}{}", volume, VOLUME_ARCHIVE_EXT));
        match ctx.collaborators.volumes.export(&runtime_name, &archive).await {
            Ok(()) => captured.push(volume.clone()),
            Err(e) => {
                warn!(volume = %runtime_name, "Volume export failed: {}", e);
                let _ = fs::remove_file(&archive);
                failed.push(format!("{} ({})", volume, e));
            }
        }
    }

    let mut parts = Vec::new();
    if !captured.is_empty() {
        parts.push(format!("captured: {}", captured.join(", ")));
    }
    if !skipped.is_empty() {
        parts.push(format!("absent: {}", skipped.join(", ")));
    }
    if !failed.is_empty() {
        parts.push(format!("failed: {}", failed.join(", ")));
    }
    let detail = if parts.is_empty() {
        "no volumes configured".to_string()
    } else {
        parts.join("; ")
    };

    let result = if !failed.is_empty() {
        ComponentResult::failed(ComponentKind::Volumes, detail)
    } else if captured.is_empty() {
        ComponentResult::skipped(ComponentKind::Volumes, detail)
    } else {
        ComponentResult::success(ComponentKind::Volumes, 0, detail)
    };
    Ok(result)
}
