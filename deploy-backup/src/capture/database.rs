//! Logical database dump plus the best-effort auth realm export.

use super::{CaptureContext, ComponentKind, ComponentResult};
use crate::utils::Result;
use std::fs;
use tracing::warn;

pub(super) async fn capture_database(ctx: &CaptureContext<'_>) -> Result<ComponentResult> {
    let database = &ctx.config.database;
    let dest = ctx.component_dir(ComponentKind::Database);
    fs::create_dir_all(&dest)?;

    let dump_path = dest.join(format!("{}.sql", database.name));
    if let Err(e) = ctx.collaborators.database.dump(&dump_path).await {
        return Ok(ComponentResult::failed(
            ComponentKind::Database,
            format!("dump of {} failed: {}", database.name, e),
        ));
    }

    let dump_size = fs::metadata(&dump_path).map(|m| m.len()).unwrap_or(0);
    if dump_size == 0 {
        return Ok(ComponentResult::failed(
            ComponentKind::Database,
            format!("dump of {} is empty", database.name),
        ));
    }

    let mut detail = format!("{}.sql", database.name);
    if !database.realm.is_empty() {
        let realm_path = dest.join(format!("realm-{}.json", database.realm));
        match ctx.collaborators.database.export_realm(&database.realm, &realm_path).await {
            Ok(()) => detail.push_str(&format!(", realm-{}.json", database.realm)),
            Err(e) => {
                warn!(realm = %database.realm, "Realm export failed, continuing: {}", e);
                let _ = fs::remove_file(&realm_path);
                detail.push_str(&format!("; realm export failed: {}", e));
            }
        }
    }

    Ok(ComponentResult::success(ComponentKind::Database, dump_size, detail))
}
