//! Per-component snapshot logic.
//!
//! Every capture copies or exports one slice of deployment state into its own
//! subdirectory of the staging tree and reports a [`ComponentResult`]. Captures
//! are independent of each other; a failing capture never stops the others.

mod database;
mod files;
mod volumes;

use crate::config::Config;
use crate::fs::walker::calculate_total_size;
use crate::runtime::Collaborators;
use crate::utils::format::single_line;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;
use tracing::{info, warn};

pub use files::is_private_key;

/// Owner-only sub-archive holding the private keys of `certs/`.
pub const KEY_BUNDLE: &str = "private-keys.tar.zst";

/// Extension of per-volume archives under `volumes/`.
pub const VOLUME_ARCHIVE_EXT: &str = ".tar.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Config,
    Certificates,
    Database,
    Volumes,
    Logs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComponentStatus {
    Success,
    /// Source absent
    Skipped,
    Failed,
}

/// Outcome of capturing one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentResult {
    pub kind: ComponentKind,
    pub status: ComponentStatus,
    pub size_bytes: u64,
    pub detail: String,
}

/// Whether a failed capture of `kind` fails the whole backup.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    pub kind: ComponentKind,
    pub aborts_on_failure: bool,
}

pub const FAILURE_POLICY: [FailurePolicy; 5] = [
    FailurePolicy {
        kind: ComponentKind::Config,
        aborts_on_failure: false,
    },
    FailurePolicy {
        kind: ComponentKind::Certificates,
        aborts_on_failure: false,
    },
    FailurePolicy {
        kind: ComponentKind::Database,
        aborts_on_failure: true,
    },
    FailurePolicy {
        kind: ComponentKind::Volumes,
        aborts_on_failure: false,
    },
    FailurePolicy {
        kind: ComponentKind::Logs,
        aborts_on_failure: false,
    },
];

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Config,
        ComponentKind::Certificates,
        ComponentKind::Database,
        ComponentKind::Volumes,
        ComponentKind::Logs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Config => "config",
            ComponentKind::Certificates => "certificates",
            ComponentKind::Database => "database",
            ComponentKind::Volumes => "volumes",
            ComponentKind::Logs => "logs",
        }
    }

    /// Subdirectory of the staging tree (and archive) owned by this kind.
    pub fn dir_name(self) -> &'static str {
        match self {
            ComponentKind::Config => "configs",
            ComponentKind::Certificates => "certs",
            ComponentKind::Database => "database",
            ComponentKind::Volumes => "volumes",
            ComponentKind::Logs => "logs",
        }
    }

    pub fn aborts_on_failure(self) -> bool {
        FAILURE_POLICY
            .iter()
            .find(|p| p.kind == self)
            .map(|p| p.aborts_on_failure)
            .unwrap_or(false)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ComponentKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown component '{}'", s))
    }
}

impl ComponentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentStatus::Success => "SUCCESS",
            ComponentStatus::Skipped => "SKIPPED",
            ComponentStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(ComponentStatus::Success),
            "SKIPPED" => Ok(ComponentStatus::Skipped),
            "FAILED" => Ok(ComponentStatus::Failed),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

impl ComponentResult {
    pub fn success(kind: ComponentKind, size_bytes: u64, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: ComponentStatus::Success,
            size_bytes,
            detail: single_line(&detail.into()),
        }
    }

    pub fn skipped(kind: ComponentKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: ComponentStatus::Skipped,
            size_bytes: 0,
            detail: single_line(&detail.into()),
        }
    }

    pub fn failed(kind: ComponentKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: ComponentStatus::Failed,
            size_bytes: 0,
            detail: single_line(&detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ComponentStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == ComponentStatus::Failed
    }
}

/// Everything a capture needs to know about the run.
pub struct CaptureContext<'a> {
    pub config: &'a Config,
    pub collaborators: &'a Collaborators,
    pub staging: &'a Path,
    /// Reference time for the log age window
    pub now: SystemTime,
}

impl CaptureContext<'_> {
    pub fn component_dir(&self, kind: ComponentKind) -> PathBuf {
        self.staging.join(kind.dir_name())
    }
}

/// Capture one component. Errors are folded into a FAILED result.
pub async fn capture(kind: ComponentKind, ctx: &CaptureContext<'_>) -> ComponentResult {
    info!(component = %kind, "Capturing");

    let outcome = match kind {
        ComponentKind::Config => files::capture_config(ctx),
        ComponentKind::Certificates => files::capture_certificates(ctx),
        ComponentKind::Database => database::capture_database(ctx).await,
        ComponentKind::Volumes => volumes::capture_volumes(ctx).await,
        ComponentKind::Logs => files::capture_logs(ctx),
    };

    let mut result = match outcome {
        Ok(result) => result,
        Err(e) => ComponentResult::failed(kind, e.to_string()),
    };

    if result.status != ComponentStatus::Skipped {
        result.size_bytes =
            calculate_total_size(&ctx.component_dir(kind)).unwrap_or(result.size_bytes);
    }

    match result.status {
        ComponentStatus::Failed => {
            warn!(component = %kind, detail = %result.detail, "Capture failed")
        }
        status => info!(component = %kind, %status, bytes = result.size_bytes, "Capture finished"),
    }
    result
}

/// Capture every component in a fixed order.
pub async fn capture_all(ctx: &CaptureContext<'_>) -> Vec<ComponentResult> {
    let mut results = Vec::with_capacity(ComponentKind::ALL.len());
    for kind in ComponentKind::ALL {
        results.push(capture(kind, ctx).await);
    }
    results
}
