//! Boundaries to the external collaborators: the container runtime, its
//! named volumes and the database engine running inside it.
//!
//! The orchestrators only talk to these traits. `docker::DockerRuntime` is the
//! production implementation; tests plug in fakes.

pub mod docker;

use crate::utils::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub use docker::DockerRuntime;

/// Start, stop and query the managed service set.
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Fails when the runtime cannot be reached at all.
    async fn ping(&self) -> Result<()>;

    /// Human-readable state of every managed service.
    async fn status_snapshot(&self) -> Result<String>;

    /// Versions of the external tools, best-effort.
    async fn tool_versions(&self) -> BTreeMap<String, String>;

    async fn stop_all(&self) -> Result<()>;

    async fn start_all(&self) -> Result<()>;

    /// Managed services that are not currently running.
    async fn not_running(&self) -> Result<Vec<String>>;
}

/// Scratch jobs against named volumes.
#[async_trait]
pub trait VolumeArchiver: Send + Sync {
    async fn volume_exists(&self, volume: &str) -> Result<bool>;

    /// Write a gzip tarball of the volume's contents to `dest_archive`.
    async fn export(&self, volume: &str, dest_archive: &Path) -> Result<()>;

    /// Recreate the volume and unpack `src_archive` into it.
    async fn import(&self, volume: &str, src_archive: &Path) -> Result<()>;
}

/// Logical dump and replay of the deployment database.
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Write a plain SQL dump to `dest`.
    async fn dump(&self, dest: &Path) -> Result<()>;

    /// Export an auth realm's configuration as JSON to `dest`.
    async fn export_realm(&self, realm: &str, dest: &Path) -> Result<()>;

    /// Drop and recreate the database, then replay `dump`. Brings the
    /// database service up first.
    async fn restore(&self, dump: &Path) -> Result<()>;
}

/// The collaborator set handed to the orchestrators.
#[derive(Clone)]
pub struct Collaborators {
    pub services: Arc<dyn ServiceController>,
    pub volumes: Arc<dyn VolumeArchiver>,
    pub database: Arc<dyn DatabaseEngine>,
}

impl Collaborators {
    /// Use one object for all three roles.
    pub fn from_runtime<R>(runtime: Arc<R>) -> Self
    where
        R: ServiceController + VolumeArchiver + DatabaseEngine + 'static,
    {
        Self {
            services: runtime.clone(),
            volumes: runtime.clone(),
            database: runtime,
        }
    }
}
