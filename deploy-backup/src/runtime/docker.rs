//! Docker and Docker Compose implementation of the runtime boundaries.
//!
//! Volumes and helper containers go through the Docker API (bollard); service
//! lifecycle and the database tools go through `docker compose`, so the
//! project's own compose file stays the source of truth for what is managed.

use super::{DatabaseEngine, ServiceController, VolumeArchiver};
use crate::config::{Config, DatabaseConfig};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures_util::stream::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts to reach a ready database after starting its service.
const DB_READY_ATTEMPTS: u32 = 30;

/// Mount points inside helper containers.
const HELPER_VOLUME_MOUNT: &str = "/volume";
const HELPER_BACKUP_MOUNT: &str = "/backup";

/// Where the realm export lands inside the auth container.
const REALM_EXPORT_TMP: &str = "/tmp/realm-export.json";

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    project_root: PathBuf,
    project_name: String,
    descriptor: PathBuf,
    database: DatabaseConfig,
    helper_image: String,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon for the configured deployment.
    pub fn connect(config: &Config) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            BackupError::Environment(format!(
                "failed to connect to Docker daemon (is Docker running?): {}",
                e
            ))
        })?;

        Ok(Self {
            docker,
            project_root: config.deployment.project_root.clone(),
            project_name: config.deployment.project_name.clone(),
            descriptor: config.deployment.descriptor_path(),
            database: config.database.clone(),
            helper_image: config.volumes.helper_image.clone(),
        })
    }

    fn compose(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-p")
            .arg(&self.project_name)
            .arg("-f")
            .arg(&self.descriptor)
            .current_dir(&self.project_root)
            .kill_on_drop(true);
        cmd
    }

    /// Execute a docker compose command and return its stdout
    async fn compose_command(&self, args: &[&str]) -> Result<String> {
        let output = self
            .compose()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackupError::Runtime(format!("failed to execute docker compose: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::Runtime(format!(
                "docker compose {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `docker compose exec -T` with optional file-backed stdin/stdout.
    async fn compose_exec(
        &self,
        service: &str,
        args: &[&str],
        stdin: Option<std::fs::File>,
        stdout: Option<std::fs::File>,
    ) -> Result<()> {
        let mut cmd = self.compose();
        cmd.arg("exec").arg("-T").arg(service).args(args);
        cmd.stdin(stdin.map(Stdio::from).unwrap_or_else(Stdio::null));
        cmd.stdout(stdout.map(Stdio::from).unwrap_or_else(Stdio::piped));
        cmd.stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| {
                BackupError::Runtime(format!("failed to execute docker compose exec: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::Runtime(format!(
                "{} in {} failed: {}",
                args.first().copied().unwrap_or("command"),
                service,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn compose_volume_labels(&self, volume: &str) -> HashMap<String, String> {
        let short = volume
            .strip_prefix(&format!("{}_", self.project_name))
            .unwrap_or(volume);
        HashMap::from([
            ("com.docker.compose.project".to_string(), self.project_name.clone()),
            ("com.docker.compose.volume".to_string(), short.to_string()),
        ])
    }

    async fn ensure_helper_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.helper_image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling helper image {}", self.helper_image);
        let options = CreateImageOptions {
            from_image: self.helper_image.clone(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    /// Run a throwaway helper container to completion, then remove it.
    async fn run_helper(&self, binds: Vec<String>, cmd: Vec<String>) -> Result<()> {
        self.ensure_helper_image().await?;

        let name = format!("deploy-backup-helper-{}", Uuid::new_v4());
        let config = ContainerConfig {
            image: Some(self.helper_image.clone()),
            cmd: Some(cmd),
            host_config: Some(HostConfig {
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;

        let outcome = self.wait_helper(&name).await;

        let remove = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(&name, Some(remove)).await {
            warn!("Failed to remove helper container {}: {}", name, e);
        }

        outcome
    }

    async fn wait_helper(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;

        let mut stream = Box::pin(
            self.docker
                .wait_container(name, None::<WaitContainerOptions<String>>),
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(response) if response.status_code == 0 => {}
                Ok(response) => {
                    return Err(BackupError::Runtime(format!(
                        "helper {} exited with status {}",
                        name, response.status_code
                    )))
                }
                Err(DockerError::DockerContainerWaitError { error, code }) => {
                    return Err(BackupError::Runtime(format!(
                        "helper {} exited with status {}: {}",
                        name, code, error
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn wait_for_database(&self) -> Result<()> {
        for attempt in 1..=DB_READY_ATTEMPTS {
            let ready = self
                .compose_exec(
                    &self.database.service,
                    &["pg_isready", "-U", &self.database.user],
                    None,
                    None,
                )
                .await;
            if ready.is_ok() {
                return Ok(());
            }
            debug!("Database not ready yet (attempt {}/{})", attempt, DB_READY_ATTEMPTS);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(BackupError::Runtime(format!(
            "database service {} did not become ready",
            self.database.service
        )))
    }

    async fn psql(&self, database: &str, sql: &str) -> Result<()> {
        self.compose_exec(
            &self.database.service,
            &[
                "psql",
                "-U",
                &self.database.user,
                "-d",
                database,
                "-v",
                "ON_ERROR_STOP=1",
                "-c",
                sql,
            ],
            None,
            None,
        )
        .await
    }
}

/// Absolute directory and file name of an archive path, for bind mounts.
fn split_archive_path(path: &Path) -> Result<(PathBuf, String)> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| BackupError::Runtime(format!("invalid archive path {}", path.display())))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    Ok((std::fs::canonicalize(dir)?, file_name))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn lines_set(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ServiceController for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| {
                BackupError::Environment(format!("container runtime unreachable: {}", e))
            })?;
        Ok(())
    }

    async fn status_snapshot(&self) -> Result<String> {
        self.compose_command(&["ps", "--all"]).await
    }

    async fn tool_versions(&self) -> BTreeMap<String, String> {
        let mut versions = BTreeMap::new();
        match self.docker.version().await {
            Ok(v) => {
                versions.insert(
                    "docker".to_string(),
                    v.version.unwrap_or_else(|| "unknown".to_string()),
                );
            }
            Err(e) => warn!("Could not query Docker version: {}", e),
        }
        if let Ok(out) = self.compose_command(&["version", "--short"]).await {
            versions.insert("docker-compose".to_string(), out.trim().to_string());
        }
        versions
    }

    async fn stop_all(&self) -> Result<()> {
        // down keeps named volumes but drops the containers holding them
        self.compose_command(&["down"]).await?;
        Ok(())
    }

    async fn start_all(&self) -> Result<()> {
        self.compose_command(&["up", "-d"]).await?;
        Ok(())
    }

    async fn not_running(&self) -> Result<Vec<String>> {
        let expected = lines_set(&self.compose_command(&["config", "--services"]).await?);
        let running = lines_set(
            &self
                .compose_command(&["ps", "--services", "--filter", "status=running"])
                .await?,
        );
        Ok(expected.difference(&running).cloned().collect())
    }
}

#[async_trait]
impl VolumeArchiver for DockerRuntime {
    async fn volume_exists(&self, volume: &str) -> Result<bool> {
        match self.docker.inspect_volume(volume).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn export(&self, volume: &str, dest_archive: &Path) -> Result<()> {
        let (dir, file_name) = split_archive_path(dest_archive)?;
        let binds = vec![
            format!("{}:{}:ro", volume, HELPER_VOLUME_MOUNT),
            format!("{}:{}", dir.display(), HELPER_BACKUP_MOUNT),
        ];
        let cmd = vec![
            "tar".to_string(),
            "czf".to_string(),
            format!("{}/{}", HELPER_BACKUP_MOUNT, file_name),
            "-C".to_string(),
            HELPER_VOLUME_MOUNT.to_string(),
            ".".to_string(),
        ];
        self.run_helper(binds, cmd).await
    }

    async fn import(&self, volume: &str, src_archive: &Path) -> Result<()> {
        if self.volume_exists(volume).await? {
            let options = RemoveVolumeOptions { force: true };
            if let Err(e) = self.docker.remove_volume(volume, Some(options)).await {
                // Still in use: extract over the emptied existing volume instead
                warn!("Could not remove volume {}, reusing it: {}", volume, e);
            }
        }

        let options = CreateVolumeOptions {
            name: volume.to_string(),
            labels: self.compose_volume_labels(volume),
            ..Default::default()
        };
        self.docker.create_volume(options).await?;

        let (dir, file_name) = split_archive_path(src_archive)?;
        let binds = vec![
            format!("{}:{}", volume, HELPER_VOLUME_MOUNT),
            format!("{}:{}:ro", dir.display(), HELPER_BACKUP_MOUNT),
        ];
        let script = format!(
            "find {vol} -mindepth 1 -delete && tar xzf {backup}/{file} -C {vol}",
            vol = HELPER_VOLUME_MOUNT,
            backup = HELPER_BACKUP_MOUNT,
            file = file_name
        );
        self.run_helper(binds, vec!["sh".to_string(), "-c".to_string(), script])
            .await
    }
}

#[async_trait]
impl DatabaseEngine for DockerRuntime {
    async fn dump(&self, dest: &Path) -> Result<()> {
        let file = std::fs::File::create(dest)?;
        self.compose_exec(
            &self.database.service,
            &[
                "pg_dump",
                "-U",
                &self.database.user,
                "--clean",
                "--if-exists",
                &self.database.name,
            ],
            None,
            Some(file),
        )
        .await
    }

    async fn export_realm(&self, realm: &str, dest: &Path) -> Result<()> {
        let service = &self.database.realm_service;
        self.compose_exec(
            service,
            &[
                "/opt/keycloak/bin/kc.sh",
                "export",
                "--realm",
                realm,
                "--file",
                REALM_EXPORT_TMP,
            ],
            None,
            None,
        )
        .await?;

        let source = format!("{}:{}", service, REALM_EXPORT_TMP);
        let dest = dest.to_string_lossy().to_string();
        self.compose_command(&["cp", &source, &dest]).await?;
        Ok(())
    }

    async fn restore(&self, dump: &Path) -> Result<()> {
        let service = self.database.service.clone();
        let name = self.database.name.clone();

        self.compose_command(&["up", "-d", &service]).await?;
        self.wait_for_database().await?;

        info!("Recreating database {}", name);
        self.psql(
            "postgres",
            &format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = {} AND pid <> pg_backend_pid();",
                quote_literal(&name)
            ),
        )
        .await?;
        self.psql("postgres", &format!("DROP DATABASE IF EXISTS {};", quote_ident(&name)))
            .await?;
        self.psql(
            "postgres",
            &format!(
                "CREATE DATABASE {} OWNER {};",
                quote_ident(&name),
                quote_ident(&self.database.user)
            ),
        )
        .await?;

        info!("Replaying {}", dump.display());
        let file = std::fs::File::open(dump)?;
        self.compose_exec(
            &service,
            &[
                "psql",
                "-U",
                &self.database.user,
                "-d",
                &name,
                "-v",
                "ON_ERROR_STOP=1",
            ],
            Some(file),
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("app"), "\"app\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_lines_set_ignores_blank_lines() {
        let set = lines_set("postgres\n\n  nginx \nwebapp\n");
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec!["nginx", "postgres", "webapp"]
        );
    }

    #[test]
    fn test_split_archive_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive = dir.path().join("postgres_data.tar.gz");
        let (parent, file) = split_archive_path(&archive).unwrap();
        assert_eq!(file, "postgres_data.tar.gz");
        assert!(parent.is_absolute());
    }
}
