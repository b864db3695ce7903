//! Configuration management for deploy-backup.
//!
//! Loads configuration from an optional TOML file, then applies the
//! deployment's `.env` and environment variable overrides.

use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub deployment: DeploymentConfig,
    pub database: DatabaseConfig,
    pub volumes: VolumesConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Directory holding the compose file, `.env` and config subtrees
    pub project_root: PathBuf,

    /// Compose project name, also the prefix of runtime volume names
    pub project_name: String,

    /// Public domain of the deployment (recorded in the manifest)
    pub domain: String,

    /// Deployment descriptor, relative to `project_root`
    pub descriptor: String,

    /// Environment file carrying credentials, relative to `project_root`
    pub env_file: String,

    /// Configuration subtrees captured with the descriptor
    pub config_dirs: Vec<String>,

    /// Certificate directory, relative to `project_root`
    pub certs_dir: String,

    /// Log directory, relative to `project_root`
    pub logs_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Compose service running the database
    pub service: String,

    pub user: String,

    pub name: String,

    /// Compose service of the external auth server
    pub realm_service: String,

    /// Realm exported next to the dump; empty disables the export
    pub realm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumesConfig {
    /// Volume names as declared in the compose file (without project prefix)
    pub names: Vec<String>,

    /// Image used for throwaway archive/extract helpers
    pub helper_image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Where archives are written
    pub dir: PathBuf,

    /// Age limit for every backup
    pub retention_days: u64,

    /// Number of automated backups kept regardless of age
    pub max_automated: usize,

    /// Only logs modified within this many days are captured
    pub log_max_age_days: u64,

    /// zstd compression level (1-22)
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Grace period after starting services, before verification
    pub start_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            project_name: "stack".to_string(),
            domain: "localhost".to_string(),
            descriptor: "docker-compose.yml".to_string(),
            env_file: ".env".to_string(),
            config_dirs: ["nginx", "prometheus", "grafana", "webapp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            certs_dir: "certs".to_string(),
            logs_dir: "logs".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            service: "postgres".to_string(),
            user: "postgres".to_string(),
            name: "app".to_string(),
            realm_service: "keycloak".to_string(),
            realm: "master".to_string(),
        }
    }
}

impl Default for VolumesConfig {
    fn default() -> Self {
        Self {
            names: ["postgres_data", "keycloak_data", "grafana_data", "prometheus_data"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            helper_image: "alpine:3.19".to_string(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("backups"),
            retention_days: 30,
            max_automated: 7,
            log_max_age_days: 7,
            compression_level: crate::archive::DEFAULT_LEVEL,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            start_grace_secs: 15,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DeploymentConfig {
    pub fn descriptor_path(&self) -> PathBuf {
        self.project_root.join(&self.descriptor)
    }

    pub fn env_path(&self) -> PathBuf {
        self.project_root.join(&self.env_file)
    }

    pub fn certs_path(&self) -> PathBuf {
        self.project_root.join(&self.certs_dir)
    }

    pub fn logs_path(&self) -> PathBuf {
        self.project_root.join(&self.logs_dir)
    }

    /// Runtime name of a compose volume (`<project>_<volume>`).
    pub fn volume_name(&self, volume: &str) -> String {
        format!("{}_{}", self.project_name, volume)
    }
}

impl Config {
    /// Backup directory, relative paths resolved against the project root.
    pub fn backup_dir(&self) -> PathBuf {
        self.deployment.project_root.join(&self.backup.dir)
    }

    /// Load configuration: TOML file (if any), then `.env`, then environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        // A missing .env is normal outside the project directory
        let _ = dotenvy::dotenv();

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DEPLOY_PROJECT_ROOT") {
            self.deployment.project_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("COMPOSE_PROJECT_NAME") {
            self.deployment.project_name = v;
        }
        if let Some(v) = lookup("DOMAIN_NAME") {
            self.deployment.domain = v;
        }
        if let Some(v) = lookup("POSTGRES_USER") {
            self.database.user = v;
        }
        if let Some(v) = lookup("POSTGRES_DB") {
            self.database.name = v;
        }
        if let Some(v) = lookup("BACKUP_DIR") {
            self.backup.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKUP_RETENTION_DAYS") {
            self.backup.retention_days = parse_number("BACKUP_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = lookup("BACKUP_MAX_AUTOMATED") {
            self.backup.max_automated = parse_number("BACKUP_MAX_AUTOMATED", &v)?;
        }
        if let Some(v) = lookup("BACKUP_COMPRESSION_LEVEL") {
            self.backup.compression_level = parse_number("BACKUP_COMPRESSION_LEVEL", &v)?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log.level = v;
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BackupError::Config(format!("{} must be a number, got '{}'", key, value)))
}
