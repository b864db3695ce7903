//! The human-readable `backup-info.txt` carried in every archive.
//!
//! The manifest is rendered from packed facts only (see
//! [`crate::archive::ArchiveManager::reopen`]), never from a staging guess, so
//! sizes always describe the archive that was shipped. [`Manifest::parse`]
//! reads the text back for `info` and for inspection of older archives.

use crate::archive::PackedFacts;
use crate::capture::{ComponentKind, ComponentResult, ComponentStatus};
use crate::config::Config;
use crate::utils::format::single_line;
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;

const TITLE: &str = "Backup Information";
const TOOLS_HEADER: &str = "Tool versions:";
const COMPONENTS_HEADER: &str = "Components:";
const STATUS_HEADER: &str = "Service status:";
const INDENT: &str = "  ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    Completed,
    /// At least one non-essential component failed
    CompletedWithWarnings,
}

impl BackupOutcome {
    pub fn from_components(components: &[ComponentResult]) -> Self {
        if components.iter().any(ComponentResult::is_failed) {
            BackupOutcome::CompletedWithWarnings
        } else {
            BackupOutcome::Completed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupOutcome::Completed => "COMPLETED",
            BackupOutcome::CompletedWithWarnings => "COMPLETED_WITH_WARNINGS",
        }
    }
}

impl std::str::FromStr for BackupOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(BackupOutcome::Completed),
            "COMPLETED_WITH_WARNINGS" => Ok(BackupOutcome::CompletedWithWarnings),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub backup_name: String,
    pub created_at: DateTime<Utc>,
    pub host: String,
    pub project: String,
    pub domain: String,
    pub tool_versions: BTreeMap<String, String>,
    pub components: Vec<ComponentResult>,
    /// Service state captured before the backup started
    pub service_status: String,
    /// Size of the packed archive before the manifest was added
    pub archive_bytes: u64,
    pub outcome: BackupOutcome,
}

/// Deployment-level facts shared by every manifest of a run.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    host: String,
    project: String,
    domain: String,
    tool_versions: BTreeMap<String, String>,
}

impl ManifestBuilder {
    pub fn new(config: &Config, tool_versions: BTreeMap<String, String>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            host,
            project: config.deployment.project_name.clone(),
            domain: config.deployment.domain.clone(),
            tool_versions,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Component sizes are replaced by what was actually packed.
    pub fn build(
        &self,
        name: &str,
        created_at: DateTime<Utc>,
        facts: &PackedFacts,
        components: &[ComponentResult],
        service_status: &str,
    ) -> Manifest {
        let components: Vec<ComponentResult> = components
            .iter()
            .map(|result| {
                let mut result = result.clone();
                if result.status != ComponentStatus::Skipped {
                    if let Some(bytes) = facts.component_bytes.get(result.kind.dir_name()) {
                        result.size_bytes = *bytes;
                    }
                }
                result
            })
            .collect();

        Manifest {
            backup_name: name.to_string(),
            created_at,
            host: self.host.clone(),
            project: self.project.clone(),
            domain: self.domain.clone(),
            tool_versions: self.tool_versions.clone(),
            outcome: BackupOutcome::from_components(&components),
            components,
            service_status: service_status.trim_end().to_string(),
            archive_bytes: facts.archive_bytes,
        }
    }
}

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim)
}

fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    Some(s.split_once(char::is_whitespace).unwrap_or((s, "")))
}

fn parse_component(line: &str) -> Option<ComponentResult> {
    let (kind, rest) = next_token(line)?;
    let (status, rest) = next_token(rest)?;
    let (size, rest) = next_token(rest)?;
    let (unit, rest) = next_token(rest).unwrap_or(("bytes", ""));
    if unit != "bytes" {
        return None;
    }

    Some(ComponentResult {
        kind: kind.parse().ok()?,
        status: status.parse().ok()?,
        size_bytes: size.parse().ok()?,
        detail: rest.trim().to_string(),
    })
}

enum Section {
    Header,
    Tools,
    Components,
    Status,
}

impl Manifest {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", TITLE);
        let _ = writeln!(out, "{}", "=".repeat(TITLE.len()));
        let _ = writeln!(out, "Name:     {}", self.backup_name);
        let _ = writeln!(out, "Created:  {}", self.created_at.to_rfc3339());
        let _ = writeln!(out, "Host:     {}", self.host);
        let _ = writeln!(out, "Project:  {}", self.project);
        let _ = writeln!(out, "Domain:   {}", self.domain);
        let _ = writeln!(out, "Archive:  {} bytes", self.archive_bytes);
        let _ = writeln!(out, "Outcome:  {}", self.outcome.as_str());

        let _ = writeln!(out, "\n{}", TOOLS_HEADER);
        for (tool, version) in &self.tool_versions {
            let _ = writeln!(out, "{}{}: {}", INDENT, tool, version);
        }

        let _ = writeln!(out, "\n{}", COMPONENTS_HEADER);
        for c in &self.components {
            let _ = writeln!(
                out,
                "{}{:<14}{:<9}{:>12} bytes  {}",
                INDENT,
                c.kind.as_str(),
                c.status.as_str(),
                c.size_bytes,
                single_line(&c.detail)
            );
        }

        let _ = writeln!(out, "\n{}", STATUS_HEADER);
        for line in self.service_status.lines() {
            let _ = writeln!(out, "{}{}", INDENT, line);
        }
        out
    }

    pub fn component(&self, kind: ComponentKind) -> Option<&ComponentResult> {
        self.components.iter().find(|c| c.kind == kind)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        if lines.next().map(str::trim) != Some(TITLE) {
            return Err(BackupError::Validation("not a backup manifest".to_string()));
        }

        let mut name = None;
        let mut created_at = None;
        let mut host = String::new();
        let mut project = String::new();
        let mut domain = String::new();
        let mut archive_bytes = 0;
        let mut outcome = None;
        let mut tool_versions = BTreeMap::new();
        let mut components = Vec::new();
        let mut status_lines = Vec::new();
        let mut section = Section::Header;

        for line in lines {
            match line.trim_end() {
                TOOLS_HEADER => {
                    section = Section::Tools;
                    continue;
                }
                COMPONENTS_HEADER => {
                    section = Section::Components;
                    continue;
                }
                STATUS_HEADER => {
                    section = Section::Status;
                    continue;
                }
                _ => {}
            }

            match section {
                Section::Header => {
                    if let Some(v) = field(line, "Name") {
                        name = Some(v.to_string());
                    } else if let Some(v) = field(line, "Created") {
                        created_at = DateTime::parse_from_rfc3339(v)
                            .ok()
                            .map(|t| t.with_timezone(&Utc));
                    } else if let Some(v) = field(line, "Host") {
                        host = v.to_string();
                    } else if let Some(v) = field(line, "Project") {
                        project = v.to_string();
                    } else if let Some(v) = field(line, "Domain") {
                        domain = v.to_string();
                    } else if let Some(v) = field(line, "Archive") {
                        archive_bytes = v.trim_end_matches("bytes").trim().parse().unwrap_or(0);
                    } else if let Some(v) = field(line, "Outcome") {
                        outcome = v.parse().ok();
                    }
                }
                Section::Tools => {
                    if let Some((tool, version)) = line.trim().split_once(':') {
                        tool_versions.insert(tool.trim().to_string(), version.trim().to_string());
                    }
                }
                Section::Components => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let component = parse_component(line).ok_or_else(|| {
                        BackupError::Validation(format!(
                            "malformed component line '{}'",
                            line.trim()
                        ))
                    })?;
                    components.push(component);
                }
                Section::Status => {
                    status_lines.push(line.strip_prefix(INDENT).unwrap_or(line));
                }
            }
        }

        let backup_name =
            name.ok_or_else(|| BackupError::Validation("manifest has no name".to_string()))?;
        let created_at = created_at.ok_or_else(|| {
            BackupError::Validation("manifest has no valid creation time".to_string())
        })?;

        Ok(Manifest {
            backup_name,
            created_at,
            host,
            project,
            domain,
            tool_versions,
            outcome: outcome.unwrap_or_else(|| BackupOutcome::from_components(&components)),
            components,
            service_status: status_lines.join("\n").trim_end().to_string(),
            archive_bytes,
        })
    }
}
