//! Configuration document loading, validation and defaults

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::transfer::local_source_path;
use crate::types::{MirrorKind, RemediationPolicy, RepositoryConfig};

/// Default config location, overridable with `MIRROR_SYNC_CONFIG`
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mirrorsync/config.json";

/// Default database location, overridable with `MIRROR_SYNC_DB`
pub const DEFAULT_DB_PATH: &str = "/var/lib/mirrorsync/mirror_sync.db";

static REPO_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]*$").expect("valid repo name regex"));

/// The structured configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Cycle period in seconds
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    /// Global bandwidth default; 0 means unlimited
    #[serde(default)]
    pub bandwidth_limit_kbps: u32,
    /// Global per-transfer ceiling
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Repositories synced concurrently within one cycle
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub remediation: RemediationPolicy,
    #[serde(default)]
    pub repos: Vec<RepositoryConfig>,
}

fn default_interval() -> u64 {
    600
}

fn default_timeout() -> u64 {
    3600
}

fn default_max_parallel() -> usize {
    1
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            bandwidth_limit_kbps: 0,
            timeout_seconds: default_timeout(),
            max_parallel: default_max_parallel(),
            remediation: RemediationPolicy::default(),
            repos: Vec::new(),
        }
    }
}

impl MirrorConfig {
    /// The document written by [`ensure_config`] when none exists
    pub fn example() -> Self {
        Self {
            repos: vec![RepositoryConfig::new(
                "example/repo",
                "https://github.com/example/example.git",
                "/var/mirrors/example.git",
            )],
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    ///
    /// Repository entries are parsed one at a time; an entry that does not
    /// parse is dropped with a warning instead of failing the document.
    pub fn from_json(content: &str) -> Result<Self> {
        let mut document: serde_json::Value = serde_json::from_str(content)?;
        let entries = match document.get_mut("repos") {
            Some(serde_json::Value::Array(entries)) => std::mem::take(entries),
            _ => Vec::new(),
        };

        let mut config: MirrorConfig = serde_json::from_value(document)?;
        config.repos = entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| match serde_json::from_value(entry) {
                Ok(repo) => Some(repo),
                Err(e) => {
                    tracing::warn!("Ignoring repository entry {}: {}", index, e);
                    None
                }
            })
            .collect();
        config.validate()
    }

    /// Load from disk. A missing file is reported as `ConfigMissing`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MirrorError::ConfigMissing(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load from disk, degrading to an empty configuration on any error.
    ///
    /// Used on the scheduler path where a bad or missing file must not stop
    /// the process.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e @ MirrorError::ConfigMissing(_)) => {
                tracing::warn!("{}; no repositories configured", e);
                Self::default()
            }
            Err(e) => {
                tracing::error!(
                    "Failed to load configuration {}: {}; no repositories configured",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Check document-level constraints and repository invariants.
    ///
    /// Only document-level problems are errors. Invalid entries and later
    /// duplicates of a name or target path are dropped with a warning; the
    /// first definition wins.
    pub fn validate(mut self) -> Result<Self> {
        if self.interval_seconds == 0 {
            return Err(MirrorError::Config(
                "interval_seconds must be positive".to_string(),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(MirrorError::Config(
                "timeout_seconds must be positive".to_string(),
            ));
        }
        if self.max_parallel == 0 {
            self.max_parallel = 1;
        }

        let mut names = HashSet::new();
        let mut targets = HashSet::new();
        let mut repos = Vec::with_capacity(self.repos.len());

        for mut repo in self.repos {
            if let Err(e) = check_repository(&repo) {
                tracing::warn!("{}, ignoring entry", e);
                continue;
            }

            repo.target_path = expand_path(&repo.target_path);

            if !names.insert(repo.name.clone()) {
                tracing::warn!("Duplicate repository name {}, ignoring entry", repo.name);
                continue;
            }
            if !targets.insert(repo.target_path.clone()) {
                tracing::warn!(
                    "Repository {} reuses target {}, ignoring entry",
                    repo.name,
                    repo.target_path.display()
                );
                names.remove(&repo.name);
                continue;
            }
            repos.push(repo);
        }

        self.repos = repos;
        Ok(self)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn check_repository(repo: &RepositoryConfig) -> Result<()> {
    if !REPO_NAME.is_match(&repo.name) {
        return Err(MirrorError::Config(format!(
            "Invalid repository name: {:?}",
            repo.name
        )));
    }
    if repo.source_url.trim().is_empty() {
        return Err(MirrorError::Config(format!(
            "Repository {} has an empty source_url",
            repo.name
        )));
    }
    if repo.kind == MirrorKind::Content
        && repo.sync_command_override.is_none()
        && local_source_path(&repo.source_url).is_none()
    {
        return Err(MirrorError::Config(format!(
            "Content repository {} needs a sync_command unless its source is a local path",
            repo.name
        )));
    }
    Ok(())
}

/// Expand `~` in a configured path
pub fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}

/// Write the example configuration if `path` does not exist, then load it.
pub fn ensure_config(path: &Path) -> Result<MirrorConfig> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&MirrorConfig::example())?;
        std::fs::write(path, content)?;
        tracing::info!("Wrote default configuration to {}", path.display());
    }
    MirrorConfig::load(path)
}
