//! Core types for mirrorsync

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Repository name, the State Store key
pub type RepoName = String;

/// How a mirror is reconciled with its source of truth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorKind {
    /// Bare git mirror, refreshed and re-fetched from the remote
    #[default]
    Git,
    /// Plain content tree, compared file by file with SHA-256 digests
    Content,
}

/// Identity and sync parameters for one mirrored repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Unique stable identifier
    pub name: RepoName,
    /// Upstream source of truth
    #[serde(alias = "url")]
    pub source_url: String,
    /// Local mirror location
    #[serde(alias = "target")]
    pub target_path: PathBuf,
    /// Explicit command, replaces the derived clone/update command
    #[serde(
        default,
        alias = "sync_command",
        deserialize_with = "deserialize_command_override",
        skip_serializing_if = "Option::is_none"
    )]
    pub sync_command_override: Option<Vec<String>>,
    /// Per-repository limit; falls back to the global default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit_kbps: Option<u32>,
    /// Per-repository transfer ceiling in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub kind: MirrorKind,
}

impl RepositoryConfig {
    /// Create a git mirror entry with no overrides
    pub fn new(
        name: impl Into<String>,
        source_url: impl Into<String>,
        target_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            source_url: source_url.into(),
            target_path: target_path.into(),
            sync_command_override: None,
            bandwidth_limit_kbps: None,
            timeout_seconds: None,
            kind: MirrorKind::Git,
        }
    }

    pub fn with_command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sync_command_override = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_bandwidth_limit(mut self, kbps: u32) -> Self {
        self.bandwidth_limit_kbps = Some(kbps);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_kind(mut self, kind: MirrorKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Characters a string-form command would need a shell for
const SHELL_SYNTAX: &[char] = &[
    '|', '&', ';', '<', '>', '(', ')', '$', '`', '\\', '"', '\'', '\n',
];

/// Accepts either an argument list or a whitespace-separated string.
/// An empty value means "no override". Strings are split on whitespace and
/// never run through a shell, so shell syntax in them is rejected.
fn deserialize_command_override<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Args(Vec<String>),
        Line(String),
    }

    let args = match Option::<Raw>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Raw::Args(args)) => args,
        Some(Raw::Line(line)) => {
            if line.contains(SHELL_SYNTAX) {
                return Err(serde::de::Error::custom(format!(
                    "Invalid command: {:?} uses shell syntax; give it as an argument list \
                     such as [\"sh\", \"-c\", \"...\"]",
                    line
                )));
            }
            line.split_whitespace().map(str::to_string).collect()
        }
    };

    if args.is_empty() || args.iter().all(|a| a.trim().is_empty()) {
        Ok(None)
    } else {
        Ok(Some(args))
    }
}

/// Outcome status of one sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Failure,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncStatus::Success),
            "failure" => Ok(SyncStatus::Failure),
            _ => Err(format!("Unknown sync status: {}", s)),
        }
    }
}

/// Result of one sync attempt, persisted per repository.
///
/// Serialized with the column names of the persisted layout so the status
/// surface can return rows as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    #[serde(rename = "repo")]
    pub repo_name: RepoName,
    #[serde(rename = "last_sync_ts", with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "last_status")]
    pub status: SyncStatus,
    #[serde(rename = "last_msg")]
    pub message: String,
}

impl SyncOutcome {
    /// Clean success, empty message
    pub fn success(repo_name: impl Into<String>) -> Self {
        Self {
            repo_name: repo_name.into(),
            timestamp: Utc::now(),
            status: SyncStatus::Success,
            message: String::new(),
        }
    }

    pub fn failure(repo_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            repo_name: repo_name.into(),
            timestamp: Utc::now(),
            status: SyncStatus::Failure,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }
}

/// When the Conflict Resolver is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationPolicy {
    /// Only after a failed transfer
    #[default]
    Reactive,
    /// Before every transfer on an existing mirror, and after failures
    Proactive,
    /// Never
    Disabled,
}

/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_legacy_field_aliases() {
        let repo: RepositoryConfig = serde_json::from_str(
            r#"{
                "name": "example/repo",
                "url": "https://github.com/example/example.git",
                "target": "/var/mirrors/example.git",
                "sync_command": ""
            }"#,
        )
        .unwrap();

        assert_eq!(
            repo,
            RepositoryConfig::new(
                "example/repo",
                "https://github.com/example/example.git",
                "/var/mirrors/example.git"
            )
        );
    }

    #[test]
    fn test_command_override_forms() {
        let from_line: RepositoryConfig = serde_json::from_str(
            r#"{"name": "a", "source_url": "rsync://h/a", "target_path": "/m/a",
                "sync_command_override": "rsync -a  rsync://h/a/ /m/a/"}"#,
        )
        .unwrap();
        assert_eq!(
            from_line.sync_command_override,
            Some(vec![
                "rsync".to_string(),
                "-a".to_string(),
                "rsync://h/a/".to_string(),
                "/m/a/".to_string()
            ])
        );

        let from_list: RepositoryConfig = serde_json::from_str(
            r#"{"name": "a", "source_url": "rsync://h/a", "target_path": "/m/a",
                "sync_command_override": ["rsync", "-a", "--delete"]}"#,
        )
        .unwrap();
        assert_eq!(
            from_list.sync_command_override.as_deref().map(|a| a.len()),
            Some(3)
        );

        let null: RepositoryConfig = serde_json::from_str(
            r#"{"name": "a", "source_url": "x", "target_path": "/m/a", "sync_command": null}"#,
        )
        .unwrap();
        assert!(null.sync_command_override.is_none());
    }

    #[test]
    fn test_shell_syntax_in_string_override_rejected() {
        let err = serde_json::from_str::<RepositoryConfig>(
            r#"{"name": "a", "source_url": "x", "target_path": "/m/a",
                "sync_command": "cd /m/a && git remote update"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("uses shell syntax"));

        // The list form is passed through as-is
        let listed: RepositoryConfig = serde_json::from_str(
            r#"{"name": "a", "source_url": "x", "target_path": "/m/a",
                "sync_command": ["sh", "-c", "cd /m/a && git remote update"]}"#,
        )
        .unwrap();
        assert_eq!(listed.sync_command_override.map(|a| a.len()), Some(3));
    }

    #[test]
    fn test_outcome_serializes_with_column_names() {
        let mut outcome = SyncOutcome::failure("a", "exit status 128");
        outcome.timestamp = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "repo": "a",
                "last_sync_ts": 1_700_000_000,
                "last_status": "failure",
                "last_msg": "exit status 128"
            })
        );
    }

    #[test]
    fn test_status_round_trip_and_unknown() {
        assert_eq!("success".parse::<SyncStatus>(), Ok(SyncStatus::Success));
        assert!("pending".parse::<SyncStatus>().is_err());
        assert!(SyncOutcome::success("a").message.is_empty());
    }
}
