//! External transfer invocation
//!
//! Commands are structured argument lists, never shell strings. The sync
//! command for a repository is derived from its configuration and validated
//! before anything is spawned.

mod bandwidth;
mod runner;

pub use bandwidth::{
    BandwidthLimiter, ShapedInvocation, ShapingPolicy, ShapingStrategy, TransferReport,
    SHAPING_HELPER,
};
pub use runner::{CommandRunner, ProcessRunner, RunOutput};

#[cfg(test)]
pub(crate) use runner::testing;

use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{MirrorError, Result};
use crate::types::{MirrorKind, RepositoryConfig};

/// `user@host:path` remotes accepted by git
static SCP_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[^:]").expect("valid scp remote regex")
});

const ALLOWED_SCHEMES: &[&str] = &["https", "http", "ssh", "git", "file", "rsync"];

/// One program with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    /// Build from an argument vector whose first element is the program
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| MirrorError::InvalidCommand("empty command".to_string()))?;
        let spec = Self {
            program: program.clone(),
            args: args.to_vec(),
            current_dir: None,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// File name of the program, so `/usr/bin/rsync` reads as `rsync`
    pub fn program_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }

    /// Reject arguments the OS cannot carry
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(MirrorError::InvalidCommand("empty program".to_string()));
        }
        for arg in std::iter::once(&self.program).chain(self.args.iter()) {
            if arg.contains('\0') {
                return Err(MirrorError::InvalidCommand(format!(
                    "argument contains a NUL byte: {:?}",
                    arg
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// What actually gets spawned: one process, or a transfer piped into a helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Single(CommandSpec),
    Piped {
        source: CommandSpec,
        sink: CommandSpec,
    },
}

impl Invocation {
    /// The transfer command itself
    pub fn primary(&self) -> &CommandSpec {
        match self {
            Invocation::Single(cmd) => cmd,
            Invocation::Piped { source, .. } => source,
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Single(cmd) => write!(f, "{}", cmd),
            Invocation::Piped { source, sink } => write!(f, "{} | {}", source, sink),
        }
    }
}

/// How the sync command was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Configured `sync_command_override`
    Override,
    /// Full mirror clone into a missing target
    Clone,
    /// Incremental update of an existing mirror
    Update,
}

/// A derived, validated sync command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub mode: SyncMode,
    pub command: CommandSpec,
}

/// Derive the effective sync command for a repository.
///
/// Content mirrors have no derived command: without an override they are
/// copied in-process from a local source (see [`local_content_source`]).
pub fn derive_command(repo: &RepositoryConfig) -> Result<SyncPlan> {
    if let Some(argv) = &repo.sync_command_override {
        return Ok(SyncPlan {
            mode: SyncMode::Override,
            command: CommandSpec::from_argv(argv)?,
        });
    }

    if repo.kind == MirrorKind::Content {
        return Err(MirrorError::InvalidCommand(format!(
            "content mirror of {} needs a sync_command unless its source is a local path",
            repo.source_url
        )));
    }

    let target = validate_target(&repo.target_path)?;

    let (mode, command) = if repo.target_path.exists() {
        (
            SyncMode::Update,
            CommandSpec::new("git").args(["-C", target, "remote", "update", "--prune"]),
        )
    } else {
        let url = validate_source_url(&repo.source_url)?;
        (
            SyncMode::Clone,
            CommandSpec::new("git").args(["clone", "--mirror", "--", url, target]),
        )
    };

    command.validate()?;
    Ok(SyncPlan { mode, command })
}

/// Source tree of a content mirror that is copied in-process.
///
/// `Some` only for content mirrors without an override whose source is an
/// absolute path or `file://` url.
pub fn local_content_source(repo: &RepositoryConfig) -> Option<PathBuf> {
    if repo.kind != MirrorKind::Content || repo.sync_command_override.is_some() {
        return None;
    }
    local_source_path(&repo.source_url)
}

/// Absolute path behind a plain path or `file://` url
pub fn local_source_path(url: &str) -> Option<PathBuf> {
    let url = url.trim();
    let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
    path.is_absolute().then_some(path)
}

/// Accept URLs with a known scheme, scp-like remotes and absolute paths
pub fn validate_source_url(url: &str) -> Result<&str> {
    let url = url.trim();
    if url.is_empty() {
        return Err(MirrorError::InvalidCommand("empty source url".to_string()));
    }
    if url.starts_with('-') {
        return Err(MirrorError::InvalidCommand(format!(
            "source url looks like an option: {}",
            url
        )));
    }
    if url.chars().any(|c| c.is_control()) {
        return Err(MirrorError::InvalidCommand(format!(
            "source url contains control characters: {:?}",
            url
        )));
    }

    if let Some((scheme, rest)) = url.split_once("://") {
        if ALLOWED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) && !rest.is_empty() {
            return Ok(url);
        }
        return Err(MirrorError::InvalidCommand(format!(
            "unsupported source url scheme: {}",
            scheme
        )));
    }

    if Path::new(url).is_absolute() || SCP_LIKE.is_match(url) {
        return Ok(url);
    }

    Err(MirrorError::InvalidCommand(format!(
        "unrecognized source url: {}",
        url
    )))
}

fn validate_target(path: &Path) -> Result<&str> {
    let target = path.to_str().ok_or_else(|| {
        MirrorError::InvalidCommand(format!("target path is not UTF-8: {}", path.display()))
    })?;
    if target.is_empty() {
        return Err(MirrorError::InvalidCommand("empty target path".to_string()));
    }
    if target.starts_with('-') {
        return Err(MirrorError::InvalidCommand(format!(
            "target path looks like an option: {}",
            target
        )));
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_missing_target_derives_mirror_clone() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a");
        let repo = RepositoryConfig::new("a", "https://example.com/a.git", &target);

        let plan = derive_command(&repo).unwrap();
        assert_eq!(plan.mode, SyncMode::Clone);
        assert_eq!(
            plan.command,
            CommandSpec::new("git").args([
                "clone",
                "--mirror",
                "--",
                "https://example.com/a.git",
                target.to_str().unwrap()
            ])
        );
    }

    #[test]
    fn test_existing_target_derives_update() {
        let dir = tempdir().unwrap();
        let repo = RepositoryConfig::new("a", "https://example.com/a.git", dir.path());

        let plan = derive_command(&repo).unwrap();
        assert_eq!(plan.mode, SyncMode::Update);
        assert_eq!(plan.command.args[0], "-C");
        assert_eq!(&plan.command.args[2..], &["remote", "update", "--prune"]);
    }

    #[test]
    fn test_override_wins() {
        let repo = RepositoryConfig::new("a", "rsync://h/a", "/m/a").with_command([
            "rsync",
            "-a",
            "rsync://h/a/",
            "/m/a/",
        ]);

        let plan = derive_command(&repo).unwrap();
        assert_eq!(plan.mode, SyncMode::Override);
        assert_eq!(plan.command.program_name(), "rsync");
        assert_eq!(plan.command.to_string(), "rsync -a rsync://h/a/ /m/a/");
    }

    #[test]
    fn test_content_mirror_has_no_derived_command() {
        let local = RepositoryConfig::new("pkgs", "file:///srv/pkgs", "/m/pkgs")
            .with_kind(MirrorKind::Content);
        assert_eq!(
            local_content_source(&local),
            Some(PathBuf::from("/srv/pkgs"))
        );

        let remote = RepositoryConfig::new("pkgs", "rsync://h/pkgs/", "/m/pkgs")
            .with_kind(MirrorKind::Content);
        assert_eq!(local_content_source(&remote), None);
        let err = derive_command(&remote).unwrap_err();
        assert!(err.to_string().contains("needs a sync_command"));

        // An override always takes the command path
        let overridden = local.clone().with_command(["rsync", "-a", "/srv/pkgs/", "/m/pkgs/"]);
        assert_eq!(local_content_source(&overridden), None);
        assert_eq!(derive_command(&overridden).unwrap().mode, SyncMode::Override);
    }

    #[test]
    fn test_local_source_path_forms() {
        assert_eq!(local_source_path("/srv/a"), Some(PathBuf::from("/srv/a")));
        assert_eq!(local_source_path("file:///srv/a"), Some(PathBuf::from("/srv/a")));
        assert_eq!(local_source_path("https://h/a"), None);
        assert_eq!(local_source_path("relative/a"), None);
    }

    #[test]
    fn test_option_injection_rejected() {
        let repo = RepositoryConfig::new("a", "--upload-pack=touch /tmp/x", "/nonexistent/a");
        assert!(matches!(
            derive_command(&repo),
            Err(MirrorError::InvalidCommand(_))
        ));

        let repo = RepositoryConfig::new("a", "https://h/a.git", "-oops");
        assert!(matches!(
            derive_command(&repo),
            Err(MirrorError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_source_url_forms() {
        assert!(validate_source_url("https://github.com/example/example.git").is_ok());
        assert!(validate_source_url("git@github.com:example/example.git").is_ok());
        assert!(validate_source_url("/srv/git/upstream.git").is_ok());
        assert!(validate_source_url("ext::sh -c touch% /tmp/pwned").is_err());
        assert!(validate_source_url("javascript://x").is_err());
        assert!(validate_source_url("relative/path").is_err());
    }

    #[test]
    fn test_nul_byte_rejected() {
        let argv = vec!["rsync".to_string(), "a\0b".to_string()];
        assert!(CommandSpec::from_argv(&argv).is_err());
        assert!(CommandSpec::from_argv(&[]).is_err());
    }

    #[test]
    fn test_program_name_strips_directories() {
        assert_eq!(CommandSpec::new("/usr/bin/rsync").program_name(), "rsync");
        assert_eq!(CommandSpec::new("curl").program_name(), "curl");
    }

    #[test]
    fn test_invocation_display() {
        let piped = Invocation::Piped {
            source: CommandSpec::new("curl").arg("https://h/index.tar"),
            sink: CommandSpec::new("pv").args(["-q", "-L", "500k"]),
        };
        assert_eq!(piped.to_string(), "curl https://h/index.tar | pv -q -L 500k");
        assert_eq!(piped.primary().program, "curl");
    }
}
