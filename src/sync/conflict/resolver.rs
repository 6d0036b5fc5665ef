//! Conflict resolution strategies
//!
//! The remote source of truth always wins. Git mirrors are refreshed and
//! re-fetched with pruning; content mirrors have diverged files replaced from
//! the source and stale files removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DivergenceDetector, DivergenceType};
use crate::error::{MirrorError, Result};
use crate::transfer::{local_source_path, CommandRunner, CommandSpec, Invocation};
use crate::types::{MirrorKind, RepositoryConfig};

/// Default ceiling for each resolver step
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(3600);

/// Resolution strategy for a diverged mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Forced remote refresh, then full re-fetch with pruning
    RefreshMirror,
    /// Copy diverged files from the source tree
    ReplaceFromSource,
}

/// A completed resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// Strategy used
    pub strategy: ResolutionStrategy,
    /// Steps executed or files repaired
    pub actions: Vec<String>,
    /// When the resolution finished
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    pub fn new(strategy: ResolutionStrategy, actions: Vec<String>) -> Self {
        Self {
            strategy,
            actions,
            resolved_at: Utc::now(),
        }
    }

    /// Nothing had to change
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Reconciles a local mirror with its source of truth
#[derive(Clone)]
pub struct ConflictResolver {
    runner: Arc<dyn CommandRunner>,
    detector: DivergenceDetector,
    step_timeout: Duration,
}

impl ConflictResolver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            detector: DivergenceDetector::new(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Ceiling for each external step
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Resolve a repository according to its mirror kind
    pub async fn resolve(&self, repo: &RepositoryConfig) -> Result<Resolution> {
        match repo.kind {
            MirrorKind::Git => self.resolve_mirror(&repo.target_path).await,
            MirrorKind::Content => {
                let source = content_source(&repo.source_url)?;
                self.reconcile_content(&source, &repo.target_path).await
            }
        }
    }

    /// Refresh a git mirror against its remote.
    ///
    /// Both steps are no-ops on a consistent mirror. A failing step aborts;
    /// whatever earlier steps did is kept for the next attempt.
    pub async fn resolve_mirror(&self, target: &Path) -> Result<Resolution> {
        if !target.exists() {
            return Err(MirrorError::ConflictUnresolved(format!(
                "mirror {} does not exist",
                target.display()
            )));
        }
        if !is_git_mirror(target) {
            return Err(MirrorError::ConflictUnresolved(format!(
                "{} is not a git repository",
                target.display()
            )));
        }
        let target_str = target.to_str().ok_or_else(|| {
            MirrorError::ConflictUnresolved(format!(
                "mirror path is not UTF-8: {}",
                target.display()
            ))
        })?;

        let steps: [(&str, &[&str]); 2] = [
            ("remote update", &["remote", "update", "--prune"]),
            ("fetch", &["fetch", "--all", "--prune"]),
        ];

        let mut actions = Vec::with_capacity(steps.len());
        for (step, args) in steps {
            let command = CommandSpec::new("git")
                .args(["-C", target_str])
                .args(args.iter().copied());
            let rendered = command.to_string();

            let output = self
                .runner
                .run(&Invocation::Single(command), self.step_timeout)
                .await
                .map_err(|e| {
                    MirrorError::ConflictUnresolved(format!("{} could not start: {}", step, e))
                })?;

            if !output.success() {
                tracing::warn!(
                    "Conflict resolution step '{}' failed for {}: {}",
                    step,
                    target.display(),
                    output.diagnostic()
                );
                return Err(MirrorError::ConflictUnresolved(format!(
                    "{} failed ({})",
                    step,
                    output.diagnostic()
                )));
            }
            actions.push(rendered);
        }

        tracing::info!("Resolved git mirror {}", target.display());
        Ok(Resolution::new(ResolutionStrategy::RefreshMirror, actions))
    }

    /// Make `target` match `source` file by file
    pub async fn reconcile_content(&self, source: &Path, target: &Path) -> Result<Resolution> {
        let detector = self.detector.clone();
        let source = source.to_path_buf();
        let target = target.to_path_buf();

        let actions =
            tokio::task::spawn_blocking(move || reconcile_tree(&detector, &source, &target))
                .await
                .map_err(|e| MirrorError::Internal(format!("reconcile task failed: {}", e)))??;

        if !actions.is_empty() {
            tracing::info!("Repaired {} diverged file(s)", actions.len());
        }
        Ok(Resolution::new(ResolutionStrategy::ReplaceFromSource, actions))
    }
}

/// Bare mirrors keep `HEAD` and `objects/` at the top level
pub fn is_git_mirror(path: &Path) -> bool {
    (path.join("HEAD").is_file() && path.join("objects").is_dir()) || path.join(".git").exists()
}

/// Content sources must be readable locally
fn content_source(url: &str) -> Result<PathBuf> {
    local_source_path(url).ok_or_else(|| {
        MirrorError::ConflictUnresolved(format!(
            "content source must be an absolute path or file:// url, got {}",
            url
        ))
    })
}

fn reconcile_tree(
    detector: &DivergenceDetector,
    source: &Path,
    target: &Path,
) -> Result<Vec<String>> {
    if !source.exists() {
        return Err(MirrorError::ConflictUnresolved(format!(
            "source {} does not exist",
            source.display()
        )));
    }

    let divergences = detector.detect(source, target).map_err(|e| {
        MirrorError::ConflictUnresolved(format!("digest comparison failed: {}", e))
    })?;

    let mut actions = Vec::with_capacity(divergences.len());
    for divergence in divergences {
        let (from, to) = if divergence.path.as_os_str().is_empty() {
            (source.to_path_buf(), target.to_path_buf())
        } else {
            (source.join(&divergence.path), target.join(&divergence.path))
        };

        match divergence.divergence_type {
            DivergenceType::Missing | DivergenceType::ContentMismatch => {
                replace_file(&from, &to).map_err(|e| {
                    MirrorError::ConflictUnresolved(format!(
                        "replacing {}: {}",
                        to.display(),
                        e
                    ))
                })?;
                actions.push(format!("replaced {}", divergence.path.display()));
            }
            DivergenceType::Extra => {
                std::fs::remove_file(&to).map_err(|e| {
                    MirrorError::ConflictUnresolved(format!(
                        "removing {}: {}",
                        to.display(),
                        e
                    ))
                })?;
                actions.push(format!("removed {}", divergence.path.display()));
            }
        }
    }

    Ok(actions)
}

/// Copy through a temp file so readers never see a half-written file
fn replace_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let name = to
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = to.with_file_name(format!(".{}.mirrorsync-tmp", name));
    std::fs::copy(from, &tmp)?;
    std::fs::rename(&tmp, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::testing::ScriptedRunner;
    use crate::transfer::RunOutput;
    use tempfile::{tempdir, TempDir};

    fn bare_mirror() -> TempDir {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::create_dir_all(dir.path().join("objects")).unwrap();
        std::fs::create_dir_all(dir.path().join("refs/heads")).unwrap();
        dir
    }

    fn listing(root: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<_> = std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        entries.sort();
        entries
    }

    #[tokio::test]
    async fn test_consistent_mirror_is_noop_success() {
        let mirror = bare_mirror();
        let before = listing(mirror.path());
        let runner = Arc::new(ScriptedRunner::new());
        let resolver = ConflictResolver::new(runner.clone());

        let resolution = resolver.resolve_mirror(mirror.path()).await.unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::RefreshMirror);

        let calls = runner.rendered_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].ends_with("remote update --prune"));
        assert!(calls[1].ends_with("fetch --all --prune"));
        assert_eq!(listing(mirror.path()), before);

        // Running again changes nothing either
        resolver.resolve_mirror(mirror.path()).await.unwrap();
        assert_eq!(listing(mirror.path()), before);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_partial_progress() {
        let mirror = bare_mirror();
        let runner = Arc::new(ScriptedRunner::new().respond(
            "fetch --all",
            RunOutput::failed(128, "fatal: unable to access upstream"),
        ));
        let resolver = ConflictResolver::new(runner.clone());

        let err = resolver.resolve_mirror(mirror.path()).await.unwrap_err();
        let MirrorError::ConflictUnresolved(diagnostic) = err else {
            panic!("unexpected error kind");
        };
        assert!(diagnostic.starts_with("fetch failed"));
        assert!(diagnostic.contains("exit status 128"));
        assert!(diagnostic.contains("unable to access upstream"));
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_aborts_before_fetch() {
        let mirror = bare_mirror();
        let runner = Arc::new(
            ScriptedRunner::new().respond("remote update", RunOutput::failed(1, "error")),
        );
        let resolver = ConflictResolver::new(runner.clone());

        assert!(resolver.resolve_mirror(mirror.path()).await.is_err());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_or_foreign_target() {
        let runner = Arc::new(ScriptedRunner::new());
        let resolver = ConflictResolver::new(runner.clone());

        let absent = resolver
            .resolve_mirror(Path::new("/nonexistent/mirror.git"))
            .await;
        assert!(matches!(absent, Err(MirrorError::ConflictUnresolved(_))));

        let plain = tempdir().unwrap();
        let foreign = resolver.resolve_mirror(plain.path()).await;
        assert!(matches!(foreign, Err(MirrorError::ConflictUnresolved(_))));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_content_reconcile_then_noop() {
        let source = tempdir().unwrap();
        let target = tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("simple")).unwrap();
        std::fs::write(source.path().join("simple/index.html"), "v2").unwrap();
        std::fs::write(target.path().join("orphan.whl"), "gone upstream").unwrap();

        let repo = RepositoryConfig::new(
            "pypi-subset",
            format!("file://{}", source.path().display()),
            target.path(),
        )
        .with_kind(MirrorKind::Content);
        let resolver = ConflictResolver::new(Arc::new(ScriptedRunner::new()));

        let first = resolver.resolve(&repo).await.unwrap();
        assert_eq!(first.strategy, ResolutionStrategy::ReplaceFromSource);
        assert_eq!(first.actions.len(), 2);
        assert_eq!(
            std::fs::read_to_string(target.path().join("simple/index.html")).unwrap(),
            "v2"
        );
        assert!(!target.path().join("orphan.whl").exists());

        let second = resolver.resolve(&repo).await.unwrap();
        assert!(second.is_noop());
    }

    #[tokio::test]
    async fn test_content_single_file() {
        let source = tempdir().unwrap();
        let target = tempdir().unwrap();
        let upstream = source.path().join("Packages.gz");
        let local = target.path().join("Packages.gz");
        std::fs::write(&upstream, "new index").unwrap();
        std::fs::write(&local, "old index").unwrap();

        let resolver = ConflictResolver::new(Arc::new(ScriptedRunner::new()));
        let resolution = resolver.reconcile_content(&upstream, &local).await.unwrap();

        assert_eq!(resolution.actions.len(), 1);
        assert_eq!(std::fs::read_to_string(&local).unwrap(), "new index");
    }

    #[tokio::test]
    async fn test_content_source_must_be_local() {
        let repo = RepositoryConfig::new("idx", "https://example.com/index", "/m/idx")
            .with_kind(MirrorKind::Content);
        let resolver = ConflictResolver::new(Arc::new(ScriptedRunner::new()));

        assert!(matches!(
            resolver.resolve(&repo).await,
            Err(MirrorError::ConflictUnresolved(_))
        ));
    }
}
