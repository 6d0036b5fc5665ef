//! Per-repository sync execution
//!
//! `run_one` is the containment boundary: whatever goes wrong while syncing a
//! repository ends up in its [`SyncOutcome`], never in the caller.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::conflict::ConflictResolver;
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::storage::StateStore;
use crate::transfer::{
    derive_command, local_content_source, BandwidthLimiter, CommandRunner, ShapingPolicy,
};
use crate::types::{RemediationPolicy, RepositoryConfig, SyncOutcome};

/// Global defaults applied to every repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub default_limit_kbps: u32,
    pub default_timeout: Duration,
    pub remediation: RemediationPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&MirrorConfig::default())
    }
}

impl From<&MirrorConfig> for ExecutorSettings {
    fn from(config: &MirrorConfig) -> Self {
        Self {
            default_limit_kbps: config.bandwidth_limit_kbps,
            default_timeout: config.timeout(),
            remediation: config.remediation,
        }
    }
}

/// Runs one repository's sync and records the outcome
pub struct SyncExecutor {
    store: StateStore,
    limiter: BandwidthLimiter,
    resolver: ConflictResolver,
    settings: RwLock<ExecutorSettings>,
}

impl SyncExecutor {
    pub fn new(
        store: StateStore,
        limiter: BandwidthLimiter,
        resolver: ConflictResolver,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            limiter,
            resolver,
            settings: RwLock::new(settings),
        }
    }

    /// Build the limiter and resolver around one shared runner
    pub fn with_runner(
        store: StateStore,
        runner: Arc<dyn CommandRunner>,
        policy: ShapingPolicy,
        settings: ExecutorSettings,
    ) -> Self {
        let limiter = BandwidthLimiter::new(runner.clone(), policy);
        let resolver = ConflictResolver::new(runner).with_step_timeout(settings.default_timeout);
        Self::new(store, limiter, resolver, settings)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn settings(&self) -> ExecutorSettings {
        self.settings.read().clone()
    }

    /// Swap in new global defaults, e.g. after a configuration reload
    pub fn update_settings(&self, settings: ExecutorSettings) {
        let mut current = self.settings.write();
        if *current != settings {
            tracing::info!(
                "Executor defaults updated: limit {} kbps, timeout {}s, remediation {:?}",
                settings.default_limit_kbps,
                settings.default_timeout.as_secs(),
                settings.remediation
            );
            *current = settings;
        }
    }

    /// Sync one repository and persist the outcome
    pub async fn run_one(&self, repo: &RepositoryConfig) -> SyncOutcome {
        let settings = self.settings();
        let started = Instant::now();
        tracing::info!("Syncing {} from {}", repo.name, repo.source_url);

        let outcome = match self.attempt(repo, &settings).await {
            Ok(()) => {
                tracing::info!(
                    "Synced {} in {:.1}s",
                    repo.name,
                    started.elapsed().as_secs_f64()
                );
                SyncOutcome::success(&repo.name)
            }
            Err(e) => {
                tracing::error!("Sync of {} failed ({}): {}", repo.name, e.kind(), e);
                if !e.is_retryable() {
                    tracing::warn!(
                        "{} will keep failing until its configuration is fixed",
                        repo.name
                    );
                }
                SyncOutcome::failure(&repo.name, e.to_string())
            }
        };

        if let Err(e) = self.store.put(&outcome) {
            tracing::error!("Failed to record outcome for {}: {}", repo.name, e);
        }

        outcome
    }

    async fn attempt(&self, repo: &RepositoryConfig, settings: &ExecutorSettings) -> Result<()> {
        let limit = repo
            .bandwidth_limit_kbps
            .unwrap_or(settings.default_limit_kbps);
        let timeout = repo
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(settings.default_timeout);

        if settings.remediation == RemediationPolicy::Proactive && repo.target_path.exists() {
            if let Err(e) = self.resolver.resolve(repo).await {
                tracing::warn!("Pre-sync resolution for {} failed: {}", repo.name, e);
            }
        }

        let transfer_err = match self.transfer(repo, limit, timeout).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        // Timeouts and rejected commands are not something a refresh can fix
        if settings.remediation == RemediationPolicy::Disabled
            || !matches!(transfer_err, MirrorError::TransferFailed(_))
        {
            return Err(transfer_err);
        }

        tracing::warn!(
            "Transfer for {} failed, attempting conflict resolution: {}",
            repo.name,
            transfer_err
        );

        match self.resolver.resolve(repo).await {
            Ok(resolution) => {
                tracing::info!(
                    "Resolved {} with {:?} ({} action(s)), retrying transfer",
                    repo.name,
                    resolution.strategy,
                    resolution.actions.len()
                );
                // Derived again: the resolver may have created the target
                self.transfer(repo, limit, timeout).await
            }
            Err(e) => {
                let diagnostic = match e {
                    MirrorError::ConflictUnresolved(diagnostic) => diagnostic,
                    other => other.to_string(),
                };
                Err(MirrorError::ConflictUnresolved(format!(
                    "{}; remediation: {}",
                    transfer_err, diagnostic
                )))
            }
        }
    }

    async fn transfer(&self, repo: &RepositoryConfig, limit: u32, timeout: Duration) -> Result<()> {
        if let Some(source) = local_content_source(repo) {
            return self.copy_content(repo, &source, timeout).await;
        }

        let plan = derive_command(repo)?;
        tracing::debug!("{} ({:?}): {}", repo.name, plan.mode, plan.command);

        let report = self
            .limiter
            .execute(&plan.command, limit, timeout)
            .await
            .map_err(|e| match e {
                MirrorError::Io(e) => MirrorError::TransferFailed(format!(
                    "could not start {}: {}",
                    plan.command.program_name(),
                    e
                )),
                other => other,
            })?;

        if report.output.timed_out {
            return Err(MirrorError::Timeout(timeout.as_secs()));
        }
        if !report.output.success() {
            return Err(MirrorError::TransferFailed(report.output.diagnostic()));
        }
        Ok(())
    }

    /// In-process copy of a local content tree; not bandwidth shaped
    async fn copy_content(
        &self,
        repo: &RepositoryConfig,
        source: &Path,
        timeout: Duration,
    ) -> Result<()> {
        tracing::debug!(
            "{} (copy): {} -> {}",
            repo.name,
            source.display(),
            repo.target_path.display()
        );
        let resolution = tokio::time::timeout(
            timeout,
            self.resolver.reconcile_content(source, &repo.target_path),
        )
        .await
        .map_err(|_| MirrorError::Timeout(timeout.as_secs()))??;

        if !resolution.is_noop() {
            tracing::info!(
                "Copied {} file change(s) into {}",
                resolution.actions.len(),
                repo.name
            );
        }
        Ok(())
    }
}
