//! Periodic sync cycles with overlap prevention and graceful shutdown

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use super::executor::{ExecutorSettings, SyncExecutor};
use super::shutdown::ShutdownSignal;
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::types::{RepositoryConfig, SchedulerState, SyncOutcome};

/// Where each cycle gets its repository list from
#[derive(Debug, Clone)]
pub enum RepositorySource {
    /// Fixed list
    Static(Vec<RepositoryConfig>),
    /// Configuration document re-read at the start of every cycle
    File(PathBuf),
}

impl RepositorySource {
    /// A missing file means no repositories; any other load error is returned
    fn load(&self) -> Result<(Vec<RepositoryConfig>, Option<ExecutorSettings>)> {
        match self {
            RepositorySource::Static(repos) => Ok((repos.clone(), None)),
            RepositorySource::File(path) => {
                let config = match MirrorConfig::load(path) {
                    Ok(config) => config,
                    Err(e @ MirrorError::ConfigMissing(_)) => {
                        tracing::warn!("{}; no repositories configured", e);
                        MirrorConfig::default()
                    }
                    Err(e) => return Err(e),
                };
                let settings = ExecutorSettings::from(&config);
                Ok((config.repos, Some(settings)))
            }
        }
    }
}

/// Fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub max_parallel: usize,
}

impl From<&MirrorConfig> for SchedulerSettings {
    fn from(config: &MirrorConfig) -> Self {
        Self {
            interval: config.interval(),
            max_parallel: config.max_parallel.max(1),
        }
    }
}

/// Summary of one completed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// In completion order
    pub outcomes: Vec<SyncOutcome>,
    /// Repositories not started because shutdown was requested
    pub skipped: usize,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Drives sync cycles on a fixed interval
pub struct Scheduler {
    executor: Arc<SyncExecutor>,
    source: RepositorySource,
    settings: SchedulerSettings,
    cycle_running: AtomicBool,
    state: RwLock<SchedulerState>,
    /// Last successfully loaded repository list
    last_repos: Mutex<Vec<RepositoryConfig>>,
}

/// Releases the overlap guard when a cycle ends, however it ends
struct CycleGuard<'a>(&'a Scheduler);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.write();
        if *state == SchedulerState::Running {
            *state = SchedulerState::Idle;
        }
        self.0.cycle_running.store(false, Ordering::Release);
    }
}

impl Scheduler {
    pub fn new(
        executor: Arc<SyncExecutor>,
        source: RepositorySource,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            executor,
            source,
            settings,
            cycle_running: AtomicBool::new(false),
            state: RwLock::new(SchedulerState::Idle),
            last_repos: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn executor(&self) -> &Arc<SyncExecutor> {
        &self.executor
    }

    /// Idle -> Running, only if no cycle is in flight
    fn try_begin(&self) -> bool {
        let mut state = self.state.write();
        if *state == SchedulerState::Stopped {
            return false;
        }
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *state = SchedulerState::Running;
        true
    }

    /// Run one cycle to completion on the current task.
    ///
    /// Returns `None` if a cycle is already running or the scheduler has
    /// stopped.
    pub async fn run_cycle(&self, signal: &ShutdownSignal) -> Option<CycleReport> {
        if !self.try_begin() {
            tracing::warn!("Sync cycle already in progress, trigger dropped");
            return None;
        }
        let _guard = CycleGuard(self);
        Some(self.execute_cycle(signal).await)
    }

    /// Start a cycle in the background. Dropped (returns `None`) while one
    /// is already running.
    pub fn trigger(self: &Arc<Self>, signal: &ShutdownSignal) -> Option<JoinHandle<CycleReport>> {
        if !self.try_begin() {
            return None;
        }
        let this = Arc::clone(self);
        let signal = signal.clone();
        Some(tokio::spawn(async move {
            let _guard = CycleGuard(&this);
            this.execute_cycle(&signal).await
        }))
    }

    /// Tick until shutdown, then wait for the in-flight cycle and stop
    pub async fn run(self: Arc<Self>, signal: ShutdownSignal) {
        tracing::info!(
            "Scheduler started: interval {}s, max parallel {}",
            self.settings.interval.as_secs(),
            self.settings.max_parallel
        );

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<CycleReport>> = None;

        loop {
            tokio::select! {
                _ = signal.stopped() => break,
                _ = ticker.tick() => {
                    if signal.is_stopping() {
                        break;
                    }
                    match self.trigger(&signal) {
                        Some(handle) => in_flight = Some(handle),
                        None => tracing::warn!("Previous sync cycle still running, skipping tick"),
                    }
                }
            }
        }

        if let Some(handle) = in_flight {
            if !handle.is_finished() {
                tracing::info!("Shutdown requested, waiting for in-flight syncs");
            }
            if let Err(e) = handle.await {
                tracing::error!("Sync cycle task failed: {}", e);
            }
        }

        *self.state.write() = SchedulerState::Stopped;
        tracing::info!("Scheduler stopped");
    }

    async fn execute_cycle(&self, signal: &ShutdownSignal) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();

        let repos = self.load_repositories();
        let total = repos.len();
        tracing::info!("Cycle {} started with {} repositories", cycle_id, total);

        let executor = &self.executor;
        let outcomes: Vec<SyncOutcome> = stream::iter(repos)
            .take_while(|_| futures::future::ready(!signal.is_stopping()))
            .map(|repo| async move { executor.run_one(&repo).await })
            .buffer_unordered(self.settings.max_parallel.max(1))
            .collect()
            .await;

        let report = CycleReport {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            skipped: total - outcomes.len(),
            outcomes,
        };

        if report.skipped > 0 {
            tracing::warn!(
                "Cycle {} interrupted by shutdown, {} repositories skipped",
                cycle_id,
                report.skipped
            );
        }
        tracing::info!(
            "Cycle {} finished: {} succeeded, {} failed",
            cycle_id,
            report.succeeded(),
            report.failed()
        );

        report
    }

    /// Reload the source, keeping the previous list and defaults if it fails
    fn load_repositories(&self) -> Vec<RepositoryConfig> {
        match self.source.load() {
            Ok((repos, settings)) => {
                if let Some(settings) = settings {
                    self.executor.update_settings(settings);
                }
                *self.last_repos.lock() = repos.clone();
                repos
            }
            Err(e) => {
                let previous = self.last_repos.lock().clone();
                tracing::error!(
                    "Failed to reload configuration: {}; keeping previous {} repositories",
                    e,
                    previous.len()
                );
                previous
            }
        }
    }
}
