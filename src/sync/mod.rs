//! Mirror sync orchestration
//!
//! The scheduler fires cycles on an interval; each cycle runs the executor
//! for every configured repository. The executor shapes the transfer, falls
//! back to conflict resolution on failure and records the outcome.

pub mod conflict;
mod executor;
mod scheduler;
mod shutdown;

pub use conflict::{ConflictResolver, DivergenceDetector, Resolution, ResolutionStrategy};
pub use executor::{ExecutorSettings, SyncExecutor};
pub use scheduler::{CycleReport, RepositorySource, Scheduler, SchedulerSettings};
pub use shutdown::{shutdown_channel, wait_for_termination, ShutdownHandle, ShutdownSignal};
