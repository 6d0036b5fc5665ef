//! Mirrorsync - repository mirror orchestration
//!
//! Keeps local mirrors of remote repositories current on a fixed interval,
//! shapes transfer bandwidth, repairs diverged mirrors from their source of
//! truth and records the last outcome per repository in SQLite.

pub mod config;
pub mod error;
pub mod status;
pub mod storage;
pub mod sync;
pub mod transfer;
pub mod types;

pub use error::{MirrorError, Result};
pub use storage::StateStore;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
