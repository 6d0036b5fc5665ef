//! State store for sync outcomes
//!
//! Handles SQLite database operations, WAL mode, and schema management.

mod connection;
mod migrations;
pub mod queries;

pub use connection::{StateStore, StoreConfig};
pub use migrations::SCHEMA_VERSION;
