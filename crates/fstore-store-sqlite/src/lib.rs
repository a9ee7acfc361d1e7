//! SQLite persistence for the function store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on dedicated threads
//! without blocking the async runtime. Writes go through one connection and
//! require a [`WriteGuard`] from the [`WriteCoordinator`]; reads use a
//! separate read-only connection and never wait on the write lock.

mod encode;
mod retry;
mod schema;
mod store;

pub mod error;
pub mod lock;

pub use error::{Error, Result};
pub use lock::{AdvisoryFileLock, LockFile, WriteCoordinator, WriteGuard};
pub use retry::RetryPolicy;
pub use store::{EmbeddedFunction, Finalization, SqliteStore};

#[cfg(test)]
mod tests;
