//! Store orchestration for the function store.
//!
//! [`FunctionService`] implements [`fstore_core::store::FunctionStore`] by
//! composing the security gate, the SQLite store and its write coordinator,
//! the background [`TaskQueue`], the environment pool and sandbox, the quality
//! gate, an [`fstore_core::capability::Embedder`] and the
//! [`PopularQueryCache`]. Only the Master process builds one.

mod maintenance;

pub mod cache;
pub mod embedder;
pub mod queue;
pub mod service;

pub use cache::{CacheStats, PopularQueryCache};
pub use embedder::HashingEmbedder;
pub use queue::TaskQueue;
pub use service::{Components, FunctionService, ServiceConfig};
