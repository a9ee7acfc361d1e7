//! Isolated execution for submitted code.
//!
//! [`EnvironmentPool`] hands out interpreter environments keyed by dependency
//! set, building each at most once. [`SandboxRunner`] runs a function's test
//! cases in a child process bound to one of those environments.

pub mod error;
pub mod installer;
pub mod pool;
pub mod runner;

pub use error::{Error, Result};
pub use installer::{EnvInstaller, UvInstaller};
pub use pool::{EnvironmentPool, Runtime};
pub use runner::{Outcome, SandboxRunner, Verdict};
