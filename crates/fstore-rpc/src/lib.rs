//! Process coordination for the function store.
//!
//! Exactly one process, the Master, opens the database and runs background
//! maintenance. Every other process elects itself a Proxy and reaches the
//! Master over a local endpoint with [`RemoteStore`], which implements the
//! same [`fstore_core::store::FunctionStore`] trait as the local service.

mod election;
mod endpoint;
mod error;
mod master;
mod proxy;
pub mod wire;

pub use election::{ProcessCoordinator, Role};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use master::{MasterHandle, MasterSeat};
pub use proxy::RemoteStore;
