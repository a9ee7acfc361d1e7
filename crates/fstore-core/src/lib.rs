//! Core types and trait definitions for the function store.
//!
//! This crate is deliberately free of database, subprocess and network
//! dependencies. Every other crate depends on it.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod capability;
pub mod embedding;
pub mod error;
pub mod function;
pub mod packages;
pub mod store;

pub use error::{Error, Rejection, Result};
