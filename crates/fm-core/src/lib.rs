//! Core library for foreman — domain types, the durable SQLite store,
//! token authentication, the capability gate, and server configuration.
//!
//! Everything else in the workspace builds on this crate: the store is the
//! single source of truth, and every in-memory structure elsewhere is a
//! cache that can be rebuilt from it.

pub mod auth;
pub mod capabilities;
pub mod config;
pub mod store;
pub mod types;

pub use store::{CoreError, Store};
