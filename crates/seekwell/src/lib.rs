//! # Seekwell
//!
//! Backend adapters and wiring for the Seekwell data-access layer:
//! embedded SQLite and networked MySQL implementations of the
//! [`Database`](seekwell_core::store::Database) contract, configuration
//! loading with environment interpolation, the database factory, and
//! the HTTP client for the external vector-index service.

pub mod backend;
pub mod config;
pub mod factory;
pub mod index;
pub mod values;

pub use seekwell_core::{
    bridge, engine, minhash, models, store, Result, StoreError,
};
