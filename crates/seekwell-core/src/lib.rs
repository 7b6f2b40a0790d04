//! # Seekwell Core
//!
//! Backend-agnostic logic for Seekwell: the [`Database`](store::Database)
//! contract, MinHash/LSH signature and query engines, and the vector
//! store bridge.
//!
//! This crate contains no tokio, sqlx, reqwest, or other I/O
//! dependencies. Backend adapters live in the `seekwell` crate.

pub mod bridge;
pub mod engine;
pub mod error;
pub mod minhash;
pub mod models;
pub mod store;

pub use error::{Result, StoreError};
