//! Lattice Core - Core contracts for the Lattice database client
//!
//! This crate provides the fundamental traits and types that the other
//! Lattice crates depend on. It defines:
//!
//! - `ServiceClient` - Trait for the service RPC surface
//! - `LatticeError` - Error type shared across the client
//! - Identifier types like `DatabaseId`, `SessionHandle`, `TransactionId`

mod client;
mod error;
mod types;

pub use client::*;
pub use error::*;
pub use types::*;
