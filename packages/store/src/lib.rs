//! Versioned secret store abstraction
//!
//! Every piece of shared KME state lives in a networked, versioned key-value
//! store. The only mutual exclusion primitive is the store's single-document
//! compare-and-swap, so this crate provides:
//! - [`SecretStore`], the store contract with awaitable request handles
//! - [`compare_and_swap_update`], the bounded read-modify-CAS combinator
//! - [`MemoryStore`], an in-process backend for tests and single-node use
//! - [`VaultKvStore`], a client for a KV version 2 secrets engine

#![forbid(unsafe_code)]

pub mod cas;
pub mod error;
pub mod memory;
pub mod request;
pub mod traits;
pub mod vault;

pub use cas::{compare_and_swap_update, CasStep};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use request::StoreRequest;
pub use traits::{Fields, SecretStore, Versioned, ABSENT_VERSION};
pub use vault::{VaultKvConfig, VaultKvStore};
