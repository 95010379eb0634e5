//! # File Vault Core
//!
//! Pure logic shared by the File Vault application crate: data models,
//! content fingerprinting, token-window chunking, the embedder and vector
//! index abstractions, and per-file search aggregation.
//!
//! This crate performs no filesystem or database I/O. Everything here can be
//! exercised with the in-memory [`index::memory::InMemoryVectorIndex`] and
//! the deterministic [`embedding::HashEmbedder`].

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod locks;
pub mod models;
pub mod search;

pub use error::VaultError;
pub use fingerprint::Fingerprint;
