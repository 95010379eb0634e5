//! # File Vault
//!
//! A deduplicating file store with semantic search.
//!
//! Uploaded bytes land in a content-addressable store keyed by their
//! SHA-256 fingerprint and reference-counted, so identical uploads share one
//! physical copy. Every file is then extracted, chunked into overlapping
//! token windows, embedded, and written to a vector index; searches rank
//! whole files by aggregating their best-matching chunks.
//!
//! ## Architecture
//!
//! ```text
//!   upload ──▶ ┌────────────┐      ┌───────────────────────────────┐
//!              │    CAS     │ ───▶ │      Indexing orchestrator     │
//!   delete ──▶ │ refcounts  │      │ extract → chunk → embed → put │
//!              └─────┬──────┘      └──────────────┬────────────────┘
//!                    │                            ▼
//!                    ▼                     ┌─────────────┐
//!              cas/ab/cd/<hash>            │ vector index│ ◀── search
//!                                          └─────────────┘
//! ```
//!
//! Pure logic (models, chunking, search aggregation, the embedder and index
//! traits) lives in the `filevault-core` crate; this crate adds SQLite, the
//! filesystem, HTTP embedding providers, and the `vault` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`cas`] | Content-addressable store with reference counting |
//! | [`files`] | File records |
//! | [`extract`] | Text extraction from stored bytes |
//! | [`embedding`] | Embedding providers |
//! | [`vector_index`] | SQLite vector index |
//! | [`indexer`] | Indexing orchestrator and deletion cleanup |
//! | [`stats`] | Storage and index statistics |
//! | [`vault`] | The facade tying it together |

pub mod cas;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod files;
pub mod indexer;
pub mod migrate;
pub mod stats;
pub mod vault;
pub mod vector_index;

pub use config::{load_config, Config};
pub use filevault_core::{Fingerprint, VaultError};
pub use vault::{Components, DeleteOutcome, IndexingDisposition, UploadOutcome, Vault};
