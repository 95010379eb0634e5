//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only surface the orchestrator and the
//! search aggregator use to persist and query chunk embeddings, so the
//! SQLite index in the app crate and the in-memory index here are
//! interchangeable.
//!
//! Implementations must report an unreachable backend as
//! [`VaultError::TransientStore`](crate::VaultError::TransientStore), never
//! as an empty result.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, ChunkHit};

/// Storage for embedded chunks.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace chunks by id |
/// | [`delete_by_owner`](VectorIndex::delete_by_owner) | Remove every chunk of a file |
/// | [`query`](VectorIndex::query) | Top-k cosine similarity search |
/// | [`count`](VectorIndex::count) | Total chunks indexed |
/// | [`count_for_owner`](VectorIndex::count_for_owner) | Chunks indexed for one file |
/// | [`reset`](VectorIndex::reset) | Drop every chunk |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace chunks. Re-upserting an id replaces, never duplicates.
    async fn upsert(&self, chunks: &[Chunk]) -> Result<()>;

    /// Remove all chunks owned by `file_id`. Returns how many were removed;
    /// zero is not an error.
    async fn delete_by_owner(&self, file_id: &str) -> Result<u64>;

    /// Chunks ranked by descending cosine similarity with `vector`.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ChunkHit>>;

    async fn count(&self) -> Result<u64>;

    async fn count_for_owner(&self, file_id: &str) -> Result<u64>;

    /// Chunk ids owned by `file_id`, in sequence order.
    async fn chunk_ids_for_owner(&self, file_id: &str) -> Result<Vec<String>>;

    /// Remove every chunk. Returns how many were removed.
    async fn reset(&self) -> Result<u64>;
}

/// Order hits by descending score, breaking ties by chunk id, and keep
/// the first `top_k`.
pub fn rank_hits(mut hits: Vec<ChunkHit>, top_k: usize) -> Vec<ChunkHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(top_k);
    hits
}
