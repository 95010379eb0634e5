//! In-memory [`VectorIndex`] for tests and embedded use.
//!
//! Chunks live in a `BTreeMap` behind `std::sync::RwLock`; queries are
//! brute-force cosine similarity. Availability can be toggled and deletes
//! can be made to fail, which lets tests drive the retry and cleanup paths
//! of the orchestrator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{rank_hits, VectorIndex};
use crate::embedding::cosine_similarity;
use crate::error::VaultError;
use crate::models::{Chunk, ChunkHit};

pub struct InMemoryVectorIndex {
    chunks: RwLock<BTreeMap<String, Chunk>>,
    available: AtomicBool,
    failing_deletes: AtomicU32,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            failing_deletes: AtomicU32::new(0),
        }
    }

    /// While unavailable, every operation fails with a transient error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `delete_by_owner` fail transiently.
    pub fn fail_next_deletes(&self, n: u32) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            bail!(VaultError::TransientStore(
                "in-memory index marked unavailable".into()
            ));
        }
        Ok(())
    }

    fn poisoned() -> anyhow::Error {
        anyhow!(VaultError::TransientStore("index lock poisoned".into()))
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, chunks: &[Chunk]) -> Result<()> {
        self.check_available()?;
        let mut stored = self.chunks.write().map_err(|_| Self::poisoned())?;
        for c in chunks {
            stored.insert(c.id.clone(), c.clone());
        }
        Ok(())
    }

    async fn delete_by_owner(&self, file_id: &str) -> Result<u64> {
        self.check_available()?;
        let pending = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            bail!(VaultError::TransientStore(format!(
                "injected delete failure for {}",
                file_id
            )));
        }
        let mut stored = self.chunks.write().map_err(|_| Self::poisoned())?;
        let before = stored.len();
        stored.retain(|_, c| c.metadata.owner_file_id != file_id);
        Ok((before - stored.len()) as u64)
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ChunkHit>> {
        self.check_available()?;
        let stored = self.chunks.read().map_err(|_| Self::poisoned())?;
        let hits = stored
            .values()
            .map(|c| ChunkHit {
                chunk_id: c.id.clone(),
                text: c.text.clone(),
                metadata: c.metadata.clone(),
                score: cosine_similarity(vector, &c.vector) as f64,
            })
            .collect();
        Ok(rank_hits(hits, top_k))
    }

    async fn count(&self) -> Result<u64> {
        self.check_available()?;
        let stored = self.chunks.read().map_err(|_| Self::poisoned())?;
        Ok(stored.len() as u64)
    }

    async fn count_for_owner(&self, file_id: &str) -> Result<u64> {
        Ok(self.chunk_ids_for_owner(file_id).await?.len() as u64)
    }

    async fn chunk_ids_for_owner(&self, file_id: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let stored = self.chunks.read().map_err(|_| Self::poisoned())?;
        let mut owned: Vec<&Chunk> = stored
            .values()
            .filter(|c| c.metadata.owner_file_id == file_id)
            .collect();
        owned.sort_by_key(|c| c.metadata.sequence_index);
        Ok(owned.into_iter().map(|c| c.id.clone()).collect())
    }

    async fn reset(&self) -> Result<u64> {
        self.check_available()?;
        let mut stored = self.chunks.write().map_err(|_| Self::poisoned())?;
        let n = stored.len() as u64;
        stored.clear();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn chunk(owner: &str, seq: u32, vector: Vec<f32>) -> Chunk {
        Chunk::new(
            ChunkMetadata {
                owner_file_id: owner.into(),
                sequence_index: seq,
                source_type: "text/plain".into(),
                display_name: format!("{}.txt", owner),
            },
            format!("chunk {} of {}", seq, owner),
            vector,
        )
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let index = InMemoryVectorIndex::new();
        index.upsert(&[chunk("a", 0, vec![1.0, 0.0])]).await.unwrap();
        index.upsert(&[chunk("a", 0, vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        let hits = index.query(&[0.0, 1.0], 5).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_delete_by_owner_isolated() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(&[
                chunk("a", 0, vec![1.0, 0.0]),
                chunk("a", 1, vec![1.0, 0.0]),
                chunk("b", 0, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        assert_eq!(index.delete_by_owner("a").await.unwrap(), 2);
        assert_eq!(index.delete_by_owner("a").await.unwrap(), 0);
        assert_eq!(index.count_for_owner("b").await.unwrap(), 1);
        let hits = index.query(&[1.0, 0.0], 10).await.unwrap();
        assert!(hits.iter().all(|h| h.metadata.owner_file_id == "b"));
    }

    #[tokio::test]
    async fn test_query_ranked_descending() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(&[
                chunk("a", 0, vec![1.0, 0.0]),
                chunk("b", 0, vec![0.6, 0.8]),
                chunk("c", 0, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        let hits = index.query(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "a:0");
        assert_eq!(hits[1].chunk_id, "b:0");
    }

    #[tokio::test]
    async fn test_unavailable_is_transient_not_empty() {
        let index = InMemoryVectorIndex::new();
        index.set_available(false);
        let err = index.query(&[1.0], 3).await.unwrap_err();
        assert!(VaultError::is_transient(&err));
        index.set_available(true);
        assert!(index.query(&[1.0], 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_delete_failures() {
        let index = InMemoryVectorIndex::new();
        index.upsert(&[chunk("a", 0, vec![1.0])]).await.unwrap();
        index.fail_next_deletes(2);
        assert!(index.delete_by_owner("a").await.is_err());
        assert!(index.delete_by_owner("a").await.is_err());
        assert_eq!(index.delete_by_owner("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_chunk_ids_in_sequence_order() {
        let index = InMemoryVectorIndex::new();
        let chunks: Vec<Chunk> = (0..12).map(|i| chunk("a", i, vec![1.0])).collect();
        index.upsert(&chunks).await.unwrap();
        let ids = index.chunk_ids_for_owner("a").await.unwrap();
        assert_eq!(ids[2], "a:2");
        assert_eq!(ids[10], "a:10");
        assert_eq!(index.reset().await.unwrap(), 12);
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
