//! SQLite-backed [`VectorIndex`].
//!
//! Vectors are little-endian `f32` BLOBs in the `chunk_vectors` table next
//! to the chunk text and metadata. Queries are brute-force cosine similarity
//! over every stored vector, which is adequate for a single-node vault.
//!
//! Every database failure is reported as
//! [`VaultError::TransientStore`](filevault_core::VaultError::TransientStore)
//! so callers retry instead of treating it as "no chunks".

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use filevault_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use filevault_core::index::{rank_hits, VectorIndex};
use filevault_core::models::{Chunk, ChunkHit, ChunkMetadata};
use filevault_core::VaultError;

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    model: String,
}

impl SqliteVectorIndex {
    /// `model` is recorded next to every vector written through this index.
    pub fn new(pool: SqlitePool, model: impl Into<String>) -> Self {
        Self {
            pool,
            model: model.into(),
        }
    }

    async fn upsert_inner(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, owner_file_id, sequence_index, text,
                                           source_type, display_name, embedding, model, dims)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    owner_file_id = excluded.owner_file_id,
                    sequence_index = excluded.sequence_index,
                    text = excluded.text,
                    source_type = excluded.source_type,
                    display_name = excluded.display_name,
                    embedding = excluded.embedding,
                    model = excluded.model,
                    dims = excluded.dims
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.metadata.owner_file_id)
            .bind(chunk.metadata.sequence_index as i64)
            .bind(&chunk.text)
            .bind(&chunk.metadata.source_type)
            .bind(&chunk.metadata.display_name)
            .bind(vec_to_blob(&chunk.vector))
            .bind(&self.model)
            .bind(chunk.vector.len() as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query_inner(&self, vector: &[f32], top_k: usize) -> Result<Vec<ChunkHit>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, owner_file_id, sequence_index, text, source_type,
                   display_name, embedding
            FROM chunk_vectors
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ChunkHit {
                    chunk_id: row.get("chunk_id"),
                    text: row.get("text"),
                    metadata: ChunkMetadata {
                        owner_file_id: row.get("owner_file_id"),
                        sequence_index: row.get::<i64, _>("sequence_index") as u32,
                        source_type: row.get("source_type"),
                        display_name: row.get("display_name"),
                    },
                    score: cosine_similarity(vector, &blob_to_vec(&blob)) as f64,
                }
            })
            .collect();

        Ok(rank_hits(hits, top_k))
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, chunks: &[Chunk]) -> Result<()> {
        self.upsert_inner(chunks)
            .await
            .map_err(VaultError::into_transient)
    }

    async fn delete_by_owner(&self, file_id: &str) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM chunk_vectors WHERE owner_file_id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::into_transient(e.into()))?;
        Ok(deleted.rows_affected())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ChunkHit>> {
        self.query_inner(vector, top_k)
            .await
            .map_err(VaultError::into_transient)
    }

    async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| VaultError::into_transient(e.into()))?;
        Ok(n as u64)
    }

    async fn count_for_owner(&self, file_id: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE owner_file_id = ?")
            .bind(file_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| VaultError::into_transient(e.into()))?;
        Ok(n as u64)
    }

    async fn chunk_ids_for_owner(&self, file_id: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT chunk_id FROM chunk_vectors WHERE owner_file_id = ? ORDER BY sequence_index",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VaultError::into_transient(e.into()))
    }

    async fn reset(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM chunk_vectors")
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::into_transient(e.into()))?;
        Ok(deleted.rows_affected())
    }
}
