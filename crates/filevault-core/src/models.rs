//! Core data models used throughout File Vault.
//!
//! These types describe stored content, the user-visible file records that
//! own it, the indexed chunks derived from those files, and the ranked
//! results of a semantic search.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::fingerprint::Fingerprint;

/// A unique physical payload in the content-addressable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Content {
    pub fingerprint: Fingerprint,
    pub size_bytes: u64,
    /// Number of live [`FileRecord`]s referencing this content.
    pub reference_count: u32,
    /// Path of the blob relative to the store root.
    pub storage_location: String,
}

/// A user-visible upload. Many records may share one [`Content`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub display_name: String,
    pub declared_type: String,
    pub content_fingerprint: Fingerprint,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// One token window produced by the chunker, before embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow {
    pub index: u32,
    /// Offset of the first token of this window in the source text.
    pub start_token: usize,
    pub token_count: usize,
    pub text: String,
}

/// Metadata stored next to every indexed chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkMetadata {
    pub owner_file_id: String,
    pub sequence_index: u32,
    /// Copy of the owning file's declared type.
    pub source_type: String,
    pub display_name: String,
}

/// An embedded chunk ready for the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(metadata: ChunkMetadata, text: String, vector: Vec<f32>) -> Self {
        Self {
            id: chunk_id(&metadata.owner_file_id, metadata.sequence_index),
            text,
            vector,
            metadata,
        }
    }
}

/// Stable chunk identity: `owner_file_id:sequence_index`.
///
/// Re-deriving a chunk from unchanged content yields the same id, so a
/// retried or repeated upsert overwrites instead of duplicating.
pub fn chunk_id(owner_file_id: &str, sequence_index: u32) -> String {
    format!("{}:{}", owner_file_id, sequence_index)
}

/// A chunk returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Cosine similarity with the query vector.
    pub score: f64,
}

/// A file-level search result, aggregated over its matching chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMatch {
    pub file_id: String,
    pub display_name: String,
    pub declared_type: String,
    pub score: f64,
    pub matched_chunks: usize,
    /// Text of the single best-scoring chunk, possibly truncated.
    pub preview: String,
}

/// Stage of an indexing attempt for one file.
///
/// ```text
/// Pending → Extracting → Chunking → Embedding → Upserting → Done
///              └──────→ Skipped
/// any stage ──────────→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Pending,
    Extracting,
    Chunking,
    Embedding,
    Upserting,
    Done,
    Skipped,
    Failed,
}

impl IndexState {
    pub const ALL: [IndexState; 8] = [
        IndexState::Pending,
        IndexState::Extracting,
        IndexState::Chunking,
        IndexState::Embedding,
        IndexState::Upserting,
        IndexState::Done,
        IndexState::Skipped,
        IndexState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Pending => "pending",
            IndexState::Extracting => "extracting",
            IndexState::Chunking => "chunking",
            IndexState::Embedding => "embedding",
            IndexState::Upserting => "upserting",
            IndexState::Done => "done",
            IndexState::Skipped => "skipped",
            IndexState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IndexState::Done | IndexState::Skipped | IndexState::Failed
        )
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IndexState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown index state: {}", s))
    }
}

/// Terminal result of one indexing attempt (or of an attempt series).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum IndexOutcome {
    Done { chunks: usize },
    Skipped { reason: String },
    Failed { error: String, attempts: u32 },
}

impl IndexOutcome {
    pub fn state(&self) -> IndexState {
        match self {
            IndexOutcome::Done { .. } => IndexState::Done,
            IndexOutcome::Skipped { .. } => IndexState::Skipped,
            IndexOutcome::Failed { .. } => IndexState::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_owner_and_index() {
        let meta = ChunkMetadata {
            owner_file_id: "f-1".into(),
            sequence_index: 3,
            source_type: "text/plain".into(),
            display_name: "a.txt".into(),
        };
        let chunk = Chunk::new(meta, "text".into(), vec![0.0]);
        assert_eq!(chunk.id, "f-1:3");
        assert_eq!(chunk.id, chunk_id("f-1", 3));
    }

    #[test]
    fn index_state_string_roundtrip() {
        for state in IndexState::ALL {
            assert_eq!(state.as_str().parse::<IndexState>().unwrap(), state);
        }
        assert!("bogus".parse::<IndexState>().is_err());
    }

    #[test]
    fn outcome_maps_to_terminal_state() {
        assert!(IndexOutcome::Done { chunks: 1 }.state().is_terminal());
        assert_eq!(
            IndexOutcome::Skipped {
                reason: "x".into()
            }
            .state(),
            IndexState::Skipped
        );
        assert!(!IndexState::Embedding.is_terminal());
    }
}
