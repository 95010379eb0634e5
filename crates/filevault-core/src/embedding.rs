//! Embedder trait, batching helpers, and vector utilities.
//!
//! Defines the [`Embedder`] trait that all embedding backends implement and
//! the deterministic [`HashEmbedder`] used offline and in tests. Network and
//! model-backed providers (OpenAI, Ollama, fastembed) live in the
//! `filevault` app crate.

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::error::VaultError;

/// A backend that maps text to fixed-dimension vectors.
///
/// `embed` must return exactly one vector per input, in input order, each
/// of length [`Embedder::dims`].
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"all-minilm-l6-v2"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `384`).
    fn dims(&self) -> usize;
    /// Embed one batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed `texts` in batches of at most `batch_size`, checking the shape of
/// every batch the provider returns.
pub async fn embed_batched(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let batch_size = batch_size.max(1);
    let mut out = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size) {
        let vectors = embedder.embed(batch).await?;
        if vectors.len() != batch.len() {
            bail!(VaultError::Consistency(format!(
                "embedder {} returned {} vectors for {} inputs",
                embedder.model_name(),
                vectors.len(),
                batch.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != embedder.dims()) {
            bail!(VaultError::Consistency(format!(
                "embedder {} returned a {}-dim vector, expected {}",
                embedder.model_name(),
                bad.len(),
                embedder.dims()
            )));
        }
        out.extend(vectors);
    }

    Ok(out)
}

/// Embed a single query string.
pub async fn embed_query(embedder: &dyn Embedder, query: &str) -> Result<Vec<f32>> {
    let mut vectors = embed_batched(embedder, &[query.to_string()], 1).await?;
    vectors
        .pop()
        .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for query"))
}

/// Deterministic feature-hashing embedder.
///
/// Lowercased alphanumeric words and adjacent word pairs are hashed into
/// `dims` signed buckets and the result is L2-normalised. Texts sharing
/// vocabulary score high cosine similarity; identical texts score 1.0.
/// Needs no model download or network.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
    model: String,
}

const BIGRAM_WEIGHT: f32 = 0.5;

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            model: format!("feature-hash-{}", dims.max(1)),
        }
    }

    /// Embed a single text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        for w in &words {
            self.bump(&mut v, w.as_bytes(), 1.0);
        }
        for pair in words.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            self.bump(&mut v, joined.as_bytes(), BIGRAM_WEIGHT);
        }

        normalize(&mut v);
        v
    }

    fn bump(&self, v: &mut [f32], feature: &[u8], weight: f32) {
        let h = fnv1a(feature);
        let bucket = (h % self.dims as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Scale `v` to unit length in place. Zero vectors are left as is.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use filevault_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, zero vectors, or mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ShortEmbedder;

    #[async_trait]
    impl Embedder for ShortEmbedder {
        fn model_name(&self) -> &str {
            "short"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().skip(1).map(|_| vec![0.0; 4]).collect())
        }
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_degenerate() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_hash_embedder_deterministic_unit_length() {
        let e = HashEmbedder::new(64);
        let a = e.embed_one("The quick brown fox");
        let b = e.embed_one("the QUICK brown, fox!");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_similarity_tracks_vocabulary() {
        let e = HashEmbedder::default();
        let doc = e.embed_one("rust ownership and borrowing rules explained");
        let close = e.embed_one("ownership and borrowing in rust");
        let far = e.embed_one("banana bread recipe with walnuts");
        assert!(cosine_similarity(&doc, &close) > cosine_similarity(&doc, &far));
    }

    #[tokio::test]
    async fn test_embed_batched_preserves_order() {
        let e = HashEmbedder::new(32);
        let texts: Vec<String> = (0..7).map(|i| format!("text number {}", i)).collect();
        let vectors = embed_batched(&e, &texts, 3).await.unwrap();
        assert_eq!(vectors.len(), 7);
        for (t, v) in texts.iter().zip(&vectors) {
            assert_eq!(&e.embed_one(t), v);
        }
    }

    #[tokio::test]
    async fn test_embed_batched_rejects_short_batch() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let err = embed_batched(&ShortEmbedder, &texts, 8).await.unwrap_err();
        assert!(matches!(
            VaultError::classify(&err),
            Some(VaultError::Consistency(_))
        ));
    }

    #[tokio::test]
    async fn test_embed_query_single_vector() {
        let e = HashEmbedder::new(16);
        let v = embed_query(&e, "hello there").await.unwrap();
        assert_eq!(v.len(), 16);
    }
}
