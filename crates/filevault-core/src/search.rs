//! Semantic search aggregated per file.
//!
//! The core search algorithm works only through the [`Embedder`],
//! [`VectorIndex`] and [`FileCatalog`] traits. The app crate supplies
//! concrete implementations and [`SearchLimits`] from its config.
//!
//! # Algorithm
//!
//! 1. Validate and normalize the request (query length, `top_k`, threshold).
//! 2. Embed the query.
//! 3. Fetch `top_k × overfetch_factor` chunks from the index.
//! 4. Group chunks by owning file, dropping files that no longer exist.
//! 5. Aggregate each file's chunk scores (`max`, `mean` or `weighted`).
//! 6. Drop files whose aggregate is below the threshold.
//! 7. Sort by score (desc), then file id (asc), and keep `top_k`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::embedding::{embed_query, Embedder};
use crate::error::VaultError;
use crate::index::VectorIndex;
use crate::models::{ChunkHit, FileMatch};

pub const MIN_QUERY_CHARS: usize = 3;
pub const MAX_QUERY_CHARS: usize = 500;

/// How per-chunk scores combine into one per-file score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Best chunk score.
    #[default]
    Max,
    /// Arithmetic mean over matched chunks.
    Mean,
    /// Mean weighted by `1 / rank`, so lower-ranked chunks count less.
    Weighted,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Max => "max",
            Aggregation::Mean => "mean",
            Aggregation::Weighted => "weighted",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" => Ok(Aggregation::Max),
            "mean" => Ok(Aggregation::Mean),
            "weighted" => Ok(Aggregation::Weighted),
            other => bail!(VaultError::Validation(format!(
                "unknown aggregation '{}'; use max, mean, or weighted",
                other
            ))),
        }
    }
}

/// Search tuning, decoupled from application config.
#[derive(Debug, Clone)]
pub struct SearchLimits {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub default_threshold: f64,
    pub overfetch_factor: usize,
    pub preview_chars: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            max_top_k: 50,
            default_threshold: 0.5,
            overfetch_factor: 5,
            preview_chars: 200,
        }
    }
}

/// A caller's search request. Unset fields take [`SearchLimits`] defaults.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub threshold: Option<f64>,
    pub aggregation: Aggregation,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Check bounds and fill defaults. Errors are [`VaultError::Validation`].
    pub fn validate(&self, limits: &SearchLimits) -> Result<ValidatedSearch> {
        let query = normalize_query(&self.query)?;

        let top_k = self.top_k.unwrap_or(limits.default_top_k);
        if top_k == 0 || top_k > limits.max_top_k {
            bail!(VaultError::Validation(format!(
                "top_k must be between 1 and {}, got {}",
                limits.max_top_k, top_k
            )));
        }

        let threshold = self.threshold.unwrap_or(limits.default_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            bail!(VaultError::Validation(format!(
                "threshold must be between 0 and 1, got {}",
                threshold
            )));
        }

        Ok(ValidatedSearch {
            query,
            top_k,
            threshold,
            aggregation: self.aggregation,
        })
    }
}

/// A request that passed [`SearchRequest::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSearch {
    pub query: String,
    pub top_k: usize,
    pub threshold: f64,
    pub aggregation: Aggregation,
}

/// Trim the query, reject it if too short, and cap its length.
pub fn normalize_query(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    if len < MIN_QUERY_CHARS {
        bail!(VaultError::Validation(format!(
            "query must be at least {} characters",
            MIN_QUERY_CHARS
        )));
    }
    Ok(trimmed.chars().take(MAX_QUERY_CHARS).collect())
}

/// Tells the aggregator which file ids still exist.
#[async_trait]
pub trait FileCatalog: Send + Sync {
    /// Subset of `file_ids` that currently exist.
    async fn existing(&self, file_ids: &[String]) -> Result<HashSet<String>>;
}

/// Chunks of one file matched by a query, in descending score order.
#[derive(Debug, Clone)]
pub struct FileGroup {
    pub file_id: String,
    pub display_name: String,
    pub declared_type: String,
    pub scores: Vec<f64>,
    pub best_text: String,
}

/// Group ranked hits by owning file, preserving rank order within each
/// group and first-seen order across groups.
pub fn group_by_file(hits: Vec<ChunkHit>) -> Vec<FileGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, FileGroup> = HashMap::new();

    for hit in hits {
        let owner = hit.metadata.owner_file_id.clone();
        match groups.get_mut(&owner) {
            Some(group) => group.scores.push(hit.score),
            None => {
                order.push(owner.clone());
                groups.insert(
                    owner.clone(),
                    FileGroup {
                        file_id: owner,
                        display_name: hit.metadata.display_name,
                        declared_type: hit.metadata.source_type,
                        scores: vec![hit.score],
                        best_text: hit.text,
                    },
                );
            }
        }
    }

    for group in groups.values_mut() {
        group
            .scores
            .sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    }

    order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .collect()
}

/// Combine descending-ordered chunk scores into one file score.
pub fn aggregate_score(scores: &[f64], aggregation: Aggregation) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    match aggregation {
        Aggregation::Max => scores.iter().copied().fold(f64::MIN, f64::max),
        Aggregation::Mean => scores.iter().sum::<f64>() / scores.len() as f64,
        Aggregation::Weighted => {
            let (num, den) = scores
                .iter()
                .enumerate()
                .fold((0.0, 0.0), |(num, den), (i, s)| {
                    let w = 1.0 / (i as f64 + 1.0);
                    (num + w * s, den + w)
                });
            num / den
        }
    }
}

/// Truncate `text` to `max_chars` characters, marking the cut with `...`.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Score, filter, sort and truncate grouped hits.
pub fn rank_files(
    groups: Vec<FileGroup>,
    search: &ValidatedSearch,
    preview_chars: usize,
) -> Vec<FileMatch> {
    let mut scored: Vec<(f64, FileGroup)> = groups
        .into_iter()
        .map(|g| (aggregate_score(&g.scores, search.aggregation), g))
        .filter(|(score, _)| *score >= search.threshold)
        .collect();

    scored.sort_by(|(sa, a), (sb, b)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.file_id.cmp(&b.file_id))
    });
    scored.truncate(search.top_k);

    scored
        .into_iter()
        .map(|(score, g)| FileMatch {
            matched_chunks: g.scores.len(),
            preview: preview(&g.best_text, preview_chars),
            file_id: g.file_id,
            display_name: g.display_name,
            declared_type: g.declared_type,
            score: round4(score),
        })
        .collect()
}

/// Run a semantic search end to end.
///
/// Embedder or index failures surface as
/// [`VaultError::TransientStore`], never as an empty result.
pub async fn search(
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    catalog: &dyn FileCatalog,
    request: &SearchRequest,
    limits: &SearchLimits,
) -> Result<Vec<FileMatch>> {
    let validated = request.validate(limits)?;

    let query_vec = embed_query(embedder, &validated.query)
        .await
        .map_err(VaultError::into_transient)?;

    let fetch = validated.top_k * limits.overfetch_factor.max(1);
    let hits = index
        .query(&query_vec, fetch)
        .await
        .map_err(VaultError::into_transient)?;

    let groups = group_by_file(hits);
    let ids: Vec<String> = groups.iter().map(|g| g.file_id.clone()).collect();
    let live = catalog
        .existing(&ids)
        .await
        .map_err(VaultError::into_transient)?;
    let groups = groups
        .into_iter()
        .filter(|g| live.contains(&g.file_id))
        .collect();

    Ok(rank_files(groups, &validated, limits.preview_chars))
}
