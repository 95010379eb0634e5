//! TOML configuration.
//!
//! Every section except `[db]` and `[storage]` is optional; missing keys
//! take the defaults below. [`load_config`] validates the result and bails
//! on values the rest of the vault cannot work with.
//!
//! ```toml
//! [db]
//! path = "./data/vault.sqlite"
//!
//! [storage]
//! root = "./data/store"
//!
//! [embedding]
//! provider = "hash"
//! dims = 384
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use filevault_core::chunk::ChunkParams;
use filevault_core::search::SearchLimits;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

fn default_max_upload_bytes() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_tokens")]
    pub window_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_tokens: default_window_tokens(),
            overlap_tokens: default_overlap_tokens(),
            min_tokens: default_min_tokens(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            window_tokens: self.window_tokens,
            overlap_tokens: self.overlap_tokens,
            min_tokens: self.min_tokens,
        }
    }
}

fn default_window_tokens() -> usize {
    500
}
fn default_overlap_tokens() -> usize {
    50
}
fn default_min_tokens() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the ollama provider (and OpenAI-compatible proxies).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_inline_max_bytes")]
    pub inline_max_bytes: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_cleanup_max_attempts")]
    pub cleanup_max_attempts: u32,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            inline_max_bytes: default_inline_max_bytes(),
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            cleanup_max_attempts: default_cleanup_max_attempts(),
        }
    }
}

fn default_inline_max_bytes() -> u64 {
    256 * 1024
}
fn default_workers() -> usize {
    2
}
fn default_max_attempts() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_cleanup_max_attempts() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            default_threshold: default_threshold(),
            overfetch_factor: default_overfetch_factor(),
            preview_chars: default_preview_chars(),
        }
    }
}

impl SearchConfig {
    pub fn limits(&self) -> SearchLimits {
        SearchLimits {
            default_top_k: self.default_top_k,
            max_top_k: self.max_top_k,
            default_threshold: self.default_threshold,
            overfetch_factor: self.overfetch_factor,
            preview_chars: self.preview_chars,
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_max_top_k() -> usize {
    50
}
fn default_threshold() -> f64 {
    0.5
}
fn default_overfetch_factor() -> usize {
    5
}
fn default_preview_chars() -> usize {
    200
}

impl Config {
    /// A config with every optional section at its default.
    pub fn with_paths(db_path: impl Into<PathBuf>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            storage: StorageConfig {
                root: storage_root.into(),
                max_upload_bytes: default_max_upload_bytes(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            indexing: IndexingConfig::default(),
            search: SearchConfig::default(),
        }
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_upload_bytes == 0 {
            bail!("storage.max_upload_bytes must be > 0");
        }

        if self.chunking.window_tokens == 0 {
            bail!("chunking.window_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.window_tokens {
            bail!("chunking.overlap_tokens must be < chunking.window_tokens");
        }
        if self.chunking.min_tokens > self.chunking.window_tokens {
            bail!("chunking.min_tokens must be <= chunking.window_tokens");
        }

        match self.embedding.provider.as_str() {
            "hash" | "disabled" => {}
            "openai" | "ollama" | "local" => {
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, ollama, local, or disabled.",
                other
            ),
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }
        if matches!(self.embedding.provider.as_str(), "openai" | "ollama")
            && self.embedding.dims.is_none()
        {
            bail!(
                "embedding.dims must be specified when provider is '{}'",
                self.embedding.provider
            );
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        if self.indexing.workers == 0 {
            bail!("indexing.workers must be >= 1");
        }
        if self.indexing.max_attempts == 0 {
            bail!("indexing.max_attempts must be >= 1");
        }
        if self.indexing.cleanup_max_attempts == 0 {
            bail!("indexing.cleanup_max_attempts must be >= 1");
        }

        if self.search.max_top_k == 0 {
            bail!("search.max_top_k must be >= 1");
        }
        if self.search.default_top_k == 0 || self.search.default_top_k > self.search.max_top_k {
            bail!("search.default_top_k must be in [1, search.max_top_k]");
        }
        if !(0.0..=1.0).contains(&self.search.default_threshold) {
            bail!("search.default_threshold must be in [0.0, 1.0]");
        }
        if self.search.overfetch_factor == 0 {
            bail!("search.overfetch_factor must be >= 1");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
