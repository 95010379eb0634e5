//! The vault facade: uploads, deletes, reads, search, and index admin.
//!
//! [`Vault`] ties the content store, the `files` table, and the indexing
//! orchestrator together and is what the CLI and integration tests drive.
//!
//! # Upload
//!
//! Under the per-fingerprint lock, one transaction takes a content
//! reference (writing the bytes on first reference), inserts the file row,
//! and seeds `index_status`. Indexing runs after commit: inline for small
//! files, on the background queue otherwise. An indexing failure never
//! fails the upload.
//!
//! # Delete
//!
//! One transaction removes the file row, drops the content reference, and
//! records a pending cleanup for the file's chunks. After commit the bytes
//! are purged if that was the last reference and the chunk cleanup is
//! queued.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use filevault_core::embedding::Embedder;
use filevault_core::index::VectorIndex;
use filevault_core::models::{FileMatch, FileRecord, IndexOutcome, IndexState};
use filevault_core::search::{self, SearchRequest};
use filevault_core::{Fingerprint, VaultError};

use crate::cas::{self, ContentStore, MAX_PUT_ATTEMPTS};
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::extract::{guess_declared_type, DefaultExtractor, Extractor};
use crate::files::{self, SqliteFileCatalog};
use crate::indexer::{
    not_found, Indexer, IndexerSettings, IndexStatus, Job, PendingCleanup, ReindexReport,
    RepairReport,
};
use crate::migrate;
use crate::stats::VaultStats;
use crate::vector_index::SqliteVectorIndex;

/// Overrides for the pluggable parts of a vault. Unset fields are built
/// from the config.
#[derive(Default)]
pub struct Components {
    pub embedder: Option<Arc<dyn Embedder>>,
    pub index: Option<Arc<dyn VectorIndex>>,
    pub extractor: Option<Arc<dyn Extractor>>,
}

/// How indexing of a fresh upload was handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "indexing", rename_all = "lowercase")]
pub enum IndexingDisposition {
    /// Ran on the upload path. A failure here has already been handed to
    /// the background queue for the remaining attempts.
    Inline { outcome: IndexOutcome },
    /// Too large for the upload path; queued.
    Queued,
    /// No embedding provider configured.
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub file: FileRecord,
    /// False when the bytes were already stored for another file.
    pub is_new_content: bool,
    pub reference_count: u32,
    pub indexing: IndexingDisposition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub file_id: String,
    pub fingerprint: Fingerprint,
    pub remaining_references: u32,
    /// True when the last reference went and the bytes were removed.
    pub content_deleted: bool,
}

pub struct Vault {
    config: Config,
    pool: SqlitePool,
    cas: ContentStore,
    catalog: SqliteFileCatalog,
    indexer: Indexer,
}

impl Vault {
    /// Open (creating if needed) the vault described by `config`.
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with(config, Components::default()).await
    }

    pub async fn open_with(config: Config, components: Components) -> Result<Self> {
        config.validate()?;

        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        tokio::fs::create_dir_all(&config.storage.root)
            .await
            .with_context(|| format!("creating {}", config.storage.root.display()))?;

        let embedder = match components.embedder {
            Some(e) => e,
            None => create_embedder(&config.embedding)?,
        };
        let index = match components.index {
            Some(i) => i,
            None => Arc::new(SqliteVectorIndex::new(pool.clone(), embedder.model_name())),
        };
        let extractor = components
            .extractor
            .unwrap_or_else(|| Arc::new(DefaultExtractor));

        let cas = ContentStore::new(pool.clone(), config.storage.root.clone());
        let indexer = Indexer::start(
            pool.clone(),
            cas.clone(),
            extractor,
            embedder,
            index,
            IndexerSettings::from_config(&config),
        );

        let vault = Self {
            catalog: SqliteFileCatalog::new(pool.clone()),
            config,
            pool,
            cas,
            indexer,
        };

        if let Err(e) = vault.indexer.resume().await {
            warn!(error = %format!("{:#}", e), "startup recovery failed");
        }
        debug!(root = %vault.config.storage.root.display(), "vault open");
        Ok(vault)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.cas
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    /// Store `bytes` as a new file. `declared_type` defaults to a guess
    /// from the name's extension.
    pub async fn upload(
        &self,
        bytes: &[u8],
        display_name: &str,
        declared_type: Option<&str>,
    ) -> Result<UploadOutcome> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            bail!(VaultError::Validation("display name must not be empty".into()));
        }
        if bytes.len() as u64 > self.config.storage.max_upload_bytes {
            bail!(VaultError::Validation(format!(
                "upload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.config.storage.max_upload_bytes
            )));
        }
        let declared_type = match declared_type.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => guess_declared_type(display_name).to_string(),
        };

        let fingerprint = Fingerprint::of_bytes(bytes);
        let now = Utc::now();
        let mut file = FileRecord {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            declared_type,
            content_fingerprint: fingerprint.clone(),
            size_bytes: bytes.len() as u64,
            created_at: DateTime::<Utc>::from_timestamp(now.timestamp(), 0).unwrap_or(now),
        };
        let indexing_enabled = self.config.embedding.is_enabled();
        let initial_state = if indexing_enabled {
            IndexState::Pending
        } else {
            IndexState::Skipped
        };

        let acquired = {
            let _guard = self.cas.lock(&fingerprint).await;
            let mut attempt = 0;
            loop {
                attempt += 1;
                let mut tx = self.pool.begin().await?;
                let acquired = match self.cas.acquire(&mut *tx, &fingerprint, bytes).await {
                    Ok(a) => a,
                    Err(e) if cas::is_race(&e) && attempt < MAX_PUT_ATTEMPTS => {
                        debug!(fingerprint = %fingerprint, attempt, "insert race; retrying upload");
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let staged = async {
                    files::insert(&mut *tx, &file).await?;
                    sqlx::query(
                        r#"
                        INSERT INTO index_status (file_id, state, attempts, chunk_count, last_error, updated_at)
                        VALUES (?, ?, 0, 0, ?, ?)
                        "#,
                    )
                    .bind(&file.id)
                    .bind(initial_state.as_str())
                    .bind((!indexing_enabled).then_some("embedding disabled"))
                    .bind(now.timestamp())
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    Ok::<_, anyhow::Error>(())
                }
                .await;

                if let Err(e) = staged {
                    self.cas.discard(&acquired).await;
                    return Err(e.context("recording upload"));
                }
                break acquired;
            }
        };
        file.size_bytes = acquired.content.size_bytes;

        info!(
            file_id = %file.id,
            name = %file.display_name,
            fingerprint = %fingerprint,
            new_content = acquired.is_new_content,
            references = acquired.content.reference_count,
            "file uploaded"
        );

        let indexing = if !indexing_enabled {
            IndexingDisposition::Disabled
        } else if file.size_bytes <= self.config.indexing.inline_max_bytes {
            IndexingDisposition::Inline {
                outcome: self.indexer.index_inline(&file.id).await,
            }
        } else {
            self.indexer.enqueue(Job::Index {
                file_id: file.id.clone(),
                first_attempt: 1,
            });
            IndexingDisposition::Queued
        };

        Ok(UploadOutcome {
            file,
            is_new_content: acquired.is_new_content,
            reference_count: acquired.content.reference_count,
            indexing,
        })
    }

    /// Delete a file. Its bytes go with the last reference; its chunks are
    /// removed by a queued cleanup.
    pub async fn delete(&self, file_id: &str) -> Result<DeleteOutcome> {
        let Some(file) = files::get(&self.pool, file_id).await? else {
            return Err(not_found(file_id));
        };
        let fingerprint = file.content_fingerprint;

        let (remaining, content_deleted) = {
            let _guard = self.cas.lock(&fingerprint).await;

            let mut tx = self.pool.begin().await?;
            if files::delete(&mut *tx, file_id).await?.is_none() {
                return Err(not_found(file_id));
            }
            let remaining = self.cas.decrement(&mut *tx, &fingerprint).await?;
            let now = Utc::now().timestamp();
            sqlx::query(
                r#"
                INSERT INTO pending_cleanups (file_id, attempts, alarmed, last_error, created_at, updated_at)
                VALUES (?, 0, 0, NULL, ?, ?)
                ON CONFLICT(file_id) DO NOTHING
                "#,
            )
            .bind(file_id)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            let content_deleted = if remaining == 0 {
                match self.cas.purge(&fingerprint).await {
                    Ok(deleted) => deleted,
                    Err(e) => {
                        warn!(
                            fingerprint = %fingerprint,
                            error = %format!("{:#}", e),
                            "content left orphaned; repair will retry"
                        );
                        false
                    }
                }
            } else {
                false
            };
            (remaining, content_deleted)
        };

        self.indexer.enqueue(Job::Cleanup {
            file_id: file_id.to_string(),
        });

        info!(
            file_id,
            fingerprint = %fingerprint,
            remaining,
            content_deleted,
            "file deleted"
        );
        Ok(DeleteOutcome {
            file_id: file_id.to_string(),
            fingerprint,
            remaining_references: remaining,
            content_deleted,
        })
    }

    pub async fn get(&self, file_id: &str) -> Result<FileRecord> {
        files::get(&self.pool, file_id)
            .await?
            .ok_or_else(|| not_found(file_id))
    }

    /// A file's metadata and stored bytes.
    pub async fn read(&self, file_id: &str) -> Result<(FileRecord, Vec<u8>)> {
        let file = self.get(file_id).await?;
        let bytes = self.cas.read(&file.content_fingerprint).await?;
        Ok((file, bytes))
    }

    pub async fn list(&self) -> Result<Vec<FileRecord>> {
        files::list(&self.pool).await
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<FileMatch>> {
        search::search(
            self.indexer.embedder().as_ref(),
            self.indexer.index().as_ref(),
            &self.catalog,
            request,
            &self.config.search.limits(),
        )
        .await
    }

    /// Purge and rebuild one file's chunks, waiting for the result.
    pub async fn reindex(&self, file_id: &str) -> Result<IndexOutcome> {
        self.get(file_id).await?;
        Ok(self.indexer.reindex(file_id).await)
    }

    pub async fn reindex_all(&self) -> Result<ReindexReport> {
        self.indexer.reindex_all().await
    }

    /// Drop every chunk. Files and contents are untouched.
    pub async fn reset_index(&self) -> Result<u64> {
        self.indexer.reset().await
    }

    pub async fn index_status(&self, file_id: &str) -> Result<Option<IndexStatus>> {
        self.indexer.status(file_id).await
    }

    pub async fn pending_cleanups(&self) -> Result<Vec<PendingCleanup>> {
        self.indexer.pending_cleanups().await
    }

    pub async fn repair(&self) -> Result<RepairReport> {
        self.indexer.repair().await
    }

    pub async fn stats(&self) -> Result<VaultStats> {
        let storage = self.cas.metrics().await?;
        let index = self.indexer.index();
        let embedder = self.indexer.embedder();
        let cleanups = self.indexer.pending_cleanups().await?;
        Ok(VaultStats {
            storage,
            chunks: index.count().await?,
            embedding_model: embedder.model_name().to_string(),
            embedding_dims: embedder.dims(),
            index_states: self
                .indexer
                .state_counts()
                .await?
                .into_iter()
                .map(|(state, n)| (state.as_str().to_string(), n))
                .collect(),
            pending_cleanups: cleanups.iter().filter(|c| !c.alarmed).count() as u64,
            alarmed_cleanups: cleanups.iter().filter(|c| c.alarmed).count() as u64,
        })
    }

    /// Wait for queued indexing and cleanup jobs to finish.
    pub async fn wait_idle(&self) {
        self.indexer.wait_idle().await
    }

    /// Drain background work and close the database.
    pub async fn shutdown(self) {
        self.indexer.shutdown().await;
        self.pool.close().await;
    }
}
