//! Indexing orchestrator.
//!
//! Drives extract → chunk → embed → upsert for one file at a time and owns
//! the deletion cleanup path. Each attempt walks the state machine
//!
//! ```text
//! Pending → Extracting → Chunking → Embedding → Upserting → Done
//!              └──────→ Skipped (not extractable, nothing to chunk, file gone)
//! any stage ──────────→ Failed
//! ```
//!
//! and records every transition in `index_status`.
//!
//! # Concurrency
//!
//! A per-file [`KeyedLocks`] entry serializes indexing attempts and cleanup
//! for one file: a second trigger queues behind the first instead of running
//! beside it. Background work goes through an unbounded `mpsc` queue drained
//! by `indexing.workers` tasks.
//!
//! # Deletion
//!
//! A file delete writes a `pending_cleanups` row in the same transaction that
//! removes the file. The cleanup job calls `delete_by_owner` until it
//! succeeds, removing the row, or until `cleanup_max_attempts` is spent, at
//! which point the row is marked alarmed and an `error!` is emitted on the
//! `filevault::alarm` target. [`Indexer::repair`] re-drives every row.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use filevault_core::chunk::{chunk_text, ChunkParams};
use filevault_core::embedding::{embed_batched, Embedder};
use filevault_core::index::VectorIndex;
use filevault_core::locks::KeyedLocks;
use filevault_core::models::{Chunk, ChunkMetadata, FileRecord, IndexOutcome, IndexState};
use filevault_core::VaultError;

use crate::cas::ContentStore;
use crate::config::Config;
use crate::extract::{Extraction, Extractor};
use crate::files;

pub const ALARM_TARGET: &str = "filevault::alarm";

#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub chunking: ChunkParams,
    pub batch_size: usize,
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub cleanup_max_attempts: u32,
}

impl IndexerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: config.chunking.params(),
            batch_size: config.embedding.batch_size,
            workers: config.indexing.workers,
            max_attempts: config.indexing.max_attempts,
            backoff_base: Duration::from_millis(config.indexing.backoff_base_ms),
            cleanup_max_attempts: config.indexing.cleanup_max_attempts,
        }
    }
}

/// Delay before attempt `attempt` (1-based): none for the first, then
/// `base · 2^(attempt-2)`, capped at `base · 2^5`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    base * (1u32 << (attempt - 2).min(5))
}

/// Background work items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Index a new file, starting at the given attempt number.
    Index { file_id: String, first_attempt: u32 },
    /// Purge and rebuild a file's chunks.
    Reindex { file_id: String },
    /// Remove the chunks of a deleted file.
    Cleanup { file_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Index,
    Reindex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum CleanupOutcome {
    /// Chunks removed and the outbox row cleared.
    Completed { removed: u64 },
    /// No outbox row: nothing left to do.
    NotPending,
    /// Attempts exhausted; the row is marked alarmed.
    Alarmed { attempts: u32, error: String },
}

/// Latest indexing state of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    pub file_id: String,
    pub state: IndexState,
    pub attempts: u32,
    pub chunk_count: u64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

/// A row of the deletion outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCleanup {
    pub file_id: String,
    pub attempts: u32,
    pub alarmed: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub indexed: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub cleanups_completed: u64,
    pub cleanups_alarmed: u64,
    pub indexing_requeued: u64,
    pub corrupt_contents: u64,
    pub orphans_purged: u64,
    pub orphans_failed: u64,
}

struct Inner {
    pool: SqlitePool,
    cas: ContentStore,
    extractor: Arc<dyn Extractor>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    settings: IndexerSettings,
    file_locks: KeyedLocks,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

#[derive(Clone)]
pub struct Indexer {
    inner: Arc<Inner>,
}

impl Indexer {
    /// Build the orchestrator and spawn its worker tasks. Must be called
    /// inside a tokio runtime.
    pub fn start(
        pool: SqlitePool,
        cas: ContentStore,
        extractor: Arc<dyn Extractor>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        settings: IndexerSettings,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let workers = settings.workers.max(1);
        let inner = Arc::new(Inner {
            pool,
            cas,
            extractor,
            embedder,
            index,
            settings,
            file_locks: KeyedLocks::new(),
            sender: Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        let indexer = Self { inner };

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let this = indexer.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    this.run_job(job).await;
                    if this.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                        this.inner.idle.notify_waiters();
                    }
                }
                debug!(worker, "indexing worker stopped");
            }));
        }
        if let Ok(mut slot) = indexer.inner.workers.try_lock() {
            *slot = handles;
        }
        indexer
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.inner.embedder
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.inner.index
    }

    /// Queue a job. Returns false if the queue is shut down; durable state
    /// (`index_status`, `pending_cleanups`) lets the next open or `repair` pick it up.
    pub fn enqueue(&self, job: Job) -> bool {
        let guard = match self.inner.sender.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(sender) = guard.as_ref() else {
            warn!(?job, "indexing queue closed; job dropped");
            return false;
        };
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        if sender.send(job).is_err() {
            self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Wait until every queued job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Close the queue and wait for workers to drain it.
    pub async fn shutdown(&self) {
        let sender = match self.inner.sender.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
        let handles = std::mem::take(&mut *self.inner.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "indexing worker ended abnormally");
            }
        }
        info!("indexer shut down");
    }

    async fn run_job(&self, job: Job) {
        match job {
            Job::Index {
                file_id,
                first_attempt,
            } => {
                self.run_with_retries(&file_id, Mode::Index, first_attempt)
                    .await;
            }
            Job::Reindex { file_id } => {
                self.run_with_retries(&file_id, Mode::Reindex, 1).await;
            }
            Job::Cleanup { file_id } => {
                if let Err(e) = self.cleanup(&file_id).await {
                    warn!(file_id = %file_id, error = %format!("{:#}", e), "cleanup job failed");
                }
            }
        }
    }

    /// One attempt on the caller's task; on failure the remaining attempts
    /// move to the background queue.
    pub async fn index_inline(&self, file_id: &str) -> IndexOutcome {
        let outcome = self.attempt(file_id, Mode::Index, 1).await;
        if matches!(outcome, IndexOutcome::Failed { .. }) && self.inner.settings.max_attempts > 1 {
            info!(file_id, "inline indexing failed; handing off to background");
            self.enqueue(Job::Index {
                file_id: file_id.to_string(),
                first_attempt: 2,
            });
        }
        outcome
    }

    /// Rebuild one file's chunks now, retrying with backoff.
    pub async fn reindex(&self, file_id: &str) -> IndexOutcome {
        self.run_with_retries(file_id, Mode::Reindex, 1).await
    }

    /// Rebuild every file sequentially.
    pub async fn reindex_all(&self) -> Result<ReindexReport> {
        let mut report = ReindexReport::default();
        for file_id in files::list_ids(&self.inner.pool).await? {
            match self.reindex(&file_id).await {
                IndexOutcome::Done { .. } => report.indexed += 1,
                IndexOutcome::Skipped { .. } => report.skipped += 1,
                IndexOutcome::Failed { .. } => report.failed += 1,
            }
        }
        info!(
            indexed = report.indexed,
            skipped = report.skipped,
            failed = report.failed,
            "reindex complete"
        );
        Ok(report)
    }

    /// Drop every chunk and every status row. Returns chunks removed.
    pub async fn reset(&self) -> Result<u64> {
        let removed = self.inner.index.reset().await?;
        sqlx::query("DELETE FROM index_status")
            .execute(&self.inner.pool)
            .await?;
        info!(removed, "index reset");
        Ok(removed)
    }

    async fn run_with_retries(&self, file_id: &str, mode: Mode, first_attempt: u32) -> IndexOutcome {
        let max = self.inner.settings.max_attempts.max(1);
        let mut attempt = first_attempt.max(1);
        loop {
            let delay = backoff_delay(self.inner.settings.backoff_base, attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = self.attempt(file_id, mode, attempt).await;
            match outcome {
                IndexOutcome::Failed { .. } if attempt < max => {
                    debug!(file_id, attempt, "indexing attempt failed; retrying");
                    attempt += 1;
                }
                IndexOutcome::Failed { ref error, .. } => {
                    warn!(file_id, attempts = attempt, error = %error, "indexing gave up");
                    return outcome;
                }
                _ => return outcome,
            }
        }
    }

    /// One pass through the state machine under the file's lock.
    async fn attempt(&self, file_id: &str, mode: Mode, attempt: u32) -> IndexOutcome {
        let _guard = self.inner.file_locks.lock(file_id).await;

        let file = match files::get(&self.inner.pool, file_id).await {
            Ok(Some(file)) => file,
            Ok(None) => {
                debug!(file_id, "file deleted before indexing");
                return IndexOutcome::Skipped {
                    reason: "file deleted".to_string(),
                };
            }
            Err(e) => {
                return IndexOutcome::Failed {
                    error: format!("{:#}", e),
                    attempts: attempt,
                }
            }
        };

        match self.pipeline(&file, mode, attempt).await {
            Ok(outcome) => {
                let (chunks, error) = match &outcome {
                    IndexOutcome::Done { chunks } => (*chunks as u64, None),
                    IndexOutcome::Skipped { reason } => (0, Some(reason.as_str())),
                    IndexOutcome::Failed { error, .. } => (0, Some(error.as_str())),
                };
                self.record_status(file_id, outcome.state(), attempt, chunks, error)
                    .await;
                match &outcome {
                    IndexOutcome::Done { chunks } => {
                        info!(file_id, chunks, attempt, "file indexed")
                    }
                    IndexOutcome::Skipped { reason } => {
                        info!(file_id, reason = %reason, "file not indexed")
                    }
                    IndexOutcome::Failed { .. } => {}
                }
                outcome
            }
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(file_id, attempt, error = %error, "indexing attempt failed");
                self.record_status(file_id, IndexState::Failed, attempt, 0, Some(&error))
                    .await;
                IndexOutcome::Failed {
                    error,
                    attempts: attempt,
                }
            }
        }
    }

    async fn pipeline(&self, file: &FileRecord, mode: Mode, attempt: u32) -> Result<IndexOutcome> {
        let inner = &self.inner;

        if mode == Mode::Reindex {
            let purged = inner.index.delete_by_owner(&file.id).await?;
            debug!(file_id = %file.id, purged, "purged chunks before reindex");
        }

        self.set_state(&file.id, IndexState::Extracting, attempt).await?;
        let bytes = inner.cas.read(&file.content_fingerprint).await?;
        let extractor = inner.extractor.clone();
        let declared_type = file.declared_type.clone();
        let display_name = file.display_name.clone();
        let extraction = tokio::task::spawn_blocking(move || {
            extractor.extract(&bytes, &declared_type, &display_name)
        })
        .await
        .unwrap_or_else(|e| Extraction::NotExtractable(format!("extractor crashed: {}", e)));

        let text = match extraction {
            Extraction::Text(text) => text,
            Extraction::NotExtractable(reason) => {
                if mode == Mode::Index {
                    self.drop_stale_chunks(&file.id).await;
                }
                return Ok(IndexOutcome::Skipped { reason });
            }
        };

        self.set_state(&file.id, IndexState::Chunking, attempt).await?;
        let windows = chunk_text(&text, &inner.settings.chunking);
        if windows.is_empty() {
            if mode == Mode::Index {
                self.drop_stale_chunks(&file.id).await;
            }
            return Ok(IndexOutcome::Skipped {
                reason: "text below minimum chunk size".to_string(),
            });
        }

        self.set_state(&file.id, IndexState::Embedding, attempt).await?;
        let texts: Vec<String> = windows.iter().map(|w| w.text.clone()).collect();
        let vectors =
            embed_batched(inner.embedder.as_ref(), &texts, inner.settings.batch_size).await?;

        self.set_state(&file.id, IndexState::Upserting, attempt).await?;
        let chunks: Vec<Chunk> = windows
            .into_iter()
            .zip(vectors)
            .map(|(window, vector)| {
                Chunk::new(
                    ChunkMetadata {
                        owner_file_id: file.id.clone(),
                        sequence_index: window.index,
                        source_type: file.declared_type.clone(),
                        display_name: file.display_name.clone(),
                    },
                    window.text,
                    vector,
                )
            })
            .collect();

        // a shrinking chunk count must not leave stale tail chunks behind
        inner.index.delete_by_owner(&file.id).await?;
        inner.index.upsert(&chunks).await?;

        Ok(IndexOutcome::Done {
            chunks: chunks.len(),
        })
    }

    /// Best effort: a skipped file must not fail because the index is down.
    async fn drop_stale_chunks(&self, file_id: &str) {
        if let Err(e) = self.inner.index.delete_by_owner(file_id).await {
            warn!(file_id, error = %format!("{:#}", e), "could not drop chunks of skipped file");
        }
    }

    async fn set_state(&self, file_id: &str, state: IndexState, attempt: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_status (file_id, state, attempts, chunk_count, last_error, updated_at)
            VALUES (?, ?, ?, 0, NULL, ?)
            ON CONFLICT(file_id) DO UPDATE SET
                state = excluded.state,
                attempts = excluded.attempts,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(file_id)
        .bind(state.as_str())
        .bind(attempt as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.inner.pool)
        .await?;
        Ok(())
    }

    /// Write a terminal state. A failure here is logged; the attempt's
    /// outcome stands.
    async fn record_status(
        &self,
        file_id: &str,
        state: IndexState,
        attempt: u32,
        chunk_count: u64,
        error: Option<&str>,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO index_status (file_id, state, attempts, chunk_count, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET
                state = excluded.state,
                attempts = excluded.attempts,
                chunk_count = excluded.chunk_count,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(file_id)
        .bind(state.as_str())
        .bind(attempt as i64)
        .bind(chunk_count as i64)
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.inner.pool)
        .await;
        if let Err(e) = result {
            warn!(file_id, state = %state, error = %e, "could not record index status");
        }
    }

    pub async fn status(&self, file_id: &str) -> Result<Option<IndexStatus>> {
        let row = sqlx::query(
            "SELECT file_id, state, attempts, chunk_count, last_error, updated_at FROM index_status WHERE file_id = ?",
        )
        .bind(file_id)
        .fetch_optional(&self.inner.pool)
        .await?;

        row.map(|row| {
            let state: String = row.get("state");
            Ok::<_, anyhow::Error>(IndexStatus {
                file_id: row.get("file_id"),
                state: state.parse()?,
                attempts: row.get::<i64, _>("attempts") as u32,
                chunk_count: row.get::<i64, _>("chunk_count") as u64,
                last_error: row.get("last_error"),
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    /// Count of `index_status` rows per state.
    pub async fn state_counts(&self) -> Result<Vec<(IndexState, u64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM index_status GROUP BY state")
            .fetch_all(&self.inner.pool)
            .await?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let state: String = row.get("state");
            counts.push((state.parse()?, row.get::<i64, _>("n") as u64));
        }
        counts.sort_by_key(|(state, _)| IndexState::ALL.iter().position(|s| s == state));
        Ok(counts)
    }

    // ============ Deletion cleanup ============

    /// Remove a deleted file's chunks, retrying with backoff until success
    /// or `cleanup_max_attempts`, then alarm.
    pub async fn cleanup(&self, file_id: &str) -> Result<CleanupOutcome> {
        let _guard = self.inner.file_locks.lock(file_id).await;
        let max = self.inner.settings.cleanup_max_attempts.max(1);

        let mut attempt = 1;
        loop {
            if self.pending_cleanup(file_id).await?.is_none() {
                return Ok(CleanupOutcome::NotPending);
            }

            match self.inner.index.delete_by_owner(file_id).await {
                Ok(removed) => {
                    sqlx::query("DELETE FROM pending_cleanups WHERE file_id = ?")
                        .bind(file_id)
                        .execute(&self.inner.pool)
                        .await?;
                    sqlx::query("DELETE FROM index_status WHERE file_id = ?")
                        .bind(file_id)
                        .execute(&self.inner.pool)
                        .await?;
                    debug!(file_id, removed, "chunks of deleted file removed");
                    return Ok(CleanupOutcome::Completed { removed });
                }
                Err(e) => {
                    let error = format!("{:#}", e);
                    let exhausted = attempt >= max;
                    sqlx::query(
                        r#"
                        UPDATE pending_cleanups
                        SET attempts = attempts + 1, last_error = ?, updated_at = ?,
                            alarmed = CASE WHEN ? THEN 1 ELSE alarmed END
                        WHERE file_id = ?
                        "#,
                    )
                    .bind(&error)
                    .bind(chrono::Utc::now().timestamp())
                    .bind(exhausted)
                    .bind(file_id)
                    .execute(&self.inner.pool)
                    .await?;

                    if exhausted {
                        let alarm = VaultError::Consistency(format!(
                            "chunks of deleted file {} could not be removed after {} attempts: {}",
                            file_id, attempt, error
                        ));
                        error!(target: ALARM_TARGET, file_id, attempts = attempt, "{}", alarm);
                        return Ok(CleanupOutcome::Alarmed {
                            attempts: attempt,
                            error,
                        });
                    }
                    warn!(file_id, attempt, error = %error, "chunk cleanup failed; retrying");
                    attempt += 1;
                    tokio::time::sleep(backoff_delay(self.inner.settings.backoff_base, attempt))
                        .await;
                }
            }
        }
    }

    pub async fn pending_cleanup(&self, file_id: &str) -> Result<Option<PendingCleanup>> {
        let row = sqlx::query(
            "SELECT file_id, attempts, alarmed, last_error FROM pending_cleanups WHERE file_id = ?",
        )
        .bind(file_id)
        .fetch_optional(&self.inner.pool)
        .await?;
        Ok(row.map(|row| PendingCleanup {
            file_id: row.get("file_id"),
            attempts: row.get::<i64, _>("attempts") as u32,
            alarmed: row.get::<i64, _>("alarmed") != 0,
            last_error: row.get("last_error"),
        }))
    }

    pub async fn pending_cleanups(&self) -> Result<Vec<PendingCleanup>> {
        let rows = sqlx::query(
            "SELECT file_id, attempts, alarmed, last_error FROM pending_cleanups ORDER BY created_at, file_id",
        )
        .fetch_all(&self.inner.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| PendingCleanup {
                file_id: row.get("file_id"),
                attempts: row.get::<i64, _>("attempts") as u32,
                alarmed: row.get::<i64, _>("alarmed") != 0,
                last_error: row.get("last_error"),
            })
            .collect())
    }

    /// Startup recovery. Pending cleanups and unfinished indexing go to the
    /// background queue so opening never waits on a slow or absent index.
    pub async fn resume(&self) -> Result<()> {
        let pending = self.pending_cleanups().await?;
        for row in &pending {
            self.enqueue(Job::Cleanup {
                file_id: row.file_id.clone(),
            });
        }
        let requeued = self.requeue_stalled().await?;
        let sweep = self.inner.cas.sweep_orphans().await?;
        if !pending.is_empty() || requeued > 0 || sweep.purged > 0 || sweep.failed > 0 {
            info!(
                cleanups = pending.len(),
                requeued,
                orphans_purged = sweep.purged,
                orphans_failed = sweep.failed,
                "resumed unfinished work"
            );
        }
        Ok(())
    }

    /// Re-drive every pending cleanup (alarmed ones included) on the
    /// caller's task, re-queue files whose indexing never finished, verify
    /// live content against its fingerprint and sweep CAS orphans.
    pub async fn repair(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();

        for pending in self.pending_cleanups().await? {
            match self.cleanup(&pending.file_id).await? {
                CleanupOutcome::Completed { .. } => report.cleanups_completed += 1,
                CleanupOutcome::Alarmed { .. } => report.cleanups_alarmed += 1,
                CleanupOutcome::NotPending => {}
            }
        }

        report.indexing_requeued = self.requeue_stalled().await?;

        for fingerprint in self.inner.cas.fingerprints().await? {
            if !self.inner.cas.verify(&fingerprint).await? {
                error!(
                    target: ALARM_TARGET,
                    fingerprint = %fingerprint,
                    "stored content does not match its fingerprint"
                );
                report.corrupt_contents += 1;
            }
        }

        let sweep = self.inner.cas.sweep_orphans().await?;
        report.orphans_purged = sweep.purged;
        report.orphans_failed = sweep.failed;

        if report != RepairReport::default() {
            info!(
                cleanups_completed = report.cleanups_completed,
                cleanups_alarmed = report.cleanups_alarmed,
                indexing_requeued = report.indexing_requeued,
                corrupt_contents = report.corrupt_contents,
                orphans_purged = report.orphans_purged,
                orphans_failed = report.orphans_failed,
                "repair finished"
            );
        }
        Ok(report)
    }

    async fn requeue_stalled(&self) -> Result<u64> {
        let rows = sqlx::query(
            "SELECT s.file_id, s.state FROM index_status s JOIN files f ON f.id = s.file_id",
        )
        .fetch_all(&self.inner.pool)
        .await?;
        let mut requeued = 0;
        for row in rows {
            let file_id: String = row.get("file_id");
            let state: String = row.get("state");
            let state: IndexState = match state.parse() {
                Ok(state) => state,
                Err(e) => {
                    warn!(file_id = %file_id, error = %e, "unreadable index state; re-queueing");
                    IndexState::Pending
                }
            };
            if state.is_terminal() {
                continue;
            }
            debug!(file_id = %file_id, %state, "re-queueing unfinished indexing");
            if self.enqueue(Job::Index {
                file_id,
                first_attempt: 1,
            }) {
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("settings", &self.inner.settings)
            .field("in_flight", &self.inner.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

/// Error for operations on a file id that does not exist.
pub fn not_found(file_id: &str) -> anyhow::Error {
    anyhow!(VaultError::NotFound(format!("file {}", file_id)))
}
