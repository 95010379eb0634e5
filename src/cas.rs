//! Content-addressable blob storage with reference counting.
//!
//! Every distinct byte sequence is stored once under
//! `<root>/cas/<h0h1>/<h2h3>/<fingerprint>` and described by one row in the
//! `contents` table whose `reference_count` is the number of live
//! [`FileRecord`](filevault_core::models::FileRecord)s pointing at it.
//!
//! # Concurrency
//!
//! Mutation of one fingerprint is serialized twice over:
//!
//! 1. An in-process [`KeyedLocks`] entry per fingerprint, held by the caller
//!    for the whole transaction.
//! 2. At the database, the increment is a conditional `UPDATE` issued as the
//!    first statement of the transaction, and the insert of new content is an
//!    `INSERT ... ON CONFLICT` that reports [`VaultError::DuplicateRace`] when
//!    another writer got there first. Callers retry on that error.
//!
//! # Write and delete ordering
//!
//! Bytes are written to `<root>/tmp`, fsynced, and renamed into place before
//! the `contents` row is inserted, so a row never exists without its bytes.
//! On release the row is decremented first; at zero the bytes are removed and
//! only then is the row deleted. A row left at zero marks an orphan whose
//! physical deletion was not confirmed; [`ContentStore::sweep_orphans`]
//! retries it and a later put of the same bytes revives it.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use filevault_core::locks::{KeyGuard, KeyedLocks};
use filevault_core::models::Content;
use filevault_core::{Fingerprint, VaultError};

/// How many times a put is retried after losing an insert race.
pub const MAX_PUT_ATTEMPTS: u32 = 3;

const CAS_DIR: &str = "cas";
const TMP_DIR: &str = "tmp";

/// Result of taking a reference on content inside a transaction.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub content: Content,
    /// True when this call created the content (first reference).
    pub is_new_content: bool,
}

/// Result of a standalone [`ContentStore::put`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutOutcome {
    pub fingerprint: Fingerprint,
    pub is_new_content: bool,
    pub reference_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageMetrics {
    pub total_files: u64,
    pub unique_contents: u64,
    /// Bytes users believe they stored: Σ size × references.
    pub logical_bytes: u64,
    /// Bytes actually on disk: Σ size over content rows.
    pub physical_bytes: u64,
    pub bytes_saved: u64,
    /// Unique contents per file; 1.0 when nothing is stored.
    pub dedup_ratio: f64,
    /// Content rows at zero references awaiting physical deletion.
    pub orphaned_contents: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub purged: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct ContentStore {
    pool: SqlitePool,
    root: PathBuf,
    locks: KeyedLocks,
}

impl ContentStore {
    pub fn new(pool: SqlitePool, root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            root: root.into(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the blob for `fingerprint`.
    pub fn blob_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(CAS_DIR).join(fingerprint.shard_path())
    }

    fn relative_location(fingerprint: &Fingerprint) -> String {
        format!("{}/{}", CAS_DIR, fingerprint.shard_path())
    }

    /// Take the per-fingerprint lock. Hold it across [`acquire`] or
    /// [`decrement`] and the commit of the enclosing transaction.
    ///
    /// [`acquire`]: ContentStore::acquire
    /// [`decrement`]: ContentStore::decrement
    pub async fn lock(&self, fingerprint: &Fingerprint) -> KeyGuard {
        self.locks.lock(fingerprint.as_str()).await
    }

    /// Take one reference on the content of `bytes` inside the caller's
    /// transaction, writing the bytes if this is the first reference.
    ///
    /// Must be the first statement of the transaction so SQLite grants the
    /// write lock up front. On `DuplicateRace` the caller rolls back and
    /// retries. If the transaction later fails to commit, call
    /// [`discard`](ContentStore::discard).
    pub async fn acquire(
        &self,
        conn: &mut SqliteConnection,
        fingerprint: &Fingerprint,
        bytes: &[u8],
    ) -> Result<Acquired> {
        let size = bytes.len() as i64;

        let bumped = sqlx::query(
            r#"
            UPDATE contents SET reference_count = reference_count + 1
            WHERE fingerprint = ? AND size_bytes = ? AND reference_count > 0
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(size)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if bumped == 1 {
            let content = fetch_content(&mut *conn, fingerprint)
                .await?
                .ok_or_else(|| VaultError::Consistency(format!("content {} vanished", fingerprint)))?;
            // Heal a blob removed behind our back rather than hand out a dangling row.
            if !tokio::fs::try_exists(self.blob_path(fingerprint))
                .await
                .unwrap_or(false)
            {
                warn!(fingerprint = %fingerprint, "blob missing for live content; rewriting");
                self.write_blob(fingerprint, bytes).await?;
            }
            debug!(fingerprint = %fingerprint, refs = content.reference_count, "dedup hit");
            return Ok(Acquired {
                content,
                is_new_content: false,
            });
        }

        self.write_blob(fingerprint, bytes).await?;

        let location = Self::relative_location(fingerprint);
        let inserted = sqlx::query(
            r#"
            INSERT INTO contents (fingerprint, size_bytes, reference_count, storage_path, created_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                reference_count = 1,
                size_bytes = excluded.size_bytes,
                storage_path = excluded.storage_path
            WHERE contents.reference_count = 0
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(size)
        .bind(&location)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted == 0 {
            bail!(VaultError::DuplicateRace {
                fingerprint: fingerprint.to_string(),
            });
        }

        debug!(fingerprint = %fingerprint, size, "stored new content");
        Ok(Acquired {
            content: Content {
                fingerprint: fingerprint.clone(),
                size_bytes: bytes.len() as u64,
                reference_count: 1,
                storage_location: location,
            },
            is_new_content: true,
        })
    }

    /// Undo the physical side of an [`acquire`](ContentStore::acquire)
    /// whose transaction did not commit. Bytes are kept if a live row
    /// references them.
    pub async fn discard(&self, acquired: &Acquired) {
        if !acquired.is_new_content {
            return;
        }
        let fingerprint = &acquired.content.fingerprint;
        match self.get(fingerprint).await {
            Ok(Some(content)) if content.reference_count > 0 => {}
            Ok(_) => {
                if let Err(e) = self.remove_blob(fingerprint).await {
                    warn!(fingerprint = %fingerprint, error = %e, "failed to discard uncommitted blob");
                }
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "could not check content before discard");
            }
        }
    }

    /// Drop one reference inside the caller's transaction. Returns the
    /// remaining count; at zero the caller should [`purge`] after commit.
    ///
    /// [`purge`]: ContentStore::purge
    pub async fn decrement(
        &self,
        conn: &mut SqliteConnection,
        fingerprint: &Fingerprint,
    ) -> Result<u32> {
        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE contents SET reference_count = reference_count - 1
            WHERE fingerprint = ? AND reference_count > 0
            RETURNING reference_count
            "#,
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        match remaining {
            Some(n) => Ok(n as u32),
            None => bail!(VaultError::Consistency(format!(
                "release of content {} with no live references",
                fingerprint
            ))),
        }
    }

    /// Physically delete content that has reached zero references, then
    /// remove its row. Returns false if the content is still referenced or
    /// already gone. Caller holds the fingerprint lock.
    ///
    /// If the bytes cannot be removed the row stays at zero so the orphan
    /// is not lost.
    pub async fn purge(&self, fingerprint: &Fingerprint) -> Result<bool> {
        match self.get(fingerprint).await? {
            Some(content) if content.reference_count == 0 => {}
            _ => return Ok(false),
        }

        self.remove_blob(fingerprint)
            .await
            .map_err(|e| VaultError::into_transient(e.context("removing content bytes")))?;

        let deleted = sqlx::query("DELETE FROM contents WHERE fingerprint = ? AND reference_count = 0")
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted == 1 {
            info!(fingerprint = %fingerprint, "content physically deleted");
        }
        Ok(deleted == 1)
    }

    /// Store `bytes`, taking one reference. Retries lost insert races.
    pub async fn put(&self, bytes: &[u8]) -> Result<PutOutcome> {
        let fingerprint = Fingerprint::of_bytes(bytes);
        let _guard = self.lock(&fingerprint).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.pool.begin().await?;
            let acquired = match self.acquire(&mut *tx, &fingerprint, bytes).await {
                Ok(a) => a,
                Err(e) if is_race(&e) && attempt < MAX_PUT_ATTEMPTS => {
                    debug!(fingerprint = %fingerprint, attempt, "insert race; retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Err(e) = tx.commit().await {
                self.discard(&acquired).await;
                return Err(e.into());
            }
            return Ok(PutOutcome {
                fingerprint,
                is_new_content: acquired.is_new_content,
                reference_count: acquired.content.reference_count,
            });
        }
    }

    /// Drop one reference, deleting the bytes on the last one. Returns
    /// whether the content was physically deleted.
    pub async fn release(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let _guard = self.lock(fingerprint).await;

        let mut tx = self.pool.begin().await?;
        let remaining = self.decrement(&mut *tx, fingerprint).await?;
        tx.commit().await?;

        if remaining > 0 {
            return Ok(false);
        }
        self.purge(fingerprint).await
    }

    /// Retry physical deletion of every content row left at zero references.
    pub async fn sweep_orphans(&self) -> Result<SweepReport> {
        let orphans: Vec<String> =
            sqlx::query_scalar("SELECT fingerprint FROM contents WHERE reference_count = 0")
                .fetch_all(&self.pool)
                .await?;

        let mut report = SweepReport::default();
        for hex in orphans {
            let fingerprint = Fingerprint::parse(&hex)?;
            let _guard = self.lock(&fingerprint).await;
            match self.purge(&fingerprint).await {
                Ok(true) => report.purged += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(fingerprint = %fingerprint, error = %format!("{:#}", e), "orphan sweep failed");
                    report.failed += 1;
                }
            }
        }
        if report.purged > 0 || report.failed > 0 {
            info!(purged = report.purged, failed = report.failed, "orphan sweep finished");
        }
        Ok(report)
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Content>> {
        let mut conn = self.pool.acquire().await?;
        fetch_content(&mut conn, fingerprint).await
    }

    /// Read the stored bytes of live content.
    pub async fn read(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        match self.get(fingerprint).await? {
            Some(content) if content.reference_count > 0 => {}
            _ => bail!(VaultError::NotFound(format!("content {}", fingerprint))),
        }
        let path = self.blob_path(fingerprint);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
            .map_err(VaultError::into_transient)
    }

    /// Fingerprints of all live content.
    pub async fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT fingerprint FROM contents WHERE reference_count > 0 ORDER BY fingerprint",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|hex| Fingerprint::parse(hex).map_err(anyhow::Error::from))
            .collect()
    }

    /// Re-hash a stored blob and compare it with its address. A missing
    /// blob counts as a mismatch.
    pub async fn verify(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let path = self.blob_path(fingerprint);
        let _guard = self.lock(fingerprint).await;
        let hashed = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path)?;
            Fingerprint::of_reader(std::io::BufReader::new(file))
        })
        .await?;
        match hashed {
            Ok(actual) => Ok(&actual == fingerprint),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("hashing {}", self.blob_path(fingerprint).display()))),
        }
    }

    pub async fn metrics(&self) -> Result<StorageMetrics> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM files) AS total_files,
                (SELECT COUNT(*) FROM contents WHERE reference_count > 0) AS unique_contents,
                (SELECT COUNT(*) FROM contents WHERE reference_count = 0) AS orphaned,
                (SELECT COALESCE(SUM(size_bytes * reference_count), 0) FROM contents) AS logical,
                (SELECT COALESCE(SUM(size_bytes), 0) FROM contents) AS physical
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total_files = row.get::<i64, _>("total_files") as u64;
        let unique_contents = row.get::<i64, _>("unique_contents") as u64;
        let logical_bytes = row.get::<i64, _>("logical") as u64;
        let physical_bytes = row.get::<i64, _>("physical") as u64;

        let dedup_ratio = if total_files == 0 {
            1.0
        } else {
            unique_contents as f64 / total_files as f64
        };

        Ok(StorageMetrics {
            total_files,
            unique_contents,
            logical_bytes,
            physical_bytes,
            bytes_saved: logical_bytes.saturating_sub(physical_bytes),
            dedup_ratio,
            orphaned_contents: row.get::<i64, _>("orphaned") as u64,
        })
    }

    async fn write_blob(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<()> {
        let final_path = self.blob_path(fingerprint);
        let tmp_dir = self.root.join(TMP_DIR);
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .with_context(|| format!("creating {}", tmp_dir.display()))
            .map_err(VaultError::into_transient)?;
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))
                .map_err(VaultError::into_transient)?;
        }

        let tmp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());
        let written = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &final_path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(VaultError::into_transient(
                anyhow::Error::new(e).context(format!("writing {}", final_path.display())),
            ));
        }
        Ok(())
    }

    async fn remove_blob(&self, fingerprint: &Fingerprint) -> Result<()> {
        let path = self.blob_path(fingerprint);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("removing {}", path.display())))
            }
        }
        self.prune_empty_dirs(&path).await;
        Ok(())
    }

    /// Remove now-empty shard directories between `blob` and the CAS root.
    async fn prune_empty_dirs(&self, blob: &Path) {
        let cas_root = self.root.join(CAS_DIR);
        let mut dir = blob.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == cas_root || !current.starts_with(&cas_root) {
                break;
            }
            // remove_dir fails on non-empty directories, which ends the walk
            if tokio::fs::remove_dir(&current).await.is_err() {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
    }
}

pub fn is_race(err: &anyhow::Error) -> bool {
    matches!(
        VaultError::classify(err),
        Some(VaultError::DuplicateRace { .. })
    )
}

async fn fetch_content(
    conn: &mut SqliteConnection,
    fingerprint: &Fingerprint,
) -> Result<Option<Content>> {
    let row = sqlx::query(
        "SELECT fingerprint, size_bytes, reference_count, storage_path FROM contents WHERE fingerprint = ?",
    )
    .bind(fingerprint.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let hex: String = row.get("fingerprint");
    Ok(Some(Content {
        fingerprint: Fingerprint::parse(&hex)?,
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        reference_count: row.get::<i64, _>("reference_count") as u32,
        storage_location: row.get("storage_path"),
    }))
}
