//! Idempotent schema creation.
//!
//! | Table | Holds |
//! |-------|-------|
//! | `contents` | one row per unique payload, with its reference count |
//! | `files` | user-visible uploads pointing at a content row |
//! | `chunk_vectors` | embedded chunks (the SQLite vector index) |
//! | `index_status` | latest indexing state per file |
//! | `pending_cleanups` | durable outbox of vector cleanups for deleted files |

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contents (
            fingerprint TEXT PRIMARY KEY,
            size_bytes INTEGER NOT NULL,
            reference_count INTEGER NOT NULL CHECK (reference_count >= 0),
            storage_path TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            declared_type TEXT NOT NULL,
            content_fingerprint TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (content_fingerprint) REFERENCES contents(fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            owner_file_id TEXT NOT NULL,
            sequence_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            source_type TEXT NOT NULL,
            display_name TEXT NOT NULL,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_status (
            file_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_cleanups (
            file_id TEXT PRIMARY KEY,
            attempts INTEGER NOT NULL DEFAULT 0,
            alarmed INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_contents_size ON contents(size_bytes)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_content ON files(content_fingerprint)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_owner ON chunk_vectors(owner_file_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
