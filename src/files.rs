//! `files` table access.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use filevault_core::models::FileRecord;
use filevault_core::search::FileCatalog;
use filevault_core::Fingerprint;

const SELECT_FILE: &str = r#"
    SELECT f.id, f.display_name, f.declared_type, f.content_fingerprint, f.created_at,
           c.size_bytes
    FROM files f
    JOIN contents c ON c.fingerprint = f.content_fingerprint
"#;

fn row_to_file(row: &SqliteRow) -> Result<FileRecord> {
    let fingerprint: String = row.get("content_fingerprint");
    let created_at: i64 = row.get("created_at");
    Ok(FileRecord {
        id: row.get("id"),
        display_name: row.get("display_name"),
        declared_type: row.get("declared_type"),
        content_fingerprint: Fingerprint::parse(&fingerprint)?,
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        created_at: DateTime::<Utc>::from_timestamp(created_at, 0).unwrap_or_default(),
    })
}

pub async fn insert(conn: &mut SqliteConnection, file: &FileRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO files (id, display_name, declared_type, content_fingerprint, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&file.id)
    .bind(&file.display_name)
    .bind(&file.declared_type)
    .bind(file.content_fingerprint.as_str())
    .bind(file.created_at.timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<FileRecord>> {
    let row = sqlx::query(&format!("{} WHERE f.id = ?", SELECT_FILE))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_file).transpose()
}

/// Delete a file row, returning its content fingerprint if it existed.
pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<Option<Fingerprint>> {
    let fingerprint: Option<String> =
        sqlx::query_scalar("DELETE FROM files WHERE id = ? RETURNING content_fingerprint")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(fingerprint.map(|f| Fingerprint::parse(&f)).transpose()?)
}

/// All files, oldest first.
pub async fn list(pool: &SqlitePool) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query(&format!("{} ORDER BY f.created_at, f.id", SELECT_FILE))
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_file).collect()
}

pub async fn list_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    Ok(
        sqlx::query_scalar("SELECT id FROM files ORDER BY created_at, id")
            .fetch_all(pool)
            .await?,
    )
}

/// [`FileCatalog`] over the `files` table.
pub struct SqliteFileCatalog {
    pool: SqlitePool,
}

impl SqliteFileCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileCatalog for SqliteFileCatalog {
    async fn existing(&self, file_ids: &[String]) -> Result<HashSet<String>> {
        let mut found = HashSet::new();
        // stay under SQLite's bound-parameter limit
        for batch in file_ids.chunks(500) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!("SELECT id FROM files WHERE id IN ({})", placeholders);
            let mut query = sqlx::query_scalar::<_, String>(&sql);
            for id in batch {
                query = query.bind(id);
            }
            found.extend(query.fetch_all(&self.pool).await?);
        }
        Ok(found)
    }
}
