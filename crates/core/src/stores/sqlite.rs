//! SQLite-backed [`MetadataStore`].
//!
//! Two tables: `documents`, and `chunks` keyed by `(document_id, id)` with an `ordinal` that
//! keeps extraction order. Every multi-statement write runs in one transaction, so a chunk swap
//! and the recount of `total_chunks`/`total_pages` become visible together or not at all.

use crate::error::BackendError;
use crate::models::{Chunk, ChunkDetail, Document, DocumentStatus};
use crate::traits::{ChunkFilter, ChunkTotals, MetadataStore};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        filename TEXT NOT NULL,
        size INTEGER NOT NULL,
        media_type TEXT NOT NULL,
        uploaded_at TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        total_pages INTEGER NOT NULL DEFAULT 0,
        total_chunks INTEGER NOT NULL DEFAULT 0,
        source_path TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT NOT NULL,
        document_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        page_number INTEGER NOT NULL,
        ocr_confidence REAL,
        position_json TEXT,
        features_json TEXT NOT NULL,
        detail_json TEXT NOT NULL,
        PRIMARY KEY (document_id, id),
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_document_kind_page ON chunks(document_id, kind, page_number)",
    "CREATE INDEX IF NOT EXISTS idx_documents_uploaded_at ON documents(uploaded_at)",
];

const DOCUMENT_COLUMNS: &str = "id, filename, size, media_type, uploaded_at, status, error, \
     total_pages, total_chunks, source_path, metadata_json";

const CHUNK_COLUMNS: &str =
    "id, document_id, content, page_number, position_json, features_json, detail_json";

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Opens (creating if needed) the database file at `path` in WAL mode and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        debug!(path = %path.display(), "metadata database opened");
        Ok(store)
    }

    /// Private in-memory database. One connection that never expires, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self, BackendError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), BackendError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn corrupt(details: String) -> BackendError {
    BackendError::BackendResponse {
        backend: "sqlite".to_string(),
        details,
    }
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn document_from_row(row: &SqliteRow) -> Result<Document, BackendError> {
    let id: String = row.try_get("id")?;
    let uploaded_at: String = row.try_get("uploaded_at")?;
    let status: String = row.try_get("status")?;
    let source_path: Option<String> = row.try_get("source_path")?;
    let metadata_json: String = row.try_get("metadata_json")?;

    let mut document = Document::new(
        row.try_get::<String, _>("filename")?,
        row.try_get::<i64, _>("size")?.max(0) as u64,
        row.try_get::<String, _>("media_type")?,
        source_path.map(PathBuf::from),
    );
    document.uploaded_at = DateTime::parse_from_rfc3339(&uploaded_at)
        .map_err(|error| corrupt(format!("document {id} has bad uploaded_at: {error}")))?
        .with_timezone(&Utc);
    document.total_pages = row.try_get::<i64, _>("total_pages")?.max(0) as u32;
    document.total_chunks = row.try_get::<i64, _>("total_chunks")?.max(0) as usize;
    document.metadata = serde_json::from_str(&metadata_json)?;
    let status = DocumentStatus::from_str(&status)
        .map_err(|error| corrupt(format!("document {id}: {error}")))?;
    document.restore_lifecycle(status, row.try_get("error")?);
    document.id = id;
    Ok(document)
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk, BackendError> {
    let position_json: Option<String> = row.try_get("position_json")?;
    let features_json: String = row.try_get("features_json")?;
    let detail_json: String = row.try_get("detail_json")?;

    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        content: row.try_get("content")?,
        page_number: row.try_get::<i64, _>("page_number")?.max(0) as u32,
        position: position_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        features: serde_json::from_str(&features_json)?,
        detail: serde_json::from_str::<ChunkDetail>(&detail_json)?,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert_document(&self, document: &Document) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, size, media_type, uploaded_at, status, error,
                                   total_pages, total_chunks, source_path, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                size = excluded.size,
                media_type = excluded.media_type,
                uploaded_at = excluded.uploaded_at,
                status = excluded.status,
                error = excluded.error,
                total_pages = excluded.total_pages,
                total_chunks = excluded.total_chunks,
                source_path = excluded.source_path,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&document.id)
        .bind(&document.filename)
        .bind(document.size as i64)
        .bind(&document.media_type)
        .bind(timestamp(&document.uploaded_at))
        .bind(document.status().as_str())
        .bind(document.error())
        .bind(i64::from(document.total_pages))
        .bind(document.total_chunks as i64)
        .bind(document.source_path.as_ref().map(|path| path.display().to_string()))
        .bind(serde_json::to_string(&document.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, BackendError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn update_document(&self, document: &Document) -> Result<bool, BackendError> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET
                filename = ?, size = ?, media_type = ?, uploaded_at = ?, status = ?, error = ?,
                source_path = ?, metadata_json = ?
            WHERE id = ?
            "#,
        )
        .bind(&document.filename)
        .bind(document.size as i64)
        .bind(&document.media_type)
        .bind(timestamp(&document.uploaded_at))
        .bind(document.status().as_str())
        .bind(document.error())
        .bind(document.source_path.as_ref().map(|path| path.display().to_string()))
        .bind(serde_json::to_string(&document.metadata)?)
        .bind(&document.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool, BackendError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_documents(&self) -> Result<Vec<Document>, BackendError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY uploaded_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
    ) -> Result<ChunkTotals, BackendError> {
        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            return Err(BackendError::BackendResponse {
                backend: "metadata-store".to_string(),
                details: format!("document {document_id} does not exist"),
            });
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        let owned = chunks.iter().filter(|chunk| chunk.document_id == document_id);
        for (ordinal, chunk) in owned.enumerate() {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, ordinal, kind, content, page_number,
                                    ocr_confidence, position_json, features_json, detail_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(ordinal as i64)
            .bind(chunk.kind().as_str())
            .bind(&chunk.content)
            .bind(i64::from(chunk.page_number))
            .bind(chunk.ocr_confidence().map(f64::from))
            .bind(chunk.position.as_ref().map(serde_json::to_string).transpose()?)
            .bind(serde_json::to_string(&chunk.features)?)
            .bind(serde_json::to_string(&chunk.detail)?)
            .execute(&mut *tx)
            .await?;
        }

        let (count, pages): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(MAX(page_number), 0) FROM chunks WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE documents SET total_chunks = ?, total_pages = ? WHERE id = ?")
            .bind(count)
            .bind(pages)
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ChunkTotals {
            chunks: count.max(0) as usize,
            pages: pages.max(0) as u32,
        })
    }

    async fn list_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, BackendError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CHUNK_COLUMNS} FROM chunks
            WHERE document_id = ?
              AND (? IS NULL OR kind = ?)
              AND (? IS NULL OR page_number = ?)
            ORDER BY ordinal
            "#
        ))
        .bind(&filter.document_id)
        .bind(filter.kind.map(|kind| kind.as_str()))
        .bind(filter.kind.map(|kind| kind.as_str()))
        .bind(filter.page.map(i64::from))
        .bind(filter.page.map(i64::from))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<usize, BackendError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE documents SET total_chunks = 0, total_pages = 0 WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() as usize)
    }
}
