use crate::error::BackendError;
use crate::models::{
    Chunk, ChunkKind, Document, IndexDocument, IndexQuery, IndexSearchResult, IndexSettings,
};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkFilter {
    pub document_id: String,
    pub kind: Option<ChunkKind>,
    pub page: Option<u32>,
}

impl ChunkFilter {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            ..Self::default()
        }
    }
}

/// Totals recomputed from the stored chunk rows of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkTotals {
    pub chunks: usize,
    pub pages: u32,
}

/// Durable record of documents and the chunks they own.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert_document(&self, document: &Document) -> Result<(), BackendError>;

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, BackendError>;

    /// Overwrites the stored record, returning `false` when it no longer exists.
    /// `total_chunks`/`total_pages` are owned by [`MetadataStore::replace_chunks`] and are
    /// kept as stored.
    async fn update_document(&self, document: &Document) -> Result<bool, BackendError>;

    async fn delete_document(&self, document_id: &str) -> Result<bool, BackendError>;

    async fn list_documents(&self) -> Result<Vec<Document>, BackendError>;

    /// Atomically swaps the document's chunk set for `chunks` and recounts its totals.
    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
    ) -> Result<ChunkTotals, BackendError>;

    async fn list_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, BackendError>;

    async fn delete_chunks(&self, document_id: &str) -> Result<usize, BackendError>;
}

/// Per-document index service. Implementations report `IndexAlreadyExists` and
/// `IndexNotFound` as errors; callers decide which of them to swallow.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn create_index(&self, uid: &str) -> Result<(), BackendError>;

    async fn configure(&self, uid: &str, settings: &IndexSettings) -> Result<(), BackendError>;

    async fn add_documents(&self, uid: &str, documents: &[IndexDocument])
        -> Result<(), BackendError>;

    async fn search(&self, uid: &str, query: &IndexQuery)
        -> Result<IndexSearchResult, BackendError>;

    async fn delete_index(&self, uid: &str) -> Result<(), BackendError>;
}

/// String key-value cache with per-entry lifetime.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// Removes every key starting with `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    pub text: String,
    /// 0..=100
    pub confidence: f32,
}

/// Single-image optical character recognition.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<OcrOutput, BackendError>;
}
