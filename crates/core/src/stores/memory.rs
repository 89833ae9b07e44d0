use crate::error::BackendError;
use crate::models::{Chunk, Document};
use crate::traits::{ChunkFilter, ChunkTotals, MetadataStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct StoreState {
    documents: BTreeMap<String, Document>,
    chunks: BTreeMap<String, Vec<Chunk>>,
}

/// In-process metadata store. Chunks are keyed by their owning document, so deleting or
/// replacing a document's chunks is a single map operation under the write lock.
#[derive(Default)]
pub struct MemoryMetadataStore {
    state: RwLock<StoreState>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_document(&self, document: &Document) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        state
            .documents
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, BackendError> {
        Ok(self.state.read().await.documents.get(document_id).cloned())
    }

    async fn update_document(&self, document: &Document) -> Result<bool, BackendError> {
        let mut state = self.state.write().await;
        let Some(stored) = state.documents.get_mut(&document.id) else {
            return Ok(false);
        };

        let (total_chunks, total_pages) = (stored.total_chunks, stored.total_pages);
        *stored = document.clone();
        stored.total_chunks = total_chunks;
        stored.total_pages = total_pages;

        Ok(true)
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool, BackendError> {
        let mut state = self.state.write().await;
        state.chunks.remove(document_id);
        let removed = state.documents.remove(document_id).is_some();
        Ok(removed)
    }

    async fn list_documents(&self) -> Result<Vec<Document>, BackendError> {
        let state = self.state.read().await;
        let mut documents: Vec<Document> = state.documents.values().cloned().collect();
        documents.sort_by(|left, right| left.uploaded_at.cmp(&right.uploaded_at));
        Ok(documents)
    }

    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
    ) -> Result<ChunkTotals, BackendError> {
        let mut state = self.state.write().await;
        if !state.documents.contains_key(document_id) {
            return Err(BackendError::BackendResponse {
                backend: "metadata-store".to_string(),
                details: format!("document {document_id} does not exist"),
            });
        }

        let owned: Vec<Chunk> = chunks
            .iter()
            .filter(|chunk| chunk.document_id == document_id)
            .cloned()
            .collect();
        let totals = ChunkTotals {
            chunks: owned.len(),
            pages: owned.iter().map(|chunk| chunk.page_number).max().unwrap_or(0),
        };
        state.chunks.insert(document_id.to_string(), owned);

        if let Some(document) = state.documents.get_mut(document_id) {
            document.total_chunks = totals.chunks;
            document.total_pages = totals.pages;
        }

        Ok(totals)
    }

    async fn list_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, BackendError> {
        let state = self.state.read().await;
        let chunks = state
            .chunks
            .get(&filter.document_id)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|chunk| filter.kind.map_or(true, |kind| chunk.kind() == kind))
                    .filter(|chunk| filter.page.map_or(true, |page| chunk.page_number == page))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(chunks)
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<usize, BackendError> {
        let mut state = self.state.write().await;
        let removed = state
            .chunks
            .remove(document_id)
            .map(|chunks| chunks.len())
            .unwrap_or(0);

        if let Some(document) = state.documents.get_mut(document_id) {
            document.total_chunks = 0;
            document.total_pages = 0;
        }

        Ok(removed)
    }
}
