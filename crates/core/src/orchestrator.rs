use crate::cache::purge_document;
use crate::error::{BackendError, PipelineError};
use crate::extractor::ChunkExtractor;
use crate::ingest::load_parsed_content;
use crate::models::{index_uid, Chunk, Document, IndexDocument, IndexSettings, JobPayload, ParsedContent};
use crate::queue::{Job, JobContext, JobHandler, Milestone};
use crate::traits::{Cache, MetadataStore, SearchIndex};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of one successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Processed {
        chunks: usize,
        pages: u32,
        skipped: usize,
    },
    /// The document was already completed; nothing was touched.
    AlreadyCompleted,
}

/// Drives a document through extraction, persistence and indexing.
///
/// Runs are not locked per document here: the job queue never hands out two jobs for the same
/// document at once.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn SearchIndex>,
    cache: Arc<dyn Cache>,
    extractor: ChunkExtractor,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn SearchIndex>,
        cache: Arc<dyn Cache>,
        extractor: ChunkExtractor,
    ) -> Self {
        Self {
            store,
            index,
            cache,
            extractor,
        }
    }

    #[instrument(skip(self, context), fields(document_id = %context.payload().document_id, attempt = context.attempt()))]
    pub async fn process(&self, context: &JobContext) -> Result<RunOutcome, PipelineError> {
        let payload = context.payload();
        let document_id = payload.document_id.as_str();

        let mut document = self.load(document_id).await?;
        if document.is_completed() {
            info!("document already completed, skipping duplicate delivery");
            return Ok(RunOutcome::AlreadyCompleted);
        }

        document.begin_processing()?;
        self.save(&document).await?;
        context.progress(Milestone::ExtractionStarted);

        let content = self.resolve_content(payload, &document).await?;
        let report = self.extractor.extract(document_id, &content).await;
        context.progress(Milestone::ExtractionDone);

        let totals = self.store.replace_chunks(document_id, &report.chunks).await?;
        debug!(
            records = content.record_count(),
            skipped = report.skipped.len(),
            chunk_count = totals.chunks,
            total_pages = totals.pages,
            reported_pages = ?content.total_pages,
            "chunks persisted"
        );

        self.rebuild_index(document_id, &report.chunks).await?;
        context.progress(Milestone::IndexingDone);

        // Reload so the stored totals from `replace_chunks` are what gets written back.
        let mut document = self.load(document_id).await?;
        document.complete()?;
        self.save(&document).await?;
        purge_document(self.cache.as_ref(), document_id).await;

        info!(
            chunk_count = totals.chunks,
            total_pages = totals.pages,
            skipped = report.skipped.len(),
            dropped = report.dropped,
            "document completed"
        );
        Ok(RunOutcome::Processed {
            chunks: totals.chunks,
            pages: totals.pages,
            skipped: report.skipped.len(),
        })
    }

    /// Records the terminal failure of a document whose attempts ran out.
    pub async fn mark_failed(&self, document_id: &str, error: &str) -> Result<(), PipelineError> {
        let mut document = self.load(document_id).await?;
        document.fail(error)?;
        self.save(&document).await?;
        warn!(document_id, error, "document marked failed");
        Ok(())
    }

    async fn load(&self, document_id: &str) -> Result<Document, PipelineError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(document_id.to_string()))
    }

    async fn save(&self, document: &Document) -> Result<(), PipelineError> {
        if self.store.update_document(document).await? {
            Ok(())
        } else {
            Err(PipelineError::NotFound(document.id.clone()))
        }
    }

    /// Inline content wins over the payload's file, which wins over the file recorded at upload.
    async fn resolve_content(
        &self,
        payload: &JobPayload,
        document: &Document,
    ) -> Result<ParsedContent, PipelineError> {
        if let Some(content) = &payload.content {
            return Ok(content.clone());
        }

        let path = payload
            .source_path
            .as_ref()
            .or(document.source_path.as_ref())
            .ok_or_else(|| {
                PipelineError::Validation(format!(
                    "document {} has neither inline content nor a source file",
                    document.id
                ))
            })?;
        load_parsed_content(path).await
    }

    /// Drops whatever index the document had and builds a fresh one from `chunks`.
    async fn rebuild_index(&self, document_id: &str, chunks: &[Chunk]) -> Result<(), PipelineError> {
        let uid = index_uid(document_id);

        match self.index.delete_index(&uid).await {
            Ok(()) => debug!(uid, "previous index removed"),
            Err(BackendError::IndexNotFound(_)) => debug!(uid, "no previous index"),
            Err(error) => return Err(error.into()),
        }
        match self.index.create_index(&uid).await {
            Ok(()) => {}
            Err(BackendError::IndexAlreadyExists(_)) => debug!(uid, "index already exists"),
            Err(error) => return Err(error.into()),
        }

        self.index.configure(&uid, &IndexSettings::for_chunks()).await?;
        let documents: Vec<IndexDocument> = chunks.iter().map(IndexDocument::from).collect();
        self.index.add_documents(&uid, &documents).await?;
        debug!(uid, indexed = documents.len(), "index rebuilt");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for PipelineOrchestrator {
    type Output = RunOutcome;

    async fn run(&self, context: JobContext) -> Result<RunOutcome, PipelineError> {
        self.process(&context).await
    }

    async fn exhausted(&self, job: &Job, error: &str) {
        if let Err(failure) = self.mark_failed(job.document_id(), error).await {
            warn!(
                document_id = job.document_id(),
                error = %failure,
                "could not record terminal failure"
            );
        }
    }
}
