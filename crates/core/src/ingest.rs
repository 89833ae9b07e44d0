use crate::cache::purge_document;
use crate::error::{BackendError, PipelineError};
use crate::models::{index_uid, Document, JobPayload, ParsedContent};
use crate::queue::{EnqueueOptions, JobId, JobQueue};
use crate::traits::{Cache, MetadataStore, SearchIndex};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const MEDIA_TYPE_PDF: &str = "application/pdf";
pub const MEDIA_TYPE_JSON: &str = "application/json";

/// Recursively collects parsed-content files (`*.json`) below `folder`, sorted.
pub fn discover_payload_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_payload = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_payload {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, BackendError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Reads one parser output file. Unreadable files are dependency failures and may be retried;
/// undecodable ones are validation failures.
pub async fn load_parsed_content(path: &Path) -> Result<ParsedContent, PipelineError> {
    let bytes = tokio::fs::read(path).await.map_err(BackendError::from)?;
    serde_json::from_slice(&bytes).map_err(|error| {
        PipelineError::Validation(format!(
            "{} is not valid parsed content: {error}",
            path.display()
        ))
    })
}

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub filename: String,
    pub size: u64,
    pub media_type: String,
    /// Parsed content delivered with the upload. Not stored; only the job carries it.
    pub content: Option<ParsedContent>,
    /// Parser output on disk, reread on every run that has no inline content.
    pub source_path: Option<PathBuf>,
    pub metadata: BTreeMap<String, Value>,
    pub priority: i32,
}

impl UploadRequest {
    /// Describes a parser output file. When a PDF with the same stem sits next to it, the
    /// document is named and sized after that PDF.
    pub fn from_payload_file(path: &Path) -> Result<Self, PipelineError> {
        let checksum = digest_file(path)?;
        let sibling_pdf = path.with_extension("pdf");
        let described = if sibling_pdf.is_file() {
            sibling_pdf.as_path()
        } else {
            path
        };

        let filename = described
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                PipelineError::Validation(format!("path missing filename: {}", path.display()))
            })?
            .to_string();
        let size = fs::metadata(described).map_err(BackendError::from)?.len();
        let media_type = if described == path {
            MEDIA_TYPE_JSON
        } else {
            MEDIA_TYPE_PDF
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("checksum".to_string(), Value::String(checksum));

        Ok(Self {
            filename,
            size,
            media_type: media_type.to_string(),
            content: None,
            source_path: Some(path.to_path_buf()),
            metadata,
            priority: 0,
        })
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.filename.trim().is_empty() {
            return Err(PipelineError::Validation("filename is empty".to_string()));
        }
        if self.size == 0 {
            return Err(PipelineError::Validation(format!(
                "{} is empty",
                self.filename
            )));
        }
        if self.media_type != MEDIA_TYPE_PDF && self.media_type != MEDIA_TYPE_JSON {
            return Err(PipelineError::Validation(format!(
                "unsupported media type: {}",
                self.media_type
            )));
        }
        if self.content.is_none() && self.source_path.is_none() {
            return Err(PipelineError::Validation(format!(
                "{} has neither parsed content nor a source file",
                self.filename
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SkippedPayload {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestionReport {
    pub documents: Vec<Document>,
    pub skipped_files: Vec<SkippedPayload>,
}

/// Entry point for new and changed documents. Uploads return as soon as the job is queued.
#[derive(Clone)]
pub struct DocumentIngestor {
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn SearchIndex>,
    cache: Arc<dyn Cache>,
    queue: JobQueue,
}

impl DocumentIngestor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn SearchIndex>,
        cache: Arc<dyn Cache>,
        queue: JobQueue,
    ) -> Self {
        Self {
            store,
            index,
            cache,
            queue,
        }
    }

    pub async fn upload(&self, request: UploadRequest) -> Result<(Document, JobId), PipelineError> {
        request.validate()?;

        let mut document = Document::new(
            request.filename,
            request.size,
            request.media_type,
            request.source_path.clone(),
        );
        document.metadata = request.metadata;
        self.store.insert_document(&document).await?;

        let job_id = self
            .queue
            .enqueue(
                JobPayload {
                    document_id: document.id.clone(),
                    content: request.content,
                    source_path: request.source_path,
                },
                EnqueueOptions {
                    priority: request.priority,
                    attempts: None,
                },
            )
            .await;

        info!(document_id = %document.id, filename = %document.filename, %job_id, "document uploaded");
        Ok((document, job_id))
    }

    /// Sends a completed or failed document through the pipeline again, reading its source file.
    pub async fn reprocess(&self, document_id: &str) -> Result<(Document, JobId), PipelineError> {
        let mut document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(document_id.to_string()))?;
        let source_path = document.source_path.clone().ok_or_else(|| {
            PipelineError::Validation(format!(
                "document {document_id} has no source file to reprocess from"
            ))
        })?;

        document.reset_for_reprocess()?;
        if !self.store.update_document(&document).await? {
            return Err(PipelineError::NotFound(document_id.to_string()));
        }
        purge_document(self.cache.as_ref(), document_id).await;

        let job_id = self
            .queue
            .enqueue(
                JobPayload {
                    document_id: document_id.to_string(),
                    content: None,
                    source_path: Some(source_path),
                },
                EnqueueOptions::default(),
            )
            .await;

        info!(document_id, %job_id, "document queued for reprocessing");
        Ok((document, job_id))
    }

    /// Removes the document with its chunks, index and cached searches.
    pub async fn delete(&self, document_id: &str) -> Result<(), PipelineError> {
        if self.store.get_document(document_id).await?.is_none() {
            return Err(PipelineError::NotFound(document_id.to_string()));
        }

        let chunks = self.store.delete_chunks(document_id).await?;
        match self.index.delete_index(&index_uid(document_id)).await {
            Ok(()) | Err(BackendError::IndexNotFound(_)) => {}
            Err(error) => return Err(error.into()),
        }
        let cached = purge_document(self.cache.as_ref(), document_id).await;
        self.store.delete_document(document_id).await?;

        info!(document_id, chunks, cached, "document deleted");
        Ok(())
    }

    /// Uploads every parser output file below `folder`. Files that cannot be described or are
    /// rejected are reported and skipped.
    pub async fn ingest_folder(&self, folder: &Path) -> Result<IngestionReport, PipelineError> {
        let files = discover_payload_files(folder);
        if files.is_empty() {
            return Err(PipelineError::Validation(format!(
                "no parsed content files found in {}",
                folder.display()
            )));
        }

        let mut report = IngestionReport::default();
        for path in files {
            let uploaded = match UploadRequest::from_payload_file(&path) {
                Ok(request) => self.upload(request).await,
                Err(error) => Err(error),
            };

            match uploaded {
                Ok((document, _)) => report.documents.push(document),
                Err(error @ PipelineError::Dependency(BackendError::Io(_)))
                | Err(error @ PipelineError::Validation(_)) => {
                    warn!(path = %path.display(), error = %error, "skipped payload file");
                    report.skipped_files.push(SkippedPayload {
                        path,
                        reason: error.to_string(),
                    });
                }
                Err(error) => return Err(error),
            }
        }

        debug!(
            uploaded = report.documents.len(),
            skipped = report.skipped_files.len(),
            "folder ingested"
        );
        Ok(report)
    }
}
