use crate::error::PipelineError;
use crate::text::{id_digest, is_plain_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    /// Legal edges of the document lifecycle.
    ///
    /// `Processing -> Processing` covers a retried attempt re-entering the run, and
    /// `Pending -> Failed` covers a job whose attempts ran out before any run started.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Pending, Failed)
                | (Completed, Pending)
                | (Failed, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(PipelineError::Validation(format!("unknown document status: {other}"))),
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing record of one uploaded PDF.
///
/// `status` and `error` are only reachable through the transition methods, so a document can
/// never carry an error outside of `failed` or skip a lifecycle edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub media_type: String,
    pub uploaded_at: DateTime<Utc>,
    status: DocumentStatus,
    #[serde(default)]
    error: Option<String>,
    pub total_pages: u32,
    pub total_chunks: usize,
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Document {
    pub fn new(
        filename: impl Into<String>,
        size: u64,
        media_type: impl Into<String>,
        source_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.into(),
            size,
            media_type: media_type.into(),
            uploaded_at: Utc::now(),
            status: DocumentStatus::Pending,
            error: None,
            total_pages: 0,
            total_chunks: 0,
            source_path,
            metadata: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.status == DocumentStatus::Completed
    }

    pub fn begin_processing(&mut self) -> Result<(), PipelineError> {
        self.transition(DocumentStatus::Processing)
    }

    pub fn complete(&mut self) -> Result<(), PipelineError> {
        self.transition(DocumentStatus::Completed)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), PipelineError> {
        self.transition(DocumentStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// `completed|failed -> pending`. Chunks stay in place until the next run replaces them.
    pub fn reset_for_reprocess(&mut self) -> Result<(), PipelineError> {
        self.transition(DocumentStatus::Pending)
    }

    /// Puts back the lifecycle state of a record read from storage. An error is only kept for
    /// a failed document.
    pub(crate) fn restore_lifecycle(&mut self, status: DocumentStatus, error: Option<String>) {
        self.status = status;
        self.error = error.filter(|_| status == DocumentStatus::Failed);
    }

    fn transition(&mut self, next: DocumentStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.error = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Paragraph,
    Image,
    Table,
}

impl ChunkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKind::Paragraph => "paragraph",
            ChunkKind::Image => "image",
            ChunkKind::Table => "table",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkKind {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "paragraph" | "text" => Ok(ChunkKind::Paragraph),
            "image" => Ok(ChunkKind::Image),
            "table" => Ok(ChunkKind::Table),
            other => Err(PipelineError::Validation(format!("unknown chunk kind: {other}"))),
        }
    }
}

/// Bounding box as reported by the parser. Carried through untouched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TextFeatures {
    pub word_count: usize,
    pub sentence_count: usize,
    pub char_count: usize,
    pub avg_words_per_sentence: usize,
    pub has_numbers: bool,
    pub has_capitals: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChunkDetail {
    Paragraph,
    Image {
        #[serde(rename = "ocrConfidence")]
        ocr_confidence: f32,
    },
    Table {
        #[serde(rename = "rowCount")]
        row_count: usize,
        #[serde(rename = "columnCount")]
        column_count: usize,
        #[serde(rename = "isNumeric")]
        numeric: bool,
        #[serde(rename = "hasCaption")]
        has_caption: bool,
    },
}

impl ChunkDetail {
    pub fn kind(&self) -> ChunkKind {
        match self {
            ChunkDetail::Paragraph => ChunkKind::Paragraph,
            ChunkDetail::Image { .. } => ChunkKind::Image,
            ChunkDetail::Table { .. } => ChunkKind::Table,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub page_number: u32,
    #[serde(default)]
    pub position: Option<Position>,
    pub features: TextFeatures,
    #[serde(flatten)]
    pub detail: ChunkDetail,
}

impl Chunk {
    pub fn kind(&self) -> ChunkKind {
        self.detail.kind()
    }

    pub fn ocr_confidence(&self) -> Option<f32> {
        match self.detail {
            ChunkDetail::Image { ocr_confidence } => Some(ocr_confidence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParagraphRecord {
    pub text: String,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub position: Option<Position>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Raw image bytes, base64 on the wire.
    #[serde_as(as = "Option<Base64>")]
    #[serde(default)]
    pub data: Option<Vec<u8>>,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TableRecord {
    #[serde(default)]
    pub headers: Vec<serde_json::Value>,
    /// Each row is either an array of cells or a map of column name to cell.
    #[serde(default)]
    pub rows: Vec<serde_json::Value>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub position: Option<Position>,
}

/// Output of the external PDF parser for one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParsedContent {
    #[serde(default)]
    pub paragraphs: Vec<ParagraphRecord>,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
    #[serde(default)]
    pub tables: Vec<TableRecord>,
    #[serde(default)]
    pub total_pages: Option<u32>,
}

impl ParsedContent {
    pub fn record_count(&self) -> usize {
        self.paragraphs.len() + self.images.len() + self.tables.len()
    }
}

/// Work item carried by the job queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub document_id: String,
    #[serde(default)]
    pub content: Option<ParsedContent>,
    #[serde(default)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    PageNumber,
    WordCount,
    CharCount,
    OcrConfidence,
}

impl SortField {
    pub fn attribute(self) -> &'static str {
        match self {
            SortField::PageNumber => "pageNumber",
            SortField::WordCount => "wordCount",
            SortField::CharCount => "charCount",
            SortField::OcrConfidence => "ocrConfidence",
        }
    }
}

impl FromStr for SortField {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "pageNumber" | "page_number" | "page" => Ok(SortField::PageNumber),
            "wordCount" | "word_count" => Ok(SortField::WordCount),
            "charCount" | "char_count" => Ok(SortField::CharCount),
            "ocrConfidence" | "ocr_confidence" | "confidence" => Ok(SortField::OcrConfidence),
            other => Err(PipelineError::Validation(format!("unsupported sort field: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

impl FromStr for SortOrder {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(PipelineError::Validation(format!("unsupported sort order: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    pub kind: Option<ChunkKind>,
    pub page: Option<u32>,
    pub min_confidence: Option<f32>,
    pub sort_by: Option<SortField>,
    pub sort_order: SortOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub chunk_id: String,
    pub kind: ChunkKind,
    pub page_number: u32,
    pub content: String,
    pub highlighted: Option<String>,
    pub ocr_confidence: Option<f32>,
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub document_id: String,
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub total_hits: usize,
    pub limit: usize,
    pub offset: usize,
    pub processing_time_ms: u64,
    /// Set only when the response was served from the cache.
    pub cached: bool,
}

/// Flat document shape submitted to the search index for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    pub id: String,
    pub document_id: String,
    pub kind: ChunkKind,
    pub content: String,
    pub page_number: u32,
    #[serde(default)]
    pub ocr_confidence: Option<f32>,
    pub word_count: usize,
    pub char_count: usize,
    #[serde(default)]
    pub position: Option<Position>,
}

impl From<&Chunk> for IndexDocument {
    fn from(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            kind: chunk.kind(),
            content: chunk.content.clone(),
            page_number: chunk.page_number,
            ocr_confidence: chunk.ocr_confidence(),
            word_count: chunk.features.word_count,
            char_count: chunk.features.char_count,
            position: chunk.position,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexSettings {
    pub searchable_attributes: Vec<String>,
    pub filterable_attributes: Vec<String>,
    pub sortable_attributes: Vec<String>,
    pub ranking_rules: Vec<String>,
    pub stop_words: Vec<String>,
}

impl IndexSettings {
    pub fn for_chunks() -> Self {
        let owned = |items: &[&str]| items.iter().map(|item| item.to_string()).collect();
        Self {
            searchable_attributes: owned(&["content"]),
            filterable_attributes: owned(&["kind", "pageNumber", "ocrConfidence", "documentId"]),
            sortable_attributes: owned(&["pageNumber", "wordCount", "charCount", "ocrConfidence"]),
            ranking_rules: owned(&[
                "words",
                "typo",
                "proximity",
                "attribute",
                "sort",
                "exactness",
            ]),
            stop_words: owned(&[
                "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with",
                "by", "is", "are", "was", "were",
            ]),
        }
    }
}

/// Name of the one search index owned by `document_id`.
///
/// Plain ids map to `doc_<id>`. Any other id maps to `doc-<sha256>`, so two distinct ids never
/// share an index.
pub fn index_uid(document_id: &str) -> String {
    if is_plain_id(document_id) {
        format!("doc_{document_id}")
    } else {
        format!("doc-{}", id_digest(document_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndexFilter {
    Kind(ChunkKind),
    Page(u32),
    MinConfidence(f32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Highlight {
    pub pre_tag: String,
    pub post_tag: String,
}

/// Query handed to the search index service.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    pub text: String,
    pub limit: usize,
    pub offset: usize,
    pub filters: Vec<IndexFilter>,
    pub sort: Option<(SortField, SortOrder)>,
    pub highlight: Option<Highlight>,
    /// Crop window in words for the formatted content.
    pub crop_length: Option<usize>,
}

impl IndexQuery {
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            limit,
            offset: 0,
            filters: Vec::new(),
            sort: None,
            highlight: None,
            crop_length: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub document: IndexDocument,
    pub formatted_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexSearchResult {
    pub hits: Vec<IndexHit>,
    pub estimated_total: usize,
    pub processing_time_ms: u64,
}
