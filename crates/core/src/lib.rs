pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod ocr;
pub mod orchestrator;
pub mod queue;
pub mod search;
pub mod stores;
pub mod text;
pub mod traits;

pub use cache::{document_prefix, purge_document, MemoryCache, RedisCache};
pub use config::{IndexConfig, OcrConfig, PipelineConfig, QueueConfig, SearchConfig};
pub use error::{BackendError, ExtractionError, PipelineError, SearchError};
pub use extractor::{ChunkExtractor, ExtractionReport, SkippedRecord};
pub use ingest::{
    digest_file, discover_payload_files, load_parsed_content, DocumentIngestor, IngestionReport,
    SkippedPayload, UploadRequest,
};
pub use models::{
    index_uid, Chunk, ChunkDetail, ChunkKind, Document, DocumentStatus, JobPayload,
    ParsedContent, SearchHit, SearchOptions, SearchResponse, SortField, SortOrder,
};
pub use ocr::{HttpOcrEngine, OcrAdapter, OcrRecognition};
pub use orchestrator::{PipelineOrchestrator, RunOutcome};
pub use queue::{
    EnqueueOptions, Job, JobContext, JobHandler, JobId, JobQueue, Milestone, QueueEvent,
    QueueStats, WorkerPool,
};
pub use search::SearchService;
pub use stores::{MeilisearchIndex, MemoryMetadataStore, MemorySearchIndex, SqliteMetadataStore};
pub use traits::{Cache, ChunkFilter, ChunkTotals, MetadataStore, OcrEngine, OcrOutput, SearchIndex};
