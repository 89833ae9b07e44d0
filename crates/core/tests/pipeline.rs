use async_trait::async_trait;
use pdf_pipeline_core::models::{
    IndexDocument, IndexQuery, IndexSearchResult, IndexSettings, ParagraphRecord, TableRecord,
};
use pdf_pipeline_core::{
    BackendError, ChunkExtractor, ChunkFilter, ChunkKind, DocumentIngestor, DocumentStatus,
    JobQueue, MemoryCache, MemoryMetadataStore, MemorySearchIndex, MetadataStore, ParsedContent,
    PipelineOrchestrator, QueueConfig, SearchConfig, SearchError, SearchIndex, SearchOptions,
    SearchService, SqliteMetadataStore, UploadRequest, WorkerPool,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Pipeline {
    store: Arc<dyn MetadataStore>,
    queue: JobQueue,
    ingestor: DocumentIngestor,
    search: SearchService,
    workers: WorkerPool,
}

fn queue_config() -> QueueConfig {
    QueueConfig::default()
        .with_workers(2)
        .with_backoff(Duration::from_millis(10), Duration::from_millis(20))
        .with_job_timeout(Duration::from_secs(5))
}

fn start(index: Arc<dyn SearchIndex>) -> Pipeline {
    start_with(Arc::new(MemoryMetadataStore::new()), index)
}

fn start_with(store: Arc<dyn MetadataStore>, index: Arc<dyn SearchIndex>) -> Pipeline {
    let cache = Arc::new(MemoryCache::new());
    let queue = JobQueue::new(queue_config());

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store.clone(),
        index.clone(),
        cache.clone(),
        ChunkExtractor::default(),
    ));
    let workers = queue.start(orchestrator);

    Pipeline {
        ingestor: DocumentIngestor::new(store.clone(), index.clone(), cache.clone(), queue.clone()),
        search: SearchService::new(store.clone(), index, cache, SearchConfig::default()),
        store,
        queue,
        workers,
    }
}

fn example_content() -> ParsedContent {
    ParsedContent {
        paragraphs: vec![ParagraphRecord {
            text: "The quick brown fox jumps over the lazy dog".to_string(),
            page_number: Some(1),
            position: None,
        }],
        tables: vec![TableRecord {
            headers: vec![json!("A"), json!("B")],
            rows: vec![json!(["1", "2"])],
            caption: None,
            page_number: Some(2),
            position: None,
        }],
        ..ParsedContent::default()
    }
}

fn upload_request(content: ParsedContent) -> UploadRequest {
    UploadRequest {
        filename: "d.pdf".to_string(),
        size: 1024,
        media_type: "application/pdf".to_string(),
        content: Some(content),
        ..UploadRequest::default()
    }
}

#[tokio::test]
async fn example_document_is_processed_and_searchable() -> anyhow::Result<()> {
    let pipeline = start(Arc::new(MemorySearchIndex::new()));
    let (document, _) = pipeline.ingestor.upload(upload_request(example_content())).await?;
    pipeline.queue.wait_idle().await;

    let stored = pipeline
        .store
        .get_document(&document.id)
        .await?
        .expect("document stored");
    assert_eq!(stored.status(), DocumentStatus::Completed);
    assert_eq!(stored.total_chunks, 2);
    assert_eq!(stored.total_pages, 2);

    let chunks = pipeline
        .store
        .list_chunks(&ChunkFilter::for_document(&document.id))
        .await?;
    assert_eq!(chunks.len(), stored.total_chunks);
    assert!(chunks.iter().all(|chunk| chunk.content.chars().count() >= 10));

    let fox = pipeline
        .search
        .search(&document.id, "fox", &SearchOptions::default())
        .await?;
    assert_eq!(fox.hits.len(), 1);
    assert_eq!(fox.hits[0].kind, ChunkKind::Paragraph);

    let tables_only = SearchOptions {
        kind: Some(ChunkKind::Table),
        ..SearchOptions::default()
    };
    let table = pipeline
        .search
        .search(&document.id, "headers", &tables_only)
        .await?;
    assert_eq!(table.hits.len(), 1);
    assert_eq!(table.hits[0].kind, ChunkKind::Table);
    assert_eq!(table.hits[0].page_number, 2);

    pipeline.workers.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn one_character_query_is_rejected() -> anyhow::Result<()> {
    let pipeline = start(Arc::new(MemorySearchIndex::new()));
    let (document, _) = pipeline.ingestor.upload(upload_request(example_content())).await?;
    pipeline.queue.wait_idle().await;

    let error = pipeline
        .search
        .search(&document.id, "A", &SearchOptions::default())
        .await
        .expect_err("query too short");
    assert!(matches!(error, SearchError::QueryTooShort { .. }));
    assert_eq!(error.status_code(), 400);

    pipeline.workers.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn pending_document_is_not_ready() -> anyhow::Result<()> {
    let store = Arc::new(MemoryMetadataStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    let cache = Arc::new(MemoryCache::new());
    // No workers: the upload stays pending.
    let queue = JobQueue::new(queue_config());
    let ingestor = DocumentIngestor::new(store.clone(), index.clone(), cache.clone(), queue);
    let search = SearchService::new(store, index, cache, SearchConfig::default());

    let (document, _) = ingestor.upload(upload_request(example_content())).await?;
    let error = search
        .search(&document.id, "fox", &SearchOptions::default())
        .await
        .expect_err("not ready");
    assert!(matches!(
        error,
        SearchError::NotReady {
            status: DocumentStatus::Pending,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn reprocessing_leaves_only_the_latest_chunks() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let payload = dir.path().join("d.json");
    std::fs::write(&payload, serde_json::to_vec(&example_content())?)?;

    let pipeline = start(Arc::new(MemorySearchIndex::new()));
    let request = UploadRequest::from_payload_file(&payload)?;
    let (document, _) = pipeline.ingestor.upload(request).await?;
    pipeline.queue.wait_idle().await;

    // Warm the cache, then change the source and reprocess.
    let before = pipeline
        .search
        .search(&document.id, "fox", &SearchOptions::default())
        .await?;
    assert_eq!(before.hits.len(), 1);

    let mut revised = example_content();
    revised.paragraphs[0].text = "A slow grey wolf naps under the old tree".to_string();
    std::fs::write(&payload, serde_json::to_vec(&revised)?)?;

    pipeline.ingestor.reprocess(&document.id).await?;
    pipeline.queue.wait_idle().await;

    let stored = pipeline
        .store
        .get_document(&document.id)
        .await?
        .expect("document stored");
    assert_eq!(stored.status(), DocumentStatus::Completed);
    assert_eq!(stored.total_chunks, 2);

    let fox = pipeline
        .search
        .search(&document.id, "fox", &SearchOptions::default())
        .await?;
    assert!(fox.hits.is_empty());
    assert!(!fox.cached);

    let wolf = pipeline
        .search
        .search(&document.id, "wolf", &SearchOptions::default())
        .await?;
    assert_eq!(wolf.hits.len(), 1);

    pipeline.workers.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cached_search_is_identical_until_cleared() -> anyhow::Result<()> {
    let pipeline = start(Arc::new(MemorySearchIndex::new()));
    let (document, _) = pipeline.ingestor.upload(upload_request(example_content())).await?;
    pipeline.queue.wait_idle().await;

    let options = SearchOptions {
        limit: Some(5),
        ..SearchOptions::default()
    };
    let first = pipeline.search.search(&document.id, "quick fox", &options).await?;
    let second = pipeline.search.search(&document.id, "quick fox", &options).await?;
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(
        serde_json::to_value(&first.hits)?,
        serde_json::to_value(&second.hits)?
    );

    assert_eq!(pipeline.search.clear_cache(&document.id).await, 1);
    let third = pipeline.search.search(&document.id, "quick fox", &options).await?;
    assert!(!third.cached);

    pipeline.workers.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_delivery_does_not_reprocess() -> anyhow::Result<()> {
    let pipeline = start(Arc::new(MemorySearchIndex::new()));
    let content = example_content();
    let (document, _) = pipeline.ingestor.upload(upload_request(content.clone())).await?;
    pipeline.queue.wait_idle().await;

    pipeline
        .queue
        .enqueue(
            pdf_pipeline_core::JobPayload {
                document_id: document.id.clone(),
                content: Some(content),
                source_path: None,
            },
            Default::default(),
        )
        .await;
    pipeline.queue.wait_idle().await;

    let stats = pipeline.queue.stats().await;
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);
    let chunks = pipeline
        .store
        .list_chunks(&ChunkFilter::for_document(&document.id))
        .await?;
    assert_eq!(chunks.len(), 2);

    pipeline.workers.shutdown().await;
    Ok(())
}

/// Accepts index creation but never accepts documents.
struct RejectingIndex;

#[async_trait]
impl SearchIndex for RejectingIndex {
    async fn create_index(&self, _uid: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn configure(&self, _uid: &str, _settings: &IndexSettings) -> Result<(), BackendError> {
        Ok(())
    }

    async fn add_documents(
        &self,
        _uid: &str,
        _documents: &[IndexDocument],
    ) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("indexer offline".to_string()))
    }

    async fn search(
        &self,
        _uid: &str,
        _query: &IndexQuery,
    ) -> Result<IndexSearchResult, BackendError> {
        Ok(IndexSearchResult::default())
    }

    async fn delete_index(&self, uid: &str) -> Result<(), BackendError> {
        Err(BackendError::IndexNotFound(uid.to_string()))
    }
}

#[tokio::test]
async fn exhausted_retries_fail_the_document() -> anyhow::Result<()> {
    let pipeline = start(Arc::new(RejectingIndex));
    let (document, _) = pipeline.ingestor.upload(upload_request(example_content())).await?;
    pipeline.queue.wait_idle().await;

    let stored = pipeline
        .store
        .get_document(&document.id)
        .await?
        .expect("document stored");
    assert_eq!(stored.status(), DocumentStatus::Failed);
    assert!(stored
        .error()
        .is_some_and(|error| error.contains("indexer offline")));
    assert_eq!(pipeline.queue.stats().await.failed, 1);

    pipeline.workers.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn sqlite_database_keeps_processed_documents_between_runs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("pipeline.db");

    let document_id = {
        let store = Arc::new(SqliteMetadataStore::open(&database).await?);
        let pipeline = start_with(store.clone(), Arc::new(MemorySearchIndex::new()));
        let (document, _) = pipeline.ingestor.upload(upload_request(example_content())).await?;
        pipeline.queue.wait_idle().await;
        pipeline.workers.shutdown().await;
        store.close().await;
        document.id
    };

    let reopened = SqliteMetadataStore::open(&database).await?;
    let stored = reopened
        .get_document(&document_id)
        .await?
        .expect("document stored");
    assert_eq!(stored.status(), DocumentStatus::Completed);
    assert_eq!((stored.total_chunks, stored.total_pages), (2, 2));

    let tables = ChunkFilter {
        kind: Some(ChunkKind::Table),
        ..ChunkFilter::for_document(&document_id)
    };
    let chunks = reopened.list_chunks(&tables).await?;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].page_number, 2);
    Ok(())
}
