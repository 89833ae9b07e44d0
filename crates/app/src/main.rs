use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pdf_pipeline_core::{
    Cache, ChunkExtractor, ChunkKind, Document, DocumentIngestor, HttpOcrEngine, JobQueue,
    MeilisearchIndex, MemoryCache, MetadataStore, OcrAdapter, PipelineConfig,
    PipelineOrchestrator, QueueEvent, RedisCache, SearchIndex, SearchOptions, SearchService,
    SortField, SortOrder, SqliteMetadataStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database holding documents and chunks
    #[arg(long, env = "PIPELINE_DATABASE", default_value = ".pdf-pipeline/pipeline.db")]
    database: PathBuf,

    /// Meilisearch base URL
    #[arg(long, env = "MEILI_URL", default_value = "http://localhost:7700")]
    meili_url: String,

    /// Meilisearch API key
    #[arg(long, env = "MEILI_API_KEY")]
    meili_key: Option<String>,

    /// Redis URL for the search cache; an in-process cache is used when absent
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// OCR service endpoint; image records are skipped when absent
    #[arg(long, env = "OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    /// OCR service API key
    #[arg(long, env = "OCR_API_KEY")]
    ocr_key: Option<String>,

    /// Concurrent OCR requests per document
    #[arg(long, env = "OCR_POOL_SIZE", default_value = "2")]
    ocr_workers: usize,

    /// Concurrent processing jobs
    #[arg(long, env = "QUEUE_WORKERS", default_value = "2")]
    workers: usize,

    /// Attempts per job before the document is marked failed
    #[arg(long, env = "QUEUE_MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    /// Lifetime of cached search responses, in seconds
    #[arg(long, env = "SEARCH_CACHE_TTL_SECS", default_value = "300")]
    cache_ttl: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Upload every parsed-content file in a folder and process it.
    Ingest {
        /// Folder that contains parser output (*.json) recursively.
        #[arg(long)]
        folder: PathBuf,
    },
    /// Show the lifecycle state of one or all documents.
    Status {
        #[arg(long)]
        document: Option<String>,
    },
    /// Search inside one document.
    Search {
        #[arg(long)]
        document: String,
        #[arg(long)]
        query: String,
        /// paragraph, image or table
        #[arg(long = "type")]
        kind: Option<ChunkKind>,
        #[arg(long)]
        page: Option<u32>,
        /// Minimum OCR confidence (0-100) for image chunks.
        #[arg(long)]
        min_confidence: Option<f32>,
        /// pageNumber, wordCount, charCount or ocrConfidence
        #[arg(long)]
        sort_by: Option<SortField>,
        #[arg(long, default_value = "asc")]
        sort_order: SortOrder,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Print the raw response as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Suggest completions for a short query.
    Suggest {
        #[arg(long)]
        document: String,
        #[arg(long)]
        query: String,
        #[arg(long)]
        count: Option<usize>,
    },
    /// Run a completed or failed document through the pipeline again.
    Reprocess {
        #[arg(long)]
        document: String,
    },
    /// Delete a document with its chunks, index and cached searches.
    Delete {
        #[arg(long)]
        document: String,
    },
    /// Drop cached searches of one document.
    ClearCache {
        #[arg(long)]
        document: String,
    },
}

struct Services {
    store: Arc<SqliteMetadataStore>,
    index: Arc<dyn SearchIndex>,
    cache: Arc<dyn Cache>,
    queue: JobQueue,
    extractor: ChunkExtractor,
    config: PipelineConfig,
}

impl Services {
    async fn connect(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = PipelineConfig::from_env();
        config.index.url = cli.meili_url.clone();
        config.index.api_key = cli.meili_key.clone();
        config.ocr.endpoint = cli.ocr_endpoint.clone();
        config.ocr.api_key = cli.ocr_key.clone();
        config.ocr = config.ocr.with_pool_size(cli.ocr_workers);
        config.queue = config
            .queue
            .with_workers(cli.workers)
            .with_max_attempts(cli.max_attempts);
        config.search = config
            .search
            .with_cache_ttl(Duration::from_secs(cli.cache_ttl));

        let store = Arc::new(
            SqliteMetadataStore::open(&cli.database)
                .await
                .with_context(|| format!("opening metadata database {}", cli.database.display()))?,
        );
        let index: Arc<dyn SearchIndex> =
            Arc::new(MeilisearchIndex::new(&config.index).context("configuring search index")?);
        let cache = connect_cache(cli.redis_url.as_deref()).await;

        let ocr = HttpOcrEngine::from_config(&config.ocr)
            .context("configuring OCR engine")?
            .map(|engine| OcrAdapter::new(Arc::new(engine), config.ocr.pool_size));
        if ocr.is_none() {
            warn!("no OCR endpoint configured, image records will be skipped");
        }

        Ok(Self {
            store,
            index,
            cache,
            queue: JobQueue::new(config.queue.clone()),
            extractor: ChunkExtractor::new(ocr),
            config,
        })
    }

    fn ingestor(&self) -> DocumentIngestor {
        DocumentIngestor::new(
            self.store.clone(),
            self.index.clone(),
            self.cache.clone(),
            self.queue.clone(),
        )
    }

    fn search(&self) -> SearchService {
        SearchService::new(
            self.store.clone(),
            self.index.clone(),
            self.cache.clone(),
            self.config.search.clone(),
        )
    }

    /// Runs queued jobs until the queue drains.
    async fn drain(&self) {
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            self.store.clone(),
            self.index.clone(),
            self.cache.clone(),
            self.extractor.clone(),
        ));
        let mut events = self.queue.events();
        let reporter = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    QueueEvent::Retrying {
                        document_id,
                        attempt,
                        delay,
                        error,
                        ..
                    } => println!(
                        "retrying document={document_id} attempt={attempt} in {}ms: {error}",
                        delay.as_millis()
                    ),
                    QueueEvent::Exhausted {
                        document_id, error, ..
                    } => println!("failed document={document_id}: {error}"),
                    QueueEvent::Completed { document_id, .. } => {
                        println!("completed document={document_id}")
                    }
                    _ => {}
                }
            }
        });

        let workers = self.queue.start(orchestrator);
        self.queue.wait_idle().await;
        workers.shutdown().await;
        reporter.abort();

        let stats = self.queue.stats().await;
        info!(
            completed = stats.completed,
            failed = stats.failed,
            "queue drained"
        );
    }
}

async fn connect_cache(redis_url: Option<&str>) -> Arc<dyn Cache> {
    let Some(url) = redis_url else {
        return Arc::new(MemoryCache::new());
    };
    match RedisCache::connect(url).await {
        Ok(cache) => Arc::new(cache),
        Err(error) => {
            warn!(error = %error, "redis unavailable, using in-process search cache");
            Arc::new(MemoryCache::new())
        }
    }
}

fn print_document(document: &Document) {
    println!(
        "{} {} status={} chunks={} pages={} uploaded={}",
        document.id,
        document.filename,
        document.status(),
        document.total_chunks,
        document.total_pages,
        document.uploaded_at.to_rfc3339()
    );
    if let Some(error) = document.error() {
        println!("  error: {error}");
    }
}

async fn print_status(store: &dyn MetadataStore, document_id: Option<&str>) -> anyhow::Result<()> {
    match document_id {
        Some(document_id) => {
            let document = store
                .get_document(document_id)
                .await?
                .with_context(|| format!("document {document_id} not found"))?;
            print_document(&document);
        }
        None => {
            let documents = store.list_documents().await?;
            if documents.is_empty() {
                println!("no documents");
            }
            for document in &documents {
                print_document(document);
            }
        }
    }
    Ok(())
}

async fn ingest(services: &Services, folder: &Path) -> anyhow::Result<()> {
    let report = services.ingestor().ingest_folder(folder).await?;
    for skipped in &report.skipped_files {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped payload");
    }
    info!(folder = %folder.display(), uploaded = report.documents.len(), "processing uploads");

    services.drain().await;
    for document in &report.documents {
        print_status(services.store.as_ref(), Some(&document.id)).await?;
    }
    println!(
        "{} documents ingested, {} files skipped at {}",
        report.documents.len(),
        report.skipped_files.len(),
        Utc::now().to_rfc3339()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-pipeline boot"
    );
    let services = Services::connect(&cli).await?;

    match &cli.command {
        Command::Ingest { folder } => ingest(&services, folder).await?,
        Command::Status { document } => {
            print_status(services.store.as_ref(), document.as_deref()).await?
        }
        Command::Search {
            document,
            query,
            kind,
            page,
            min_confidence,
            sort_by,
            sort_order,
            limit,
            offset,
            json,
        } => {
            let options = SearchOptions {
                limit: *limit,
                offset: *offset,
                kind: *kind,
                page: *page,
                min_confidence: *min_confidence,
                sort_by: *sort_by,
                sort_order: *sort_order,
            };
            let response = services.search().search(document, query, &options).await?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!(
                    "query: {} hits={} total={} time={}ms cached={}",
                    response.query,
                    response.hits.len(),
                    response.total_hits,
                    response.processing_time_ms,
                    response.cached
                );
                for hit in &response.hits {
                    let confidence = hit
                        .ocr_confidence
                        .map(|value| format!(" confidence={value:.1}"))
                        .unwrap_or_default();
                    println!(
                        "[{}] page={} chunk={}{confidence}",
                        hit.kind, hit.page_number, hit.chunk_id
                    );
                    println!("  {}", hit.highlighted.as_deref().unwrap_or(&hit.content));
                }
            }
        }
        Command::Suggest {
            document,
            query,
            count,
        } => {
            for suggestion in services.search().suggest(document, query, *count).await? {
                println!("{suggestion}");
            }
        }
        Command::Reprocess { document } => {
            services.ingestor().reprocess(document).await?;
            services.drain().await;
            print_status(services.store.as_ref(), Some(document)).await?;
        }
        Command::Delete { document } => {
            services.ingestor().delete(document).await?;
            println!("deleted {document}");
        }
        Command::ClearCache { document } => {
            let removed = services.search().clear_cache(document).await;
            println!("{removed} cached searches removed for {document}");
        }
    }

    services.store.close().await;
    Ok(())
}
