//! Document-scoped search with cache-aside.
//!
//! A request is validated before anything external is touched. Responses are cached under a
//! fingerprint that starts with the document's cache prefix, so
//! [`SearchService::clear_cache`] can drop every entry for one document.

use crate::cache::{document_prefix, purge_document};
use crate::config::SearchConfig;
use crate::error::{BackendError, SearchError};
use crate::models::{
    index_uid, ChunkKind, Highlight, IndexFilter, IndexHit, IndexQuery, IndexSearchResult,
    SearchHit, SearchOptions, SearchResponse, SortField, SortOrder,
};
use crate::text::{char_len, normalize_query, tokenize};
use crate::traits::{Cache, MetadataStore, SearchIndex};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Results scanned when building suggestions.
const SUGGESTION_WINDOW: usize = 10;

/// Every input that can change the response, in a fixed field order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Fingerprint<'a> {
    query: &'a str,
    limit: usize,
    offset: usize,
    kind: Option<ChunkKind>,
    page: Option<u32>,
    min_confidence: Option<f32>,
    sort_by: Option<SortField>,
    sort_order: SortOrder,
}

pub struct SearchService {
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn SearchIndex>,
    cache: Arc<dyn Cache>,
    config: SearchConfig,
}

impl SearchService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn SearchIndex>,
        cache: Arc<dyn Cache>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            index,
            cache,
            config,
        }
    }

    #[instrument(skip(self, options))]
    pub async fn search(
        &self,
        document_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let normalized = self.validate_query(query)?;
        let limit = self.effective_limit(options)?;
        self.ensure_ready(document_id).await?;

        let key = self.fingerprint(document_id, &normalized, limit, options)?;
        if let Some(mut cached) = self.cached(&key).await {
            debug!(key, "search served from cache");
            cached.cached = true;
            return Ok(cached);
        }

        let started = Instant::now();
        let index_query = self.index_query(&normalized, limit, options);
        let result = match self.index.search(&index_uid(document_id), &index_query).await {
            Ok(result) => result,
            Err(BackendError::IndexNotFound(uid)) => {
                debug!(uid, "document has no index, answering with no hits");
                IndexSearchResult::default()
            }
            Err(error) => return Err(error.into()),
        };

        let response = SearchResponse {
            document_id: document_id.to_string(),
            query: normalized,
            total_hits: result.estimated_total,
            hits: result.hits.into_iter().map(shape_hit).collect(),
            limit,
            offset: options.offset,
            processing_time_ms: started.elapsed().as_millis() as u64,
            cached: false,
        };

        if !response.hits.is_empty() {
            self.store_in_cache(&key, &response).await;
        }
        Ok(response)
    }

    /// Words from the best matches that continue the last query word or repeat a query word.
    pub async fn suggest(
        &self,
        document_id: &str,
        prefix: &str,
        count: Option<usize>,
    ) -> Result<Vec<String>, SearchError> {
        let count = count.unwrap_or(self.config.suggestion_limit);
        let options = SearchOptions {
            limit: Some(SUGGESTION_WINDOW),
            ..SearchOptions::default()
        };
        let response = self.search(document_id, prefix, &options).await?;

        let query_tokens = tokenize(&response.query);
        let Some(last) = query_tokens.last() else {
            return Ok(Vec::new());
        };

        let mut seen = HashSet::new();
        let suggestions = response
            .hits
            .iter()
            .flat_map(|hit| tokenize(&hit.content))
            .filter(|word| char_len(word) >= self.config.min_query_chars)
            .filter(|word| word.starts_with(last.as_str()) || query_tokens.contains(word))
            .filter(|word| seen.insert(word.clone()))
            .take(count)
            .collect();
        Ok(suggestions)
    }

    /// Drops every cached response for `document_id`, regardless of TTL.
    pub async fn clear_cache(&self, document_id: &str) -> usize {
        purge_document(self.cache.as_ref(), document_id).await
    }

    fn validate_query(&self, query: &str) -> Result<String, SearchError> {
        let min = self.config.min_query_chars;
        let actual = char_len(query.trim());
        if actual < min {
            return Err(SearchError::QueryTooShort { min, actual });
        }

        let normalized = normalize_query(query);
        let searchable = char_len(&normalized);
        if searchable < min {
            return Err(SearchError::QueryTooShort {
                min,
                actual: searchable,
            });
        }
        Ok(normalized)
    }

    fn effective_limit(&self, options: &SearchOptions) -> Result<usize, SearchError> {
        if options.limit == Some(0) {
            return Err(SearchError::Validation("limit must be at least 1".to_string()));
        }
        if let Some(threshold) = options.min_confidence {
            if !(0.0..=100.0).contains(&threshold) {
                return Err(SearchError::Validation(format!(
                    "minimum confidence must be within 0..=100, got {threshold}"
                )));
            }
        }
        if options.page == Some(0) {
            return Err(SearchError::Validation("page numbers start at 1".to_string()));
        }

        Ok(options
            .limit
            .unwrap_or(self.config.default_limit)
            .min(self.config.max_limit))
    }

    async fn ensure_ready(&self, document_id: &str) -> Result<(), SearchError> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| SearchError::NotFound(document_id.to_string()))?;

        if !document.is_completed() {
            return Err(SearchError::NotReady {
                document_id: document_id.to_string(),
                status: document.status(),
            });
        }
        Ok(())
    }

    fn fingerprint(
        &self,
        document_id: &str,
        normalized: &str,
        limit: usize,
        options: &SearchOptions,
    ) -> Result<String, SearchError> {
        let canonical = serde_json::to_vec(&Fingerprint {
            query: normalized,
            limit,
            offset: options.offset,
            kind: options.kind,
            page: options.page,
            min_confidence: options.min_confidence,
            sort_by: options.sort_by,
            sort_order: options.sort_order,
        })
        .map_err(BackendError::from)?;

        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(format!(
            "{}{:x}",
            document_prefix(document_id),
            hasher.finalize()
        ))
    }

    fn index_query(&self, normalized: &str, limit: usize, options: &SearchOptions) -> IndexQuery {
        let mut query = IndexQuery::new(normalized, limit);
        query.offset = options.offset;

        if let Some(kind) = options.kind {
            query.filters.push(IndexFilter::Kind(kind));
        }
        if let Some(page) = options.page {
            query.filters.push(IndexFilter::Page(page));
        }
        if let Some(threshold) = options.min_confidence {
            query.filters.push(IndexFilter::MinConfidence(threshold));
        }

        query.sort = options.sort_by.map(|field| (field, options.sort_order));
        query.highlight = Some(Highlight {
            pre_tag: self.config.highlight_pre_tag.clone(),
            post_tag: self.config.highlight_post_tag.clone(),
        });
        query.crop_length = Some(self.config.crop_length);
        query
    }

    async fn cached(&self, key: &str) -> Option<SearchResponse> {
        let raw = match self.cache.get(key).await {
            Ok(raw) => raw?,
            Err(error) => {
                warn!(key, error = %error, "search cache read failed, querying index");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(response) => Some(response),
            Err(error) => {
                warn!(key, error = %error, "discarding unreadable cache entry");
                if let Err(error) = self.cache.delete(key).await {
                    debug!(key, error = %error, "cache entry cleanup failed");
                }
                None
            }
        }
    }

    async fn store_in_cache(&self, key: &str, response: &SearchResponse) {
        let serialized = match serde_json::to_string(response) {
            Ok(serialized) => serialized,
            Err(error) => {
                warn!(key, error = %error, "search response not cacheable");
                return;
            }
        };
        if let Err(error) = self.cache.set(key, &serialized, self.config.cache_ttl).await {
            warn!(key, error = %error, "search cache write failed");
        }
    }
}

fn shape_hit(hit: IndexHit) -> SearchHit {
    let IndexHit {
        document,
        formatted_content,
    } = hit;
    SearchHit {
        chunk_id: document.id,
        kind: document.kind,
        page_number: document.page_number,
        content: document.content,
        highlighted: formatted_content,
        ocr_confidence: document.ocr_confidence,
        position: document.position,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::models::{Document, IndexDocument, IndexSettings};
    use crate::stores::{MemoryMetadataStore, MemorySearchIndex};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts queries reaching the wrapped index.
    struct CountingIndex {
        inner: MemorySearchIndex,
        searches: AtomicUsize,
    }

    #[async_trait]
    impl SearchIndex for CountingIndex {
        async fn create_index(&self, uid: &str) -> Result<(), BackendError> {
            self.inner.create_index(uid).await
        }

        async fn configure(&self, uid: &str, settings: &IndexSettings) -> Result<(), BackendError> {
            self.inner.configure(uid, settings).await
        }

        async fn add_documents(
            &self,
            uid: &str,
            documents: &[IndexDocument],
        ) -> Result<(), BackendError> {
            self.inner.add_documents(uid, documents).await
        }

        async fn search(
            &self,
            uid: &str,
            query: &IndexQuery,
        ) -> Result<IndexSearchResult, BackendError> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            self.inner.search(uid, query).await
        }

        async fn delete_index(&self, uid: &str) -> Result<(), BackendError> {
            self.inner.delete_index(uid).await
        }
    }

    struct UnreachableCache;

    #[async_trait]
    impl Cache for UnreachableCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, BackendError> {
            Err(BackendError::Unavailable("cache down".to_string()))
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), BackendError> {
            Err(BackendError::Unavailable("cache down".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<bool, BackendError> {
            Err(BackendError::Unavailable("cache down".to_string()))
        }

        async fn exists(&self, _key: &str) -> Result<bool, BackendError> {
            Err(BackendError::Unavailable("cache down".to_string()))
        }

        async fn delete_prefix(&self, _prefix: &str) -> Result<usize, BackendError> {
            Err(BackendError::Unavailable("cache down".to_string()))
        }
    }

    fn index_document(document_id: &str, id: &str, kind: ChunkKind, page: u32, content: &str) -> IndexDocument {
        IndexDocument {
            id: id.to_string(),
            document_id: document_id.to_string(),
            kind,
            content: content.to_string(),
            page_number: page,
            ocr_confidence: (kind == ChunkKind::Image).then_some(88.0),
            word_count: content.split_whitespace().count(),
            char_count: content.chars().count(),
            position: None,
        }
    }

    struct Fixture {
        service: SearchService,
        index: Arc<CountingIndex>,
        store: Arc<MemoryMetadataStore>,
        document_id: String,
    }

    async fn fixture_with_cache(cache: Arc<dyn Cache>) -> Fixture {
        let store = Arc::new(MemoryMetadataStore::new());
        let index = Arc::new(CountingIndex {
            inner: MemorySearchIndex::new(),
            searches: AtomicUsize::new(0),
        });

        let mut document = Document::new("manual.pdf", 4096, "application/pdf", None);
        document.begin_processing().unwrap();
        document.complete().unwrap();
        store.insert_document(&document).await.unwrap();

        let uid = index_uid(&document.id);
        index.create_index(&uid).await.unwrap();
        index.configure(&uid, &IndexSettings::for_chunks()).await.unwrap();
        index
            .add_documents(
                &uid,
                &[
                    index_document(&document.id, "p1", ChunkKind::Paragraph, 1, "The pump pressure dropped below the limit"),
                    index_document(&document.id, "p2", ChunkKind::Paragraph, 2, "Replace the pump seal every year"),
                    index_document(&document.id, "i1", ChunkKind::Image, 3, "Pump diagram label"),
                ],
            )
            .await
            .unwrap();

        Fixture {
            service: SearchService::new(store.clone(), index.clone(), cache, SearchConfig::default()),
            index,
            store,
            document_id: document.id,
        }
    }

    async fn fixture() -> (Fixture, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        (fixture_with_cache(cache.clone()).await, cache)
    }

    #[tokio::test]
    async fn short_query_fails_before_any_lookup() {
        let (f, _) = fixture().await;
        let error = f
            .service
            .search("unknown", " a ", &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, SearchError::QueryTooShort { min: 2, actual: 1 }));
        assert_eq!(f.index.searches.load(Ordering::SeqCst), 0);

        let punctuation_only = f
            .service
            .search(&f.document_id, "?!", &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(punctuation_only, SearchError::QueryTooShort { .. }));
    }

    #[tokio::test]
    async fn unknown_and_unfinished_documents_are_distinguished() {
        let (f, _) = fixture().await;
        let missing = f
            .service
            .search("missing", "pump", &SearchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(missing.status_code(), 404);

        let pending = Document::new("later.pdf", 10, "application/pdf", None);
        f.store.insert_document(&pending).await.unwrap();
        let not_ready = f
            .service
            .search(&pending.id, "pump", &SearchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(not_ready.status_code(), 409);
        assert_eq!(f.index.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_options_are_rejected() {
        let (f, _) = fixture().await;
        let zero_limit = SearchOptions {
            limit: Some(0),
            ..SearchOptions::default()
        };
        assert!(matches!(
            f.service.search(&f.document_id, "pump", &zero_limit).await,
            Err(SearchError::Validation(_))
        ));

        let bad_confidence = SearchOptions {
            min_confidence: Some(140.0),
            ..SearchOptions::default()
        };
        assert!(matches!(
            f.service.search(&f.document_id, "pump", &bad_confidence).await,
            Err(SearchError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn repeated_search_is_served_from_cache_until_cleared() {
        let (f, _) = fixture().await;
        let options = SearchOptions::default();

        let first = f.service.search(&f.document_id, "  PUMP ", &options).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.query, "pump");
        assert_eq!(first.total_hits, 3);

        let second = f.service.search(&f.document_id, "pump", &options).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.hits, first.hits);
        assert_eq!(second.processing_time_ms, first.processing_time_ms);
        assert_eq!(f.index.searches.load(Ordering::SeqCst), 1);

        assert_eq!(f.service.clear_cache(&f.document_id).await, 1);
        let third = f.service.search(&f.document_id, "pump", &options).await.unwrap();
        assert!(!third.cached);
        assert_eq!(f.index.searches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn different_options_use_different_cache_entries() {
        let (f, cache) = fixture().await;
        f.service
            .search(&f.document_id, "pump", &SearchOptions::default())
            .await
            .unwrap();
        let filtered = SearchOptions {
            kind: Some(ChunkKind::Image),
            min_confidence: Some(80.0),
            ..SearchOptions::default()
        };
        let response = f.service.search(&f.document_id, "pump", &filtered).await.unwrap();

        assert!(!response.cached);
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].chunk_id, "i1");
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn empty_results_are_not_cached() {
        let (f, cache) = fixture().await;
        let response = f
            .service
            .search(&f.document_id, "turbine", &SearchOptions::default())
            .await
            .unwrap();
        assert!(response.hits.is_empty());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn limit_is_capped_and_hits_are_highlighted() {
        let (f, _) = fixture().await;
        let options = SearchOptions {
            limit: Some(10_000),
            sort_by: Some(SortField::PageNumber),
            sort_order: SortOrder::Desc,
            ..SearchOptions::default()
        };
        let response = f.service.search(&f.document_id, "pump", &options).await.unwrap();

        assert_eq!(response.limit, 100);
        let pages: Vec<u32> = response.hits.iter().map(|hit| hit.page_number).collect();
        assert_eq!(pages, vec![3, 2, 1]);
        assert!(response.hits[0]
            .highlighted
            .as_deref()
            .is_some_and(|text| text.contains("<mark>Pump</mark>")));
    }

    #[tokio::test]
    async fn unreachable_cache_degrades_to_index_queries() {
        let f = fixture_with_cache(Arc::new(UnreachableCache)).await;
        for _ in 0..2 {
            let response = f
                .service
                .search(&f.document_id, "pump", &SearchOptions::default())
                .await
                .unwrap();
            assert!(!response.cached);
        }
        assert_eq!(f.index.searches.load(Ordering::SeqCst), 2);
        assert_eq!(f.service.clear_cache(&f.document_id).await, 0);
    }

    #[tokio::test]
    async fn suggestions_extend_the_last_word() {
        let (f, _) = fixture().await;
        let suggestions = f
            .service
            .suggest(&f.document_id, "replace pu", Some(3))
            .await
            .unwrap();
        assert_eq!(suggestions, vec!["replace".to_string(), "pump".to_string()]);
    }
}
