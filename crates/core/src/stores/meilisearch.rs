use crate::config::IndexConfig;
use crate::error::BackendError;
use crate::models::{
    IndexDocument, IndexFilter, IndexHit, IndexQuery, IndexSearchResult, IndexSettings,
};
use crate::traits::SearchIndex;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

const BACKEND: &str = "meilisearch";
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueuedTask {
    task_uid: u64,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Meilisearch index service. Index mutations are asynchronous tasks on the server; each call
/// waits for its task to settle so callers see the outcome, including the
/// `index_already_exists` / `index_not_found` conditions.
pub struct MeilisearchIndex {
    client: Client,
    base: Url,
    api_key: Option<String>,
    task_timeout: Duration,
}

impl MeilisearchIndex {
    pub fn new(config: &IndexConfig) -> Result<Self, BackendError> {
        let mut raw = config.url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }

        Ok(Self {
            client: Client::builder().timeout(config.task_timeout).build()?,
            base: Url::parse(&raw)?,
            api_key: config.api_key.clone(),
            task_timeout: config.task_timeout,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, BackendError> {
        let url = self.base.join(path)?;
        let mut request = self.client.request(method, url);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        Ok(request)
    }

    /// Waits for the task enqueued by `response` and maps a failed task onto a backend error.
    async fn settle(&self, response: Response, uid: &str) -> Result<(), BackendError> {
        if !response.status().is_success() {
            return Err(error_from_response(response, uid).await);
        }

        let task: EnqueuedTask = response.json().await?;
        let deadline = Instant::now() + self.task_timeout;

        loop {
            let response = self
                .request(Method::GET, &format!("tasks/{}", task.task_uid))?
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(error_from_response(response, uid).await);
            }

            let status: TaskStatus = response.json().await?;
            match status.status.as_str() {
                "succeeded" => return Ok(()),
                "failed" | "canceled" => {
                    let error = status.error.unwrap_or(ApiError {
                        code: status.status.clone(),
                        message: format!("task {} {}", task.task_uid, status.status),
                    });
                    return Err(map_api_error(error, uid));
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(BackendError::Unavailable(format!(
                    "{BACKEND} task {} did not finish within {:?}",
                    task.task_uid, self.task_timeout
                )));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }
}

fn map_api_error(error: ApiError, uid: &str) -> BackendError {
    match error.code.as_str() {
        "index_already_exists" => BackendError::IndexAlreadyExists(uid.to_string()),
        "index_not_found" => BackendError::IndexNotFound(uid.to_string()),
        _ => BackendError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!("{}: {}", error.code, error.message),
        },
    }
}

async fn error_from_response(response: Response, uid: &str) -> BackendError {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(error) if !error.code.is_empty() => map_api_error(error, uid),
        _ if status == StatusCode::NOT_FOUND => BackendError::IndexNotFound(uid.to_string()),
        _ => BackendError::BackendResponse {
            backend: BACKEND.to_string(),
            details: status.to_string(),
        },
    }
}

#[async_trait]
impl SearchIndex for MeilisearchIndex {
    async fn create_index(&self, uid: &str) -> Result<(), BackendError> {
        let response = self
            .request(Method::POST, "indexes")?
            .json(&json!({ "uid": uid, "primaryKey": "id" }))
            .send()
            .await?;
        self.settle(response, uid).await
    }

    async fn configure(&self, uid: &str, settings: &IndexSettings) -> Result<(), BackendError> {
        let response = self
            .request(Method::PATCH, &format!("indexes/{uid}/settings"))?
            .json(settings)
            .send()
            .await?;
        self.settle(response, uid).await
    }

    async fn add_documents(
        &self,
        uid: &str,
        documents: &[IndexDocument],
    ) -> Result<(), BackendError> {
        if documents.is_empty() {
            return Ok(());
        }

        let response = self
            .request(Method::POST, &format!("indexes/{uid}/documents?primaryKey=id"))?
            .json(documents)
            .send()
            .await?;
        self.settle(response, uid).await?;
        debug!(uid, count = documents.len(), "documents indexed");
        Ok(())
    }

    async fn search(
        &self,
        uid: &str,
        query: &IndexQuery,
    ) -> Result<IndexSearchResult, BackendError> {
        let response = self
            .request(Method::POST, &format!("indexes/{uid}/search"))?
            .json(&build_search_body(query))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, uid).await);
        }

        let body: Value = response.json().await?;
        parse_search_response(&body)
    }

    async fn delete_index(&self, uid: &str) -> Result<(), BackendError> {
        let response = self
            .request(Method::DELETE, &format!("indexes/{uid}"))?
            .send()
            .await?;
        self.settle(response, uid).await
    }
}

fn build_filters(filters: &[IndexFilter]) -> Vec<String> {
    filters
        .iter()
        .map(|filter| match filter {
            IndexFilter::Kind(kind) => format!("kind = \"{}\"", kind.as_str()),
            IndexFilter::Page(page) => format!("pageNumber = {page}"),
            IndexFilter::MinConfidence(threshold) => format!("ocrConfidence >= {threshold}"),
        })
        .collect()
}

fn build_search_body(query: &IndexQuery) -> Value {
    let mut body = json!({
        "q": query.text,
        "limit": query.limit,
        "offset": query.offset,
    });

    let filters = build_filters(&query.filters);
    if !filters.is_empty() {
        body["filter"] = json!(filters);
    }
    if let Some((field, order)) = query.sort {
        body["sort"] = json!([format!("{}:{}", field.attribute(), order.as_str())]);
    }
    if let Some(highlight) = &query.highlight {
        body["attributesToHighlight"] = json!(["content"]);
        body["highlightPreTag"] = json!(highlight.pre_tag);
        body["highlightPostTag"] = json!(highlight.post_tag);
    }
    if let Some(crop_length) = query.crop_length {
        body["attributesToCrop"] = json!(["content"]);
        body["cropLength"] = json!(crop_length);
    }

    body
}

fn parse_search_response(body: &Value) -> Result<IndexSearchResult, BackendError> {
    let raw_hits = body
        .pointer("/hits")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut hits = Vec::with_capacity(raw_hits.len());
    for raw in raw_hits {
        let formatted_content = raw
            .pointer("/_formatted/content")
            .and_then(Value::as_str)
            .map(str::to_string);
        let document: IndexDocument = serde_json::from_value(raw)?;
        hits.push(IndexHit {
            document,
            formatted_content,
        });
    }

    let estimated_total = body
        .pointer("/estimatedTotalHits")
        .or_else(|| body.pointer("/totalHits"))
        .and_then(Value::as_u64)
        .map(|total| total as usize)
        .unwrap_or(hits.len());
    let processing_time_ms = body
        .pointer("/processingTimeMs")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(IndexSearchResult {
        hits,
        estimated_total,
        processing_time_ms,
    })
}
