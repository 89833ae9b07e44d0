use crate::models::DocumentStatus;
use thiserror::Error;

/// Failure of an external collaborator: search index, cache, OCR engine or metadata database.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// A single content record could not be turned into a chunk.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("malformed table: {0}")]
    MalformedTable(String),

    #[error("image record has no data")]
    MissingImageData,

    #[error("no OCR engine configured")]
    OcrUnavailable,

    #[error("OCR failed: {0}")]
    Ocr(#[from] BackendError),

    #[error("OCR worker panicked: {0}")]
    OcrWorker(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("illegal status transition from {from} to {to}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },

    #[error("dependency error: {0}")]
    Dependency(#[from] BackendError),
}

impl PipelineError {
    /// Whether another attempt could succeed. Bad input and missing records never will.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Dependency(_))
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("query must be at least {min} characters, got {actual}")]
    QueryTooShort { min: usize, actual: usize },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document {document_id} is not ready for search (status {status})")]
    NotReady {
        document_id: String,
        status: DocumentStatus,
    },

    #[error("dependency error: {0}")]
    Dependency(#[from] BackendError),
}

impl SearchError {
    /// Response code the HTTP boundary should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            SearchError::QueryTooShort { .. } | SearchError::Validation(_) => 400,
            SearchError::NotFound(_) => 404,
            SearchError::NotReady { .. } => 409,
            SearchError::Dependency(_) => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_errors_map_to_distinct_codes() {
        let too_short = SearchError::QueryTooShort { min: 2, actual: 1 };
        let missing = SearchError::NotFound("doc".to_string());
        let not_ready = SearchError::NotReady {
            document_id: "doc".to_string(),
            status: DocumentStatus::Pending,
        };
        let backend = SearchError::Dependency(BackendError::Unavailable("index".to_string()));

        assert_eq!(too_short.status_code(), 400);
        assert_eq!(missing.status_code(), 404);
        assert_eq!(not_ready.status_code(), 409);
        assert_eq!(backend.status_code(), 503);
    }
}
