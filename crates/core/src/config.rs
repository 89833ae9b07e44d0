//! Runtime configuration for the pipeline collaborators.
//!
//! Every section has a `Default` and a `from_env()` constructor; unset or unparsable variables
//! fall back to the default.

use std::time::Duration;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|value| value.parse::<T>().ok())
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Maximum number of images recognized at the same time.
    pub pool_size: usize,
    pub timeout: Duration,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            pool_size: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

impl OcrConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OCR_ENDPOINT` | unset (images are skipped) |
    /// | `OCR_API_KEY` | unset |
    /// | `OCR_POOL_SIZE` | `2` |
    /// | `OCR_TIMEOUT_SECS` | `60` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: env_string("OCR_ENDPOINT"),
            api_key: env_string("OCR_API_KEY"),
            pool_size: env_parse("OCR_POOL_SIZE")
                .unwrap_or(defaults.pool_size)
                .max(1),
            timeout: env_parse("OCR_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// A run still active after this long is treated as stalled.
    pub job_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(30_000),
            job_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl QueueConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `QUEUE_WORKERS` | `2` |
    /// | `QUEUE_MAX_ATTEMPTS` | `3` |
    /// | `QUEUE_BACKOFF_MS` | `1000` |
    /// | `QUEUE_BACKOFF_MAX_MS` | `30000` |
    /// | `QUEUE_JOB_TIMEOUT_SECS` | `300` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_parse("QUEUE_WORKERS").unwrap_or(defaults.workers).max(1),
            max_attempts: env_parse("QUEUE_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_attempts)
                .max(1),
            backoff_base: env_parse("QUEUE_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: env_parse("QUEUE_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            job_timeout: env_parse("QUEUE_JOB_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            poll_interval: defaults.poll_interval,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Delay before retry number `attempt` (1-based count of failed attempts so far):
    /// the base delay doubled per failure, capped at `backoff_max`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        delay.min(self.backoff_max)
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub min_query_chars: usize,
    pub default_limit: usize,
    pub max_limit: usize,
    pub cache_ttl: Duration,
    /// Crop window, in words, for long content in results.
    pub crop_length: usize,
    pub highlight_pre_tag: String,
    pub highlight_post_tag: String,
    pub suggestion_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_query_chars: 2,
            default_limit: 20,
            max_limit: 100,
            cache_ttl: Duration::from_secs(300),
            crop_length: 30,
            highlight_pre_tag: "<mark>".to_string(),
            highlight_post_tag: "</mark>".to_string(),
            suggestion_limit: 5,
        }
    }
}

impl SearchConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SEARCH_CACHE_TTL_SECS` | `300` |
    /// | `SEARCH_DEFAULT_LIMIT` | `20` |
    /// | `SEARCH_MAX_LIMIT` | `100` |
    /// | `SEARCH_CROP_LENGTH` | `30` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_ttl: env_parse("SEARCH_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            default_limit: env_parse("SEARCH_DEFAULT_LIMIT").unwrap_or(defaults.default_limit),
            max_limit: env_parse("SEARCH_MAX_LIMIT").unwrap_or(defaults.max_limit),
            crop_length: env_parse("SEARCH_CROP_LENGTH").unwrap_or(defaults.crop_length),
            ..defaults
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// How long to wait for an enqueued index task to settle.
    pub task_timeout: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:7700".to_string(),
            api_key: None,
            task_timeout: Duration::from_secs(30),
        }
    }
}

impl IndexConfig {
    /// Reads `MEILI_URL` and `MEILI_API_KEY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env_string("MEILI_URL").unwrap_or(defaults.url),
            api_key: env_string("MEILI_API_KEY"),
            task_timeout: defaults.task_timeout,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub ocr: OcrConfig,
    pub queue: QueueConfig,
    pub search: SearchConfig,
    pub index: IndexConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            ocr: OcrConfig::from_env(),
            queue: QueueConfig::from_env(),
            search: SearchConfig::from_env(),
            index: IndexConfig::from_env(),
        }
    }
}
