use crate::config::OcrConfig;
use crate::error::{BackendError, ExtractionError};
use crate::traits::{OcrEngine, OcrOutput};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
struct OcrRequest {
    image_base64: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// OCR engine reached over HTTP: the image goes out base64-encoded, `{text, confidence}` comes back.
pub struct HttpOcrEngine {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOcrEngine {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &OcrConfig) -> Result<Option<Self>, BackendError> {
        match &config.endpoint {
            Some(endpoint) => Ok(Some(Self::new(
                endpoint.clone(),
                config.api_key.clone(),
                config.timeout,
            )?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    async fn recognize(&self, image: &[u8]) -> Result<OcrOutput, BackendError> {
        let payload = OcrRequest {
            image_base64: STANDARD.encode(image),
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BackendError::BackendResponse {
                backend: "ocr".to_string(),
                details: format!("{} returned {}", self.endpoint, response.status()),
            });
        }

        let payload: OcrResponse = response.json().await?;
        Ok(OcrOutput {
            text: payload.text.unwrap_or_default(),
            confidence: payload.confidence.unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrRecognition {
    pub text: String,
    pub confidence: f32,
    pub processing_time: Duration,
}

/// Bounded pool in front of an [`OcrEngine`].
///
/// A semaphore permit is the worker: it is taken per image and released when the recognition
/// future finishes, whether it succeeded, failed or panicked.
#[derive(Clone)]
pub struct OcrAdapter {
    engine: Arc<dyn OcrEngine>,
    permits: Arc<Semaphore>,
}

impl OcrAdapter {
    pub fn new(engine: Arc<dyn OcrEngine>, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            engine,
            permits: Arc::new(Semaphore::new(pool_size)),
        }
    }

    pub async fn recognize(&self, image: &[u8]) -> Result<OcrRecognition, ExtractionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ExtractionError::OcrWorker("ocr pool closed".to_string()))?;
        run_recognition(self.engine.as_ref(), image).await
    }

    /// Recognizes every image with at most `pool_size` in flight. The result at position `i`
    /// belongs to `images[i]`; one failure never affects the other outcomes.
    pub async fn recognize_batch(
        &self,
        images: Vec<Vec<u8>>,
    ) -> Vec<Result<OcrRecognition, ExtractionError>> {
        let total = images.len();
        let mut tasks = JoinSet::new();

        for (index, image) in images.into_iter().enumerate() {
            let engine = Arc::clone(&self.engine);
            let permits = Arc::clone(&self.permits);
            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => run_recognition(engine.as_ref(), &image).await,
                    Err(_) => Err(ExtractionError::OcrWorker("ocr pool closed".to_string())),
                };
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<OcrRecognition, ExtractionError>>> =
            (0..total).map(|_| None).collect();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(error) => warn!(error = %error, "ocr task aborted"),
            }
        }

        outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| {
                    Err(ExtractionError::OcrWorker("ocr task aborted".to_string()))
                })
            })
            .collect()
    }
}

async fn run_recognition(
    engine: &dyn OcrEngine,
    image: &[u8],
) -> Result<OcrRecognition, ExtractionError> {
    let started = Instant::now();
    let output = engine.recognize(image).await?;
    let recognition = OcrRecognition {
        text: clean_ocr_text(&output.text),
        confidence: output.confidence.clamp(0.0, 100.0),
        processing_time: started.elapsed(),
    };
    debug!(
        bytes = image.len(),
        chars = recognition.text.len(),
        confidence = recognition.confidence,
        elapsed_ms = recognition.processing_time.as_millis() as u64,
        "ocr recognized image"
    );
    Ok(recognition)
}

fn blank_lines() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\n{3,}").expect("blank line pattern is valid"))
}

fn inline_whitespace() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[ \t\u{a0}]+").expect("whitespace pattern is valid"))
}

/// Removes common OCR artifacts: mixed line endings, control characters, misread glyphs and
/// runs of whitespace.
pub fn clean_ocr_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let printable: Vec<char> = unified
        .chars()
        .filter(|ch| !ch.is_control() || *ch == '\n' || *ch == '\t')
        .collect();

    let mut repaired = String::with_capacity(printable.len());
    for (index, ch) in printable.iter().enumerate() {
        let before = index.checked_sub(1).and_then(|i| printable.get(i)).copied();
        let after = printable.get(index + 1).copied();
        let letter_before = before.is_some_and(char::is_alphabetic);
        let letter_after = after.is_some_and(char::is_alphabetic);

        let fixed = match ch {
            '|' if letter_before || letter_after => 'l',
            '0' if letter_before && letter_after => 'o',
            other => *other,
        };
        repaired.push(fixed);
    }

    let collapsed = inline_whitespace().replace_all(&repaired, " ");
    let trimmed_lines = collapsed
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");

    blank_lines()
        .replace_all(&trimmed_lines, "\n\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEngine {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl OcrEngine for CountingEngine {
        async fn recognize(&self, image: &[u8]) -> Result<OcrOutput, BackendError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if image == b"broken" {
                return Err(BackendError::Unavailable("engine rejected image".to_string()));
            }
            Ok(OcrOutput {
                text: String::from_utf8_lossy(image).to_string(),
                confidence: 140.0,
            })
        }
    }

    #[test]
    fn cleanup_repairs_glyphs_and_whitespace() {
        let raw = "He||o   wor|d\r\n\r\n\r\n\r\nB0ok\u{0007} page 10\t\tend";
        assert_eq!(clean_ocr_text(raw), "Hello world\n\nBook page 10 end");
    }

    #[test]
    fn cleanup_keeps_standalone_bars_and_numbers() {
        assert_eq!(clean_ocr_text("a | b 100"), "a | b 100");
    }

    #[tokio::test]
    async fn batch_respects_pool_bound_and_isolates_failures() {
        let engine = Arc::new(CountingEngine {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let adapter = OcrAdapter::new(engine.clone(), 2);

        let images = vec![
            b"first image".to_vec(),
            b"broken".to_vec(),
            b"third image".to_vec(),
            b"fourth image".to_vec(),
            b"fifth image".to_vec(),
        ];
        let outcomes = adapter.recognize_batch(images).await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes[1].is_err());
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 4);
        assert_eq!(outcomes[0].as_ref().unwrap().text, "first image");
        assert_eq!(outcomes[0].as_ref().unwrap().confidence, 100.0);
        assert!(engine.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(adapter.permits.available_permits(), 2);
    }

    #[tokio::test]
    async fn single_image_is_cleaned_clamped_and_releases_its_permit() {
        let engine = Arc::new(CountingEngine {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let adapter = OcrAdapter::new(engine, 1);

        let recognition = adapter.recognize(b"He||o   wor|d").await.unwrap();
        assert_eq!(recognition.text, "Hello world");
        assert_eq!(recognition.confidence, 100.0);
        assert_eq!(adapter.permits.available_permits(), 1);

        let failure = adapter.recognize(b"broken").await;
        assert!(matches!(failure, Err(ExtractionError::Ocr(_))));
        assert_eq!(adapter.permits.available_permits(), 1);
    }
}
