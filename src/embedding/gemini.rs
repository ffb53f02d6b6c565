//! Gemini 임베딩 - embedContent API 호출
//!
//! 문서는 `RETRIEVAL_DOCUMENT`, 쿼리는 `RETRIEVAL_QUERY` task type으로 보냅니다.
//! 무료 티어 분당 한도를 넘지 않도록 요청 간격을 두고, 429/5xx는 지수 백오프로 재시도합니다.
//!
//! ref: https://ai.google.dev/gemini-api/docs/embeddings

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{get_api_key, EmbeddingProvider};

/// Gemini API 베이스 URL
pub(crate) const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// 기본 임베딩 모델 (MRL: 출력 차원 축소 지원)
const DEFAULT_MODEL: &str = "gemini-embedding-001";

/// 기본 임베딩 차원
pub const DEFAULT_DIMENSION: usize = 768;

/// `outputDimensionality` 상한
const MAX_DIMENSION: usize = 3072;

/// 분당 요청 수 (무료 티어)
const REQUESTS_PER_MINUTE: u32 = 60;

/// Gemini 임베딩 task type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// 색인 대상 문서
    RetrievalDocument,
    /// 검색 쿼리
    RetrievalQuery,
}

impl TaskType {
    fn as_str(self) -> &'static str {
        match self {
            Self::RetrievalDocument => "RETRIEVAL_DOCUMENT",
            Self::RetrievalQuery => "RETRIEVAL_QUERY",
        }
    }
}

// ============================================================================
// Pacing & Retry
// ============================================================================

/// 요청 사이 최소 간격을 지키는 페이서
#[derive(Debug)]
struct Pacer {
    interval: Duration,
    next_slot: Option<Instant>,
}

impl Pacer {
    fn per_minute(requests: u32) -> Self {
        Self {
            interval: Duration::from_secs(60) / requests.max(1),
            next_slot: None,
        }
    }

    /// 다음 슬롯까지 대기할 시간을 계산하고 슬롯을 예약
    fn reserve(&mut self, now: Instant) -> Duration {
        let slot = match self.next_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        self.next_slot = Some(slot + self.interval);
        slot - now
    }
}

/// 재시도 정책 (지수 백오프)
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(attempt)
    }

    fn is_retryable(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

/// 한 번의 호출 결과
enum Attempt {
    Done(Vec<f32>),
    Retry(anyhow::Error),
}

// ============================================================================
// GeminiEmbedding
// ============================================================================

#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    model: String,
    dimension: usize,
    pacer: Arc<Mutex<Pacer>>,
    retry: RetryPolicy,
}

impl GeminiEmbedding {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_dimension(api_key, DEFAULT_DIMENSION)
    }

    /// # Arguments
    /// * `dimension` - 출력 차원 (1 ~ 3072, 권장 768/1536/3072)
    pub fn with_dimension(api_key: String, dimension: usize) -> Result<Self> {
        if dimension == 0 || dimension > MAX_DIMENSION {
            anyhow::bail!(
                "Invalid Gemini embedding dimension {} (expected 1..={})",
                dimension,
                MAX_DIMENSION
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            client,
            model: DEFAULT_MODEL.to_string(),
            dimension,
            pacer: Arc::new(Mutex::new(Pacer::per_minute(REQUESTS_PER_MINUTE))),
            retry: RetryPolicy::default(),
        })
    }

    /// 모델 지정 (예: "text-embedding-004")
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// 환경변수의 API 키로 생성
    pub fn from_env(dimension: usize) -> Result<Self> {
        Self::with_dimension(get_api_key()?, dimension)
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:embedContent", GEMINI_API_BASE, self.model)
    }

    /// task type을 지정한 임베딩
    pub async fn embed_with_task(&self, text: &str, task: TaskType) -> Result<Vec<f32>> {
        let request = EmbedRequest {
            model: format!("models/{}", self.model),
            content: EmbedContent {
                parts: vec![EmbedPart { text }],
            },
            task_type: task.as_str(),
            output_dimensionality: self.dimension,
        };

        let mut attempt = 0;
        loop {
            let wait = self.pacer.lock().await.reserve(Instant::now());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            let error = match self.send(&request).await? {
                Attempt::Done(values) => return Ok(values),
                Attempt::Retry(error) => error,
            };

            if attempt >= self.retry.max_retries {
                return Err(error.context(format!(
                    "Gemini embedding failed after {} retries",
                    self.retry.max_retries
                )));
            }

            let backoff = self.retry.backoff(attempt);
            attempt += 1;
            tracing::warn!(
                "Gemini embedding: {:#}; retry {}/{} in {:?}",
                error,
                attempt,
                self.retry.max_retries,
                backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// 요청 한 번. 재시도할 수 없는 에러는 `Err`로 반환
    async fn send(&self, request: &EmbedRequest<'_>) -> Result<Attempt> {
        let response = match self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Retry(anyhow::anyhow!("request failed: {}", e))),
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read embedding response body")?;

        if status.is_success() {
            let parsed: EmbedResponse =
                serde_json::from_str(&body).context("Failed to parse embedding response")?;
            return Ok(Attempt::Done(parsed.embedding.values));
        }

        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);

        if RetryPolicy::is_retryable(status) {
            return Ok(Attempt::Retry(anyhow::anyhow!("{}: {}", status, message)));
        }
        anyhow::bail!("Gemini API error ({}): {}", status, message)
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_with_task(text, TaskType::RetrievalDocument).await
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed_with_task(query, TaskType::RetrievalQuery).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: String,
    content: EmbedContent<'a>,
    #[serde(rename = "taskType")]
    task_type: &'static str,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent<'a> {
    parts: Vec<EmbedPart<'a>>,
}

#[derive(Debug, Serialize)]
struct EmbedPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_bounds() {
        assert!(GeminiEmbedding::with_dimension("key".to_string(), 0).is_err());
        assert!(GeminiEmbedding::with_dimension("key".to_string(), 4096).is_err());
        for dim in [256, 768, 3072] {
            assert!(GeminiEmbedding::with_dimension("key".to_string(), dim).is_ok());
        }
    }

    #[test]
    fn test_endpoint_uses_model() {
        let embedder = GeminiEmbedding::with_dimension("key".to_string(), 768)
            .unwrap()
            .with_model("text-embedding-004");
        assert!(embedder.endpoint().ends_with("/models/text-embedding-004:embedContent"));
        assert_eq!(embedder.name(), "text-embedding-004");
    }

    #[test]
    fn test_request_body_shape() {
        let request = EmbedRequest {
            model: "models/gemini-embedding-001".to_string(),
            content: EmbedContent {
                parts: vec![EmbedPart { text: "Section 302" }],
            },
            task_type: TaskType::RetrievalQuery.as_str(),
            output_dimensionality: 768,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["taskType"], "RETRIEVAL_QUERY");
        assert_eq!(body["outputDimensionality"], 768);
        assert_eq!(body["content"]["parts"][0]["text"], "Section 302");
    }

    #[test]
    fn test_pacer_spaces_requests() {
        let mut pacer = Pacer::per_minute(60);
        let start = Instant::now();

        assert_eq!(pacer.reserve(start), Duration::ZERO);
        assert_eq!(pacer.reserve(start), Duration::from_secs(1));
        assert_eq!(pacer.reserve(start), Duration::from_secs(2));
        // 간격이 지난 뒤에는 대기 없음
        assert_eq!(pacer.reserve(start + Duration::from_secs(10)), Duration::ZERO);
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
        assert!(RetryPolicy::is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(RetryPolicy::is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!RetryPolicy::is_retryable(StatusCode::BAD_REQUEST));
    }
}
