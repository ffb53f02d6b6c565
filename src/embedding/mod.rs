//! 임베딩 모듈 - 텍스트 벡터화
//!
//! 청크와 쿼리를 고정 차원 벡터로 변환하는 프로바이더입니다.
//!
//! - `GeminiEmbedding`: Google Gemini API (문서/쿼리 task type 구분)
//! - `TeiEmbedding`: text-embeddings-inference 서버
//! - `HashingEmbedding`: 오프라인 결정적 임베딩 (테스트, 네트워크 없는 환경)
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = create_embedder(&config.embedding)?;
//! let embedding = embedder.embed_query("punishment for murder").await?;
//! ```

mod gemini;
mod hashing;
mod tei;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::{EmbeddingBackend, EmbeddingConfig};

pub(crate) use gemini::GEMINI_API_BASE;
pub use gemini::{GeminiEmbedding, TaskType, DEFAULT_DIMENSION};
pub use hashing::HashingEmbedding;
pub use tei::TeiEmbedding;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 벡터로 변환하는 인터페이스입니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩 (문서/청크용)
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 검색 쿼리 임베딩 (기본 구현: `embed`와 동일)
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed(query).await
    }

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// API Key Management
// ============================================================================

/// API 키 환경변수 (우선순위 순)
const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"];

fn find_api_key() -> Option<(&'static str, String)> {
    API_KEY_VARS.iter().find_map(|var| {
        std::env::var(var)
            .ok()
            .filter(|key| !key.is_empty())
            .map(|key| (*var, key))
    })
}

/// 환경변수에서 Gemini API 키 로드
pub fn get_api_key() -> Result<String> {
    let (var, key) = find_api_key().with_context(|| {
        format!(
            "API key not found. Set one of: {}",
            API_KEY_VARS.join(", ")
        )
    })?;
    tracing::debug!("Using API key from {}", var);
    Ok(key)
}

pub fn has_api_key() -> bool {
    find_api_key().is_some()
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에 맞는 임베딩 프로바이더 생성
///
/// Gemini는 환경변수의 API 키가 필요하고, TEI는 `endpoint`가 필요합니다.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let embedder: Arc<dyn EmbeddingProvider> = match config.backend {
        EmbeddingBackend::Gemini => {
            let mut embedder = GeminiEmbedding::from_env(config.dimension)?;
            if let Some(model) = &config.model {
                embedder = embedder.with_model(model.clone());
            }
            Arc::new(embedder)
        }
        EmbeddingBackend::Tei => {
            let endpoint = config
                .endpoint
                .as_deref()
                .context("embedding.endpoint is required for the tei backend")?;
            Arc::new(TeiEmbedding::new(endpoint, config.dimension)?)
        }
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedding::new(config.dimension)?),
    };

    tracing::info!(
        "Using {} embedding (dimension: {})",
        embedder.name(),
        embedder.dimension()
    );
    Ok(embedder)
}

// ============================================================================
// Tests
// ============================================================================
