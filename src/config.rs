//! 엔진 설정
//!
//! 모든 튜닝 값은 이름 있는 필드로 노출됩니다. 숨겨진 상수는 없습니다.
//!
//! 로드 순서 (뒤가 우선):
//! 1. 기본값 (`EngineConfig::default()`)
//! 2. TOML 파일 (`<data_dir>/config.toml` 또는 지정 경로)
//! 3. `LEGAL_RAG_` 접두사 환경변수 (`__`로 섹션 구분, 예: `LEGAL_RAG_HYBRID__W_SEMANTIC=0.5`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::knowledge::{Bm25Params, ChunkConfig, DistanceMetric, ScoreNormalization};

/// 환경변수 접두사
pub const ENV_PREFIX: &str = "LEGAL_RAG_";

/// 데이터 디렉토리 경로 (~/.legal-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".legal-rag")
}

// ============================================================================
// Sections
// ============================================================================

/// 임베딩 백엔드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Google Gemini API
    Gemini,
    /// text-embeddings-inference 서버
    Tei,
    /// 로컬 해싱 임베딩 (오프라인, 결정적)
    Hashing,
}

/// 임베딩 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    /// 벡터 차원. 인덱스에 들어가는 모든 벡터가 이 차원이어야 합니다.
    pub dimension: usize,
    /// HTTP 백엔드 주소 (Tei)
    pub endpoint: Option<String>,
    /// 모델 이름 (Gemini)
    pub model: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Gemini,
            dimension: 768,
            endpoint: None,
            model: None,
        }
    }
}

/// 하이브리드 결합 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// 시맨틱 점수 가중치 (0.0 ~ 1.0). 렉시컬 가중치는 `1 - w_semantic`.
    pub w_semantic: f32,
    /// 점수 정규화 방식
    pub normalization: ScoreNormalization,
    /// 각 인덱스에서 가져올 후보 수 (요청 top_k 보다 작으면 top_k 사용)
    pub candidate_pool: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            w_semantic: 0.7,
            normalization: ScoreNormalization::MinMax,
            candidate_pool: 50,
        }
    }
}

/// 리랭커 백엔드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankBackend {
    /// 리랭킹 없음 (하이브리드 순서 그대로)
    None,
    /// 로컬 용어 근접도 스코어러
    TermProximity,
    /// text-embeddings-inference 크로스 인코더
    Tei,
}

/// 리랭커 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub backend: RerankBackend,
    pub endpoint: Option<String>,
    /// 리랭킹할 하이브리드 상위 후보 수
    pub candidates: usize,
    /// 리랭커 호출 제한 시간 (ms). 초과 시 하이브리드 순서로 응답합니다.
    pub timeout_ms: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            backend: RerankBackend::TermProximity,
            endpoint: None,
            candidates: 20,
            timeout_ms: 2_000,
        }
    }
}

impl RerankConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 검색 기본값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// 기본 결과 수
    pub top_k: usize,
    /// 쿼리 임베딩 제한 시간 (ms). 초과 시 렉시컬 검색만 사용합니다.
    pub embed_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            embed_timeout_ms: 10_000,
        }
    }
}

impl SearchConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }
}

/// 컨텍스트 조립 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// 답변 생성에 넘길 최대 청크 수
    pub top_k: usize,
    /// 선택된 청크 전체의 문자 수 상한
    pub char_budget: usize,
    /// 같은 문서에서 인접한 청크 병합 여부
    pub merge_adjacent: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            char_budget: 4_000,
            merge_adjacent: true,
        }
    }
}

/// 답변 생성 설정 (Gemini `generateContent`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.1,
            max_output_tokens: 1024,
        }
    }
}

// ============================================================================
// EngineConfig
// ============================================================================

/// 검색 엔진 전체 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 인덱스 저장 디렉토리
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    /// 벡터 거리 척도
    pub distance: DistanceMetric,
    pub bm25: Bm25Params,
    pub hybrid: HybridConfig,
    pub chunking: ChunkConfig,
    pub rerank: RerankConfig,
    pub search: SearchConfig,
    pub context: ContextConfig,
    pub generation: GenerationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            embedding: EmbeddingConfig::default(),
            distance: DistanceMetric::Cosine,
            bm25: Bm25Params::default(),
            hybrid: HybridConfig::default(),
            chunking: ChunkConfig::default(),
            rerank: RerankConfig::default(),
            search: SearchConfig::default(),
            context: ContextConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 기본값 + TOML + 환경변수 병합 로드
    ///
    /// `path`가 없으면 `<기본 데이터 디렉토리>/config.toml`을 시도합니다.
    /// 파일이 없으면 건너뜁니다.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| get_data_dir().join("config.toml"));

        let config: EngineConfig = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| RagError::Config(e.to_string()))?;

        config.validate()?;
        tracing::debug!("Loaded engine config (file: {:?})", file);
        Ok(config)
    }

    /// 지정된 데이터 디렉토리를 쓰는 기본 설정
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        let hybrid = &self.hybrid;
        if !(0.0..=1.0).contains(&hybrid.w_semantic) {
            return Err(RagError::Config(format!(
                "hybrid.w_semantic must be within [0, 1], got {}",
                hybrid.w_semantic
            )));
        }
        if self.bm25.k1.is_nan() || self.bm25.k1 < 0.0 {
            return Err(RagError::Config(format!(
                "bm25.k1 must be non-negative, got {}",
                self.bm25.k1
            )));
        }
        if !(0.0..=1.0).contains(&self.bm25.b) {
            return Err(RagError::Config(format!(
                "bm25.b must be within [0, 1], got {}",
                self.bm25.b
            )));
        }
        if self.embedding.dimension == 0 {
            return Err(RagError::Config(
                "embedding.dimension must be greater than zero".to_string(),
            ));
        }
        if self.embedding.backend == EmbeddingBackend::Tei && self.embedding.endpoint.is_none() {
            return Err(RagError::Config(
                "embedding.endpoint is required for the tei backend".to_string(),
            ));
        }
        if self.rerank.backend == RerankBackend::Tei && self.rerank.endpoint.is_none() {
            return Err(RagError::Config(
                "rerank.endpoint is required for the tei backend".to_string(),
            ));
        }

        let chunking = &self.chunking;
        if chunking.max_characters == 0
            || chunking.min_characters > chunking.max_characters
            || chunking.max_characters > chunking.hard_cap_characters
        {
            return Err(RagError::Config(format!(
                "chunking sizes must satisfy 0 < min ({}) <= max ({}) <= hard cap ({})",
                chunking.min_characters, chunking.max_characters, chunking.hard_cap_characters
            )));
        }

        if self.search.top_k == 0 || self.context.top_k == 0 {
            return Err(RagError::Config("top_k defaults must be at least 1".to_string()));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.hybrid.w_semantic - 0.7).abs() < f32::EPSILON);
        assert!((config.bm25.k1 - 1.5).abs() < f32::EPSILON);
        assert!((config.bm25.b - 0.75).abs() < f32::EPSILON);
        assert_eq!(config.context.top_k, 3);
    }

    #[test]
    fn test_invalid_weight_rejected() {
        let mut config = EngineConfig::default();
        config.hybrid.w_semantic = 1.5;
        assert!(matches!(config.validate(), Err(RagError::Config(_))));
    }

    #[test]
    fn test_invalid_chunk_sizes_rejected() {
        let mut config = EngineConfig::default();
        config.chunking.min_characters = 900;
        config.chunking.max_characters = 800;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tei_requires_endpoint() {
        let mut config = EngineConfig::default();
        config.rerank.backend = RerankBackend::Tei;
        assert!(config.validate().is_err());

        config.rerank.endpoint = Some("http://localhost:8081".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            distance = "l2"

            [hybrid]
            w_semantic = 0.4
            normalization = "rank"

            [embedding]
            backend = "hashing"
            dimension = 64
            "#,
        )
        .unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.distance, DistanceMetric::L2);
        assert!((config.hybrid.w_semantic - 0.4).abs() < f32::EPSILON);
        assert_eq!(config.hybrid.normalization, ScoreNormalization::Rank);
        assert_eq!(config.embedding.backend, EmbeddingBackend::Hashing);
        assert_eq!(config.embedding.dimension, 64);
        // 지정하지 않은 값은 기본값 유지
        assert_eq!(config.context.char_budget, 4_000);
    }

    #[test]
    fn test_load_rejects_out_of_range_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bm25]\nb = 2.0\n").unwrap();

        let result = EngineConfig::load(Some(&path));
        assert!(matches!(result, Err(RagError::Config(_))));
    }
}
