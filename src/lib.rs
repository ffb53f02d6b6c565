//! legal-rag - 법률 문서 하이브리드 검색 엔진
//!
//! BM25 키워드 검색 + 벡터 검색을 가중 결합하고, 상위 후보를 리랭크한 뒤
//! 인용이 붙은 컨텍스트로 조립합니다.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod knowledge;

// Re-exports
pub use config::{get_data_dir, EngineConfig};
pub use embedding::{
    create_embedder, get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding,
    HashingEmbedding, TeiEmbedding,
};
pub use error::{RagError, Result};
pub use generation::{answer_query, build_prompt, AnswerGenerator, GeminiGenerator};
pub use knowledge::{
    create_reranker, AssembledContext, Chunk, ChunkId, Citation, ConsistencyReport,
    IngestReport, Reranker, RetrievalEngine, SearchHit, SearchQuery, SearchResults, SourceText,
};
