//! Knowledge 모듈 - 법률 문서 하이브리드 검색 엔진
//!
//! - Chunker: 조문/문장 경계 인식 텍스트 분할
//! - Lexical: BM25 역색인
//! - Vector: 정확한(brute-force) 벡터 검색
//! - Hybrid: 정규화된 점수의 가중 결합
//! - Rerank: 상위 후보 재채점
//! - Context: 인용이 붙은 답변용 컨텍스트 조립
//! - Store: SQLite + 벡터 아티팩트 + 매니페스트 영속화
//! - Engine: 위 구성요소의 수명 주기와 동시성

mod chunk;
mod chunker;
mod context;
mod engine;
mod hybrid;
mod lexical;
mod rerank;
mod store;
mod tokenizer;
mod vector;

// Re-exports
pub use chunk::{Chunk, ChunkId, ChunkStore};
pub use chunker::{
    default_chunker, legal_chunker, normalize_text, ChunkConfig, Chunker, LegalChunker, TextSpan,
};
pub use context::{AssembledContext, Citation, ContextAssembler, ContextPassage};
pub use engine::{
    ConsistencyReport, DocumentFailure, EngineStats, IndexSnapshot, IngestReport,
    RetrievalEngine, SearchHit, SearchQuery, SearchResults, SourceText,
};
pub use hybrid::{
    fuse, hybrid_score, normalize, Candidate, HybridRetriever, ScoreNormalization, SearchMethod,
};
pub use lexical::{Bm25Params, LexicalHit, LexicalIndex, Posting};
pub use rerank::{
    create_reranker, rerank_candidates, PassthroughReranker, RerankOutcome, Reranker,
    TeiReranker, TermProximityReranker,
};
pub use store::{IndexStore, LoadedIndex, Manifest, MANIFEST_FILE};
pub use tokenizer::LegalTokenizer;
pub use vector::{cosine_similarity, DistanceMetric, SemanticHit, SemanticIndex};
