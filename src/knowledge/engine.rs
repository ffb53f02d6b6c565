//! Retrieval Engine - 청크 저장소 + 두 인덱스 + 영속화의 수명 주기
//!
//! 읽기는 현재 스냅샷(`Arc<IndexSnapshot>`)을 복제해서 잠금 없이 진행하고,
//! 쓰기는 하나의 writer 잠금 안에서 새 스냅샷을 만들고 저장한 뒤 교체합니다.
//! 검색은 절반만 갱신된 인덱스를 볼 수 없습니다.
//!
//! 쿼리 흐름: 임베딩(시간 제한) → 하이브리드 검색 → 리랭크(시간 제한) → 결과
//! 임베딩이 실패하면 BM25만으로, 리랭커가 실패하면 하이브리드 순서로 응답합니다.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

use super::chunk::{Chunk, ChunkId, ChunkStore};
use super::chunker::{legal_chunker, normalize_text, Chunker};
use super::context::{AssembledContext, ContextAssembler};
use super::hybrid::HybridRetriever;
use super::lexical::LexicalIndex;
use super::rerank::{rerank_candidates, Reranker};
use super::store::{IndexStore, LoadedIndex, Manifest};
use super::vector::SemanticIndex;

// ============================================================================
// Types
// ============================================================================

/// 수집 입력 (로더가 추출한 텍스트)
#[derive(Debug, Clone)]
pub struct SourceText {
    pub source_document: String,
    pub text: String,
}

impl SourceText {
    pub fn new(source_document: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_document: source_document.into(),
            text: text.into(),
        }
    }
}

/// 문서 단위 수집 실패
#[derive(Debug, Clone, Serialize)]
pub struct DocumentFailure {
    pub source_document: String,
    pub reason: String,
}

/// 수집 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub chunks_added: usize,
    pub documents_indexed: usize,
    pub failures: Vec<DocumentFailure>,
    /// 수집 후 스냅샷 세대
    pub generation: u64,
}

/// 검색 요청
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    /// 없으면 `search.top_k`
    pub top_k: Option<usize>,
    /// 특정 문서로 제한
    pub source_document: Option<String>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: None,
            source_document: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_source(mut self, source_document: impl Into<String>) -> Self {
        self.source_document = Some(source_document.into());
        self
    }
}

/// 검색 결과 항목
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub chunk_text: String,
    pub source_document: String,
    pub sequence_index: u32,
    /// 최종 순위 점수 (리랭크 점수, 없으면 하이브리드 점수)
    pub score: f32,
    pub lexical_score: f32,
    pub semantic_score: f32,
    pub hybrid_score: f32,
    pub rerank_score: Option<f32>,
}

/// 검색 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    /// 리랭커 점수가 적용되었는지
    pub reranked: bool,
    /// 쿼리 임베딩 실패로 BM25만 사용했는지
    pub semantic_degraded: bool,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }
}

/// 이중 색인 검사 결과
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub checked: usize,
    /// 청크는 있으나 BM25 항목이 없음
    pub missing_lexical: Vec<ChunkId>,
    /// 청크는 있으나 벡터가 없음
    pub missing_semantic: Vec<ChunkId>,
    /// 인덱스에는 있으나 청크가 없음
    pub orphaned: Vec<ChunkId>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_lexical.is_empty() && self.missing_semantic.is_empty() && self.orphaned.is_empty()
    }

    /// 검색에서 제외할 ID
    pub fn affected(&self) -> BTreeSet<ChunkId> {
        self.missing_lexical
            .iter()
            .chain(&self.missing_semantic)
            .chain(&self.orphaned)
            .copied()
            .collect()
    }
}

/// 엔진 통계
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub generation: u64,
    pub chunk_count: usize,
    pub document_count: usize,
    pub term_count: usize,
    pub vector_count: usize,
    pub dimension: Option<usize>,
    pub average_chunk_tokens: f32,
    pub quarantined: usize,
    pub embedder: String,
    pub reranker: String,
    pub data_dir: Option<PathBuf>,
}

// ============================================================================
// IndexSnapshot
// ============================================================================

/// 불변 인덱스 스냅샷
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    generation: u64,
    chunks: ChunkStore,
    lexical: LexicalIndex,
    semantic: SemanticIndex,
    /// 짝이 맞지 않아 검색에서 제외된 청크
    quarantined: BTreeSet<ChunkId>,
}

impl IndexSnapshot {
    /// 세 구조로 스냅샷 생성. 짝이 맞지 않는 ID는 격리합니다.
    pub fn new(
        generation: u64,
        chunks: ChunkStore,
        lexical: LexicalIndex,
        semantic: SemanticIndex,
    ) -> Self {
        let mut snapshot = Self {
            generation,
            chunks,
            lexical,
            semantic,
            quarantined: BTreeSet::new(),
        };

        let report = snapshot.consistency_report();
        if !report.is_consistent() {
            for id in report.affected() {
                tracing::warn!("Chunk {} is not dual-indexed, excluded until reindexed", id);
            }
            snapshot.quarantined = report.affected();
        }
        snapshot
    }

    fn empty(config: &EngineConfig, dimension: usize) -> Self {
        Self::new(
            0,
            ChunkStore::new(),
            LexicalIndex::new(config.bm25),
            SemanticIndex::new(config.distance, Some(dimension)),
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    pub fn semantic(&self) -> &SemanticIndex {
        &self.semantic
    }

    pub fn quarantined(&self) -> &BTreeSet<ChunkId> {
        &self.quarantined
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn is_searchable(&self, chunk_id: ChunkId) -> bool {
        !self.quarantined.contains(&chunk_id) && self.chunks.contains(chunk_id)
    }

    /// 청크 저장소, BM25, 벡터 인덱스의 ID 집합 비교
    pub fn consistency_report(&self) -> ConsistencyReport {
        let chunk_ids: BTreeSet<ChunkId> = self.chunks.ids().collect();
        let lexical_ids: BTreeSet<ChunkId> = self.lexical.chunk_ids().collect();
        let semantic_ids: BTreeSet<ChunkId> = self.semantic.chunk_ids().collect();

        let orphaned: BTreeSet<ChunkId> = lexical_ids
            .union(&semantic_ids)
            .filter(|id| !chunk_ids.contains(id))
            .copied()
            .collect();

        ConsistencyReport {
            checked: chunk_ids.len(),
            missing_lexical: chunk_ids.difference(&lexical_ids).copied().collect(),
            missing_semantic: chunk_ids.difference(&semantic_ids).copied().collect(),
            orphaned: orphaned.into_iter().collect(),
        }
    }
}

/// 문서 하나의 수집 준비물 (잠금 밖에서 계산)
struct PreparedDocument {
    source_document: String,
    spans: Vec<(usize, String)>,
    embeddings: Vec<Vec<f32>>,
}

// ============================================================================
// RetrievalEngine
// ============================================================================

pub struct RetrievalEngine {
    config: EngineConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<dyn Reranker>,
    chunker: Box<dyn Chunker>,
    retriever: HybridRetriever,
    assembler: ContextAssembler,
    store: Option<IndexStore>,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
}

impl RetrievalEngine {
    /// 데이터 디렉토리에서 엔진 열기
    ///
    /// 저장된 인덱스가 없으면 빈 코퍼스로 시작합니다. 저장소가 손상되었으면
    /// `RagError::Corrupted`를 반환하며 빈 코퍼스로 대체하지 않습니다.
    pub fn open(
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Arc<dyn Reranker>,
    ) -> Result<Self> {
        config.validate()?;
        let store = IndexStore::open(&config.data_dir)?;

        let snapshot = match store.load(config.bm25)? {
            Some(loaded) => snapshot_from_loaded(&config, embedder.dimension(), loaded)?,
            None => {
                tracing::info!("No saved index in {:?}, starting empty", config.data_dir);
                IndexSnapshot::empty(&config, embedder.dimension())
            }
        };

        Self::build(config, embedder, reranker, Some(store), snapshot)
    }

    /// 저장소 없는 엔진 (테스트, 일회성 코퍼스)
    pub fn in_memory(
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Arc<dyn Reranker>,
    ) -> Result<Self> {
        config.validate()?;
        let snapshot = IndexSnapshot::empty(&config, embedder.dimension());
        Self::build(config, embedder, reranker, None, snapshot)
    }

    /// 외부에서 만든 인덱스로 엔진 구성 (저장소 없음)
    ///
    /// 짝이 맞지 않는 청크는 격리되며 `reindex`로 복구할 수 있습니다.
    pub fn from_indices(
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Arc<dyn Reranker>,
        chunks: ChunkStore,
        lexical: LexicalIndex,
        semantic: SemanticIndex,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(dimension) = semantic.dimension() {
            if dimension != embedder.dimension() {
                return Err(RagError::DimensionMismatch {
                    expected: embedder.dimension(),
                    actual: dimension,
                });
            }
        }
        let snapshot = IndexSnapshot::new(0, chunks, lexical, semantic);
        Self::build(config, embedder, reranker, None, snapshot)
    }

    fn build(
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Arc<dyn Reranker>,
        store: Option<IndexStore>,
        snapshot: IndexSnapshot,
    ) -> Result<Self> {
        if embedder.dimension() != config.embedding.dimension {
            return Err(RagError::Config(format!(
                "embedder {} produces {} dimensions, configuration says {}",
                embedder.name(),
                embedder.dimension(),
                config.embedding.dimension
            )));
        }

        Ok(Self {
            chunker: legal_chunker(config.chunking.clone()),
            retriever: HybridRetriever::new(&config.hybrid),
            assembler: ContextAssembler::new(&config.context),
            config,
            embedder,
            reranker,
            store,
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 현재 스냅샷
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    fn swap(&self, snapshot: Arc<IndexSnapshot>) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = snapshot;
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// 문서 배치 수집
    ///
    /// 빈 텍스트나 임베딩 실패는 해당 문서만 건너뛰고 `failures`에 기록합니다.
    /// 임베딩 차원 불일치는 설정 오류이므로 배치 전체를 중단하고 인덱스는 그대로입니다.
    /// 성공한 배치는 저장소에 기록된 뒤에 검색에 반영됩니다.
    pub async fn ingest(&self, documents: Vec<SourceText>) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut prepared = Vec::with_capacity(documents.len());

        for document in documents {
            match self.prepare(&document).await {
                Ok(doc) => prepared.push(doc),
                Err(reason) => {
                    tracing::warn!("Skipping document {}: {}", document.source_document, reason);
                    report.failures.push(DocumentFailure {
                        source_document: document.source_document,
                        reason,
                    });
                }
            }
        }

        let expected = self.embedder.dimension();
        for doc in &prepared {
            if let Some(bad) = doc.embeddings.iter().find(|e| e.len() != expected) {
                return Err(RagError::DimensionMismatch {
                    expected,
                    actual: bad.len(),
                });
            }
        }

        let _writer = self.writer.lock().await;
        let current = self.snapshot();
        report.generation = current.generation;

        if prepared.is_empty() {
            return Ok(report);
        }

        let mut chunks = current.chunks.clone();
        let mut lexical = current.lexical.clone();
        let mut semantic = current.semantic.clone();

        for doc in prepared {
            let base_sequence = chunks.next_sequence_index(&doc.source_document);
            for (i, ((offset, text), embedding)) in doc.spans.into_iter().zip(doc.embeddings).enumerate() {
                let chunk = Chunk {
                    id: chunks.allocate_id(),
                    text,
                    source_document: doc.source_document.clone(),
                    sequence_index: base_sequence + i as u32,
                    char_offset: offset,
                    embedding,
                };
                semantic.insert(chunk.id, &chunk.embedding)?;
                lexical.index(&chunk)?;
                chunks.insert(chunk);
                report.chunks_added += 1;
            }
            report.documents_indexed += 1;
        }

        let next = IndexSnapshot {
            generation: current.generation + 1,
            chunks,
            lexical,
            semantic,
            quarantined: current.quarantined.clone(),
        };
        let next = self.commit(next).await?;
        report.generation = next.generation;

        tracing::info!(
            "Ingested {} chunks from {} documents ({} failed), generation {}",
            report.chunks_added,
            report.documents_indexed,
            report.failures.len(),
            report.generation
        );
        Ok(report)
    }

    /// 정규화, 청킹, 임베딩. 실패 사유는 문서 단위 에러 메시지.
    async fn prepare(&self, document: &SourceText) -> std::result::Result<PreparedDocument, String> {
        let normalized = normalize_text(&document.text);
        if normalized.is_empty() {
            return Err("empty text".to_string());
        }

        let spans: Vec<(usize, String)> = self
            .chunker
            .chunk(&normalized)
            .into_iter()
            .map(|span| (span.offset, span.text))
            .collect();
        if spans.is_empty() {
            return Err("no chunks produced".to_string());
        }

        let texts: Vec<String> = spans.iter().map(|(_, text)| text.clone()).collect();
        let embeddings = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| format!("embedding failed: {e:#}"))?;
        if embeddings.len() != texts.len() {
            return Err(format!(
                "embedding backend returned {} vectors for {} chunks",
                embeddings.len(),
                texts.len()
            ));
        }
        if embeddings.iter().flatten().any(|v| !v.is_finite()) {
            return Err("embedding contains non-finite values".to_string());
        }

        tracing::debug!(
            "Prepared {} ({} chunks)",
            document.source_document,
            spans.len()
        );

        Ok(PreparedDocument {
            source_document: document.source_document.clone(),
            spans,
            embeddings,
        })
    }

    /// 저장 후 교체. 저장이 실패하면 현재 스냅샷은 바뀌지 않습니다.
    async fn commit(&self, next: IndexSnapshot) -> Result<Arc<IndexSnapshot>> {
        let next = Arc::new(next);
        if let Some(store) = &self.store {
            persist(store.clone(), Arc::clone(&next)).await?;
        }
        self.swap(Arc::clone(&next));
        Ok(next)
    }

    // ------------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------------

    /// 하이브리드 검색 + 리랭크
    ///
    /// 빈 쿼리나 빈 코퍼스는 에러가 아니라 빈 결과입니다.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults> {
        let text = query.text.trim();
        let top_k = query.top_k.unwrap_or(self.config.search.top_k);
        let snapshot = self.snapshot();

        if text.is_empty() || top_k == 0 || snapshot.is_empty() {
            return Ok(SearchResults::default());
        }

        let query_embedding = self.embed_query(text).await;
        if let Some(embedding) = &query_embedding {
            snapshot.semantic.check_dimension(embedding.len())?;
        }
        let semantic_degraded = query_embedding.is_none();

        let source_filter = query.source_document.as_deref();
        let accept = |id: ChunkId| {
            snapshot.is_searchable(id)
                && source_filter.map_or(true, |source| {
                    snapshot
                        .chunks
                        .get(id)
                        .is_some_and(|c| c.source_document == source)
                })
        };

        let shortlist = self.config.rerank.candidates;
        let candidates = self.retriever.retrieve(
            &snapshot.lexical,
            &snapshot.semantic,
            text,
            query_embedding.as_deref(),
            top_k.max(shortlist),
            accept,
        )?;

        let passages: Vec<String> = candidates
            .iter()
            .map(|c| {
                snapshot
                    .chunks
                    .get(c.chunk_id)
                    .map(|chunk| chunk.text.clone())
                    .unwrap_or_default()
            })
            .collect();

        let outcome = rerank_candidates(
            self.reranker.as_ref(),
            text,
            candidates,
            &passages,
            shortlist,
            self.config.rerank.timeout(),
        )
        .await;

        let hits: Vec<SearchHit> = outcome
            .candidates
            .into_iter()
            .take(top_k)
            .filter_map(|candidate| {
                let chunk = snapshot.chunks.get(candidate.chunk_id)?;
                Some(SearchHit {
                    chunk_id: chunk.id,
                    chunk_text: chunk.text.clone(),
                    source_document: chunk.source_document.clone(),
                    sequence_index: chunk.sequence_index,
                    score: candidate.score(),
                    lexical_score: candidate.lexical_score,
                    semantic_score: candidate.semantic_score,
                    hybrid_score: candidate.hybrid_score,
                    rerank_score: candidate.rerank_score,
                })
            })
            .collect();

        tracing::debug!(
            "Query '{}': {} hits (reranked: {}, degraded: {})",
            text,
            hits.len(),
            outcome.applied,
            semantic_degraded
        );

        Ok(SearchResults {
            hits,
            reranked: outcome.applied,
            semantic_degraded,
        })
    }

    /// 쿼리 임베딩 (실패/시간 초과 시 `None`)
    async fn embed_query(&self, text: &str) -> Option<Vec<f32>> {
        let timeout = self.config.search.embed_timeout();
        match tokio::time::timeout(timeout, self.embedder.embed_query(text)).await {
            Ok(Ok(embedding)) => Some(embedding),
            Ok(Err(e)) => {
                tracing::warn!("Query embedding failed, using lexical search only: {:#}", e);
                None
            }
            Err(_) => {
                tracing::warn!(
                    "Query embedding timed out after {:?}, using lexical search only",
                    timeout
                );
                None
            }
        }
    }

    /// 검색 후 답변 생성용 컨텍스트 조립
    ///
    /// `query.top_k`가 없으면 `context.top_k`개를 선택합니다.
    pub async fn assemble_context(&self, query: &SearchQuery) -> Result<AssembledContext> {
        let mut query = query.clone();
        if query.top_k.is_none() {
            query.top_k = Some(self.assembler.top_k());
        }
        let results = self.search(&query).await?;
        Ok(self.assembler.assemble(&results.hits))
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// 문서의 모든 청크 삭제 (갱신은 삭제 후 재수집)
    pub async fn remove_document(&self, source_document: &str) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();

        let ids = current.chunks.ids_for_source(source_document);
        if ids.is_empty() {
            return Err(RagError::NotFound {
                kind: "document",
                name: source_document.to_string(),
            });
        }

        let mut next = (*current).clone();
        next.generation += 1;
        for &id in &ids {
            next.chunks.remove(id);
            next.lexical.remove(id);
            next.semantic.remove(id);
            next.quarantined.remove(&id);
        }
        self.commit(next).await?;

        tracing::info!("Removed {} chunks of {}", ids.len(), source_document);
        Ok(ids.len())
    }

    /// 청크 저장소로부터 두 인덱스를 처음부터 재구성
    ///
    /// BM25 파라미터나 거리 척도를 바꾼 뒤, 또는 인덱스 구조가 의심될 때 사용합니다.
    /// 유효한 임베딩이 없는 청크는 다시 임베딩합니다.
    pub async fn rebuild(&self) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();

        let mut chunks = ChunkStore::restore(std::iter::empty(), current.chunks.next_id());
        let mut lexical = LexicalIndex::new(self.config.bm25);
        let mut semantic = SemanticIndex::new(self.config.distance, Some(self.embedder.dimension()));

        for chunk in current.chunks.iter() {
            let chunk = self.with_valid_embedding(chunk).await?;
            semantic.insert(chunk.id, &chunk.embedding)?;
            lexical.index(&chunk)?;
            chunks.insert(chunk);
        }

        let count = chunks.len();
        let next = IndexSnapshot::new(current.generation + 1, chunks, lexical, semantic);
        self.commit(next).await?;

        tracing::info!("Rebuilt indices for {} chunks", count);
        Ok(count)
    }

    /// 격리된 청크만 다시 이중 색인. 복구한 청크 수를 반환합니다.
    pub async fn reindex(&self) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();
        if current.quarantined.is_empty() {
            return Ok(0);
        }

        let mut next = (*current).clone();
        let mut repaired = 0;

        for &id in &current.quarantined {
            next.lexical.remove(id);
            next.semantic.remove(id);

            let Some(chunk) = current.chunks.get(id) else {
                // 청크 없는 인덱스 항목은 제거만
                continue;
            };
            let chunk = self.with_valid_embedding(chunk).await?;
            next.semantic.insert(id, &chunk.embedding)?;
            next.lexical.index(&chunk)?;
            next.chunks.remove(id);
            next.chunks.insert(chunk);
            repaired += 1;
        }

        let next = IndexSnapshot::new(next.generation + 1, next.chunks, next.lexical, next.semantic);
        self.commit(next).await?;

        tracing::info!("Reindexed {} quarantined chunks", repaired);
        Ok(repaired)
    }

    /// 청크의 임베딩이 현재 차원에 맞으면 그대로, 아니면 다시 계산
    async fn with_valid_embedding(&self, chunk: &Chunk) -> Result<Chunk> {
        let mut chunk = chunk.clone();
        if chunk.embedding.len() != self.embedder.dimension() {
            chunk.embedding = self
                .embedder
                .embed(&chunk.text)
                .await
                .map_err(|e| RagError::Embedding(format!("chunk {}: {e:#}", chunk.id)))?;
            if chunk.embedding.len() != self.embedder.dimension() {
                return Err(RagError::DimensionMismatch {
                    expected: self.embedder.dimension(),
                    actual: chunk.embedding.len(),
                });
            }
        }
        Ok(chunk)
    }

    /// 이중 색인 검사. 문제가 있는 청크는 격리되어 검색에서 제외됩니다.
    pub async fn verify_consistency(&self) -> ConsistencyReport {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();
        let report = current.consistency_report();

        let affected = report.affected();
        if affected != current.quarantined {
            let mut next = (*current).clone();
            next.quarantined = affected;
            self.swap(Arc::new(next));
        }

        if !report.is_consistent() {
            tracing::warn!(
                "Index consistency check failed: {} missing lexical, {} missing semantic, {} orphaned",
                report.missing_lexical.len(),
                report.missing_semantic.len(),
                report.orphaned.len()
            );
        }
        report
    }

    /// 현재 스냅샷을 저장소에 기록 (메모리 엔진이면 `None`)
    pub async fn save(&self) -> Result<Option<Manifest>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let _writer = self.writer.lock().await;
        let snapshot = self.snapshot();

        // 이미 기록된 세대는 다시 쓰지 않음
        if let Some(manifest) = store.read_manifest()? {
            if manifest.generation == snapshot.generation {
                return Ok(Some(manifest));
            }
        }

        let manifest = persist(store.clone(), snapshot).await?;
        Ok(Some(manifest))
    }

    /// 저장 후 종료
    pub async fn close(self) -> Result<()> {
        self.save().await?;
        tracing::debug!("Retrieval engine closed");
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        let snapshot = self.snapshot();
        EngineStats {
            generation: snapshot.generation,
            chunk_count: snapshot.chunks.len(),
            document_count: snapshot.chunks.document_count(),
            term_count: snapshot.lexical.term_count(),
            vector_count: snapshot.semantic.len(),
            dimension: snapshot.semantic.dimension(),
            average_chunk_tokens: snapshot.lexical.average_doc_length(),
            quarantined: snapshot.quarantined.len(),
            embedder: self.embedder.name().to_string(),
            reranker: self.reranker.name().to_string(),
            data_dir: self.store.as_ref().map(|s| s.dir().to_path_buf()),
        }
    }
}

/// 로드된 인덱스를 현재 설정에 맞춰 스냅샷으로 변환
fn snapshot_from_loaded(
    config: &EngineConfig,
    dimension: usize,
    loaded: LoadedIndex,
) -> Result<IndexSnapshot> {
    let LoadedIndex {
        manifest,
        chunks,
        lexical,
        mut semantic,
    } = loaded;

    if let Some(stored) = semantic.dimension() {
        if stored != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: stored,
            });
        }
    }

    if semantic.metric() != config.distance {
        tracing::info!(
            "Distance metric changed ({:?} -> {:?}), rebuilding semantic index",
            semantic.metric(),
            config.distance
        );
        semantic = SemanticIndex::build(
            config.distance,
            Some(dimension),
            chunks.iter().map(|c| c.as_ref()),
        )?;
    }

    Ok(IndexSnapshot::new(manifest.generation, chunks, lexical, semantic))
}

/// 스냅샷 저장 (블로킹 I/O는 전용 스레드에서)
async fn persist(store: IndexStore, snapshot: Arc<IndexSnapshot>) -> Result<Manifest> {
    tokio::task::spawn_blocking(move || {
        store.save(
            snapshot.generation,
            &snapshot.chunks,
            &snapshot.lexical,
            &snapshot.semantic,
        )
    })
    .await
    .map_err(|e| RagError::Io(std::io::Error::other(e)))?
}

// ============================================================================
// Tests
// ============================================================================
