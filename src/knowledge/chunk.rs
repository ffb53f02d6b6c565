//! Chunk Store - 검색 단위 청크 보관소
//!
//! 청크는 수집 시에만 생성되며 이후 변경되지 않습니다.
//! 갱신은 삭제 후 재삽입으로 표현합니다.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// 청크 ID (단조 증가)
pub type ChunkId = u64;

/// 검색 단위 청크
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    /// 정규화된 본문
    pub text: String,
    /// 출처 문서 식별자 (파일명, 경로 등)
    pub source_document: String,
    /// 문서 내 순서 (0-based)
    pub sequence_index: u32,
    /// 정규화된 문서 기준 바이트 오프셋
    pub char_offset: usize,
    /// 수집 시 한 번 계산된 임베딩
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

impl Chunk {
    /// 본문 문자 수
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// 청크 보관소
///
/// `Arc<Chunk>`로 보관하므로 스냅샷 복제 비용은 포인터 복사 수준입니다.
#[derive(Debug, Clone, Default)]
pub struct ChunkStore {
    chunks: BTreeMap<ChunkId, Arc<Chunk>>,
    next_id: ChunkId,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 저장된 청크와 다음 ID로 복원
    ///
    /// `next_id`는 기존 최대 ID보다 커야 하며, 작으면 보정합니다.
    pub fn restore(chunks: impl IntoIterator<Item = Chunk>, next_id: ChunkId) -> Self {
        let chunks: BTreeMap<ChunkId, Arc<Chunk>> =
            chunks.into_iter().map(|c| (c.id, Arc::new(c))).collect();
        let min_next = chunks.keys().next_back().map(|id| id + 1).unwrap_or(0);

        Self {
            chunks,
            next_id: next_id.max(min_next),
        }
    }

    /// 새 ID 할당
    pub fn allocate_id(&mut self) -> ChunkId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn next_id(&self) -> ChunkId {
        self.next_id
    }

    pub fn insert(&mut self, chunk: Chunk) -> Arc<Chunk> {
        self.next_id = self.next_id.max(chunk.id + 1);
        let chunk = Arc::new(chunk);
        self.chunks.insert(chunk.id, Arc::clone(&chunk));
        chunk
    }

    pub fn get(&self, id: ChunkId) -> Option<&Arc<Chunk>> {
        self.chunks.get(&id)
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunks.contains_key(&id)
    }

    pub fn remove(&mut self, id: ChunkId) -> Option<Arc<Chunk>> {
        self.chunks.remove(&id)
    }

    /// 특정 문서의 청크 ID 목록 (sequence 순)
    pub fn ids_for_source(&self, source_document: &str) -> Vec<ChunkId> {
        let mut chunks: Vec<&Arc<Chunk>> = self
            .chunks
            .values()
            .filter(|c| c.source_document == source_document)
            .collect();
        chunks.sort_by_key(|c| (c.sequence_index, c.id));
        chunks.into_iter().map(|c| c.id).collect()
    }

    /// 문서별 다음 sequence_index (추가 수집 시 이어 붙이기용)
    pub fn next_sequence_index(&self, source_document: &str) -> u32 {
        self.chunks
            .values()
            .filter(|c| c.source_document == source_document)
            .map(|c| c.sequence_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// ID 오름차순 순회
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Chunk>> {
        self.chunks.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.chunks.keys().copied()
    }

    /// 서로 다른 문서 수
    pub fn document_count(&self) -> usize {
        let mut sources: Vec<&str> = self
            .chunks
            .values()
            .map(|c| c.source_document.as_str())
            .collect();
        sources.sort_unstable();
        sources.dedup();
        sources.len()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
