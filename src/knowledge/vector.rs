//! Semantic Index - 밀집 벡터 인덱스
//!
//! 청크 ID → 임베딩 매핑을 연속 메모리에 보관하고 최근접 이웃을 찾습니다.
//! 전수 비교이므로 근사 검색의 정확도 상한과 같은 결과를 냅니다.
//!
//! 모든 벡터는 같은 차원이어야 하며, 차원이 다른 벡터 삽입은
//! 잘라내거나 채우지 않고 `RagError::DimensionMismatch`로 거부합니다.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

use super::chunk::{Chunk, ChunkId};

/// 벡터 아티팩트 매직 넘버
const ARTIFACT_MAGIC: &[u8; 8] = b"LRAGVEC1";
/// 헤더 크기: magic(8) + metric(4) + dimension(4) + count(8)
const HEADER_LEN: usize = 24;

// ============================================================================
// Types
// ============================================================================

/// 거리 척도. 거리가 작을수록 관련도가 높습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// 1 − 코사인 유사도 (0.0 ~ 2.0)
    Cosine,
    /// 유클리드 거리
    L2,
}

impl DistanceMetric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => 1.0 - cosine_similarity(a, b),
            Self::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }

    /// 거리 → 유사도 (단조 감소 변환)
    pub fn similarity(self, distance: f32) -> f32 {
        match self {
            Self::Cosine => 1.0 - distance,
            Self::L2 => 1.0 / (1.0 + distance),
        }
    }

    fn code(self) -> u32 {
        match self {
            Self::Cosine => 0,
            Self::L2 => 1,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Cosine),
            1 => Some(Self::L2),
            _ => None,
        }
    }
}

/// 시맨틱 검색 결과
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SemanticHit {
    pub chunk_id: ChunkId,
    pub distance: f32,
    /// `metric.similarity(distance)`
    pub similarity: f32,
}

// ============================================================================
// SemanticIndex
// ============================================================================

#[derive(Debug, Clone)]
pub struct SemanticIndex {
    metric: DistanceMetric,
    dimension: Option<usize>,
    ids: Vec<ChunkId>,
    /// `ids[i]`의 벡터는 `vectors[i*dim..(i+1)*dim]`
    vectors: Vec<f32>,
    positions: HashMap<ChunkId, usize>,
}

impl SemanticIndex {
    /// 빈 인덱스 생성. `dimension`이 없으면 첫 삽입 벡터의 차원으로 고정됩니다.
    pub fn new(metric: DistanceMetric, dimension: Option<usize>) -> Self {
        Self {
            metric,
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// 청크 저장소의 임베딩으로 처음부터 재구성 (손상 복구 경로)
    pub fn build<'a>(
        metric: DistanceMetric,
        dimension: Option<usize>,
        chunks: impl IntoIterator<Item = &'a Chunk>,
    ) -> Result<Self> {
        let mut index = Self::new(metric, dimension);
        for chunk in chunks {
            index.insert(chunk.id, &chunk.embedding)?;
        }
        Ok(index)
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.positions.contains_key(&chunk_id)
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.ids.iter().copied()
    }

    /// 벡터 차원 검증
    pub fn check_dimension(&self, actual: usize) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(RagError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    pub fn insert(&mut self, chunk_id: ChunkId, embedding: &[f32]) -> Result<()> {
        if embedding.is_empty() {
            return Err(RagError::Embedding(format!(
                "empty embedding for chunk {chunk_id}"
            )));
        }
        self.check_dimension(embedding.len())?;
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(RagError::Embedding(format!(
                "non-finite value in embedding for chunk {chunk_id}"
            )));
        }
        if self.positions.contains_key(&chunk_id) {
            return Err(RagError::Consistency {
                chunk_id,
                reason: "chunk already has a vector".to_string(),
            });
        }

        self.dimension = Some(embedding.len());
        self.positions.insert(chunk_id, self.ids.len());
        self.ids.push(chunk_id);
        self.vectors.extend_from_slice(embedding);
        Ok(())
    }

    pub fn get(&self, chunk_id: ChunkId) -> Option<&[f32]> {
        let dim = self.dimension?;
        let pos = *self.positions.get(&chunk_id)?;
        Some(&self.vectors[pos * dim..(pos + 1) * dim])
    }

    /// 벡터 제거 (마지막 벡터를 빈 자리로 이동)
    pub fn remove(&mut self, chunk_id: ChunkId) -> bool {
        let (Some(dim), Some(pos)) = (self.dimension, self.positions.remove(&chunk_id)) else {
            return false;
        };

        let last = self.ids.len() - 1;
        if pos != last {
            let moved_id = self.ids[last];
            self.vectors
                .copy_within(last * dim..(last + 1) * dim, pos * dim);
            self.ids[pos] = moved_id;
            self.positions.insert(moved_id, pos);
        }
        self.ids.truncate(last);
        self.vectors.truncate(last * dim);
        true
    }

    /// 최근접 이웃 검색
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SemanticHit>> {
        self.search_where(query, top_k, |_| true)
    }

    /// 조건부 최근접 이웃 검색
    ///
    /// 거리 오름차순, 동점은 낮은 청크 ID 우선.
    pub fn search_where<F>(&self, query: &[f32], top_k: usize, accept: F) -> Result<Vec<SemanticHit>>
    where
        F: Fn(ChunkId) -> bool,
    {
        let Some(dim) = self.dimension else {
            return Ok(vec![]);
        };
        self.check_dimension(query.len())?;
        if top_k == 0 {
            return Ok(vec![]);
        }

        let mut hits: Vec<SemanticHit> = self
            .ids
            .iter()
            .enumerate()
            .filter(|(_, id)| accept(**id))
            .map(|(pos, &chunk_id)| {
                let vector = &self.vectors[pos * dim..(pos + 1) * dim];
                let distance = self.metric.distance(query, vector);
                SemanticHit {
                    chunk_id,
                    distance,
                    similarity: self.metric.similarity(distance),
                }
            })
            .collect();

        if hits.len() > top_k {
            hits.select_nth_unstable_by(top_k, compare_hits);
            hits.truncate(top_k);
        }
        hits.sort_by(compare_hits);
        Ok(hits)
    }

    // ------------------------------------------------------------------------
    // Artifact
    // ------------------------------------------------------------------------

    /// 바이너리 아티팩트로 기록 (청크 ID 오름차순, little-endian)
    pub fn write_artifact<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let dim = self.dimension.unwrap_or(0);

        writer.write_all(ARTIFACT_MAGIC)?;
        writer.write_all(&self.metric.code().to_le_bytes())?;
        writer.write_all(&(dim as u32).to_le_bytes())?;
        writer.write_all(&(self.ids.len() as u64).to_le_bytes())?;

        let mut order: Vec<(ChunkId, usize)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(pos, &id)| (id, pos))
            .collect();
        order.sort_unstable();

        for (id, pos) in order {
            writer.write_all(&id.to_le_bytes())?;
            for value in &self.vectors[pos * dim..(pos + 1) * dim] {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// 바이너리 아티팩트에서 복원. 형식 오류는 `RagError::Corrupted`.
    pub fn from_artifact(bytes: &[u8], path: &Path) -> Result<Self> {
        let corrupted = |reason: String| RagError::corrupted(path, reason);

        if bytes.len() < HEADER_LEN || &bytes[..8] != ARTIFACT_MAGIC {
            return Err(corrupted("missing vector artifact header".to_string()));
        }

        let metric_code = read_u32(&bytes[8..12]);
        let metric = DistanceMetric::from_code(metric_code)
            .ok_or_else(|| corrupted(format!("unknown distance metric code {metric_code}")))?;
        let dim = read_u32(&bytes[12..16]) as usize;
        let count = read_u64(&bytes[16..24]) as usize;

        let record_len = 8 + dim * 4;
        let expected_len = count
            .checked_mul(record_len)
            .and_then(|body| body.checked_add(HEADER_LEN))
            .ok_or_else(|| corrupted("vector count overflows".to_string()))?;
        if bytes.len() != expected_len {
            return Err(corrupted(format!(
                "vector artifact is {} bytes, expected {expected_len}",
                bytes.len()
            )));
        }
        if count > 0 && dim == 0 {
            return Err(corrupted("vectors with zero dimension".to_string()));
        }

        let mut index = Self::new(metric, (dim > 0).then_some(dim));
        let mut vector = Vec::with_capacity(dim);
        for record in bytes[HEADER_LEN..].chunks_exact(record_len) {
            let id = read_u64(&record[..8]);
            vector.clear();
            vector.extend(record[8..].chunks_exact(4).map(read_f32));
            index
                .insert(id, &vector)
                .map_err(|e| corrupted(format!("invalid vector record {id}: {e}")))?;
        }

        Ok(index)
    }
}

/// 거리 오름차순, 동점은 청크 ID 오름차순
fn compare_hits(a: &SemanticHit, b: &SemanticHit) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_f32(bytes: &[u8]) -> f32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    f32::from_le_bytes(buf)
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다. 길이가 다르거나 영벡터면 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(vectors: &[(ChunkId, [f32; 3])], metric: DistanceMetric) -> SemanticIndex {
        let mut index = SemanticIndex::new(metric, Some(3));
        for (id, v) in vectors {
            index.insert(*id, v).unwrap();
        }
        index
    }

    #[test]
    fn test_cosine_similarity_same() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_empty() {
        let a: Vec<f32> = vec![];
        let b: Vec<f32> = vec![];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_search_orders_by_distance() {
        let index = index_with(
            &[
                (0, [0.0, 1.0, 0.0]),
                (1, [1.0, 0.0, 0.0]),
                (2, [0.7, 0.7, 0.0]),
            ],
            DistanceMetric::Cosine,
        );
        let hits = index.search(&[1.0, 0.1, 0.0], 3).unwrap();
        let ids: Vec<ChunkId> = hits.iter().map(|h| h.chunk_id).collect();
        assert_eq!(ids, vec![1, 2, 0]);
        assert!(hits[0].similarity > hits[1].similarity);
        assert!(hits[0].distance < hits[1].distance);
    }

    #[test]
    fn test_l2_metric() {
        let index = index_with(
            &[(0, [0.0, 0.0, 0.0]), (1, [3.0, 4.0, 0.0])],
            DistanceMetric::L2,
        );
        let hits = index.search(&[3.0, 4.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].chunk_id, 1);
        assert!(hits[0].distance.abs() < 1e-6);
        assert!((hits[1].distance - 5.0).abs() < 1e-5);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ties_broken_by_id_and_top_k() {
        let index = index_with(
            &[
                (4, [1.0, 0.0, 0.0]),
                (2, [1.0, 0.0, 0.0]),
                (9, [1.0, 0.0, 0.0]),
                (1, [0.0, 1.0, 0.0]),
            ],
            DistanceMetric::Cosine,
        );
        let hits = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
        let ids: Vec<ChunkId> = hits.iter().map(|h| h.chunk_id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let mut index = SemanticIndex::new(DistanceMetric::Cosine, None);
        index.insert(0, &[1.0, 0.0, 0.0]).unwrap();

        let result = index.insert(1, &[1.0, 0.0]);
        assert!(matches!(
            result,
            Err(RagError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert_eq!(index.len(), 1);

        assert!(index.search(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut index = SemanticIndex::new(DistanceMetric::Cosine, Some(2));
        assert!(index.insert(0, &[f32::NAN, 1.0]).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_keeps_other_vectors() {
        let mut index = index_with(
            &[
                (0, [1.0, 0.0, 0.0]),
                (1, [0.0, 1.0, 0.0]),
                (2, [0.0, 0.0, 1.0]),
            ],
            DistanceMetric::Cosine,
        );
        assert!(index.remove(0));
        assert!(!index.remove(0));
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(2), Some(&[0.0, 0.0, 1.0][..]));
        assert_eq!(index.get(1), Some(&[0.0, 1.0, 0.0][..]));

        let hits = index.search(&[0.0, 0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].chunk_id, 2);
    }

    #[test]
    fn test_empty_index_search() {
        let index = SemanticIndex::new(DistanceMetric::Cosine, None);
        assert!(index.search(&[1.0, 2.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_artifact_restores_search_results() {
        let index = index_with(
            &[
                (3, [0.1, 0.9, 0.0]),
                (1, [0.9, 0.1, 0.0]),
                (2, [0.5, 0.5, 0.5]),
            ],
            DistanceMetric::Cosine,
        );
        let mut bytes = Vec::new();
        index.write_artifact(&mut bytes).unwrap();

        let restored = SemanticIndex::from_artifact(&bytes, Path::new("vectors.bin")).unwrap();
        let query = [0.8, 0.2, 0.1];
        assert_eq!(
            restored.search(&query, 3).unwrap(),
            index.search(&query, 3).unwrap()
        );
        assert_eq!(restored.dimension(), Some(3));
    }

    #[test]
    fn test_truncated_artifact_is_corruption() {
        let index = index_with(&[(0, [1.0, 0.0, 0.0])], DistanceMetric::Cosine);
        let mut bytes = Vec::new();
        index.write_artifact(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 2);

        let err = SemanticIndex::from_artifact(&bytes, Path::new("vectors.bin")).unwrap_err();
        assert!(err.is_corruption());

        let err = SemanticIndex::from_artifact(b"garbage", Path::new("vectors.bin")).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_build_from_chunks() {
        let chunks = vec![Chunk {
            id: 7,
            text: "x".to_string(),
            source_document: "a".to_string(),
            sequence_index: 0,
            char_offset: 0,
            embedding: vec![0.0, 1.0],
        }];
        let index = SemanticIndex::build(DistanceMetric::Cosine, Some(2), &chunks).unwrap();
        assert!(index.contains(7));
    }
}
