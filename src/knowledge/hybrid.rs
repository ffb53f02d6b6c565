//! 하이브리드 검색 - BM25 + 벡터 검색 가중 결합
//!
//! 두 점수 체계는 스케일이 달라 그대로 더할 수 없으므로, 쿼리마다 각 후보 목록을
//! [0, 1]로 정규화한 뒤 볼록 결합합니다.
//!
//! hybrid = w_semantic · norm(semantic) + (1 − w_semantic) · norm(lexical)
//!
//! 한쪽 목록에만 있는 청크는 빠진 쪽 점수를 0으로 두고 합집합에 포함됩니다.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::HybridConfig;
use crate::error::Result;

use super::chunk::ChunkId;
use super::lexical::{LexicalHit, LexicalIndex};
use super::vector::{SemanticHit, SemanticIndex};

// ============================================================================
// Types
// ============================================================================

/// 점수 정규화 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreNormalization {
    /// (s − min) / (max − min). 모든 점수가 같으면 1.0
    #[default]
    MinMax,
    /// (n − rank) / n. 동점은 같은 순위
    Rank,
}

/// 후보가 어느 검색에서 나왔는지
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    /// 벡터 검색에만 있음
    Semantic,
    /// BM25 검색에만 있음
    Lexical,
    /// 양쪽 모두
    Hybrid,
}

/// 검색 후보 (쿼리마다 재계산, 저장되지 않음)
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk_id: ChunkId,
    /// BM25 원점수 (없으면 0)
    pub lexical_score: f32,
    /// 유사도 원점수 (없으면 0)
    pub semantic_score: f32,
    pub hybrid_score: f32,
    /// 리랭커 점수 (적용된 경우)
    pub rerank_score: Option<f32>,
    pub method: SearchMethod,
}

impl Candidate {
    /// 최종 순위에 사용된 점수
    pub fn score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.hybrid_score)
    }
}

// ============================================================================
// Fusion
// ============================================================================

/// 점수 목록을 [0, 1]로 정규화
///
/// 입력 순서를 유지합니다.
pub fn normalize(scores: &[f32], method: ScoreNormalization) -> Vec<f32> {
    if scores.is_empty() {
        return vec![];
    }

    match method {
        ScoreNormalization::MinMax => {
            let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let range = max - min;
            if range <= f32::EPSILON {
                return vec![1.0; scores.len()];
            }
            scores.iter().map(|s| (s - min) / range).collect()
        }
        ScoreNormalization::Rank => {
            let n = scores.len() as f32;
            scores
                .iter()
                .map(|s| {
                    let rank = scores.iter().filter(|other| *other > s).count() as f32;
                    (n - rank) / n
                })
                .collect()
        }
    }
}

/// 가중 결합 점수
pub fn hybrid_score(w_semantic: f32, semantic: f32, lexical: f32) -> f32 {
    w_semantic * semantic + (1.0 - w_semantic) * lexical
}

/// 두 후보 목록을 결합하여 상위 `top_k`를 반환
///
/// 하이브리드 점수 내림차순, 동점은 낮은 청크 ID 우선. 결과에 중복 ID는 없습니다.
pub fn fuse(
    lexical: &[LexicalHit],
    semantic: &[SemanticHit],
    w_semantic: f32,
    normalization: ScoreNormalization,
    top_k: usize,
) -> Vec<Candidate> {
    // chunk_id -> (lexical raw, lexical norm, semantic raw, semantic norm)
    let mut merged: BTreeMap<ChunkId, (Option<(f32, f32)>, Option<(f32, f32)>)> = BTreeMap::new();

    let lexical_raw: Vec<f32> = lexical.iter().map(|h| h.score).collect();
    for (hit, norm) in lexical.iter().zip(normalize(&lexical_raw, normalization)) {
        merged.entry(hit.chunk_id).or_default().0 = Some((hit.score, norm));
    }

    let semantic_raw: Vec<f32> = semantic.iter().map(|h| h.similarity).collect();
    for (hit, norm) in semantic.iter().zip(normalize(&semantic_raw, normalization)) {
        merged.entry(hit.chunk_id).or_default().1 = Some((hit.similarity, norm));
    }

    let mut candidates: Vec<Candidate> = merged
        .into_iter()
        .map(|(chunk_id, (lex, sem))| {
            let method = match (lex.is_some(), sem.is_some()) {
                (true, true) => SearchMethod::Hybrid,
                (true, false) => SearchMethod::Lexical,
                _ => SearchMethod::Semantic,
            };
            let (lexical_score, lexical_norm) = lex.unwrap_or((0.0, 0.0));
            let (semantic_score, semantic_norm) = sem.unwrap_or((0.0, 0.0));

            Candidate {
                chunk_id,
                lexical_score,
                semantic_score,
                hybrid_score: hybrid_score(w_semantic, semantic_norm, lexical_norm),
                rerank_score: None,
                method,
            }
        })
        .collect();

    candidates.sort_by(compare_candidates);
    candidates.truncate(top_k);
    candidates
}

/// 하이브리드 점수 내림차순, 동점은 청크 ID 오름차순
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.hybrid_score
        .total_cmp(&a.hybrid_score)
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
///
/// 인덱스를 소유하지 않고, 호출 시 넘겨받은 스냅샷의 두 인덱스를 조회합니다.
#[derive(Debug, Clone)]
pub struct HybridRetriever {
    w_semantic: f32,
    normalization: ScoreNormalization,
    candidate_pool: usize,
}

impl HybridRetriever {
    pub fn new(config: &HybridConfig) -> Self {
        Self {
            w_semantic: config.w_semantic,
            normalization: config.normalization,
            candidate_pool: config.candidate_pool,
        }
    }

    pub fn w_semantic(&self) -> f32 {
        self.w_semantic
    }

    /// 두 인덱스 검색 후 결합
    ///
    /// `query_embedding`이 없으면 (임베딩 실패) BM25 결과만으로 순위를 매깁니다.
    /// `accept`는 필터(출처 문서, 격리된 청크 제외 등)입니다.
    pub fn retrieve<F>(
        &self,
        lexical: &LexicalIndex,
        semantic: &SemanticIndex,
        query: &str,
        query_embedding: Option<&[f32]>,
        top_k: usize,
        accept: F,
    ) -> Result<Vec<Candidate>>
    where
        F: Fn(ChunkId) -> bool,
    {
        if top_k == 0 {
            return Ok(vec![]);
        }
        let pool = self.candidate_pool.max(top_k);

        let terms = lexical.query_terms(query);
        let lexical_hits = lexical.search_terms(&terms, pool, &accept);

        let semantic_hits = match query_embedding {
            Some(embedding) => semantic.search_where(embedding, pool, &accept)?,
            None => vec![],
        };

        tracing::debug!(
            "Hybrid retrieval: {} lexical, {} semantic candidates",
            lexical_hits.len(),
            semantic_hits.len()
        );

        Ok(fuse(
            &lexical_hits,
            &semantic_hits,
            self.w_semantic,
            self.normalization,
            top_k,
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(chunk_id: ChunkId, score: f32) -> LexicalHit {
        LexicalHit { chunk_id, score }
    }

    fn sem(chunk_id: ChunkId, similarity: f32) -> SemanticHit {
        SemanticHit {
            chunk_id,
            distance: 1.0 - similarity,
            similarity,
        }
    }

    #[test]
    fn test_search_method_equality() {
        assert_eq!(SearchMethod::Semantic, SearchMethod::Semantic);
        assert_ne!(SearchMethod::Semantic, SearchMethod::Lexical);
        assert_ne!(SearchMethod::Lexical, SearchMethod::Hybrid);
    }

    #[test]
    fn test_min_max_normalization() {
        let norm = normalize(&[4.0, 2.0, 3.0], ScoreNormalization::MinMax);
        assert_eq!(norm, vec![1.0, 0.0, 0.5]);

        let equal = normalize(&[2.5, 2.5], ScoreNormalization::MinMax);
        assert_eq!(equal, vec![1.0, 1.0]);

        assert!(normalize(&[], ScoreNormalization::MinMax).is_empty());
    }

    #[test]
    fn test_rank_normalization_ties_share_rank() {
        let norm = normalize(&[9.0, 5.0, 5.0, 1.0], ScoreNormalization::Rank);
        assert_eq!(norm, vec![1.0, 0.75, 0.75, 0.25]);
    }

    #[test]
    fn test_hybrid_score_monotonic() {
        let w = 0.7;
        let steps = [0.0, 0.1, 0.25, 0.5, 0.75, 1.0];
        for &fixed in &steps {
            for pair in steps.windows(2) {
                assert!(hybrid_score(w, pair[1], fixed) >= hybrid_score(w, pair[0], fixed));
                assert!(hybrid_score(w, fixed, pair[1]) >= hybrid_score(w, fixed, pair[0]));
            }
        }
    }

    #[test]
    fn test_union_with_missing_scores_as_zero() {
        let lexical = [lex(1, 8.0), lex(2, 2.0)];
        let semantic = [sem(3, 0.9), sem(1, 0.5)];

        let fused = fuse(&lexical, &semantic, 0.7, ScoreNormalization::MinMax, 10);
        let ids: Vec<ChunkId> = fused.iter().map(|c| c.chunk_id).collect();
        assert_eq!(ids.len(), 3);

        let exact_match_only = fused.iter().find(|c| c.chunk_id == 2).unwrap();
        assert_eq!(exact_match_only.method, SearchMethod::Lexical);
        assert_eq!(exact_match_only.semantic_score, 0.0);

        let semantic_only = fused.iter().find(|c| c.chunk_id == 3).unwrap();
        assert_eq!(semantic_only.method, SearchMethod::Semantic);
        assert!((semantic_only.hybrid_score - 0.7).abs() < 1e-6);

        let both = fused.iter().find(|c| c.chunk_id == 1).unwrap();
        assert_eq!(both.method, SearchMethod::Hybrid);
        // lexical norm 1.0, semantic norm 0.0
        assert!((both.hybrid_score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_lexical_only_hit_still_retrievable() {
        // 의미 검색에는 없고 정확한 용어 일치만 있는 청크
        let lexical = [lex(42, 3.1)];
        let semantic = [sem(1, 0.8), sem(2, 0.6), sem(3, 0.4)];

        let fused = fuse(&lexical, &semantic, 0.7, ScoreNormalization::MinMax, 10);
        assert!(fused.iter().any(|c| c.chunk_id == 42));
    }

    #[test]
    fn test_top_k_and_no_duplicates() {
        let lexical: Vec<LexicalHit> = (0..8).map(|i| lex(i, 10.0 - i as f32)).collect();
        let semantic: Vec<SemanticHit> = (4..12).map(|i| sem(i, 1.0 - i as f32 / 20.0)).collect();

        for k in [0, 1, 3, 5, 20] {
            let fused = fuse(&lexical, &semantic, 0.5, ScoreNormalization::MinMax, k);
            assert!(fused.len() <= k);

            let mut ids: Vec<ChunkId> = fused.iter().map(|c| c.chunk_id).collect();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), fused.len());
        }
    }

    #[test]
    fn test_ties_ordered_by_chunk_id() {
        let lexical = [lex(9, 1.0), lex(3, 1.0), lex(5, 1.0)];
        for _ in 0..3 {
            let fused = fuse(&lexical, &[], 0.7, ScoreNormalization::MinMax, 10);
            let ids: Vec<ChunkId> = fused.iter().map(|c| c.chunk_id).collect();
            assert_eq!(ids, vec![3, 5, 9]);
        }
    }

    #[test]
    fn test_sorted_descending() {
        let lexical = [lex(1, 5.0), lex(2, 1.0), lex(3, 3.0)];
        let semantic = [sem(2, 0.9), sem(4, 0.2)];
        let fused = fuse(&lexical, &semantic, 0.6, ScoreNormalization::Rank, 10);
        for pair in fused.windows(2) {
            assert!(pair[0].hybrid_score >= pair[1].hybrid_score);
        }
    }
}
