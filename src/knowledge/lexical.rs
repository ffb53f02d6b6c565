//! Lexical Index - BM25 희소 인덱스
//!
//! 용어 → 포스팅(청크 ID, 용어 빈도) 매핑과 청크 길이, 평균 길이를 유지합니다.
//! 통계는 삽입/삭제 시 증분 갱신됩니다.
//!
//! ```text
//! score = Σ IDF(t) · tf·(k1+1) / (tf + k1·(1 − b + b·len/avg_len))
//! IDF(t) = ln(1 + (N − df + 0.5) / (df + 0.5))
//! ```
//!
//! IDF는 모든 청크에 등장하는 용어에도 양수를 유지합니다.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

use super::chunk::{Chunk, ChunkId};
use super::tokenizer::LegalTokenizer;

// ============================================================================
// Types
// ============================================================================

/// BM25 파라미터
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Params {
    /// 용어 빈도 포화 (클수록 tf 영향이 오래 증가)
    pub k1: f32,
    /// 길이 정규화 강도 (0 = 없음, 1 = 완전)
    pub b: f32,
    /// 영어 불용어 제거 여부
    pub remove_stop_words: bool,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            remove_stop_words: true,
        }
    }
}

/// 포스팅 엔트리
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub chunk_id: ChunkId,
    pub term_frequency: u32,
}

/// 렉시컬 검색 결과
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalHit {
    pub chunk_id: ChunkId,
    pub score: f32,
}

// ============================================================================
// LexicalIndex
// ============================================================================

#[derive(Debug, Clone)]
pub struct LexicalIndex {
    params: Bm25Params,
    tokenizer: LegalTokenizer,
    /// 용어 → 청크 ID 오름차순 포스팅
    postings: HashMap<String, Vec<Posting>>,
    /// 청크 ID → 토큰 수
    doc_lengths: BTreeMap<ChunkId, u32>,
    total_length: u64,
}

impl LexicalIndex {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            tokenizer: LegalTokenizer::new(params.remove_stop_words),
            postings: HashMap::new(),
            doc_lengths: BTreeMap::new(),
            total_length: 0,
        }
    }

    /// 저장된 통계로 복원 (재토큰화 없음)
    ///
    /// 포스팅이 알 수 없는 청크를 가리키거나 용어 빈도 합이 청크 길이와
    /// 다르면 `RagError::Consistency`를 반환합니다.
    pub fn from_parts(
        params: Bm25Params,
        doc_lengths: BTreeMap<ChunkId, u32>,
        mut postings: HashMap<String, Vec<Posting>>,
    ) -> Result<Self> {
        let mut sums: HashMap<ChunkId, u64> = HashMap::new();

        for (term, list) in postings.iter_mut() {
            list.sort_by_key(|p| p.chunk_id);
            for pair in list.windows(2) {
                if pair[0].chunk_id == pair[1].chunk_id {
                    return Err(RagError::Consistency {
                        chunk_id: pair[0].chunk_id,
                        reason: format!("duplicate posting for term '{term}'"),
                    });
                }
            }
            for posting in list.iter() {
                if !doc_lengths.contains_key(&posting.chunk_id) {
                    return Err(RagError::Consistency {
                        chunk_id: posting.chunk_id,
                        reason: format!("posting for term '{term}' has no document length"),
                    });
                }
                *sums.entry(posting.chunk_id).or_insert(0) += u64::from(posting.term_frequency);
            }
        }

        for (&chunk_id, &length) in &doc_lengths {
            let sum = sums.get(&chunk_id).copied().unwrap_or(0);
            if sum != u64::from(length) {
                return Err(RagError::Consistency {
                    chunk_id,
                    reason: format!("term frequencies sum to {sum}, expected length {length}"),
                });
            }
        }

        let total_length = doc_lengths.values().map(|&l| u64::from(l)).sum();
        postings.retain(|_, list| !list.is_empty());

        Ok(Self {
            params,
            tokenizer: LegalTokenizer::new(params.remove_stop_words),
            postings,
            doc_lengths,
            total_length,
        })
    }

    /// 청크 토큰화 후 색인
    pub fn index(&mut self, chunk: &Chunk) -> Result<()> {
        let freqs = self.tokenizer.term_frequencies(&chunk.text);
        self.insert_terms(chunk.id, freqs)
    }

    /// 용어 빈도로 직접 색인
    pub fn insert_terms(&mut self, chunk_id: ChunkId, freqs: BTreeMap<String, u32>) -> Result<()> {
        if self.doc_lengths.contains_key(&chunk_id) {
            return Err(RagError::Consistency {
                chunk_id,
                reason: "chunk is already lexically indexed".to_string(),
            });
        }

        let length: u32 = freqs.values().sum();
        for (term, term_frequency) in freqs {
            let list = self.postings.entry(term).or_default();
            let posting = Posting {
                chunk_id,
                term_frequency,
            };
            match list.binary_search_by_key(&chunk_id, |p| p.chunk_id) {
                Ok(pos) => list[pos] = posting,
                Err(pos) => list.insert(pos, posting),
            }
        }

        self.doc_lengths.insert(chunk_id, length);
        self.total_length += u64::from(length);
        Ok(())
    }

    /// 청크 제거. 색인되어 있지 않았으면 `false`.
    pub fn remove(&mut self, chunk_id: ChunkId) -> bool {
        let Some(length) = self.doc_lengths.remove(&chunk_id) else {
            return false;
        };
        self.total_length -= u64::from(length);

        self.postings.retain(|_, list| {
            if let Ok(pos) = list.binary_search_by_key(&chunk_id, |p| p.chunk_id) {
                list.remove(pos);
            }
            !list.is_empty()
        });
        true
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    pub fn tokenizer(&self) -> &LegalTokenizer {
        &self.tokenizer
    }

    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.doc_lengths.contains_key(&chunk_id)
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.doc_lengths.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    /// 고유 용어 수
    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    pub fn doc_length(&self, chunk_id: ChunkId) -> Option<u32> {
        self.doc_lengths.get(&chunk_id).copied()
    }

    pub fn doc_lengths(&self) -> &BTreeMap<ChunkId, u32> {
        &self.doc_lengths
    }

    /// (용어, 포스팅) 전체 순회
    pub fn postings(&self) -> impl Iterator<Item = (&str, &Posting)> + '_ {
        self.postings
            .iter()
            .flat_map(|(term, list)| list.iter().map(move |p| (term.as_str(), p)))
    }

    pub fn average_doc_length(&self) -> f32 {
        if self.doc_lengths.is_empty() {
            0.0
        } else {
            (self.total_length as f64 / self.doc_lengths.len() as f64) as f32
        }
    }

    pub fn document_frequency(&self, term: &str) -> usize {
        self.postings.get(term).map(Vec::len).unwrap_or(0)
    }

    /// 평활화된 IDF (항상 양수)
    pub fn idf(&self, term: &str) -> f32 {
        let n = self.doc_lengths.len() as f64;
        let df = self.document_frequency(term) as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln() as f32
    }

    /// 쿼리 용어 (중복 제거, 순서 유지)
    pub fn query_terms(&self, query: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tokenizer
            .tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }

    /// 특정 청크의 BM25 점수
    pub fn score(&self, query_terms: &[String], chunk_id: ChunkId) -> f32 {
        let Some(length) = self.doc_length(chunk_id) else {
            return 0.0;
        };

        query_terms
            .iter()
            .filter_map(|term| {
                let list = self.postings.get(term)?;
                let pos = list.binary_search_by_key(&chunk_id, |p| p.chunk_id).ok()?;
                Some(self.term_score(term, list[pos].term_frequency, length))
            })
            .sum()
    }

    fn term_score(&self, term: &str, tf: u32, length: u32) -> f32 {
        let Bm25Params { k1, b, .. } = self.params;
        let avg = self.average_doc_length();
        let ratio = if avg > 0.0 { length as f32 / avg } else { 1.0 };
        let tf = tf as f32;

        self.idf(term) * (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * ratio))
    }

    /// 쿼리 문자열 검색
    pub fn search(&self, query: &str, top_k: usize) -> Vec<LexicalHit> {
        let terms = self.query_terms(query);
        self.search_terms(&terms, top_k, |_| true)
    }

    /// 용어 목록 검색 (`accept`가 false인 청크 제외)
    ///
    /// 점수 내림차순, 동점은 낮은 청크 ID 우선. 매칭 용어가 없으면 빈 목록.
    pub fn search_terms<F>(&self, terms: &[String], top_k: usize, accept: F) -> Vec<LexicalHit>
    where
        F: Fn(ChunkId) -> bool,
    {
        if top_k == 0 || terms.is_empty() {
            return vec![];
        }

        let mut scores: HashMap<ChunkId, f32> = HashMap::new();
        for term in terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            for posting in list {
                if !accept(posting.chunk_id) {
                    continue;
                }
                let length = self.doc_lengths.get(&posting.chunk_id).copied().unwrap_or(0);
                *scores.entry(posting.chunk_id).or_insert(0.0) +=
                    self.term_score(term, posting.term_frequency, length);
            }
        }

        let mut hits: Vec<LexicalHit> = scores
            .into_iter()
            .map(|(chunk_id, score)| LexicalHit { chunk_id, score })
            .collect();
        hits.sort_by(compare_hits);
        hits.truncate(top_k);
        hits
    }
}

/// 점수 내림차순, 동점은 청크 ID 오름차순
fn compare_hits(a: &LexicalHit, b: &LexicalHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

// ============================================================================
// Tests
// ============================================================================
