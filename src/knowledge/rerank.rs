//! Reranker - (쿼리, 청크) 쌍 재채점
//!
//! 하이브리드 상위 후보만 다시 채점하여 정밀도를 높입니다.
//! 리랭커가 실패하거나 시간 초과되면 하이브리드 순서를 그대로 반환합니다.
//!
//! - `PassthroughReranker`: 비활성 (순서 유지)
//! - `TermProximityReranker`: 로컬 결정적 채점 (용어 포함률 + 인접 순서 + 구문 일치)
//! - `TeiReranker`: text-embeddings-inference `/rerank` 크로스 인코더

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{RerankBackend, RerankConfig};
use crate::error::RagError;

use super::hybrid::Candidate;
use super::tokenizer::LegalTokenizer;

// ============================================================================
// Reranker Trait
// ============================================================================

/// 리랭커 트레이트
///
/// `score`는 `passages`와 같은 길이, 같은 순서의 점수를 반환해야 합니다.
/// 같은 입력에는 같은 점수를 반환해야 합니다.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;

    fn name(&self) -> &str;

    /// false면 호출하지 않고 하이브리드 순서를 그대로 사용
    fn is_enabled(&self) -> bool {
        true
    }
}

/// 리랭크 결과
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub candidates: Vec<Candidate>,
    /// 리랭커 점수가 실제로 적용되었는지
    pub applied: bool,
}

impl RerankOutcome {
    fn unchanged(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            applied: false,
        }
    }
}

/// 상위 `limit`개 후보를 리랭크
///
/// `passages[i]`는 `candidates[i]`의 본문입니다. `limit` 밖의 후보는 하이브리드
/// 순서대로 뒤에 붙습니다. 새 후보를 만들지 않으며, 동점은 하이브리드 순서를 유지합니다.
pub async fn rerank_candidates(
    reranker: &dyn Reranker,
    query: &str,
    candidates: Vec<Candidate>,
    passages: &[String],
    limit: usize,
    timeout: Duration,
) -> RerankOutcome {
    if !reranker.is_enabled() || candidates.is_empty() || limit == 0 {
        return RerankOutcome::unchanged(candidates);
    }
    if passages.len() != candidates.len() {
        tracing::warn!(
            "Rerank skipped: {} passages for {} candidates",
            passages.len(),
            candidates.len()
        );
        return RerankOutcome::unchanged(candidates);
    }

    let head_len = limit.min(candidates.len());
    let head_passages = &passages[..head_len];

    let scores = match tokio::time::timeout(timeout, reranker.score(query, head_passages)).await {
        Ok(Ok(scores)) => scores,
        Ok(Err(e)) => {
            tracing::warn!("Reranker {} failed, using hybrid order: {:#}", reranker.name(), e);
            return RerankOutcome::unchanged(candidates);
        }
        Err(_) => {
            tracing::warn!(
                "Reranker {} timed out after {:?}, using hybrid order",
                reranker.name(),
                timeout
            );
            return RerankOutcome::unchanged(candidates);
        }
    };

    if scores.len() != head_len || scores.iter().any(|s| !s.is_finite()) {
        tracing::warn!(
            "Reranker {} returned {} scores for {} passages, using hybrid order",
            reranker.name(),
            scores.len(),
            head_len
        );
        return RerankOutcome::unchanged(candidates);
    }

    let mut candidates = candidates;
    let tail = candidates.split_off(head_len);
    for (candidate, score) in candidates.iter_mut().zip(scores) {
        candidate.rerank_score = Some(score);
    }
    // 안정 정렬: 동점은 하이브리드 순서 유지
    candidates.sort_by(|a, b| {
        let a = a.rerank_score.unwrap_or(f32::NEG_INFINITY);
        let b = b.rerank_score.unwrap_or(f32::NEG_INFINITY);
        b.total_cmp(&a)
    });
    candidates.extend(tail);

    tracing::debug!("Reranked {} candidates with {}", head_len, reranker.name());

    RerankOutcome {
        candidates,
        applied: true,
    }
}

// ============================================================================
// Passthrough
// ============================================================================

/// 비활성 리랭커
#[derive(Debug, Clone, Default)]
pub struct PassthroughReranker;

#[async_trait]
impl Reranker for PassthroughReranker {
    async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>> {
        Ok(vec![0.0; passages.len()])
    }

    fn name(&self) -> &str {
        "passthrough"
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

// ============================================================================
// Term Proximity
// ============================================================================

/// 용어 근접도 리랭커
///
/// 쿼리와 본문을 함께 보고 채점합니다.
/// score = 0.6 · 포함률 + 0.3 · 인접 쌍 일치율 + 0.1 · 구문 일치
#[derive(Debug, Clone, Default)]
pub struct TermProximityReranker {
    tokenizer: LegalTokenizer,
}

impl TermProximityReranker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score_pair(&self, query: &str, passage: &str) -> f32 {
        let mut query_terms = self.tokenizer.tokenize(query);
        let mut seen = HashSet::new();
        query_terms.retain(|t| seen.insert(t.clone()));
        if query_terms.is_empty() {
            return 0.0;
        }

        let passage_terms = self.tokenizer.tokenize(passage);
        let passage_set: HashSet<&str> = passage_terms.iter().map(String::as_str).collect();
        let passage_pairs: HashSet<(&str, &str)> = passage_terms
            .windows(2)
            .map(|w| (w[0].as_str(), w[1].as_str()))
            .collect();

        let covered = query_terms
            .iter()
            .filter(|t| passage_set.contains(t.as_str()))
            .count();
        let coverage = covered as f32 / query_terms.len() as f32;

        let adjacency = if query_terms.len() > 1 {
            let matched = query_terms
                .windows(2)
                .filter(|w| passage_pairs.contains(&(w[0].as_str(), w[1].as_str())))
                .count();
            matched as f32 / (query_terms.len() - 1) as f32
        } else {
            coverage
        };

        let phrase = query.trim().to_lowercase();
        let phrase_bonus = if !phrase.is_empty() && passage.to_lowercase().contains(&phrase) {
            1.0
        } else {
            0.0
        };

        0.6 * coverage + 0.3 * adjacency + 0.1 * phrase_bonus
    }
}

#[async_trait]
impl Reranker for TermProximityReranker {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        Ok(passages.iter().map(|p| self.score_pair(query, p)).collect())
    }

    fn name(&self) -> &str {
        "term-proximity"
    }
}

// ============================================================================
// TEI Cross-Encoder
// ============================================================================

#[derive(Debug, Serialize)]
struct TeiRerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
}

#[derive(Debug, Deserialize)]
struct TeiRerankScore {
    index: usize,
    score: f32,
}

/// text-embeddings-inference 리랭커 (HTTP)
///
/// ref: https://huggingface.github.io/text-embeddings-inference/
#[derive(Debug)]
pub struct TeiReranker {
    client: reqwest::Client,
    url: String,
}

impl TeiReranker {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}/rerank", endpoint.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Reranker for TeiReranker {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let request = TeiRerankRequest {
            query,
            texts: passages,
            raw_scores: false,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("Failed to send rerank request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Rerank API error ({}): {}", status, body);
        }

        let ranked: Vec<TeiRerankScore> = response
            .json()
            .await
            .context("Failed to parse rerank response")?;

        // 응답은 점수순이므로 입력 순서로 되돌림
        let mut scores = vec![None; passages.len()];
        for item in ranked {
            match scores.get_mut(item.index) {
                Some(slot) => *slot = Some(item.score),
                None => anyhow::bail!("Rerank response index {} out of range", item.index),
            }
        }
        scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.with_context(|| format!("Rerank response missing index {i}")))
            .collect()
    }

    fn name(&self) -> &str {
        "tei-rerank"
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에 맞는 리랭커 생성
pub fn create_reranker(config: &RerankConfig) -> std::result::Result<Arc<dyn Reranker>, RagError> {
    let reranker: Arc<dyn Reranker> = match config.backend {
        RerankBackend::None => Arc::new(PassthroughReranker),
        RerankBackend::TermProximity => Arc::new(TermProximityReranker::new()),
        RerankBackend::Tei => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| RagError::Config("rerank.endpoint is required for tei".into()))?;
            let reranker = TeiReranker::new(endpoint, config.timeout())
                .map_err(|e| RagError::Config(format!("{e:#}")))?;
            Arc::new(reranker)
        }
    };

    tracing::info!("Using reranker: {}", reranker.name());
    Ok(reranker)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::hybrid::SearchMethod;

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>> {
            anyhow::bail!("model failed to load")
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct SlowReranker;

    #[async_trait]
    impl Reranker for SlowReranker {
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![1.0; passages.len()])
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    struct ShortReranker;

    #[async_trait]
    impl Reranker for ShortReranker {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>> {
            Ok(vec![1.0])
        }

        fn name(&self) -> &str {
            "short"
        }
    }

    fn candidates(n: u64) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate {
                chunk_id: i,
                lexical_score: 0.0,
                semantic_score: 0.0,
                hybrid_score: 1.0 - i as f32 * 0.1,
                rerank_score: None,
                method: SearchMethod::Hybrid,
            })
            .collect()
    }

    fn ids(candidates: &[Candidate]) -> Vec<u64> {
        candidates.iter().map(|c| c.chunk_id).collect()
    }

    fn passages() -> Vec<String> {
        vec![
            "Section 379: punishment for theft.".to_string(),
            "Section 302: punishment for murder is death or life imprisonment.".to_string(),
            "Section 420: cheating and dishonestly inducing delivery of property.".to_string(),
        ]
    }

    #[test]
    fn test_term_proximity_prefers_phrase_match() {
        let reranker = TermProximityReranker::new();
        let exact = reranker.score_pair("punishment for murder", &passages()[1]);
        let partial = reranker.score_pair("punishment for murder", &passages()[0]);
        let none = reranker.score_pair("punishment for murder", &passages()[2]);

        assert!(exact > partial);
        assert!(partial > none);
        assert!((exact - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_is_deterministic() {
        let reranker = TermProximityReranker::new();
        let first = rerank_candidates(
            &reranker,
            "punishment for murder",
            candidates(3),
            &passages(),
            10,
            Duration::from_secs(1),
        )
        .await;
        assert!(first.applied);
        assert_eq!(ids(&first.candidates), vec![1, 0, 2]);

        let second = rerank_candidates(
            &reranker,
            "punishment for murder",
            candidates(3),
            &passages(),
            10,
            Duration::from_secs(1),
        )
        .await;
        let first_scores: Vec<_> = first.candidates.iter().map(|c| c.rerank_score).collect();
        let second_scores: Vec<_> = second.candidates.iter().map(|c| c.rerank_score).collect();
        assert_eq!(first_scores, second_scores);
    }

    #[tokio::test]
    async fn test_rerank_only_shortlist() {
        let reranker = TermProximityReranker::new();
        let outcome = rerank_candidates(
            &reranker,
            "cheating property",
            candidates(3),
            &passages(),
            2,
            Duration::from_secs(1),
        )
        .await;
        assert!(outcome.applied);
        // 2번은 shortlist 밖이므로 마지막, 리랭크 점수 없음
        assert_eq!(outcome.candidates[2].chunk_id, 2);
        assert_eq!(outcome.candidates[2].rerank_score, None);
    }

    #[tokio::test]
    async fn test_failure_returns_hybrid_order() {
        let outcome = rerank_candidates(
            &FailingReranker,
            "punishment for murder",
            candidates(3),
            &passages(),
            10,
            Duration::from_secs(1),
        )
        .await;
        assert!(!outcome.applied);
        assert_eq!(ids(&outcome.candidates), vec![0, 1, 2]);
        assert!(outcome.candidates.iter().all(|c| c.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_timeout_returns_hybrid_order() {
        let outcome = rerank_candidates(
            &SlowReranker,
            "murder",
            candidates(3),
            &passages(),
            10,
            Duration::from_millis(20),
        )
        .await;
        assert!(!outcome.applied);
        assert_eq!(ids(&outcome.candidates), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_score_count_mismatch_returns_hybrid_order() {
        let outcome = rerank_candidates(
            &ShortReranker,
            "murder",
            candidates(3),
            &passages(),
            10,
            Duration::from_secs(1),
        )
        .await;
        assert!(!outcome.applied);
        assert_eq!(ids(&outcome.candidates), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_passthrough_is_disabled() {
        let outcome = rerank_candidates(
            &PassthroughReranker,
            "murder",
            candidates(3),
            &passages(),
            10,
            Duration::from_secs(1),
        )
        .await;
        assert!(!outcome.applied);
        assert_eq!(ids(&outcome.candidates), vec![0, 1, 2]);
    }

    #[test]
    fn test_tei_requires_endpoint() {
        let config = RerankConfig {
            backend: RerankBackend::Tei,
            endpoint: None,
            ..RerankConfig::default()
        };
        assert!(create_reranker(&config).is_err());
    }
}
