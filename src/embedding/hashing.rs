//! 해싱 임베딩 - 네트워크 없이 쓰는 결정적 임베딩
//!
//! 토큰과 토큰 접두어(어간 근사)를 FNV-1a로 해싱하여 고정 차원에 누적한 뒤
//! L2 정규화합니다. 같은 입력은 항상 같은 벡터가 됩니다.

use anyhow::Result;
use async_trait::async_trait;

use super::EmbeddingProvider;
use crate::knowledge::LegalTokenizer;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 접두어 특성 길이 (murder / murdered 를 가깝게)
const PREFIX_CHARS: usize = 5;
const PREFIX_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimension: usize,
    tokenizer: LegalTokenizer,
}

impl HashingEmbedding {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            anyhow::bail!("Hashing embedding dimension must be greater than zero");
        }
        Ok(Self {
            dimension,
            tokenizer: LegalTokenizer::default(),
        })
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for (term, tf) in self.tokenizer.term_frequencies(text) {
            let weight = 1.0 + (tf as f32).ln();
            self.accumulate(&mut vector, &term, weight);

            if term.chars().count() > PREFIX_CHARS && term.chars().all(char::is_alphabetic) {
                let prefix: String = term.chars().take(PREFIX_CHARS).collect();
                self.accumulate(&mut vector, &format!("#{prefix}"), weight * PREFIX_WEIGHT);
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::cosine_similarity;

    #[tokio::test]
    async fn test_deterministic_and_normalized() {
        let embedder = HashingEmbedding::new(256).unwrap();
        let a = embedder.embed("Section 302: punishment for murder").await.unwrap();
        let b = embedder.embed("Section 302: punishment for murder").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_overlap_increases_similarity() {
        let embedder = HashingEmbedding::new(512).unwrap();
        let query = embedder.embed_query("punishment for murder").await.unwrap();
        let related = embedder
            .embed("Section 302: punishment for murder is death or life imprisonment.")
            .await
            .unwrap();
        let unrelated = embedder
            .embed("Section 420: cheating and dishonestly inducing delivery of property.")
            .await
            .unwrap();

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[tokio::test]
    async fn test_stop_words_only_gives_zero_vector() {
        let embedder = HashingEmbedding::new(32).unwrap();
        let v = embedder.embed("the of and").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(HashingEmbedding::new(0).is_err());
    }
}
