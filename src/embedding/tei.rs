//! TEI 임베딩 - text-embeddings-inference 서버 호출
//!
//! ref: https://huggingface.github.io/text-embeddings-inference/

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::EmbeddingProvider;

/// 요청당 최대 입력 수
const MAX_BATCH: usize = 32;

#[derive(Debug, Serialize)]
struct TeiEmbedRequest<'a> {
    inputs: &'a [String],
    truncate: bool,
}

#[derive(Debug)]
pub struct TeiEmbedding {
    client: reqwest::Client,
    url: String,
    dimension: usize,
}

impl TeiEmbedding {
    /// # Arguments
    /// * `endpoint` - 서버 주소 (예: `http://localhost:8080`)
    /// * `dimension` - 모델 출력 차원 (응답과 다르면 에러)
    pub fn new(endpoint: &str, dimension: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}/embed", endpoint.trim_end_matches('/')),
            dimension,
        })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(&self.url)
            .json(&TeiEmbedRequest {
                inputs,
                truncate: true,
            })
            .send()
            .await
            .context("Failed to send embedding request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("TEI embedding error ({}): {}", status, body);
        }

        let vectors: Vec<Vec<f32>> = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        if vectors.len() != inputs.len() {
            anyhow::bail!(
                "TEI returned {} embeddings for {} inputs",
                vectors.len(),
                inputs.len()
            );
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for TeiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors.pop().context("TEI returned no embedding")
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(MAX_BATCH).enumerate() {
            tracing::debug!("Embedding batch {} ({} texts)", i + 1, batch.len());
            results.extend(self.request(batch).await?);
        }
        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "tei"
    }
}
