//! Generation 모듈 - 검색 컨텍스트 기반 답변 생성
//!
//! 조립된 컨텍스트를 번호 붙은 인용과 함께 프롬프트로 만들고 LLM에 넘깁니다.
//! 컨텍스트가 비어 있으면 모델을 호출하지 않습니다.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::embedding::{get_api_key, GEMINI_API_BASE};
use crate::knowledge::{AssembledContext, Citation};

/// 컨텍스트가 없을 때의 응답
pub const NO_CONTEXT_ANSWER: &str = "No relevant information found in the knowledge base.";

/// 생성 실패 시의 응답
pub const GENERATION_FAILED_ANSWER: &str = "An error occurred while generating an answer.";

/// 모델이 빈 문자열을 반환했을 때의 응답
pub const EMPTY_ANSWER: &str = "No answer generated.";

// ============================================================================
// AnswerGenerator Trait
// ============================================================================

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// 프롬프트로 답변 생성
    async fn generate(&self, prompt: &str) -> Result<String>;

    fn name(&self) -> &str;
}

/// 생성된 답변
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// 프롬프트에 넣은 인용 (번호 순)
    pub citations: Vec<Citation>,
    /// 모델 응답인지 (false면 고정 메시지)
    pub generated: bool,
}

/// "Question / Relevant Information / Answer" 프롬프트
///
/// 각 구절은 `[n] 문서 #순번` 머리글로 구분됩니다.
pub fn build_prompt(query: &str, context: &AssembledContext) -> String {
    format!(
        "Answer the legal question using only the numbered passages below. \
         Cite passages by their number, e.g. [1].\n\n\
         Question: {}\n\n\
         Relevant Information:\n{}\n\n\
         Answer:",
        query.trim(),
        context.render()
    )
}

/// 컨텍스트로 답변 생성
///
/// 컨텍스트가 비면 모델을 부르지 않고 `NO_CONTEXT_ANSWER`를 반환합니다.
/// 생성기 에러는 전파하지 않고 `GENERATION_FAILED_ANSWER`로 바꿉니다.
pub async fn answer_query(
    generator: &dyn AnswerGenerator,
    query: &str,
    context: &AssembledContext,
) -> Answer {
    if context.is_empty() {
        return Answer {
            text: NO_CONTEXT_ANSWER.to_string(),
            citations: Vec::new(),
            generated: false,
        };
    }

    let citations: Vec<Citation> = context.citations().cloned().collect();
    let prompt = build_prompt(query, context);

    match generator.generate(&prompt).await {
        Ok(text) if text.trim().is_empty() => Answer {
            text: EMPTY_ANSWER.to_string(),
            citations,
            generated: false,
        },
        Ok(text) => Answer {
            text: text.trim().to_string(),
            citations,
            generated: true,
        },
        Err(e) => {
            tracing::error!("Answer generation with {} failed: {:#}", generator.name(), e);
            Answer {
                text: GENERATION_FAILED_ANSWER.to_string(),
                citations,
                generated: false,
            }
        }
    }
}

// ============================================================================
// Gemini Generator
// ============================================================================

pub struct GeminiGenerator {
    client: reqwest::Client,
    api_key: String,
    config: GenerationConfig,
}

impl GeminiGenerator {
    pub fn new(api_key: String, config: GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    /// 환경변수의 API 키로 생성
    pub fn from_env(config: GenerationConfig) -> Result<Self> {
        Self::new(get_api_key()?, config)
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", GEMINI_API_BASE, self.config.model)
    }
}

#[async_trait]
impl AnswerGenerator for GeminiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: RequestGenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send generateContent request")?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            anyhow::bail!("Gemini API error ({}): {}", status, body);
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&body).context("Failed to parse generateContent response")?;

        Ok(parsed.text())
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

/// 설정으로 생성기 생성 (Gemini API 키 필요)
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn AnswerGenerator>> {
    Ok(Arc::new(GeminiGenerator::from_env(config.clone())?))
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<RequestContent>,
    #[serde(rename = "generationConfig")]
    generation_config: RequestGenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct RequestGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

impl GenerateResponse {
    /// 첫 후보의 텍스트 파트를 이어 붙임
    fn text(self) -> String {
        self.candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    content: ResponseContent,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================
