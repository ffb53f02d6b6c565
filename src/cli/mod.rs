//! CLI 모듈
//!
//! legal-rag CLI 명령어 정의 및 구현

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{EmbeddingBackend, EngineConfig};
use crate::embedding::{create_embedder, has_api_key};
use crate::generation::{answer_query, create_generator};
use crate::knowledge::{
    create_reranker, DocumentFailure, RetrievalEngine, SearchQuery, SourceText,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "legal-rag")]
#[command(version, about = "법률 문서 하이브리드 검색 엔진", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로 (기본: <데이터 디렉토리>/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// 데이터 디렉토리 (설정보다 우선)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 텍스트 또는 파일을 인덱스에 추가
    Ingest {
        /// 직접 입력할 텍스트
        #[arg(short, long)]
        text: Option<String>,

        /// 수집할 텍스트 파일 경로 (여러 번 지정 가능)
        #[arg(short, long)]
        file: Vec<PathBuf>,

        /// 문서 이름 (기본: 파일 이름 또는 "direct-input")
        #[arg(short, long)]
        source: Option<String>,
    },

    /// 하이브리드 검색
    Query {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 제한
        #[arg(short, long)]
        limit: Option<usize>,

        /// 특정 문서로 제한
        #[arg(short, long)]
        source: Option<String>,

        /// JSON 출력
        #[arg(long)]
        json: bool,
    },

    /// 답변 생성용 컨텍스트 조립
    Context {
        /// 검색 쿼리
        query: String,

        /// 선택할 청크 수
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// 컨텍스트 기반 답변 생성 (Gemini API 키 필요)
    Answer {
        /// 질문
        query: String,
    },

    /// 문서의 모든 청크 삭제
    Remove {
        /// 삭제할 문서 이름
        #[arg(short, long)]
        source: String,
    },

    /// 청크 저장소로부터 인덱스 재구성
    Rebuild,

    /// 이중 색인 검사 (--repair: 격리된 청크 재색인)
    Verify {
        #[arg(long)]
        repair: bool,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config_file = config_path(cli.config, cli.data_dir.as_deref());
    let mut config = EngineConfig::load(config_file.as_deref()).context("설정 로드 실패")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Ingest { text, file, source } => cmd_ingest(config, text, file, source).await,
        Commands::Query {
            query,
            limit,
            source,
            json,
        } => cmd_query(config, &query, limit, source, json).await,
        Commands::Context { query, limit } => cmd_context(config, &query, limit).await,
        Commands::Answer { query } => cmd_answer(config, &query).await,
        Commands::Remove { source } => cmd_remove(config, &source).await,
        Commands::Rebuild => cmd_rebuild(config).await,
        Commands::Verify { repair } => cmd_verify(config, repair).await,
        Commands::Status => cmd_status(config).await,
    }
}

/// 설정으로 엔진 열기
fn open_engine(config: EngineConfig) -> Result<RetrievalEngine> {
    if config.embedding.backend == EmbeddingBackend::Gemini && !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n\n\
             또는 오프라인 임베딩 사용:\n  \
             export LEGAL_RAG_EMBEDDING__BACKEND=hashing"
        );
    }

    let embedder = create_embedder(&config.embedding).context("임베딩 생성 실패")?;
    let reranker = create_reranker(&config.rerank).context("리랭커 생성 실패")?;
    RetrievalEngine::open(config, embedder, reranker).context("인덱스 열기 실패")
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 문서 수집 명령어 (ingest)
async fn cmd_ingest(
    config: EngineConfig,
    text: Option<String>,
    files: Vec<PathBuf>,
    source: Option<String>,
) -> Result<()> {
    let mut documents = Vec::new();

    if let Some(text) = text {
        let name = source.clone().unwrap_or_else(|| "direct-input".to_string());
        documents.push(SourceText::new(name, text));
    }

    let (read, read_failures) = read_sources(&files, source.as_deref()).await;
    documents.extend(read);

    for failure in &read_failures {
        println!("[!] {} 건너뜀: {}", failure.source_document, failure.reason);
    }

    if documents.is_empty() {
        if read_failures.is_empty() {
            bail!("--text 또는 --file 중 하나를 지정해야 합니다");
        }
        println!("[!] 읽을 수 있는 문서가 없습니다 (실패 {} 건)", read_failures.len());
        return Ok(());
    }

    println!("[*] {} 문서 청킹 및 임베딩 중...", documents.len());

    let engine = open_engine(config)?;
    let report = engine.ingest(documents).await.context("수집 실패")?;

    for failure in &report.failures {
        println!("[!] {} 건너뜀: {}", failure.source_document, failure.reason);
    }
    println!(
        "[OK] {} 문서, {} 청크 추가 (세대 {}, 실패 {} 건)",
        report.documents_indexed,
        report.chunks_added,
        report.generation,
        read_failures.len() + report.failures.len()
    );

    Ok(())
}

/// 파일 읽기 (읽을 수 없는 파일은 실패로 기록하고 계속)
async fn read_sources(
    files: &[PathBuf],
    source: Option<&str>,
) -> (Vec<SourceText>, Vec<DocumentFailure>) {
    let mut documents = Vec::new();
    let mut failures = Vec::new();

    for path in files {
        let name = match (source, files.len()) {
            (Some(name), 1) => name.to_string(),
            _ => source_name(path),
        };

        match tokio::fs::read_to_string(path).await {
            Ok(content) => documents.push(SourceText::new(name, content)),
            Err(e) => {
                tracing::warn!("Skipping unreadable file {:?}: {}", path, e);
                failures.push(DocumentFailure {
                    source_document: name,
                    reason: format!("파일 읽기 실패: {}", e),
                });
            }
        }
    }

    (documents, failures)
}

/// 검색 명령어 (query)
async fn cmd_query(
    config: EngineConfig,
    query: &str,
    limit: Option<usize>,
    source: Option<String>,
    json: bool,
) -> Result<()> {
    let engine = open_engine(config)?;

    let mut request = SearchQuery::new(query);
    request.top_k = limit;
    request.source_document = source;

    let results = engine.search(&request).await.context("검색 실패")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    if results.semantic_degraded {
        println!("[!] 쿼리 임베딩 실패: 키워드 검색 결과만 표시합니다.");
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", results.len());

    for (i, hit) in results.hits.iter().enumerate() {
        println!(
            "{}. [점수: {:.4}] {} #{} (BM25 {:.3} / 벡터 {:.3})",
            i + 1,
            hit.score,
            hit.source_document,
            hit.sequence_index,
            hit.lexical_score,
            hit.semantic_score
        );
        println!("   내용: {}", truncate_text(&hit.chunk_text, 200));
        println!();
    }

    Ok(())
}

/// 컨텍스트 명령어 (context)
async fn cmd_context(config: EngineConfig, query: &str, limit: Option<usize>) -> Result<()> {
    let engine = open_engine(config)?;

    let mut request = SearchQuery::new(query);
    request.top_k = limit;

    let context = engine
        .assemble_context(&request)
        .await
        .context("컨텍스트 조립 실패")?;

    if context.is_empty() {
        println!("[!] 관련 청크가 없습니다.");
        return Ok(());
    }

    println!("{}", context.render());
    println!();
    println!(
        "[OK] {} 패시지, {} 자 (예산 초과 {} 건 제외)",
        context.passages.len(),
        context.total_characters,
        context.dropped
    );

    Ok(())
}

/// 답변 명령어 (answer)
async fn cmd_answer(config: EngineConfig, query: &str) -> Result<()> {
    let generator = create_generator(&config.generation).context("생성기 초기화 실패")?;
    let engine = open_engine(config)?;

    let context = engine
        .assemble_context(&SearchQuery::new(query))
        .await
        .context("컨텍스트 조립 실패")?;
    let answer = answer_query(generator.as_ref(), query, &context).await;

    println!("{}", answer.text);
    if !answer.citations.is_empty() {
        println!();
        println!("출처:");
        for citation in &answer.citations {
            println!("  - {} #{}", citation.source_document, citation.sequence_index);
        }
    }

    Ok(())
}

/// 삭제 명령어 (remove)
async fn cmd_remove(config: EngineConfig, source: &str) -> Result<()> {
    let engine = open_engine(config)?;
    let removed = engine
        .remove_document(source)
        .await
        .context("문서 삭제 실패")?;

    println!("[OK] {} 청크 삭제됨: {}", removed, source);
    Ok(())
}

/// 재구성 명령어 (rebuild)
async fn cmd_rebuild(config: EngineConfig) -> Result<()> {
    let engine = open_engine(config)?;
    let count = engine.rebuild().await.context("재구성 실패")?;

    println!("[OK] {} 청크 재색인 완료", count);
    Ok(())
}

/// 검사 명령어 (verify)
async fn cmd_verify(config: EngineConfig, repair: bool) -> Result<()> {
    let engine = open_engine(config)?;
    let report = engine.verify_consistency().await;

    if report.is_consistent() {
        println!("[OK] {} 청크 모두 이중 색인됨", report.checked);
        return Ok(());
    }

    println!(
        "[!] BM25 누락 {}, 벡터 누락 {}, 고아 항목 {}",
        report.missing_lexical.len(),
        report.missing_semantic.len(),
        report.orphaned.len()
    );

    if repair {
        let repaired = engine.reindex().await.context("재색인 실패")?;
        println!("[OK] {} 청크 복구됨", repaired);
    }

    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(config: EngineConfig) -> Result<()> {
    println!("legal-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] 데이터 디렉토리: {}", config.data_dir.display());

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
    }

    match open_engine(config) {
        Ok(engine) => {
            let stats = engine.stats();
            let dimension = stats
                .dimension
                .map_or_else(|| "-".to_string(), |d| d.to_string());
            println!("[OK] 임베딩: {} ({} 차원)", stats.embedder, dimension);
            println!("[OK] 리랭커: {}", stats.reranker);
            println!(
                "[OK] 문서 {} 건, 청크 {} 개 (세대 {})",
                stats.document_count, stats.chunk_count, stats.generation
            );
            println!(
                "     어휘 {} 개, 벡터 {} 개, 평균 {:.1} 토큰/청크",
                stats.term_count, stats.vector_count, stats.average_chunk_tokens
            );
            if stats.quarantined > 0 {
                println!("[!] 격리된 청크: {} (verify --repair 로 복구)", stats.quarantined);
            }
        }
        Err(e) => {
            println!("[!] 인덱스 열기 실패: {:#}", e);
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 설정 파일 경로: `--config` > `<--data-dir>/config.toml` > 기본 위치
fn config_path(config: Option<PathBuf>, data_dir: Option<&Path>) -> Option<PathBuf> {
    config.or_else(|| data_dir.map(|dir| dir.join("config.toml")))
}

/// 파일 경로에서 문서 이름
fn source_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

// ============================================================================
// Tests
// ============================================================================
