//! Text Chunking Module
//!
//! 법률 문서 구조(조문 제목, 문단)를 존중하면서 검색 단위 청크로 나눕니다.
//! 각 청크는 원문 내 바이트 오프셋을 함께 가집니다.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 조문 제목 (예: "Section 302", "Article 21", "302.", "CHAPTER XVI")
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:section|sec\.|article|art\.|chapter|rule|order)\s+[0-9ivxlcdm]+|^\s*\d+[a-z]?\.\s")
        .expect("heading pattern is valid")
});

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정 (문자 수 기준)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// 조문 경계에서 새 청크를 시작하기 위한 최소 크기
    pub min_characters: usize,
    /// 목표 최대 크기
    pub max_characters: usize,
    /// 절대 상한 (임베딩 입력 잘림 방지)
    pub hard_cap_characters: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_characters: 500,
            max_characters: 800,
            hard_cap_characters: 1000,
        }
    }
}

impl ChunkConfig {
    /// 짧은 조문 단위 설정 (조문 하나가 청크 하나가 되도록)
    pub fn for_sections() -> Self {
        Self {
            min_characters: 80,
            max_characters: 800,
            hard_cap_characters: 1000,
        }
    }
}

/// 원문 내 위치를 가진 청크 텍스트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    /// 원문 기준 바이트 오프셋
    pub offset: usize,
    pub text: String,
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할
    fn chunk(&self, text: &str) -> Vec<TextSpan>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// LegalChunker
// ============================================================================

/// 법률 문서 청커
///
/// - 줄 단위로 읽어 `max_characters`까지 묶음
/// - 조문 제목을 만나면 (현재 청크가 `min_characters` 이상일 때) 새 청크 시작
/// - `hard_cap_characters`를 넘는 줄은 문장 → 공백 경계에서 분할
pub struct LegalChunker {
    config: ChunkConfig,
}

impl LegalChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    /// 비어있지 않은 줄을 오프셋과 함께 수집 (긴 줄은 분할)
    fn split_units(&self, text: &str) -> Vec<TextSpan> {
        let mut units = Vec::new();
        let mut offset = 0;

        for raw_line in text.split('\n') {
            let line_offset = offset;
            offset += raw_line.len() + 1;

            let trimmed = raw_line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let lead = raw_line.len() - raw_line.trim_start().len();
            let start = line_offset + lead;

            if char_len(trimmed) > self.config.hard_cap_characters {
                units.extend(self.split_long_line(trimmed, start));
            } else {
                units.push(TextSpan {
                    offset: start,
                    text: trimmed.to_string(),
                });
            }
        }

        units
    }

    /// 긴 줄을 문장 경계로, 그래도 길면 공백 경계로 분할
    fn split_long_line(&self, line: &str, base_offset: usize) -> Vec<TextSpan> {
        let max = self.config.max_characters;
        let mut pieces: Vec<TextSpan> = Vec::new();
        let mut current_start: Option<usize> = None;
        let mut current_end = 0;

        for (start, end) in sentence_bounds(line) {
            match current_start {
                Some(open) if char_len(&line[open..end]) > max => {
                    pieces.push(trimmed_span(line, open, current_end, base_offset));
                    current_start = Some(start);
                }
                Some(_) => {}
                None => current_start = Some(start),
            }
            current_end = end;
        }
        if let Some(open) = current_start {
            pieces.push(trimmed_span(line, open, current_end, base_offset));
        }

        // 한 문장 자체가 상한을 넘으면 공백 경계에서 자름
        pieces
            .into_iter()
            .flat_map(|piece| {
                if char_len(&piece.text) > self.config.hard_cap_characters {
                    split_on_whitespace(&piece.text, piece.offset, max)
                } else {
                    vec![piece]
                }
            })
            .filter(|piece| !piece.text.is_empty())
            .collect()
    }

    /// 단위를 청크로 묶음
    fn pack(&self, units: Vec<TextSpan>) -> Vec<TextSpan> {
        let mut chunks: Vec<TextSpan> = Vec::new();
        let mut current: Option<TextSpan> = None;

        for unit in units {
            let Some(mut open) = current.take() else {
                current = Some(unit);
                continue;
            };

            let open_len = char_len(&open.text);
            let at_heading = HEADING_RE.is_match(&unit.text);
            let overflow = open_len + 1 + char_len(&unit.text) > self.config.max_characters;

            if (at_heading && open_len >= self.config.min_characters) || overflow {
                chunks.push(open);
                current = Some(unit);
            } else {
                open.text.push('\n');
                open.text.push_str(&unit.text);
                current = Some(open);
            }
        }

        if let Some(last) = current {
            chunks.push(last);
        }

        self.merge_small_tail(chunks)
    }

    /// 마지막 청크가 너무 작으면 이전 청크에 병합 (상한 이내일 때만)
    fn merge_small_tail(&self, mut chunks: Vec<TextSpan>) -> Vec<TextSpan> {
        if chunks.len() < 2 {
            return chunks;
        }

        let Some(tail) = chunks.last() else {
            return chunks;
        };
        if HEADING_RE.is_match(&tail.text) {
            return chunks;
        }
        let tail_len = char_len(&tail.text);
        let prev_len = chunks
            .get(chunks.len() - 2)
            .map(|c| char_len(&c.text))
            .unwrap_or(0);

        if tail_len < self.config.min_characters / 4
            && prev_len + 1 + tail_len <= self.config.hard_cap_characters
        {
            if let Some(tail) = chunks.pop() {
                if let Some(prev) = chunks.last_mut() {
                    prev.text.push('\n');
                    prev.text.push_str(&tail.text);
                }
            }
        }

        chunks
    }
}

impl Chunker for LegalChunker {
    fn chunk(&self, text: &str) -> Vec<TextSpan> {
        if text.trim().is_empty() {
            return vec![];
        }

        let units = self.split_units(text);
        self.pack(units)
    }

    fn name(&self) -> &'static str {
        "LegalChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 정규화: 제어문자 제거, 줄 내부 공백 압축, 줄바꿈은 유지
pub fn normalize_text(text: &str) -> String {
    text.lines()
        .map(|line| {
            line.split(|c: char| c.is_whitespace() || (c.is_control() && c != '\n'))
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// `line[start..end]`을 앞뒤 공백 제거한 span으로 (오프셋 보정 포함)
fn trimmed_span(line: &str, start: usize, end: usize, base_offset: usize) -> TextSpan {
    let raw = &line[start..end];
    let lead = raw.len() - raw.trim_start().len();
    TextSpan {
        offset: base_offset + start + lead,
        text: raw.trim().to_string(),
    }
}

#[inline]
fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// 문장 경계 (바이트 범위) 목록
fn sentence_bounds(line: &str) -> Vec<(usize, usize)> {
    let mut bounds = Vec::new();
    let mut start = 0;
    let mut chars = line.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '?' | '!' | ';' | '\u{0964}') {
            let next_is_space = chars.peek().map(|(_, n)| n.is_whitespace()).unwrap_or(true);
            if next_is_space {
                let end = i + c.len_utf8();
                bounds.push((start, end));
                start = end;
            }
        }
    }
    if start < line.len() {
        bounds.push((start, line.len()));
    }

    bounds
}

/// 공백 경계에서 `max_chars` 이하로 분할
fn split_on_whitespace(text: &str, base_offset: usize, max_chars: usize) -> Vec<TextSpan> {
    let mut pieces = Vec::new();
    let mut piece_start: Option<usize> = None;
    let mut piece_end = 0;
    let mut piece_chars = 0;

    for (start, word) in word_spans(text) {
        let word_chars = char_len(word);
        match piece_start {
            Some(ps) if piece_chars + 1 + word_chars > max_chars => {
                pieces.push(TextSpan {
                    offset: base_offset + ps,
                    text: text[ps..piece_end].to_string(),
                });
                piece_start = Some(start);
                piece_chars = word_chars;
            }
            Some(_) => piece_chars += 1 + word_chars,
            None => {
                piece_start = Some(start);
                piece_chars = word_chars;
            }
        }
        piece_end = start + word.len();
    }
    if let Some(ps) = piece_start {
        pieces.push(TextSpan {
            offset: base_offset + ps,
            text: text[ps..piece_end].to_string(),
        });
    }

    pieces
}

/// (바이트 시작, 단어) 목록
fn word_spans(text: &str) -> Vec<(usize, &str)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, &text[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, &text[s..]));
    }

    spans
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 기본 청커 생성
pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(LegalChunker::with_defaults())
}

/// 법률 청커 생성 (설정 지정)
pub fn legal_chunker(config: ChunkConfig) -> Box<dyn Chunker> {
    Box::new(LegalChunker::new(config))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            min_characters: 20,
            max_characters: 80,
            hard_cap_characters: 100,
        }
    }

    #[test]
    fn test_chunker_empty() {
        let chunker = LegalChunker::with_defaults();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("  \n\n ").is_empty());
    }

    #[test]
    fn test_chunker_small_text() {
        let chunker = LegalChunker::with_defaults();
        let chunks = chunker.chunk("Section 302: punishment for murder.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].text, "Section 302: punishment for murder.");
    }

    #[test]
    fn test_chunker_splits_at_headings() {
        let chunker = LegalChunker::new(small_config());
        let text = "Section 299: culpable homicide defined here.\n\
                    Section 300: murder defined in this clause.";
        let chunks = chunker.chunk(text);

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.starts_with("Section 299"));
        assert!(chunks[1].text.starts_with("Section 300"));
        assert_eq!(&text[chunks[1].offset..chunks[1].offset + 11], "Section 300");
    }

    #[test]
    fn test_chunker_packs_short_lines() {
        let chunker = LegalChunker::new(small_config());
        let text = "first line\nsecond line\nthird line";
        let chunks = chunker.chunk(text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "first line\nsecond line\nthird line");
    }

    #[test]
    fn test_chunker_respects_hard_cap() {
        let config = small_config();
        let chunker = LegalChunker::new(config.clone());
        let sentence = "The accused shall be punished with imprisonment. ";
        let text = sentence.repeat(10);
        let chunks = chunker.chunk(&text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(char_len(&chunk.text) <= config.hard_cap_characters);
            assert!(text[chunk.offset..].starts_with(&chunk.text[..10]));
        }
    }

    #[test]
    fn test_chunker_splits_unbroken_sentence_on_whitespace() {
        let chunker = LegalChunker::new(small_config());
        let text = "word ".repeat(60);
        let chunks = chunker.chunk(&text);

        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(char_len(&chunk.text) <= 80);
        }
    }

    #[test]
    fn test_offsets_with_indentation() {
        let chunker = LegalChunker::with_defaults();
        let text = "\n   Article 21: protection of life.";
        let chunks = chunker.chunk(text);
        assert_eq!(chunks[0].offset, 4);
        assert!(text[chunks[0].offset..].starts_with("Article 21"));
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(
            normalize_text("  Section\t302 \u{0007}:  murder \n\n next  "),
            "Section 302 : murder\n\nnext"
        );
        assert_eq!(normalize_text(" \n\t "), "");
    }

    #[test]
    fn test_config_presets() {
        let default = ChunkConfig::default();
        assert_eq!(default.max_characters, 800);
        assert!(default.max_characters <= default.hard_cap_characters);

        let sections = ChunkConfig::for_sections();
        assert!(sections.min_characters < default.min_characters);
    }

    #[test]
    fn test_multibyte_text() {
        let chunker = LegalChunker::new(small_config());
        let text = "धारा 302: हत्या के लिए दंड। ".repeat(8);
        let chunks = chunker.chunk(&text);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(char_len(&chunk.text) <= 100);
        }
    }
}
