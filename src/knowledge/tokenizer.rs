//! 법률 텍스트 토크나이저
//!
//! 소문자화 + (선택) 불용어 제거를 하되, 조문 번호와 법령 인용은 쪼개지 않습니다.
//!
//! - `302`, `498a` → 그대로
//! - `302(1)(b)` → `302(1)(b)`, `302`
//! - `s.302`, `art.21` → `s.302`, `302` / `art.21`, `21`

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

/// 인용 토큰 | 일반 단어
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[a-z]{1,4}\.)?\d+[a-z]{0,2}(?:\([0-9a-z]{1,4}\))*|\p{L}[\p{L}\p{N}]*(?:'\p{L}+)?")
        .expect("token pattern is valid")
});

/// 영어 불용어 (법률 문서에 흔한 조동사 포함)
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "by", "for", "from", "has", "have", "in",
    "into", "is", "it", "its", "of", "on", "or", "shall", "such", "that", "the", "their", "this",
    "to", "was", "were", "which", "with",
];

/// 법률 텍스트 토크나이저
#[derive(Debug, Clone)]
pub struct LegalTokenizer {
    remove_stop_words: bool,
}

impl Default for LegalTokenizer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LegalTokenizer {
    pub fn new(remove_stop_words: bool) -> Self {
        Self { remove_stop_words }
    }

    /// 텍스트를 토큰 목록으로 변환 (등장 순서 유지)
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut tokens = Vec::new();

        for m in TOKEN_RE.find_iter(&lowered) {
            let token = m.as_str();

            if starts_like_citation(token) {
                tokens.push(token.to_string());
                if let Some(base) = citation_base(token) {
                    tokens.push(base.to_string());
                }
                continue;
            }

            if self.remove_stop_words && is_stop_word(token) {
                continue;
            }
            tokens.push(token.to_string());
        }

        tokens
    }

    /// 용어별 출현 빈도
    pub fn term_frequencies(&self, text: &str) -> BTreeMap<String, u32> {
        let mut freqs = BTreeMap::new();
        for token in self.tokenize(text) {
            *freqs.entry(token).or_insert(0) += 1;
        }
        freqs
    }
}

fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.binary_search(&token).is_ok()
}

/// 숫자를 포함하는 인용 토큰 여부 (`302`, `s.302`, `21(1)`)
fn starts_like_citation(token: &str) -> bool {
    let after_prefix = token.split_once('.').map(|(_, rest)| rest).unwrap_or(token);
    after_prefix.starts_with(|c: char| c.is_ascii_digit())
}

/// 복합 인용의 기본 조문 번호 (`s.302` → `302`, `302(1)(b)` → `302`)
///
/// 단순 번호는 `None`.
fn citation_base(token: &str) -> Option<&str> {
    let after_prefix = token.split_once('.').map(|(_, rest)| rest).unwrap_or(token);
    let base = after_prefix
        .split_once('(')
        .map(|(head, _)| head)
        .unwrap_or(after_prefix);

    if base.len() == token.len() || base.is_empty() {
        None
    } else {
        Some(base)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_words_sorted() {
        let mut sorted = STOP_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOP_WORDS);
    }

    #[test]
    fn test_basic_case_folding() {
        let tokenizer = LegalTokenizer::default();
        let tokens = tokenizer.tokenize("Punishment for MURDER");
        assert_eq!(tokens, vec!["punishment", "murder"]);
    }

    #[test]
    fn test_keep_stop_words() {
        let tokenizer = LegalTokenizer::new(false);
        let tokens = tokenizer.tokenize("Punishment for murder");
        assert_eq!(tokens, vec!["punishment", "for", "murder"]);
    }

    #[test]
    fn test_section_numbers_preserved() {
        let tokenizer = LegalTokenizer::default();
        let tokens = tokenizer.tokenize("Section 302: punishment");
        assert_eq!(tokens, vec!["section", "302", "punishment"]);

        let tokens = tokenizer.tokenize("Section 498A IPC");
        assert_eq!(tokens, vec!["section", "498a", "ipc"]);
    }

    #[test]
    fn test_compound_citation_kept_whole() {
        let tokenizer = LegalTokenizer::default();
        let tokens = tokenizer.tokenize("under 302(1)(b) and s.304");
        assert_eq!(
            tokens,
            vec!["under", "302(1)(b)", "302", "s.304", "304"]
        );
    }

    #[test]
    fn test_term_frequencies() {
        let tokenizer = LegalTokenizer::default();
        let freqs = tokenizer.term_frequencies("murder and murder and theft");
        assert_eq!(freqs.get("murder"), Some(&2));
        assert_eq!(freqs.get("theft"), Some(&1));
        assert_eq!(freqs.get("and"), None);
    }

    #[test]
    fn test_empty_input() {
        let tokenizer = LegalTokenizer::default();
        assert!(tokenizer.tokenize("   ").is_empty());
        assert!(tokenizer.tokenize("the of and").is_empty());
    }
}
