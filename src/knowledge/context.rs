//! Context Assembler - 답변 생성용 컨텍스트 구성
//!
//! 리랭크된 상위 청크를 골라 같은 문서의 인접 청크를 병합하고,
//! 청크마다 출처(문서, 순서)를 붙이며, 전체 문자 예산을 지킵니다.
//!
//! 예산은 병합 전에 순위 순으로 청크 단위로 적용합니다. 예산 초과 시 낮은
//! 순위 청크부터 버리고, 1위 청크 하나만으로 예산을 넘는 경우에만 잘라내고
//! `truncated`로 표시합니다. 인용은 본문이 실제로 들어간 청크에만 붙습니다.

use std::fmt::Write as _;

use serde::Serialize;

use crate::config::ContextConfig;

use super::chunk::ChunkId;
use super::engine::SearchHit;

// ============================================================================
// Types
// ============================================================================

/// 청크 출처
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub chunk_id: ChunkId,
    pub source_document: String,
    pub sequence_index: u32,
}

/// 답변 생성에 넘길 패시지 (인접 청크 병합 결과)
#[derive(Debug, Clone, Serialize)]
pub struct ContextPassage {
    pub source_document: String,
    pub text: String,
    /// sequence 순
    pub citations: Vec<Citation>,
    /// 패시지에 포함된 청크 중 최고 점수
    pub score: f32,
    /// 예산 때문에 잘렸는지
    pub truncated: bool,
}

impl ContextPassage {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    /// "ipc.txt #3" 또는 "ipc.txt #3-4"
    pub fn label(&self) -> String {
        let first = self.citations.first().map(|c| c.sequence_index);
        let last = self.citations.last().map(|c| c.sequence_index);
        match (first, last) {
            (Some(a), Some(b)) if a != b => format!("{} #{}-{}", self.source_document, a, b),
            (Some(a), _) => format!("{} #{}", self.source_document, a),
            _ => self.source_document.clone(),
        }
    }
}

/// 조립된 컨텍스트
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssembledContext {
    /// 순위 순
    pub passages: Vec<ContextPassage>,
    pub total_characters: usize,
    /// 예산 초과로 버려진 청크 수
    pub dropped: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn citations(&self) -> impl Iterator<Item = &Citation> {
        self.passages.iter().flat_map(|p| p.citations.iter())
    }

    /// 번호 붙은 출처와 함께 텍스트로 렌더링
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, passage) in self.passages.iter().enumerate() {
            if i > 0 {
                out.push_str("\n\n");
            }
            let _ = writeln!(out, "[{}] {}", i + 1, passage.label());
            out.push_str(&passage.text);
            if passage.truncated {
                out.push_str(" [truncated]");
            }
        }
        out
    }
}

/// 병합 중인 패시지 (sequence 순 세그먼트)
#[derive(Debug, Clone)]
struct Window {
    source_document: String,
    segments: Vec<(u32, ChunkId, String)>,
    score: f32,
}

impl Window {
    fn single(hit: &SearchHit) -> Self {
        Self {
            source_document: hit.source_document.clone(),
            segments: vec![(hit.sequence_index, hit.chunk_id, hit.chunk_text.clone())],
            score: hit.score,
        }
    }

    fn first_seq(&self) -> u32 {
        self.segments.first().map(|s| s.0).unwrap_or(0)
    }

    fn last_seq(&self) -> u32 {
        self.segments.last().map(|s| s.0).unwrap_or(0)
    }

    fn covers(&self, seq: u32) -> bool {
        self.segments.iter().any(|s| s.0 == seq)
    }

    fn adjoins(&self, source: &str, seq: u32) -> bool {
        self.source_document == source
            && (seq + 1 == self.first_seq() || seq == self.last_seq() + 1)
    }

    fn absorb(&mut self, other: Window) {
        self.score = self.score.max(other.score);
        self.segments.extend(other.segments);
        self.segments.sort_by_key(|s| s.0);
    }

    fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.2.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn into_passage(self) -> ContextPassage {
        let text = self.text();
        let citations = self
            .segments
            .iter()
            .map(|(seq, id, _)| Citation {
                chunk_id: *id,
                source_document: self.source_document.clone(),
                sequence_index: *seq,
            })
            .collect();

        ContextPassage {
            source_document: self.source_document,
            text,
            citations,
            score: self.score,
            truncated: false,
        }
    }
}

// ============================================================================
// ContextAssembler
// ============================================================================

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    top_k: usize,
    char_budget: usize,
    merge_adjacent: bool,
}

impl ContextAssembler {
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            top_k: config.top_k,
            char_budget: config.char_budget,
            merge_adjacent: config.merge_adjacent,
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// 순위순 검색 결과로 컨텍스트 조립
    ///
    /// 예산은 병합 전 순위 순으로 청크 단위로 적용하고, 통과한 청크끼리만 병합합니다.
    pub fn assemble(&self, hits: &[SearchHit]) -> AssembledContext {
        let selected = self.select(hits);
        let total = selected.len();

        let mut windows: Vec<Window> = Vec::new();
        let mut context = AssembledContext::default();

        for (rank, hit) in selected.into_iter().enumerate() {
            let mut candidate = windows.clone();
            self.place(&mut candidate, hit);
            let len = total_chars(&candidate);

            if len <= self.char_budget {
                windows = candidate;
                continue;
            }

            // 1위 청크 하나만으로 예산 초과: 잘라내고 표시
            if rank == 0 && self.char_budget > 0 {
                let mut passage = Window::single(hit).into_passage();
                passage.text = truncate_chars(&passage.text, self.char_budget);
                passage.truncated = true;
                context.total_characters = passage.char_count();
                context.passages.push(passage);
            }
            break;
        }

        if context.passages.is_empty() {
            context.passages = windows.into_iter().map(Window::into_passage).collect();
            context.total_characters = context.passages.iter().map(|p| p.char_count()).sum();
        }

        let kept: usize = context.passages.iter().map(|p| p.citations.len()).sum();
        context.dropped = total - kept;
        if context.dropped > 0 {
            tracing::debug!(
                "Context budget {} chars: dropped {} lower-ranked chunks",
                self.char_budget,
                context.dropped
            );
        }
        context
    }

    /// 상위 k개에서 중복 청크를 뺀 순위순 목록
    fn select<'a>(&self, hits: &'a [SearchHit]) -> Vec<&'a SearchHit> {
        let mut selected: Vec<&SearchHit> = Vec::new();

        for hit in hits.iter().take(self.top_k) {
            let duplicate = selected.iter().any(|s| {
                (s.source_document == hit.source_document && s.sequence_index == hit.sequence_index)
                    || s.chunk_text.contains(hit.chunk_text.as_str())
            });
            if duplicate {
                tracing::debug!("Context: skipping duplicate chunk {}", hit.chunk_id);
                continue;
            }
            selected.push(hit);
        }

        selected
    }

    /// 청크를 인접한 창에 병합하거나 새 창으로 추가
    fn place(&self, windows: &mut Vec<Window>, hit: &SearchHit) {
        let incoming = Window::single(hit);

        if !self.merge_adjacent {
            windows.push(incoming);
            return;
        }

        let Some(pos) = windows
            .iter()
            .position(|w| w.adjoins(&hit.source_document, hit.sequence_index))
        else {
            windows.push(incoming);
            return;
        };

        windows[pos].absorb(incoming);
        // 병합으로 두 창이 이어졌으면 하나로 합침
        let (source, first, last) = (
            windows[pos].source_document.clone(),
            windows[pos].first_seq(),
            windows[pos].last_seq(),
        );
        if let Some(other) = windows.iter().enumerate().position(|(i, w)| {
            i != pos
                && w.source_document == source
                && (w.last_seq() + 1 == first || w.first_seq() == last + 1)
        }) {
            let (keep, gone) = if other < pos { (other, pos) } else { (pos, other) };
            let removed = windows.remove(gone);
            windows[keep].absorb(removed);
        }
    }
}

fn total_chars(windows: &[Window]) -> usize {
    windows.iter().map(|w| w.text().chars().count()).sum()
}

/// 문자 수 기준으로 자르되 가능하면 공백에서 끊음
fn truncate_chars(text: &str, max_chars: usize) -> String {
    let end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..end];

    match head.rfind(char::is_whitespace) {
        Some(cut) if cut > end / 2 => head[..cut].trim_end().to_string(),
        _ => head.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: ChunkId, source: &str, seq: u32, text: &str, score: f32) -> SearchHit {
        SearchHit {
            chunk_id,
            chunk_text: text.to_string(),
            source_document: source.to_string(),
            sequence_index: seq,
            score,
            lexical_score: 0.0,
            semantic_score: 0.0,
            hybrid_score: score,
            rerank_score: None,
        }
    }

    fn assembler(top_k: usize, char_budget: usize, merge_adjacent: bool) -> ContextAssembler {
        ContextAssembler::new(&ContextConfig {
            top_k,
            char_budget,
            merge_adjacent,
        })
    }

    #[test]
    fn test_citations_attached() {
        let hits = vec![
            hit(1, "ipc.txt", 4, "Section 302: punishment for murder.", 0.9),
            hit(7, "crpc.txt", 0, "Section 154: information in cognizable cases.", 0.5),
        ];
        let context = assembler(3, 4000, true).assemble(&hits);

        assert_eq!(context.passages.len(), 2);
        let first = &context.passages[0].citations[0];
        assert_eq!(first.source_document, "ipc.txt");
        assert_eq!(first.sequence_index, 4);
        assert_eq!(context.citations().count(), 2);
        assert_eq!(context.dropped, 0);
    }

    #[test]
    fn test_adjacent_chunks_merged() {
        let hits = vec![
            hit(5, "ipc.txt", 5, "second part", 0.9),
            hit(4, "ipc.txt", 4, "first part", 0.8),
            hit(9, "ipc.txt", 9, "far away", 0.7),
        ];
        let context = assembler(3, 4000, true).assemble(&hits);

        assert_eq!(context.passages.len(), 2);
        let merged = &context.passages[0];
        assert_eq!(merged.text, "first part\nsecond part");
        let seqs: Vec<u32> = merged.citations.iter().map(|c| c.sequence_index).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(merged.score, 0.9);
        assert_eq!(merged.label(), "ipc.txt #4-5");
    }

    #[test]
    fn test_bridge_merges_two_windows() {
        let hits = vec![
            hit(1, "a", 1, "one", 0.9),
            hit(3, "a", 3, "three", 0.8),
            hit(2, "a", 2, "two", 0.7),
        ];
        let context = assembler(3, 4000, true).assemble(&hits);
        assert_eq!(context.passages.len(), 1);
        assert_eq!(context.passages[0].text, "one\ntwo\nthree");
    }

    #[test]
    fn test_no_merge_when_disabled() {
        let hits = vec![hit(5, "ipc.txt", 5, "second", 0.9), hit(4, "ipc.txt", 4, "first", 0.8)];
        let context = assembler(3, 4000, false).assemble(&hits);
        assert_eq!(context.passages.len(), 2);
    }

    #[test]
    fn test_duplicate_text_dropped() {
        let hits = vec![
            hit(1, "ipc.txt", 0, "Section 302: punishment for murder.", 0.9),
            hit(2, "ipc_copy.txt", 3, "Section 302: punishment for murder.", 0.8),
        ];
        let context = assembler(3, 4000, true).assemble(&hits);
        assert_eq!(context.passages.len(), 1);
    }

    #[test]
    fn test_top_k_limits_selection() {
        let hits: Vec<SearchHit> = (0..10)
            .map(|i| hit(i, "doc", i as u32 * 10, &format!("text {i}"), 1.0))
            .collect();
        let context = assembler(3, 4000, true).assemble(&hits);
        assert_eq!(context.passages.len(), 3);
    }

    #[test]
    fn test_budget_drops_lowest_ranked() {
        let hits = vec![
            hit(1, "a", 0, &"x".repeat(40), 0.9),
            hit(2, "b", 0, &"y".repeat(40), 0.8),
            hit(3, "c", 0, &"z".repeat(40), 0.7),
        ];
        let context = assembler(3, 100, true).assemble(&hits);

        assert_eq!(context.passages.len(), 2);
        assert_eq!(context.passages[0].citations[0].chunk_id, 1);
        assert_eq!(context.passages[1].citations[0].chunk_id, 2);
        assert_eq!(context.total_characters, 80);
        assert_eq!(context.dropped, 1);
        assert!(context.passages.iter().all(|p| !p.truncated));
    }

    #[test]
    fn test_oversized_top_passage_truncated_and_marked() {
        let text = "word ".repeat(50);
        let hits = vec![hit(1, "a", 0, text.trim(), 0.9), hit(2, "b", 0, "short", 0.5)];
        let context = assembler(3, 32, true).assemble(&hits);

        assert_eq!(context.passages.len(), 1);
        let passage = &context.passages[0];
        assert!(passage.truncated);
        assert!(passage.char_count() <= 32);
        assert_eq!(context.dropped, 1);
        assert!(context.render().contains("[truncated]"));
    }

    #[test]
    fn test_budget_applies_before_merge() {
        // 1위(seq 5)와 2위(seq 4)가 인접하지만 합치면 예산 초과
        let hits = vec![
            hit(10, "ipc.txt", 5, &"B".repeat(600), 0.9),
            hit(9, "ipc.txt", 4, &"A".repeat(600), 0.8),
        ];
        let context = assembler(3, 1000, true).assemble(&hits);

        assert_eq!(context.passages.len(), 1);
        let passage = &context.passages[0];
        assert_eq!(passage.text, "B".repeat(600));
        assert!(!passage.truncated);
        let ids: Vec<ChunkId> = context.citations().map(|c| c.chunk_id).collect();
        assert_eq!(ids, vec![10]);
        assert_eq!(context.total_characters, 600);
        assert_eq!(context.dropped, 1);
    }

    #[test]
    fn test_merged_window_counts_separator() {
        let hits = vec![
            hit(10, "ipc.txt", 5, &"B".repeat(600), 0.9),
            hit(9, "ipc.txt", 4, &"A".repeat(600), 0.8),
        ];

        let fits = assembler(3, 1201, true).assemble(&hits);
        assert_eq!(fits.passages.len(), 1);
        assert_eq!(fits.passages[0].citations.len(), 2);
        assert_eq!(fits.total_characters, 1201);
        assert_eq!(fits.dropped, 0);

        let tight = assembler(3, 1200, true).assemble(&hits);
        let ids: Vec<ChunkId> = tight.citations().map(|c| c.chunk_id).collect();
        assert_eq!(ids, vec![10]);
    }

    #[test]
    fn test_truncated_top_chunk_cites_only_itself() {
        let hits = vec![
            hit(10, "ipc.txt", 5, &"B".repeat(600), 0.9),
            hit(9, "ipc.txt", 4, "short neighbour", 0.8),
        ];
        let context = assembler(3, 100, true).assemble(&hits);

        assert_eq!(context.passages.len(), 1);
        let passage = &context.passages[0];
        assert!(passage.truncated);
        assert_eq!(passage.text, "B".repeat(100));
        let ids: Vec<ChunkId> = context.citations().map(|c| c.chunk_id).collect();
        assert_eq!(ids, vec![10]);
        assert_eq!(context.dropped, 1);
    }

    #[test]
    fn test_empty_hits() {
        let context = assembler(3, 4000, true).assemble(&[]);
        assert!(context.is_empty());
        assert_eq!(context.render(), "");
    }

    #[test]
    fn test_render_numbers_sources() {
        let hits = vec![hit(1, "ipc.txt", 2, "Section 302.", 0.9)];
        let rendered = assembler(3, 4000, true).assemble(&hits).render();
        assert_eq!(rendered, "[1] ipc.txt #2\nSection 302.");
    }
}
