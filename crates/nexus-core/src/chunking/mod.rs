//! Structure-aware windowing chunker.
//!
//! Splits a document body into retrievable chunks:
//!
//! 1. Segment on structural boundaries in priority order: headings, then
//!    blank-line paragraph breaks. Code fences and tables are indivisible
//!    segments.
//! 2. Greedily pack segments into chunks up to `target_tokens`. Headings are
//!    hard boundaries: a chunk never spans them. A segment is only split
//!    when it alone exceeds `2 × target_tokens`, first at sentence
//!    boundaries, then at a hard character limit.
//! 3. Overlap each chunk (except the first) with the tail of its
//!    predecessor by extending `char_start` backward, so the chunk text is
//!    always an exact slice of the body and duplicated text attributes to
//!    its true position.
//! 4. Attach the heading stack active at the chunk's starting position.
//!
//! Given identical input bytes and config, output boundaries and ids are
//! byte-stable, which is what makes re-ingest of an unchanged file a no-op.

pub mod sizer;
pub mod structure;

pub use sizer::{HeuristicSizer, HfTokenizerSizer, TokenSizer};
pub use structure::{scan_markdown, DocStructure, HeadingSpan, ProtectedSpan};

use crate::config::ChunkingConfig;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Rough bytes-per-token for English text, used for overlap and hard-limit
/// byte math.
pub const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

/// A chunk before it is assigned an id and persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub text: String,
    /// Byte offset where the chunk (including any overlap prefix) starts
    pub char_start: usize,
    /// Byte offset one past the end of the chunk
    pub char_end: usize,
    pub section_path: Vec<String>,
    pub token_count: usize,
}

/// The chunker. Stateless; cheap to share.
pub struct Chunker {
    target_tokens: usize,
    overlap_tokens: usize,
    sizer: Arc<dyn TokenSizer>,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig, sizer: Arc<dyn TokenSizer>) -> Self {
        Self {
            target_tokens: config.target_tokens,
            overlap_tokens: config.overlap_tokens,
            sizer,
        }
    }

    /// Chunks a frontmatter-stripped body using its parsed structure.
    pub fn chunk(&self, body: &str, structure: &DocStructure) -> Vec<RawChunk> {
        if body.trim().is_empty() {
            return Vec::new();
        }

        let segments = self.segment(body, structure);
        let heading_starts: BTreeSet<usize> =
            structure.headings.iter().map(|h| h.start).collect();

        // Pack segments, flushing at heading boundaries and at the token
        // target.
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        let mut current: Option<(usize, usize, usize)> = None; // (start, end, tokens)
        for (start, end) in segments {
            let tokens = self.sizer.size(&body[start..end]);
            match current.take() {
                None => current = Some((start, end, tokens)),
                Some((cur_start, cur_end, cur_tokens)) => {
                    let at_heading = heading_starts.contains(&start);
                    if at_heading || cur_tokens + tokens > self.target_tokens {
                        ranges.push((cur_start, cur_end));
                        current = Some((start, end, tokens));
                    } else {
                        current = Some((cur_start, end, cur_tokens + tokens));
                    }
                }
            }
        }
        if let Some((start, end, _)) = current {
            ranges.push((start, end));
        }

        // Overlap + finalize.
        let overlap_bytes = self.overlap_tokens * CHARS_PER_TOKEN_ESTIMATE;
        let mut chunks = Vec::with_capacity(ranges.len());
        for (i, &(own_start, end)) in ranges.iter().enumerate() {
            let char_start = if i == 0 || overlap_bytes == 0 {
                own_start
            } else {
                let prev_start = ranges[i - 1].0;
                overlap_start(body, own_start, overlap_bytes, prev_start)
            };
            let text = body[char_start..end].to_string();
            if text.trim().is_empty() {
                continue;
            }
            let token_count = self.sizer.size(&text);
            chunks.push(RawChunk {
                text,
                char_start,
                char_end: end,
                section_path: structure.section_path_at(own_start),
                token_count,
            });
        }
        chunks
    }

    /// Splits the body into ordered segments on structural boundaries,
    /// breaking oversize segments down to packable pieces.
    fn segment(&self, body: &str, structure: &DocStructure) -> Vec<(usize, usize)> {
        let mut cuts: BTreeSet<usize> = BTreeSet::new();
        cuts.insert(0);
        cuts.insert(body.len());
        for heading in &structure.headings {
            cuts.insert(heading.start);
        }
        for span in &structure.protected {
            cuts.insert(span.start);
            cuts.insert(span.end.min(body.len()));
        }
        for pos in paragraph_starts(body) {
            cuts.insert(pos);
        }
        // No cut may land inside a protected span.
        cuts.retain(|&pos| !structure.protected.iter().any(|span| span.contains(pos)));

        let positions: Vec<usize> = cuts.into_iter().collect();
        let mut segments = Vec::new();
        for window in positions.windows(2) {
            let (start, end) = (window[0], window[1]);
            if body[start..end].trim().is_empty() {
                continue;
            }
            if self.sizer.size(&body[start..end]) > 2 * self.target_tokens {
                segments.extend(self.split_oversize(body, start, end));
            } else {
                segments.push((start, end));
            }
        }
        segments
    }

    /// Splits an oversize segment at sentence boundaries, then at a hard
    /// character limit for anything still too large.
    fn split_oversize(&self, body: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
        let mut points = vec![start];
        let bytes = body.as_bytes();
        let mut i = start;
        while i < end {
            if matches!(bytes[i], b'.' | b'!' | b'?') {
                let mut j = i + 1;
                while j < end && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j > i + 1 && j < end {
                    points.push(j);
                }
                i = j.max(i + 1);
            } else {
                i += 1;
            }
        }
        points.push(end);
        points.dedup();

        // Greedily pack sentences up to the target.
        let mut pieces = Vec::new();
        let mut piece_start = start;
        let mut tokens = 0usize;
        for window in points.windows(2) {
            let (a, b) = (window[0], window[1]);
            let t = self.sizer.size(&body[a..b]);
            if tokens > 0 && tokens + t > self.target_tokens {
                pieces.push((piece_start, a));
                piece_start = a;
                tokens = 0;
            }
            tokens += t;
        }
        pieces.push((piece_start, end));

        // Hard character limit for pathological single sentences.
        let hard = 2 * self.target_tokens * CHARS_PER_TOKEN_ESTIMATE;
        let mut out = Vec::with_capacity(pieces.len());
        for (a, b) in pieces {
            let mut cur = a;
            while b - cur > hard {
                let mut cut = floor_char_boundary(body, cur + hard);
                if let Some(ws) = body[cur..cut].rfind(char::is_whitespace) {
                    // Prefer a whitespace boundary unless it would leave a
                    // tiny fragment.
                    if ws > hard / 2 {
                        cut = cur + ws;
                    }
                }
                if cut <= cur {
                    break;
                }
                out.push((cur, cut));
                cur = cut;
            }
            if cur < b {
                out.push((cur, b));
            }
        }
        out
    }
}

/// Byte positions where a new paragraph begins after a blank-line run.
fn paragraph_starts(body: &str) -> Vec<usize> {
    let bytes = body.as_bytes();
    let mut starts = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let mut j = i;
            let mut newlines = 0;
            while j < bytes.len()
                && matches!(bytes[j], b'\n' | b'\r' | b' ' | b'\t')
            {
                if bytes[j] == b'\n' {
                    newlines += 1;
                }
                j += 1;
            }
            if newlines >= 2 && j < bytes.len() {
                starts.push(j);
            }
            i = j;
        } else {
            i += 1;
        }
    }
    starts
}

/// Picks the overlap-extended start for a chunk: at most `overlap_bytes`
/// back into the previous chunk, snapped forward to a word boundary.
fn overlap_start(body: &str, own_start: usize, overlap_bytes: usize, prev_start: usize) -> usize {
    let desired = own_start.saturating_sub(overlap_bytes).max(prev_start);
    let mut pos = ceil_char_boundary(body, desired);
    if pos >= own_start {
        return own_start;
    }
    // Snap to the next word boundary so the overlap starts on a whole token.
    if !body[..pos].ends_with(char::is_whitespace) && pos > prev_start {
        match body[pos..own_start].find(char::is_whitespace) {
            Some(ws) => {
                pos += ws;
                pos += body[pos..own_start]
                    .chars()
                    .take_while(|c| c.is_whitespace())
                    .map(|c| c.len_utf8())
                    .sum::<usize>();
            }
            None => return own_start,
        }
    }
    pos.min(own_start)
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use crate::types::{ChunkId, DocumentId, SourceId, SourceKind};

    fn chunker(target: usize, overlap: usize) -> Chunker {
        Chunker::new(
            &ChunkingConfig {
                target_tokens: target,
                overlap_tokens: overlap,
            },
            Arc::new(HeuristicSizer),
        )
    }

    const DOC: &str = "\
# Machine Learning

Machine learning is a subfield of artificial intelligence.

## Types of Machine Learning

Supervised learning uses labeled data to train models.

Unsupervised learning finds patterns in unlabeled data.

## Applications

Recommendation systems and fraud detection are common uses.
";

    #[test]
    fn test_one_chunk_per_section() {
        let structure = scan_markdown(DOC);
        let chunks = chunker(512, 0).chunk(DOC, &structure);
        // Heading boundaries are hard: one chunk per section even though
        // everything would fit in a single 512-token chunk.
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.contains("subfield"));
        assert!(chunks[1].text.contains("Supervised"));
        assert!(chunks[2].text.contains("fraud"));
    }

    #[test]
    fn test_section_paths() {
        let structure = scan_markdown(DOC);
        let chunks = chunker(512, 0).chunk(DOC, &structure);
        assert_eq!(chunks[0].section_path, vec!["Machine Learning"]);
        assert_eq!(
            chunks[1].section_path,
            vec!["Machine Learning", "Types of Machine Learning"]
        );
        assert_eq!(chunks[2].section_path, vec!["Machine Learning", "Applications"]);
    }

    #[test]
    fn test_text_is_exact_slice() {
        let structure = scan_markdown(DOC);
        for chunk in chunker(512, 10).chunk(DOC, &structure) {
            assert_eq!(chunk.text, &DOC[chunk.char_start..chunk.char_end]);
        }
    }

    #[test]
    fn test_contiguity_modulo_overlap() {
        let structure = scan_markdown(DOC);
        let overlap = 10;
        let chunks = chunker(512, overlap).chunk(DOC, &structure);
        for pair in chunks.windows(2) {
            assert!(
                pair[0].char_end <= pair[1].char_start + overlap * CHARS_PER_TOKEN_ESTIMATE,
                "gap between {:?} and {:?}",
                pair[0].char_end,
                pair[1].char_start
            );
            assert!(pair[0].char_start < pair[1].char_start);
        }
    }

    #[test]
    fn test_overlap_carries_previous_text() {
        let structure = scan_markdown(DOC);
        let with_overlap = chunker(512, 10).chunk(DOC, &structure);
        let without = chunker(512, 0).chunk(DOC, &structure);
        assert_eq!(with_overlap.len(), without.len());
        // First chunk never gets an overlap prefix
        assert_eq!(with_overlap[0].char_start, without[0].char_start);
        // Later chunks start earlier than their own content
        assert!(with_overlap[1].char_start < without[1].char_start);
        // The overlap region is the predecessor's tail
        let prefix_end = without[1].char_start;
        assert!(without[0].text.contains(DOC[with_overlap[1].char_start..prefix_end].trim()));
    }

    #[test]
    fn test_determinism() {
        let structure = scan_markdown(DOC);
        let a = chunker(512, 50).chunk(DOC, &structure);
        let b = chunker(512, 50).chunk(DOC, &structure);
        assert_eq!(a, b);

        let source = SourceId::derive(SourceKind::File, "/ml.md");
        let doc_id = DocumentId::derive(&source, "/ml.md");
        let ids_a: Vec<ChunkId> = a
            .iter()
            .enumerate()
            .map(|(i, c)| ChunkId::derive(&doc_id, i as u32, &c.text))
            .collect();
        let ids_b: Vec<ChunkId> = b
            .iter()
            .enumerate()
            .map(|(i, c)| ChunkId::derive(&doc_id, i as u32, &c.text))
            .collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_paragraph_packing_under_target() {
        let body = "one two three.\n\nfour five six.\n\nseven eight nine.\n";
        let structure = scan_markdown(body);
        // Each paragraph is 3 tokens; target 7 packs two paragraphs, not three
        let chunks = chunker(7, 0).chunk(body, &structure);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.contains("four"));
        assert!(!chunks[0].text.contains("seven"));
    }

    #[test]
    fn test_code_fence_not_split() {
        let mut body = String::from("# Code\n\nIntro paragraph.\n\n```text\n");
        for i in 0..15 {
            body.push_str(&format!("line number {} of the example\n", i));
        }
        body.push_str("```\n\nOutro.\n");
        let structure = scan_markdown(&body);
        // The fence (~90 tokens) exceeds the 50-token target but not the
        // 2x split threshold, so it stays whole in exactly one chunk.
        let chunks = chunker(50, 0).chunk(&body, &structure);
        let fence_chunks: Vec<_> = chunks
            .iter()
            .filter(|c| c.text.contains("line number 0 "))
            .collect();
        assert_eq!(fence_chunks.len(), 1);
        assert!(fence_chunks[0].text.contains("line number 14"));
    }

    #[test]
    fn test_oversize_paragraph_splits_at_sentences() {
        let mut body = String::new();
        for i in 0..40 {
            body.push_str(&format!("Sentence number {} has exactly six words. ", i));
        }
        let structure = scan_markdown(&body);
        let chunks = chunker(30, 0).chunk(&body, &structure);
        assert!(chunks.len() > 1, "oversize paragraph must split");
        for chunk in &chunks {
            // Splits happen between sentences, so chunk text starts at one
            assert!(chunk.text.trim_start().starts_with("Sentence"));
        }
    }

    #[test]
    fn test_hard_limit_without_sentence_boundaries() {
        // One giant paragraph, no sentence punctuation anywhere
        let body = "word ".repeat(2000);
        let structure = scan_markdown(&body);
        let chunks = chunker(100, 0).chunk(&body, &structure);
        assert!(chunks.len() > 1);
        let hard = 2 * 100 * CHARS_PER_TOKEN_ESTIMATE;
        for chunk in &chunks {
            assert!(chunk.char_end - chunk.char_start <= hard);
        }
    }

    #[test]
    fn test_empty_and_whitespace_body() {
        let structure = scan_markdown("");
        assert!(chunker(512, 50).chunk("", &structure).is_empty());
        let ws = "  \n\n   \n";
        let structure = scan_markdown(ws);
        assert!(chunker(512, 50).chunk(ws, &structure).is_empty());
    }

    #[test]
    fn test_multibyte_text_boundaries() {
        let body = "# Ü\n\nÜber die Berge käme ich gerne. ".to_string();
        let structure = scan_markdown(&body);
        let chunks = chunker(4, 2).chunk(&body, &structure);
        for chunk in &chunks {
            assert!(body.is_char_boundary(chunk.char_start));
            assert!(body.is_char_boundary(chunk.char_end));
        }
    }
}
