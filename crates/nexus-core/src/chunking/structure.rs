//! Markdown structure scan.
//!
//! Walks pulldown-cmark's offset iterator over the frontmatter-stripped body
//! and records heading spans plus "protected" spans (fenced/indented code
//! blocks and tables) that the chunker must never split.

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};

/// A heading with its byte offset in the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadingSpan {
    pub level: u8,
    pub text: String,
    /// Byte offset of the heading start
    pub start: usize,
}

/// A byte range the chunker treats as indivisible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedSpan {
    pub start: usize,
    pub end: usize,
}

impl ProtectedSpan {
    pub fn contains(&self, pos: usize) -> bool {
        pos > self.start && pos < self.end
    }
}

/// Parser-reported structure consumed by the chunker.
#[derive(Debug, Clone, Default)]
pub struct DocStructure {
    /// Headings in document order
    pub headings: Vec<HeadingSpan>,
    /// Code blocks and tables, in document order, non-overlapping
    pub protected: Vec<ProtectedSpan>,
}

impl DocStructure {
    /// Heading titles enclosing `pos`, outermost first.
    pub fn section_path_at(&self, pos: usize) -> Vec<String> {
        let mut stack: Vec<(u8, &str)> = Vec::new();
        for heading in &self.headings {
            if heading.start > pos {
                break;
            }
            while stack
                .last()
                .is_some_and(|(level, _)| *level >= heading.level)
            {
                stack.pop();
            }
            stack.push((heading.level, &heading.text));
        }
        stack.into_iter().map(|(_, text)| text.to_string()).collect()
    }
}

/// Scans markdown for headings, code blocks, and tables.
pub fn scan_markdown(body: &str) -> DocStructure {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);

    let mut structure = DocStructure::default();
    let mut heading: Option<(u8, usize, String)> = None;

    for (event, range) in Parser::new_ext(body, options).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                heading = Some((heading_level(level), range.start, String::new()));
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some((level, start, text)) = heading.take() {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        structure.headings.push(HeadingSpan { level, text, start });
                    }
                }
            }
            Event::Start(Tag::CodeBlock(_)) => {
                structure.protected.push(ProtectedSpan {
                    start: range.start,
                    end: range.end,
                });
            }
            Event::Start(Tag::Table(_)) => {
                structure.protected.push(ProtectedSpan {
                    start: range.start,
                    end: range.end,
                });
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some((_, _, buf)) = heading.as_mut() {
                    buf.push_str(&text);
                }
            }
            _ => {}
        }
    }

    structure.protected.sort_by_key(|span| span.start);
    structure
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headings_with_offsets() {
        let body = "# Title\n\nIntro text.\n\n## Section One\n\nBody.\n";
        let structure = scan_markdown(body);
        assert_eq!(structure.headings.len(), 2);
        assert_eq!(structure.headings[0].level, 1);
        assert_eq!(structure.headings[0].text, "Title");
        assert_eq!(structure.headings[0].start, 0);
        assert_eq!(structure.headings[1].level, 2);
        assert_eq!(structure.headings[1].text, "Section One");
        assert_eq!(&body[structure.headings[1].start..][..2], "##");
    }

    #[test]
    fn test_code_fence_is_protected() {
        let body = "Intro.\n\n```rust\nfn main() {}\n```\n\nOutro.\n";
        let structure = scan_markdown(body);
        assert_eq!(structure.protected.len(), 1);
        let span = structure.protected[0];
        assert!(body[span.start..span.end].contains("fn main"));
        assert!(span.contains(span.start + 2));
        assert!(!span.contains(span.start));
    }

    #[test]
    fn test_table_is_protected() {
        let body = "Before.\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\nAfter.\n";
        let structure = scan_markdown(body);
        assert_eq!(structure.protected.len(), 1);
        assert!(body[structure.protected[0].start..structure.protected[0].end].contains("| 1 |"));
    }

    #[test]
    fn test_section_path_stack() {
        let body = "# Doc\n\n## Alpha\n\ntext a\n\n### Deep\n\ntext d\n\n## Beta\n\ntext b\n";
        let structure = scan_markdown(body);

        let pos_a = body.find("text a").unwrap();
        assert_eq!(structure.section_path_at(pos_a), vec!["Doc", "Alpha"]);

        let pos_d = body.find("text d").unwrap();
        assert_eq!(structure.section_path_at(pos_d), vec!["Doc", "Alpha", "Deep"]);

        let pos_b = body.find("text b").unwrap();
        assert_eq!(structure.section_path_at(pos_b), vec!["Doc", "Beta"]);
    }

    #[test]
    fn test_section_path_before_first_heading() {
        let body = "preamble\n\n# Late Title\n\nbody\n";
        let structure = scan_markdown(body);
        assert!(structure.section_path_at(0).is_empty());
    }

    #[test]
    fn test_heading_with_inline_code() {
        let body = "## Using `cargo test` locally\n\nbody\n";
        let structure = scan_markdown(body);
        assert_eq!(structure.headings[0].text, "Using cargo test locally");
    }

    #[test]
    fn test_empty_body() {
        let structure = scan_markdown("");
        assert!(structure.headings.is_empty());
        assert!(structure.protected.is_empty());
    }
}
