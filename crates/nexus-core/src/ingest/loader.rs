//! Document loaders.
//!
//! A [`DocumentLoader`] turns raw bytes into text plus metadata and
//! parser-reported structure. Selection is by file extension with the
//! source kind as a tiebreak for extensionless blobs. Loader failures are
//! per-document corpus errors: the document is skipped and the batch
//! continues.

use crate::chunking::structure::{scan_markdown, DocStructure};
use crate::error::NexusError;
use crate::types::SourceKind;
use tracing::warn;

/// A parsed document ready for chunking.
#[derive(Debug, Clone, Default)]
pub struct LoadedDocument {
    pub title: Option<String>,
    /// Frontmatter-stripped text; chunk offsets index into this
    pub body: String,
    /// Tags declared in the document itself (merged with caller tags)
    pub tags: Vec<String>,
    pub frontmatter: serde_json::Map<String, serde_json::Value>,
    pub structure: DocStructure,
}

/// Capability for turning source bytes into a [`LoadedDocument`].
pub trait DocumentLoader: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, bytes: &[u8], uri: &str) -> Result<LoadedDocument, NexusError>;
}

/// Markdown with optional YAML frontmatter.
pub struct MarkdownLoader;

/// PDF text extraction.
pub struct PdfLoader;

/// UTF-8 text without structure.
pub struct PlainTextLoader;

static MARKDOWN: MarkdownLoader = MarkdownLoader;
static PDF: PdfLoader = PdfLoader;
static PLAIN: PlainTextLoader = PlainTextLoader;

/// Picks a loader by extension, falling back on the source kind for
/// extensionless content (ad-hoc and API blobs are treated as markdown).
pub fn loader_for(kind: SourceKind, uri: &str) -> &'static dyn DocumentLoader {
    let extension = uri
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("md") | Some("markdown") => &MARKDOWN,
        Some("pdf") => &PDF,
        Some("txt") | Some("text") | Some("log") => &PLAIN,
        _ => match kind {
            SourceKind::Api | SourceKind::AdHoc => &MARKDOWN,
            SourceKind::Directory | SourceKind::File => &PLAIN,
        },
    }
}

impl DocumentLoader for MarkdownLoader {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn load(&self, bytes: &[u8], uri: &str) -> Result<LoadedDocument, NexusError> {
        let content = std::str::from_utf8(bytes)
            .map_err(|e| NexusError::corpus(uri, format!("not valid UTF-8: {}", e)))?;

        let (frontmatter, body) = match split_frontmatter(content) {
            Some((yaml, body)) => match serde_yaml::from_str::<serde_yaml::Value>(yaml) {
                Ok(value) => {
                    let map = serde_json::to_value(&value)
                        .ok()
                        .and_then(|v| match v {
                            serde_json::Value::Object(map) => Some(map),
                            _ => None,
                        })
                        .unwrap_or_default();
                    (map, body.to_string())
                }
                Err(e) => {
                    warn!(uri, "Ignoring unparseable frontmatter: {}", e);
                    (serde_json::Map::new(), content.to_string())
                }
            },
            None => (serde_json::Map::new(), content.to_string()),
        };

        let structure = scan_markdown(&body);

        let title = frontmatter
            .get("title")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| {
                structure
                    .headings
                    .iter()
                    .find(|h| h.level == 1)
                    .map(|h| h.text.clone())
            });

        let tags = match frontmatter.get("tags") {
            Some(serde_json::Value::String(s)) => s
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => Vec::new(),
        };

        Ok(LoadedDocument {
            title,
            body,
            tags,
            frontmatter,
            structure,
        })
    }
}

impl DocumentLoader for PdfLoader {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn load(&self, bytes: &[u8], uri: &str) -> Result<LoadedDocument, NexusError> {
        let body = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| NexusError::corpus(uri, format!("pdf extraction failed: {}", e)))?;
        Ok(LoadedDocument {
            body,
            ..LoadedDocument::default()
        })
    }
}

impl DocumentLoader for PlainTextLoader {
    fn name(&self) -> &'static str {
        "text"
    }

    fn load(&self, bytes: &[u8], _uri: &str) -> Result<LoadedDocument, NexusError> {
        Ok(LoadedDocument {
            body: String::from_utf8_lossy(bytes).into_owned(),
            ..LoadedDocument::default()
        })
    }
}

/// Splits a leading `---` YAML frontmatter block. Returns the YAML text and
/// the remaining body, or None when there is no block.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let first_line_end = rest.find('\n')?;
    if !rest[..first_line_end].trim().is_empty() {
        return None;
    }
    let rest = &rest[first_line_end + 1..];

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']).trim() == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_with_frontmatter() {
        let content = b"---\ntitle: My Note\ntags: [rust, search]\nauthor: someone\n---\n\n# Heading\n\nBody text.\n";
        let doc = MarkdownLoader.load(content, "/n.md").unwrap();
        assert_eq!(doc.title.as_deref(), Some("My Note"));
        assert_eq!(doc.tags, vec!["rust", "search"]);
        assert!(doc.body.starts_with("\n# Heading"));
        assert!(!doc.body.contains("---"));
        assert_eq!(
            doc.frontmatter.get("author").and_then(|v| v.as_str()),
            Some("someone")
        );
        assert_eq!(doc.structure.headings.len(), 1);
    }

    #[test]
    fn test_markdown_comma_separated_tags() {
        let content = b"---\ntags: alpha, beta\n---\nbody\n";
        let doc = MarkdownLoader.load(content, "/n.md").unwrap();
        assert_eq!(doc.tags, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_markdown_title_falls_back_to_h1() {
        let content = b"# The Real Title\n\ntext\n";
        let doc = MarkdownLoader.load(content, "/n.md").unwrap();
        assert_eq!(doc.title.as_deref(), Some("The Real Title"));
    }

    #[test]
    fn test_markdown_without_frontmatter() {
        let content = b"Just some text.\n\nMore text.\n";
        let doc = MarkdownLoader.load(content, "/n.md").unwrap();
        assert!(doc.frontmatter.is_empty());
        assert_eq!(doc.body, String::from_utf8_lossy(content));
    }

    #[test]
    fn test_broken_frontmatter_keeps_content() {
        let content = b"---\n: : not yaml [\n---\nbody\n";
        let doc = MarkdownLoader.load(content, "/n.md").unwrap();
        assert!(doc.frontmatter.is_empty());
        // Unparseable frontmatter is left in place rather than dropped
        assert!(doc.body.contains("body"));
    }

    #[test]
    fn test_invalid_utf8_is_corpus_error() {
        let err = MarkdownLoader.load(&[0xff, 0xfe, 0x00], "/bad.md").unwrap_err();
        assert!(matches!(err, NexusError::Corpus { .. }));
    }

    #[test]
    fn test_loader_selection() {
        assert_eq!(loader_for(SourceKind::Directory, "/a/b/note.md").name(), "markdown");
        assert_eq!(loader_for(SourceKind::Directory, "/a/b/NOTE.MD").name(), "markdown");
        assert_eq!(loader_for(SourceKind::File, "/x/paper.pdf").name(), "pdf");
        assert_eq!(loader_for(SourceKind::Directory, "/x/notes.txt").name(), "text");
        assert_eq!(loader_for(SourceKind::AdHoc, "clipboard-1234").name(), "markdown");
        assert_eq!(loader_for(SourceKind::File, "/x/binary.dat").name(), "text");
    }

    #[test]
    fn test_plain_text_loader_lossy() {
        let doc = PlainTextLoader.load(b"hello \xff world", "/x.txt").unwrap();
        assert!(doc.body.starts_with("hello"));
        assert!(doc.body.ends_with("world"));
    }

    #[test]
    fn test_split_frontmatter_edge_cases() {
        assert!(split_frontmatter("no frontmatter here").is_none());
        assert!(split_frontmatter("--- not a fence\ntext").is_none());
        // Unterminated block
        assert!(split_frontmatter("---\ntitle: x\nbody without close").is_none());
        let (yaml, body) = split_frontmatter("---\na: 1\n---\nrest").unwrap();
        assert_eq!(yaml, "a: 1\n");
        assert_eq!(body, "rest");
    }
}
