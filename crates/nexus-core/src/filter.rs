//! Metadata filter grammar and evaluation.
//!
//! ```text
//! filter := clause ("," clause)*       implicit AND
//! clause := tag:<string>
//!         | source:<source_id>
//!         | kind:<directory|file|api|ad-hoc>
//!         | since:<ISO8601>
//!         | path:<glob>
//! ```
//!
//! Filters evaluate against [`ChunkPayload`] so both retrievers can apply
//! them without a metadata lookup. The same clause syntax is accepted as a
//! query prefix (`tag:rust how do lifetimes work`), where hint clauses are
//! stripped from the query and ANDed with caller-provided filters.

use crate::error::NexusError;
use crate::types::{ChunkPayload, SourceId, SourceKind};
use chrono::{DateTime, NaiveDate};
use globset::{Glob, GlobMatcher};

/// One conjunct of a filter.
#[derive(Debug, Clone)]
pub enum FilterClause {
    /// Tag membership
    Tag(String),
    /// Exact source match
    Source(SourceId),
    /// Source kind match
    Kind(SourceKind),
    /// `indexed_at >= t` (Unix seconds)
    Since(i64),
    /// Glob over the `/`-joined section path
    Path { pattern: String, matcher: GlobMatcher },
}

impl FilterClause {
    fn matches(&self, payload: &ChunkPayload) -> bool {
        match self {
            FilterClause::Tag(tag) => payload.tags.iter().any(|t| t == tag),
            FilterClause::Source(id) => payload.source_id == *id,
            FilterClause::Kind(kind) => payload.kind == *kind,
            FilterClause::Since(t) => payload.indexed_at >= *t,
            FilterClause::Path { matcher, .. } => {
                matcher.is_match(payload.section_path.join("/"))
            }
        }
    }
}

/// A conjunctive set of filter clauses. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<FilterClause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the comma-separated clause grammar.
    pub fn parse(input: &str) -> Result<Self, NexusError> {
        let mut clauses = Vec::new();
        for part in input.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            clauses.push(parse_clause(part)?);
        }
        Ok(Self { clauses })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn push(&mut self, clause: FilterClause) {
        self.clauses.push(clause);
    }

    /// Conjunction of two filters.
    pub fn and(mut self, other: Filter) -> Filter {
        self.clauses.extend(other.clauses);
        self
    }

    /// True when every clause matches the payload.
    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        self.clauses.iter().all(|c| c.matches(payload))
    }
}

fn parse_clause(part: &str) -> Result<FilterClause, NexusError> {
    let (key, value) = part
        .split_once(':')
        .ok_or_else(|| NexusError::Query(format!("malformed filter clause: {:?}", part)))?;
    let value = value.trim();
    if value.is_empty() {
        return Err(NexusError::Query(format!(
            "empty value in filter clause: {:?}",
            part
        )));
    }
    match key.trim() {
        "tag" => Ok(FilterClause::Tag(value.to_string())),
        "source" => Ok(FilterClause::Source(SourceId::new(value))),
        "kind" => value
            .parse::<SourceKind>()
            .map(FilterClause::Kind)
            .map_err(NexusError::Query),
        "since" => parse_since(value).map(FilterClause::Since),
        "path" => {
            let glob = Glob::new(value).map_err(|e| {
                NexusError::Query(format!("invalid path glob {:?}: {}", value, e))
            })?;
            Ok(FilterClause::Path {
                pattern: value.to_string(),
                matcher: glob.compile_matcher(),
            })
        }
        other => Err(NexusError::Query(format!(
            "unknown filter key: {:?}",
            other
        ))),
    }
}

/// Accepts full RFC 3339 timestamps or bare dates (midnight UTC).
fn parse_since(value: &str) -> Result<i64, NexusError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    Err(NexusError::Query(format!(
        "invalid ISO8601 timestamp in since clause: {:?}",
        value
    )))
}

/// Splits leading filter-clause tokens off a query string.
///
/// Tokens are consumed from the front while they parse as clauses; the rest
/// of the query is returned verbatim. `tag:rust lifetimes` therefore becomes
/// (`"lifetimes"`, `tag:rust`).
pub fn split_query_hints(query: &str) -> (String, Filter) {
    let mut hints = Filter::new();
    let mut rest = query.trim();
    loop {
        let Some(token) = rest.split_whitespace().next() else {
            break;
        };
        if !token.contains(':') {
            break;
        }
        match parse_clause(token) {
            Ok(clause) => {
                hints.push(clause);
                rest = rest[token.len()..].trim_start();
            }
            Err(_) => break,
        }
    }
    (rest.to_string(), hints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentId;

    fn payload(tags: &[&str], kind: SourceKind, indexed_at: i64, sections: &[&str]) -> ChunkPayload {
        let source_id = SourceId::new("src-1");
        ChunkPayload {
            document_id: DocumentId::derive(&source_id, "/a.md"),
            source_id,
            uri: "/a.md".to_string(),
            kind,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            indexed_at,
            section_path: sections.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_and_match_tag() {
        let filter = Filter::parse("tag:tutorial").unwrap();
        assert!(filter.matches(&payload(&["tutorial", "ai"], SourceKind::File, 0, &[])));
        assert!(!filter.matches(&payload(&["ai"], SourceKind::File, 0, &[])));
    }

    #[test]
    fn test_conjunction() {
        let filter = Filter::parse("tag:ai,kind:file").unwrap();
        assert!(filter.matches(&payload(&["ai"], SourceKind::File, 0, &[])));
        assert!(!filter.matches(&payload(&["ai"], SourceKind::Directory, 0, &[])));
    }

    #[test]
    fn test_source_clause() {
        let filter = Filter::parse("source:src-1").unwrap();
        assert!(filter.matches(&payload(&[], SourceKind::File, 0, &[])));
        let other = Filter::parse("source:src-2").unwrap();
        assert!(!other.matches(&payload(&[], SourceKind::File, 0, &[])));
    }

    #[test]
    fn test_since_clause() {
        let filter = Filter::parse("since:2024-01-01T00:00:00Z").unwrap();
        assert!(filter.matches(&payload(&[], SourceKind::File, 1_800_000_000, &[])));
        assert!(!filter.matches(&payload(&[], SourceKind::File, 0, &[])));

        // Bare dates are midnight UTC
        let filter = Filter::parse("since:2024-01-01").unwrap();
        assert!(filter.matches(&payload(&[], SourceKind::File, 1_704_067_200, &[])));
    }

    #[test]
    fn test_path_glob() {
        let filter = Filter::parse("path:Types*").unwrap();
        assert!(filter.matches(&payload(
            &[],
            SourceKind::File,
            0,
            &["Types of Machine Learning"],
        )));
        assert!(!filter.matches(&payload(&[], SourceKind::File, 0, &["Overview"])));
    }

    #[test]
    fn test_malformed_clauses_rejected() {
        assert!(Filter::parse("tag").is_err());
        assert!(Filter::parse("tag:").is_err());
        assert!(Filter::parse("flavor:spicy").is_err());
        assert!(Filter::parse("kind:database").is_err());
        assert!(Filter::parse("since:not-a-date").is_err());
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = Filter::parse("").unwrap();
        assert!(filter.is_empty());
        assert!(filter.matches(&payload(&[], SourceKind::Api, 0, &[])));
    }

    #[test]
    fn test_query_hint_extraction() {
        let (query, hints) = split_query_hints("tag:rust how do lifetimes work");
        assert_eq!(query, "how do lifetimes work");
        assert!(!hints.is_empty());
        assert!(hints.matches(&payload(&["rust"], SourceKind::File, 0, &[])));
        assert!(!hints.matches(&payload(&["go"], SourceKind::File, 0, &[])));
    }

    #[test]
    fn test_query_without_hints_untouched() {
        let (query, hints) = split_query_hints("what is 2:1 odds");
        // "what" is not a clause, so nothing is consumed
        assert_eq!(query, "what is 2:1 odds");
        assert!(hints.is_empty());
    }

    #[test]
    fn test_unknown_prefix_token_stops_extraction() {
        let (query, hints) = split_query_hints("re:search tag:x");
        assert_eq!(query, "re:search tag:x");
        assert!(hints.is_empty());
    }
}
