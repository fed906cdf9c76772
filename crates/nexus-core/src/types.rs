//! Core data model: identifiers, records, payloads, and results.
//!
//! Identifiers are deterministic blake3 digests so that re-ingesting
//! unchanged content always produces the same ids. `ChunkId` ordering is the
//! byte order of the digest, which matches the hex order used in tie-breaks
//! and in the BM25 on-disk format.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Returns the current Unix timestamp in seconds.
///
/// If the system clock is before UNIX_EPOCH, returns 0 instead of panicking.
pub fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn hex_decode_16(s: &str) -> Option<[u8; 16]> {
    if s.len() != 32 || !s.is_ascii() {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

/// Identifier of a chunk, derived from `(document_id, ordinal, text)`.
///
/// Re-chunking an unchanged document reproduces identical ids, which is what
/// makes re-ingest a cheap no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId([u8; 16]);

/// Identifier of a document, derived from `(source_id, uri)`.
///
/// Uniqueness of `(source_id, uri)` is structural: the same pair always maps
/// to the same document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId([u8; 16]);

impl ChunkId {
    /// Derives the deterministic id for a chunk.
    pub fn derive(document_id: &DocumentId, ordinal: u32, text: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(document_id.as_bytes());
        hasher.update(&ordinal.to_le_bytes());
        hasher.update(text.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex_decode_16(s).map(Self)
    }
}

impl DocumentId {
    /// Derives the deterministic id for a `(source_id, uri)` pair.
    pub fn derive(source_id: &SourceId, uri: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source_id.as_str().as_bytes());
        hasher.update(&[0u8]);
        hasher.update(uri.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex_decode_16(s).map(Self)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

macro_rules! hex_serde {
    ($name:ident, $expecting:expr) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                struct HexVisitor;
                impl<'de> Visitor<'de> for HexVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                        f.write_str($expecting)
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<$name, E> {
                        $name::from_hex(v)
                            .ok_or_else(|| E::custom(format!("invalid id: {:?}", v)))
                    }
                }
                deserializer.deserialize_str(HexVisitor)
            }
        }
    };
}

hex_serde!(ChunkId, "a 32-character hex chunk id");
hex_serde!(DocumentId, "a 32-character hex document id");

/// Identifier of a registered content source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    /// Derives a stable id from the source kind and root.
    pub fn derive(kind: SourceKind, root: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(&[0u8]);
        hasher.update(root.as_bytes());
        Self(hex_encode(&hasher.finalize().as_bytes()[..16]))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a registered content origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Directory,
    File,
    Api,
    AdHoc,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Directory => "directory",
            SourceKind::File => "file",
            SourceKind::Api => "api",
            SourceKind::AdHoc => "ad-hoc",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "directory" => Ok(SourceKind::Directory),
            "file" => Ok(SourceKind::File),
            "api" => Ok(SourceKind::Api),
            "ad-hoc" => Ok(SourceKind::AdHoc),
            other => Err(format!("unknown source kind: {:?}", other)),
        }
    }
}

/// A registered content origin. Owns zero or more documents; deleting a
/// source cascades to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub kind: SourceKind,
    /// Path or URI the source was registered with
    pub root: String,
    /// Unix timestamp of registration
    pub created_at: i64,
    /// Unix timestamp of the last completed scan, if any
    pub last_scan_at: Option<i64>,
}

/// One original unit of content: a markdown file, a PDF, an ingested blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub source_id: SourceId,
    /// Absolute path or logical id within the source
    pub uri: String,
    pub title: Option<String>,
    /// blake3 hex digest of the raw bytes, used for change detection
    pub content_hash: String,
    pub byte_size: u64,
    /// Filesystem mtime in Unix seconds, when known
    pub mtime: Option<i64>,
    pub tags: Vec<String>,
    /// Free-form frontmatter mapping
    pub frontmatter: serde_json::Map<String, serde_json::Value>,
    /// Unix timestamp of the last (re-)index
    pub indexed_at: i64,
}

/// The smallest retrievable unit, persisted in the metadata store.
///
/// `char_start`/`char_end` are UTF-8 byte offsets into the
/// frontmatter-stripped document body, always on character boundaries;
/// `text` equals `body[char_start..char_end]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub document_id: DocumentId,
    /// Position within the document, 0-based
    pub ordinal: u32,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
    /// Heading titles leading to this chunk, outermost first
    pub section_path: Vec<String>,
    pub token_count: u32,
    pub embedding_version: u32,
    pub indexed_at: i64,
}

/// Payload stored next to each vector so filtered search needs no second
/// lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub source_id: SourceId,
    pub document_id: DocumentId,
    pub uri: String,
    pub kind: SourceKind,
    pub tags: Vec<String>,
    /// Unix timestamp the chunk was indexed
    pub indexed_at: i64,
    pub section_path: Vec<String>,
}

/// A ranked retrieval result with per-stage diagnostics. Transient.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    /// Final score: rerank score when reranking ran, RRF score otherwise
    pub score: f32,
    pub text: String,
    pub document_id: DocumentId,
    pub uri: String,
    pub section_path: Vec<String>,
    pub char_start: usize,
    pub char_end: usize,
    /// 1-based rank in the dense candidate list, if present
    pub dense_rank: Option<u32>,
    /// 1-based rank in the sparse candidate list, if present
    pub sparse_rank: Option<u32>,
    pub dense_score: Option<f32>,
    pub sparse_score: Option<f32>,
    pub rerank_score: Option<f32>,
    /// False when reranking was disabled, failed, or timed out
    pub rerank_used: bool,
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub document_id: DocumentId,
    pub added: usize,
    pub removed: usize,
    pub kept: usize,
}

/// Outcome of deleting one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub removed: usize,
}

/// Result of `upsert_document` change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Created,
    Updated,
    Unchanged,
}

/// Aggregate index statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub sources: usize,
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub bm25_terms: usize,
    pub index_size_bytes: u64,
}
