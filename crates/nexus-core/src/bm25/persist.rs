//! BM25 on-disk representation.
//!
//! Two little-endian binary files under the `bm25/` state directory:
//!
//! `index.bin`:
//! ```text
//! header     { magic "NXBM", version u32, doc_count u64, term_count u64, avg_doc_len f64 }
//! dictionary (term_len u16, term_bytes, df u32, posting_offset u64, posting_len u32)*  sorted by term
//! postings   (chunk_id [u8;16], tf u32)*                                               sorted by chunk id
//! ```
//!
//! `lengths.bin`:
//! ```text
//! header  { magic "NXBL", version u32, count u64 }
//! entries (chunk_id [u8;16], length u32)*  sorted by chunk id
//! ```
//!
//! Writes go to a temp file and are atomically renamed into place. Version
//! or magic mismatch on load forces a rebuild from the metadata store.

use super::{Bm25Index, Bm25Params, Bm25State};
use crate::error::StoreError;
use crate::types::ChunkId;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

const INDEX_MAGIC: &[u8; 4] = b"NXBM";
const LENGTHS_MAGIC: &[u8; 4] = b"NXBL";
const FORMAT_VERSION: u32 = 1;

pub const INDEX_FILE: &str = "index.bin";
pub const LENGTHS_FILE: &str = "lengths.bin";

/// Why a persisted index could not be used. Every variant is handled by
/// rebuilding from the metadata store rather than failing startup.
#[derive(Debug, Error)]
pub enum Bm25LoadError {
    #[error("BM25 index files not present")]
    Missing,
    #[error("BM25 index format version mismatch (found {found}, expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("BM25 index corrupt: {0}")]
    Corrupt(String),
}

impl Bm25Index {
    /// Serializes the index to `dir`, atomically swapping both files.
    pub fn persist(&self, dir: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(dir)
            .map_err(|e| StoreError::Database(format!("Failed to create {:?}: {}", dir, e)))?;

        let state = self.state.read().expect("bm25 lock poisoned");

        // Postings section, dictionary entries referencing absolute offsets.
        let header_len = 4 + 4 + 8 + 8 + 8;
        let dict_len: usize = state
            .postings
            .keys()
            .map(|term| 2 + term.len() + 4 + 8 + 4)
            .sum();
        let postings_base = (header_len + dict_len) as u64;

        let mut dict = Vec::with_capacity(dict_len);
        let mut postings = Vec::new();
        for (term, entries) in &state.postings {
            let offset = postings_base + postings.len() as u64;
            let mut sorted: Vec<(&ChunkId, &u32)> = entries.iter().collect();
            sorted.sort_by_key(|(id, _)| **id);
            for (chunk_id, tf) in sorted {
                postings.extend_from_slice(chunk_id.as_bytes());
                postings.extend_from_slice(&tf.to_le_bytes());
            }
            dict.extend_from_slice(&(term.len() as u16).to_le_bytes());
            dict.extend_from_slice(term.as_bytes());
            dict.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            dict.extend_from_slice(&offset.to_le_bytes());
            dict.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        }

        let mut index_buf =
            Vec::with_capacity(header_len + dict.len() + postings.len());
        index_buf.extend_from_slice(INDEX_MAGIC);
        index_buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        index_buf.extend_from_slice(&(state.lengths.len() as u64).to_le_bytes());
        index_buf.extend_from_slice(&(state.postings.len() as u64).to_le_bytes());
        index_buf.extend_from_slice(&(state.avg_doc_len() as f64).to_le_bytes());
        index_buf.extend_from_slice(&dict);
        index_buf.extend_from_slice(&postings);

        let mut lengths_buf = Vec::with_capacity(16 + state.lengths.len() * 20);
        lengths_buf.extend_from_slice(LENGTHS_MAGIC);
        lengths_buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        lengths_buf.extend_from_slice(&(state.lengths.len() as u64).to_le_bytes());
        let mut sorted_lengths: Vec<(&ChunkId, &u32)> = state.lengths.iter().collect();
        sorted_lengths.sort_by_key(|(id, _)| **id);
        for (chunk_id, len) in sorted_lengths {
            lengths_buf.extend_from_slice(chunk_id.as_bytes());
            lengths_buf.extend_from_slice(&len.to_le_bytes());
        }
        drop(state);

        atomic_write(&dir.join(INDEX_FILE), &index_buf)?;
        atomic_write(&dir.join(LENGTHS_FILE), &lengths_buf)?;
        debug!("Persisted BM25 index to {:?}", dir);
        Ok(())
    }

    /// Loads a persisted index from `dir`.
    ///
    /// The reverse chunk→terms map is rebuilt by inverting the posting
    /// lists; `avg_doc_len` is recomputed from the lengths file and checked
    /// against the header.
    pub fn load(dir: &Path, params: Bm25Params) -> Result<Self, Bm25LoadError> {
        let index_path = dir.join(INDEX_FILE);
        let lengths_path = dir.join(LENGTHS_FILE);
        if !index_path.exists() || !lengths_path.exists() {
            return Err(Bm25LoadError::Missing);
        }
        let index_bytes = fs::read(&index_path)
            .map_err(|e| Bm25LoadError::Corrupt(format!("read {:?}: {}", index_path, e)))?;
        let lengths_bytes = fs::read(&lengths_path)
            .map_err(|e| Bm25LoadError::Corrupt(format!("read {:?}: {}", lengths_path, e)))?;

        let mut cursor = Cursor::new(&index_bytes);
        let magic = cursor.take(4)?;
        if magic != INDEX_MAGIC {
            return Err(Bm25LoadError::Corrupt("bad index magic".to_string()));
        }
        let version = cursor.u32()?;
        if version != FORMAT_VERSION {
            return Err(Bm25LoadError::VersionMismatch {
                found: version,
                expected: FORMAT_VERSION,
            });
        }
        let doc_count = cursor.u64()? as usize;
        let term_count = cursor.u64()? as usize;
        let stored_avgdl = cursor.f64()?;

        // Dictionary
        let mut dict: Vec<(String, u32, u64, u32)> = Vec::with_capacity(term_count);
        for _ in 0..term_count {
            let term_len = cursor.u16()? as usize;
            let term_bytes = cursor.take(term_len)?;
            let term = std::str::from_utf8(term_bytes)
                .map_err(|e| Bm25LoadError::Corrupt(format!("term not utf-8: {}", e)))?
                .to_string();
            let df = cursor.u32()?;
            let offset = cursor.u64()?;
            let len = cursor.u32()?;
            dict.push((term, df, offset, len));
        }

        // Posting lists
        let mut postings: BTreeMap<String, HashMap<ChunkId, u32>> = BTreeMap::new();
        let mut chunk_terms: HashMap<ChunkId, Vec<(String, u32)>> = HashMap::new();
        for (term, df, offset, len) in dict {
            if df != len {
                return Err(Bm25LoadError::Corrupt(format!(
                    "df {} disagrees with posting length {} for term {:?}",
                    df, len, term
                )));
            }
            let mut entry_cursor = Cursor::at(&index_bytes, offset as usize)?;
            let mut entries = HashMap::with_capacity(len as usize);
            for _ in 0..len {
                let id_bytes: [u8; 16] = entry_cursor
                    .take(16)?
                    .try_into()
                    .map_err(|_| Bm25LoadError::Corrupt("truncated posting".to_string()))?;
                let chunk_id = ChunkId::from_bytes(id_bytes);
                let tf = entry_cursor.u32()?;
                entries.insert(chunk_id, tf);
                chunk_terms
                    .entry(chunk_id)
                    .or_default()
                    .push((term.clone(), tf));
            }
            postings.insert(term, entries);
        }
        for terms in chunk_terms.values_mut() {
            terms.sort_by(|a, b| a.0.cmp(&b.0));
        }

        // Lengths
        let mut cursor = Cursor::new(&lengths_bytes);
        let magic = cursor.take(4)?;
        if magic != LENGTHS_MAGIC {
            return Err(Bm25LoadError::Corrupt("bad lengths magic".to_string()));
        }
        let version = cursor.u32()?;
        if version != FORMAT_VERSION {
            return Err(Bm25LoadError::VersionMismatch {
                found: version,
                expected: FORMAT_VERSION,
            });
        }
        let count = cursor.u64()? as usize;
        if count != doc_count {
            return Err(Bm25LoadError::Corrupt(format!(
                "lengths count {} disagrees with index doc_count {}",
                count, doc_count
            )));
        }
        let mut lengths = HashMap::with_capacity(count);
        let mut total_len = 0u64;
        for _ in 0..count {
            let id_bytes: [u8; 16] = cursor
                .take(16)?
                .try_into()
                .map_err(|_| Bm25LoadError::Corrupt("truncated length entry".to_string()))?;
            let len = cursor.u32()?;
            lengths.insert(ChunkId::from_bytes(id_bytes), len);
            total_len += len as u64;
        }

        let state = Bm25State {
            postings,
            chunk_terms,
            lengths,
            total_len,
        };
        let recomputed = state.avg_doc_len() as f64;
        if doc_count > 0 && (recomputed - stored_avgdl).abs() > 1e-3 {
            warn!(
                stored = stored_avgdl,
                recomputed, "BM25 avg_doc_len header disagrees with lengths; using recomputed value"
            );
        }
        debug!(
            doc_count,
            term_count, "Loaded BM25 index from {:?}", dir
        );
        Ok(Bm25Index::from_state(params, state))
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("bin.tmp");
    {
        let mut file = File::create(&tmp)
            .map_err(|e| StoreError::Database(format!("create {:?}: {}", tmp, e)))?;
        file.write_all(bytes)
            .map_err(|e| StoreError::Database(format!("write {:?}: {}", tmp, e)))?;
        file.sync_all()
            .map_err(|e| StoreError::Database(format!("sync {:?}: {}", tmp, e)))?;
    }
    fs::rename(&tmp, path)
        .map_err(|e| StoreError::Database(format!("rename {:?} -> {:?}: {}", tmp, path, e)))?;
    Ok(())
}

/// Bounds-checked little-endian reader.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn at(bytes: &'a [u8], pos: usize) -> Result<Self, Bm25LoadError> {
        if pos > bytes.len() {
            return Err(Bm25LoadError::Corrupt("offset out of bounds".to_string()));
        }
        Ok(Self { bytes, pos })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Bm25LoadError> {
        if self.pos + n > self.bytes.len() {
            return Err(Bm25LoadError::Corrupt("unexpected end of file".to_string()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, Bm25LoadError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, Bm25LoadError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, Bm25LoadError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, Bm25LoadError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bm25::Bm25Tokenizer;
    use crate::types::{DocumentId, SourceId, SourceKind};
    use tempfile::TempDir;

    fn id(n: u32) -> ChunkId {
        let source = SourceId::derive(SourceKind::File, "/persist.md");
        let doc = DocumentId::derive(&source, "/persist.md");
        ChunkId::derive(&doc, n, "fixture")
    }

    fn tokens(text: &str) -> Vec<String> {
        Bm25Tokenizer::default().tokenize(text)
    }

    #[test]
    fn test_persist_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let index = Bm25Index::new(Bm25Params::default());
        index.add(id(1), &tokens("the quick brown fox jumps"));
        index.add(id(2), &tokens("lazy dogs sleep all afternoon"));
        index.add(id(3), &tokens("quick thinking saves the afternoon"));

        index.persist(dir.path()).unwrap();

        let loaded = Bm25Index::load(dir.path(), Bm25Params::default()).unwrap();
        assert_eq!(loaded.doc_count(), 3);
        assert_eq!(loaded.term_count(), index.term_count());
        assert!((loaded.avg_doc_len() - index.avg_doc_len()).abs() < 1e-6);

        // Scores must be identical after reload
        let before = index.search(&tokens("quick afternoon"), 10, None);
        let after = loaded.search(&tokens("quick afternoon"), 10, None);
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.0, b.0);
            assert!((a.1 - b.1).abs() < 1e-6);
        }

        // Removal must work on the loaded index (chunk_terms inverted correctly)
        assert!(loaded.remove(&id(1)));
        assert_eq!(loaded.doc_count(), 2);
    }

    #[test]
    fn test_empty_index_round_trip() {
        let dir = TempDir::new().unwrap();
        let index = Bm25Index::new(Bm25Params::default());
        index.persist(dir.path()).unwrap();
        let loaded = Bm25Index::load(dir.path(), Bm25Params::default()).unwrap();
        assert_eq!(loaded.doc_count(), 0);
        assert_eq!(loaded.term_count(), 0);
    }

    #[test]
    fn test_missing_files() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Bm25Index::load(dir.path(), Bm25Params::default()),
            Err(Bm25LoadError::Missing)
        ));
    }

    #[test]
    fn test_version_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let index = Bm25Index::new(Bm25Params::default());
        index.add(id(1), &tokens("content"));
        index.persist(dir.path()).unwrap();

        // Corrupt the version field in place
        let path = dir.path().join(INDEX_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            Bm25Index::load(dir.path(), Bm25Params::default()),
            Err(Bm25LoadError::VersionMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let index = Bm25Index::new(Bm25Params::default());
        index.add(id(1), &tokens("words to persist here"));
        index.persist(dir.path()).unwrap();

        let path = dir.path().join(INDEX_FILE);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();

        assert!(matches!(
            Bm25Index::load(dir.path(), Bm25Params::default()),
            Err(Bm25LoadError::Corrupt(_))
        ));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let index = Bm25Index::new(Bm25Params::default());
        index.add(id(1), &tokens("some words"));
        index.persist(dir.path()).unwrap();
        index.persist(dir.path()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{:?}", names);
    }
}
