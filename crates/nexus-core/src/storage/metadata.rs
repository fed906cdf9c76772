//! redb-backed metadata store.
//!
//! The durable record of sources, documents, and chunks, and the source of
//! truth when the three stores disagree. Three B-tree tables:
//!
//! - `sources`:   source id (string) -> Source (JSON)
//! - `documents`: document id (16 raw bytes) -> StoredDocument (JSON),
//!   which embeds the ordered chunk id list
//! - `chunks`:    chunk id (16 raw bytes) -> ChunkRecord (JSON)
//!
//! Transactions are per-document; redb commits are durable (fsync) by
//! default, which is the per-document commit guarantee the ingest pipeline
//! relies on.

use crate::error::StoreError;
use crate::types::{ChunkId, ChunkRecord, Document, DocumentId, DocumentStatus, Source, SourceId};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

const SOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("sources");
const DOCUMENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("documents");
const CHUNKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("chunks");

fn db_err(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(format!("{}: {}", context, e))
}

fn ser_err(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(format!("{}: {}", context, e))
}

/// Document row: the document plus its ordered chunk ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    doc: Document,
    chunk_ids: Vec<ChunkId>,
}

/// Chunk-set transition applied by [`MetadataStore::replace_chunks`].
#[derive(Debug, Clone, Default)]
pub struct ChunkDiff {
    pub added: Vec<ChunkId>,
    pub removed: Vec<ChunkId>,
    pub kept: Vec<ChunkId>,
}

/// Row counts for `stats()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub sources: usize,
    pub documents: usize,
    pub chunks: usize,
}

pub struct MetadataStore {
    db: Database,
    path: PathBuf,
}

impl MetadataStore {
    /// Opens or creates the database file, creating all tables.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err("create metadata dir", e))?;
        }
        let db = Database::create(path).map_err(|e| db_err("open metadata db", e))?;
        {
            let txn = db.begin_write().map_err(|e| db_err("begin write", e))?;
            txn.open_table(SOURCES).map_err(|e| db_err("create sources table", e))?;
            txn.open_table(DOCUMENTS).map_err(|e| db_err("create documents table", e))?;
            txn.open_table(CHUNKS).map_err(|e| db_err("create chunks table", e))?;
            txn.commit().map_err(|e| db_err("commit table creation", e))?;
        }
        debug!("Opened metadata store at {:?}", path);
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    // =========================================================================
    // Sources
    // =========================================================================

    pub fn upsert_source(&self, source: &Source) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(source).map_err(|e| ser_err("serialize source", e))?;
        let txn = self.db.begin_write().map_err(|e| db_err("begin write", e))?;
        {
            let mut table = txn.open_table(SOURCES).map_err(|e| db_err("open sources", e))?;
            table
                .insert(source.id.as_str(), bytes.as_slice())
                .map_err(|e| db_err("insert source", e))?;
        }
        txn.commit().map_err(|e| db_err("commit source", e))
    }

    pub fn get_source(&self, id: &SourceId) -> Result<Option<Source>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = txn.open_table(SOURCES).map_err(|e| db_err("open sources", e))?;
        match table.get(id.as_str()).map_err(|e| db_err("get source", e))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(|e| ser_err("decode source", e))?,
            )),
            None => Ok(None),
        }
    }

    pub fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = txn.open_table(SOURCES).map_err(|e| db_err("open sources", e))?;
        let mut sources = Vec::new();
        for entry in table.iter().map_err(|e| db_err("iterate sources", e))? {
            let (_, value) = entry.map_err(|e| db_err("read source row", e))?;
            sources.push(
                serde_json::from_slice(value.value()).map_err(|e| ser_err("decode source", e))?,
            );
        }
        Ok(sources)
    }

    /// Deletes a source, cascading to its documents and chunks. Returns
    /// every removed chunk id so the caller can purge the indexes.
    pub fn delete_source(&self, id: &SourceId) -> Result<Vec<ChunkId>, StoreError> {
        let txn = self.db.begin_write().map_err(|e| db_err("begin write", e))?;
        let mut removed_chunks = Vec::new();
        {
            let mut sources = txn.open_table(SOURCES).map_err(|e| db_err("open sources", e))?;
            sources
                .remove(id.as_str())
                .map_err(|e| db_err("remove source", e))?;

            let mut documents = txn
                .open_table(DOCUMENTS)
                .map_err(|e| db_err("open documents", e))?;
            let mut chunks = txn.open_table(CHUNKS).map_err(|e| db_err("open chunks", e))?;

            let mut doomed: Vec<(Vec<u8>, Vec<ChunkId>)> = Vec::new();
            for entry in documents.iter().map_err(|e| db_err("iterate documents", e))? {
                let (key, value) = entry.map_err(|e| db_err("read document row", e))?;
                let stored: StoredDocument = serde_json::from_slice(value.value())
                    .map_err(|e| ser_err("decode document", e))?;
                if stored.doc.source_id == *id {
                    doomed.push((key.value().to_vec(), stored.chunk_ids));
                }
            }
            for (key, chunk_ids) in doomed {
                documents
                    .remove(key.as_slice())
                    .map_err(|e| db_err("remove document", e))?;
                for chunk_id in &chunk_ids {
                    chunks
                        .remove(chunk_id.as_bytes().as_slice())
                        .map_err(|e| db_err("remove chunk", e))?;
                }
                removed_chunks.extend(chunk_ids);
            }
        }
        txn.commit().map_err(|e| db_err("commit source deletion", e))?;
        Ok(removed_chunks)
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// Inserts or updates a document, comparing content hashes.
    ///
    /// `Unchanged` performs no write at all, which is what makes re-ingest
    /// of identical bytes zero-cost. On update the existing chunk id list is
    /// preserved until `replace_chunks` commits the new set.
    pub fn upsert_document(&self, doc: &Document) -> Result<DocumentStatus, StoreError> {
        let existing = self.get_stored(&doc.id)?;
        if let Some(stored) = &existing {
            if stored.doc.content_hash == doc.content_hash {
                return Ok(DocumentStatus::Unchanged);
            }
        }
        let status = if existing.is_some() {
            DocumentStatus::Updated
        } else {
            DocumentStatus::Created
        };
        let stored = StoredDocument {
            doc: doc.clone(),
            chunk_ids: existing.map(|s| s.chunk_ids).unwrap_or_default(),
        };
        self.put_stored(&stored)?;
        Ok(status)
    }

    pub fn get_document(&self, id: &DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.get_stored(id)?.map(|s| s.doc))
    }

    pub fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = txn
            .open_table(DOCUMENTS)
            .map_err(|e| db_err("open documents", e))?;
        let mut docs = Vec::new();
        for entry in table.iter().map_err(|e| db_err("iterate documents", e))? {
            let (_, value) = entry.map_err(|e| db_err("read document row", e))?;
            let stored: StoredDocument = serde_json::from_slice(value.value())
                .map_err(|e| ser_err("decode document", e))?;
            docs.push(stored.doc);
        }
        Ok(docs)
    }

    /// Ordered chunk ids of a document; empty when the document is unknown.
    pub fn chunk_ids_of(&self, id: &DocumentId) -> Result<Vec<ChunkId>, StoreError> {
        Ok(self.get_stored(id)?.map(|s| s.chunk_ids).unwrap_or_default())
    }

    /// Deletes a document and its chunks, returning the removed chunk ids.
    pub fn delete_document(&self, id: &DocumentId) -> Result<Vec<ChunkId>, StoreError> {
        let Some(stored) = self.get_stored(id)? else {
            return Ok(Vec::new());
        };
        let txn = self.db.begin_write().map_err(|e| db_err("begin write", e))?;
        {
            let mut documents = txn
                .open_table(DOCUMENTS)
                .map_err(|e| db_err("open documents", e))?;
            documents
                .remove(id.as_bytes().as_slice())
                .map_err(|e| db_err("remove document", e))?;
            let mut chunks = txn.open_table(CHUNKS).map_err(|e| db_err("open chunks", e))?;
            for chunk_id in &stored.chunk_ids {
                chunks
                    .remove(chunk_id.as_bytes().as_slice())
                    .map_err(|e| db_err("remove chunk", e))?;
            }
        }
        txn.commit().map_err(|e| db_err("commit document deletion", e))?;
        Ok(stored.chunk_ids)
    }

    // =========================================================================
    // Chunks
    // =========================================================================

    /// Swaps a document's chunk set in one transaction and returns the
    /// applied diff. Rows for kept ids are untouched (identical id implies
    /// identical text).
    pub fn replace_chunks(
        &self,
        document_id: &DocumentId,
        new_chunks: &[ChunkRecord],
    ) -> Result<ChunkDiff, StoreError> {
        let mut stored = self.get_stored(document_id)?.ok_or_else(|| {
            StoreError::NotFound(format!("document {}", document_id))
        })?;

        let old_ids: HashSet<ChunkId> = stored.chunk_ids.iter().copied().collect();
        let new_ids: HashSet<ChunkId> = new_chunks.iter().map(|c| c.id).collect();

        let mut diff = ChunkDiff::default();
        for chunk in new_chunks {
            if old_ids.contains(&chunk.id) {
                diff.kept.push(chunk.id);
            } else {
                diff.added.push(chunk.id);
            }
        }
        for id in &stored.chunk_ids {
            if !new_ids.contains(id) {
                diff.removed.push(*id);
            }
        }

        let txn = self.db.begin_write().map_err(|e| db_err("begin write", e))?;
        {
            let mut chunks = txn.open_table(CHUNKS).map_err(|e| db_err("open chunks", e))?;
            for id in &diff.removed {
                chunks
                    .remove(id.as_bytes().as_slice())
                    .map_err(|e| db_err("remove chunk", e))?;
            }
            for chunk in new_chunks {
                if old_ids.contains(&chunk.id) {
                    continue;
                }
                let bytes =
                    serde_json::to_vec(chunk).map_err(|e| ser_err("serialize chunk", e))?;
                chunks
                    .insert(chunk.id.as_bytes().as_slice(), bytes.as_slice())
                    .map_err(|e| db_err("insert chunk", e))?;
            }

            stored.chunk_ids = new_chunks.iter().map(|c| c.id).collect();
            let mut documents = txn
                .open_table(DOCUMENTS)
                .map_err(|e| db_err("open documents", e))?;
            let bytes =
                serde_json::to_vec(&stored).map_err(|e| ser_err("serialize document", e))?;
            documents
                .insert(document_id.as_bytes().as_slice(), bytes.as_slice())
                .map_err(|e| db_err("insert document", e))?;
        }
        txn.commit().map_err(|e| db_err("commit chunk replacement", e))?;

        debug!(
            document = %document_id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            kept = diff.kept.len(),
            "Replaced chunk set"
        );
        Ok(diff)
    }

    pub fn get_chunk(&self, id: &ChunkId) -> Result<Option<ChunkRecord>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = txn.open_table(CHUNKS).map_err(|e| db_err("open chunks", e))?;
        match table
            .get(id.as_bytes().as_slice())
            .map_err(|e| db_err("get chunk", e))?
        {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(|e| ser_err("decode chunk", e))?,
            )),
            None => Ok(None),
        }
    }

    /// Fetches chunks preserving input order; missing ids are skipped.
    pub fn get_chunks_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkRecord>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = txn.open_table(CHUNKS).map_err(|e| db_err("open chunks", e))?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(guard) = table
                .get(id.as_bytes().as_slice())
                .map_err(|e| db_err("get chunk", e))?
            {
                records.push(
                    serde_json::from_slice(guard.value())
                        .map_err(|e| ser_err("decode chunk", e))?,
                );
            }
        }
        Ok(records)
    }

    /// A document's chunks in ordinal order.
    pub fn list_chunks(&self, document_id: &DocumentId) -> Result<Vec<ChunkRecord>, StoreError> {
        let ids = self.chunk_ids_of(document_id)?;
        self.get_chunks_by_ids(&ids)
    }

    /// Every live chunk id. Used for the three-way consistency audit.
    pub fn all_chunk_ids(&self) -> Result<Vec<ChunkId>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = txn.open_table(CHUNKS).map_err(|e| db_err("open chunks", e))?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(|e| db_err("iterate chunks", e))? {
            let (key, _) = entry.map_err(|e| db_err("read chunk row", e))?;
            if let Ok(bytes) = <[u8; 16]>::try_from(key.value()) {
                ids.push(ChunkId::from_bytes(bytes));
            }
        }
        Ok(ids)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let sources = txn
            .open_table(SOURCES)
            .map_err(|e| db_err("open sources", e))?
            .len()
            .map_err(|e| db_err("count sources", e))? as usize;
        let documents = txn
            .open_table(DOCUMENTS)
            .map_err(|e| db_err("open documents", e))?
            .len()
            .map_err(|e| db_err("count documents", e))? as usize;
        let chunks = txn
            .open_table(CHUNKS)
            .map_err(|e| db_err("open chunks", e))?
            .len()
            .map_err(|e| db_err("count chunks", e))? as usize;
        Ok(StoreStats {
            sources,
            documents,
            chunks,
        })
    }

    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn get_stored(&self, id: &DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = txn
            .open_table(DOCUMENTS)
            .map_err(|e| db_err("open documents", e))?;
        match table
            .get(id.as_bytes().as_slice())
            .map_err(|e| db_err("get document", e))?
        {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value())
                    .map_err(|e| ser_err("decode document", e))?,
            )),
            None => Ok(None),
        }
    }

    fn put_stored(&self, stored: &StoredDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(stored).map_err(|e| ser_err("serialize document", e))?;
        let txn = self.db.begin_write().map_err(|e| db_err("begin write", e))?;
        {
            let mut table = txn
                .open_table(DOCUMENTS)
                .map_err(|e| db_err("open documents", e))?;
            table
                .insert(stored.doc.id.as_bytes().as_slice(), bytes.as_slice())
                .map_err(|e| db_err("insert document", e))?;
        }
        txn.commit().map_err(|e| db_err("commit document", e))
    }
}
