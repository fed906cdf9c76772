//! redb persistence for the vector store.
//!
//! Tables:
//! - `embeddings`: chunk id (16 raw bytes) -> f32 values, little-endian
//! - `payloads`:   chunk id -> ChunkPayload (JSON)
//! - `meta`:       store metadata: embedding model id and dimension,
//!   checked at startup against the configured embedder
//!
//! The HNSW graph itself is not persisted; it is rebuilt from these rows on
//! open, which also flushes any tombstones accumulated in the prior session.

use crate::error::StoreError;
use crate::types::{ChunkId, ChunkPayload};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::debug;

const EMBEDDINGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("embeddings");
const PAYLOADS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("payloads");
const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

const META_MODEL_ID: &str = "embedding_model_id";
const META_DIMENSION: &str = "dimension";

#[derive(Debug)]
pub(crate) struct VectorDb {
    db: Database,
    path: PathBuf,
}

fn db_err(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(format!("{}: {}", context, e))
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

impl VectorDb {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(|e| db_err("open vector db", e))?;
        {
            let txn = db
                .begin_write()
                .map_err(|e| db_err("begin write", e))?;
            txn.open_table(EMBEDDINGS)
                .map_err(|e| db_err("create embeddings table", e))?;
            txn.open_table(PAYLOADS)
                .map_err(|e| db_err("create payloads table", e))?;
            txn.open_table(META)
                .map_err(|e| db_err("create meta table", e))?;
            txn.commit().map_err(|e| db_err("commit table creation", e))?;
        }
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Recorded (model id, dimension), if the store has been written before.
    pub fn read_meta(&self) -> Result<Option<(String, usize)>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = txn.open_table(META).map_err(|e| db_err("open meta", e))?;
        let model = table
            .get(META_MODEL_ID)
            .map_err(|e| db_err("get model id", e))?
            .map(|g| g.value().to_string());
        let dimension = table
            .get(META_DIMENSION)
            .map_err(|e| db_err("get dimension", e))?
            .and_then(|g| g.value().parse::<usize>().ok());
        Ok(match (model, dimension) {
            (Some(m), Some(d)) => Some((m, d)),
            _ => None,
        })
    }

    pub fn write_meta(&self, model_id: &str, dimension: usize) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(|e| db_err("begin write", e))?;
        {
            let mut table = txn.open_table(META).map_err(|e| db_err("open meta", e))?;
            table
                .insert(META_MODEL_ID, model_id)
                .map_err(|e| db_err("insert model id", e))?;
            table
                .insert(META_DIMENSION, dimension.to_string().as_str())
                .map_err(|e| db_err("insert dimension", e))?;
        }
        txn.commit().map_err(|e| db_err("commit meta", e))
    }

    /// Writes embeddings and payloads in a single transaction.
    pub fn put_many(
        &self,
        items: &[(ChunkId, Vec<f32>, ChunkPayload)],
    ) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(|e| db_err("begin write", e))?;
        {
            let mut embeddings = txn
                .open_table(EMBEDDINGS)
                .map_err(|e| db_err("open embeddings", e))?;
            let mut payloads = txn
                .open_table(PAYLOADS)
                .map_err(|e| db_err("open payloads", e))?;
            for (chunk_id, embedding, payload) in items {
                let payload_bytes = serde_json::to_vec(payload).map_err(|e| {
                    StoreError::Serialization(format!("serialize payload: {}", e))
                })?;
                embeddings
                    .insert(
                        chunk_id.as_bytes().as_slice(),
                        encode_embedding(embedding).as_slice(),
                    )
                    .map_err(|e| db_err("insert embedding", e))?;
                payloads
                    .insert(chunk_id.as_bytes().as_slice(), payload_bytes.as_slice())
                    .map_err(|e| db_err("insert payload", e))?;
            }
        }
        txn.commit().map_err(|e| db_err("commit puts", e))
    }

    pub fn delete_many(&self, ids: &[ChunkId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(|e| db_err("begin write", e))?;
        {
            let mut embeddings = txn
                .open_table(EMBEDDINGS)
                .map_err(|e| db_err("open embeddings", e))?;
            let mut payloads = txn
                .open_table(PAYLOADS)
                .map_err(|e| db_err("open payloads", e))?;
            for id in ids {
                embeddings
                    .remove(id.as_bytes().as_slice())
                    .map_err(|e| db_err("remove embedding", e))?;
                payloads
                    .remove(id.as_bytes().as_slice())
                    .map_err(|e| db_err("remove payload", e))?;
            }
        }
        txn.commit().map_err(|e| db_err("commit deletes", e))
    }

    /// Loads every live row for graph rebuild. Rows missing either half are
    /// skipped; the startup audit purges them.
    pub fn load_all(&self) -> Result<Vec<(ChunkId, Vec<f32>, ChunkPayload)>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let embeddings = txn
            .open_table(EMBEDDINGS)
            .map_err(|e| db_err("open embeddings", e))?;
        let payloads = txn
            .open_table(PAYLOADS)
            .map_err(|e| db_err("open payloads", e))?;

        let mut rows = Vec::new();
        let iter = embeddings
            .iter()
            .map_err(|e| db_err("iterate embeddings", e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| db_err("read embedding row", e))?;
            let Ok(id_bytes) = <[u8; 16]>::try_from(key.value()) else {
                continue;
            };
            let chunk_id = ChunkId::from_bytes(id_bytes);
            let Some(payload_guard) = payloads
                .get(key.value())
                .map_err(|e| db_err("get payload", e))?
            else {
                continue;
            };
            let Ok(payload) = serde_json::from_slice::<ChunkPayload>(payload_guard.value())
            else {
                continue;
            };
            rows.push((chunk_id, decode_embedding(value.value()), payload));
        }
        debug!("Loaded {} vector rows from {:?}", rows.len(), self.path);
        Ok(rows)
    }

    pub fn get_embedding(&self, id: &ChunkId) -> Result<Option<Vec<f32>>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| db_err("begin read", e))?;
        let table = txn
            .open_table(EMBEDDINGS)
            .map_err(|e| db_err("open embeddings", e))?;
        Ok(table
            .get(id.as_bytes().as_slice())
            .map_err(|e| db_err("get embedding", e))?
            .map(|g| decode_embedding(g.value())))
    }

    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_codec_round_trip() {
        let embedding = vec![0.25f32, -1.5, 3.125, 0.0];
        let bytes = encode_embedding(&embedding);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_embedding(&bytes), embedding);
    }
}
