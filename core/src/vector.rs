//! Vector Store (spec §4.A) — fixed-dimension nearest-neighbor search over
//! chunk embeddings.
//!
//! Grounded on `memory/store.rs`'s schema-first, write-new-then-rename
//! table design, reworked from a LanceDB-backed column store into an
//! in-memory flat index: the spec's scale target (<=10^5 chunks) does not
//! need a column store, and this keeps the default build free of the
//! `lancedb`/`arrow-*` dependency weight (kept behind the `vector-db`
//! feature for parity with the teacher's on-disk engine).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SynapseError};

pub type ChunkId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub source_ref: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkMetadata {
    id: ChunkId,
    source_ref: String,
    text: String,
}

/// One nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborHit {
    pub chunk_id: ChunkId,
    pub distance: f32,
}

/// Readers-parallel, writers-exclusive fixed-dimension index (spec §5
/// shared-resource policy).
pub struct VectorStore {
    dimension: usize,
    chunks: RwLock<Vec<Chunk>>,
}

impl VectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends new chunks; rejects shape-mismatched embeddings outright
    /// rather than silently truncating/padding.
    pub fn append(&self, chunks: Vec<Chunk>) -> Result<()> {
        for c in &chunks {
            if c.embedding.len() != self.dimension {
                return Err(SynapseError::Validation {
                    message: format!(
                        "chunk {} has embedding dim {}, index dimension is {}",
                        c.id,
                        c.embedding.len(),
                        self.dimension
                    ),
                });
            }
        }
        self.chunks.write().extend(chunks);
        Ok(())
    }

    /// Full rebuild: write-new-then-swap so concurrent readers never see a
    /// partially rebuilt index (spec §4.A, §5 "index rebuilds quiesce
    /// readers").
    pub fn rebuild(&self, chunks: Vec<Chunk>) -> Result<()> {
        for c in &chunks {
            if c.embedding.len() != self.dimension {
                return Err(SynapseError::Validation {
                    message: format!(
                        "chunk {} has embedding dim {}, index dimension is {}",
                        c.id,
                        c.embedding.len(),
                        self.dimension
                    ),
                });
            }
        }
        *self.chunks.write() = chunks;
        Ok(())
    }

    /// Up to `k` nearest chunks by ascending Euclidean distance, ties
    /// broken by insertion order (spec §4.A ordering guarantee). Returns
    /// an empty result on an empty index rather than blocking or erroring.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<NeighborHit>> {
        if query.len() != self.dimension {
            return Err(SynapseError::Validation {
                message: format!(
                    "query dim {} does not match index dimension {}",
                    query.len(),
                    self.dimension
                ),
            });
        }
        let chunks = self.chunks.read();
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(usize, f32)> = chunks
            .iter()
            .enumerate()
            .map(|(idx, c)| (idx, l2_distance(query, &c.embedding)))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(idx, distance)| NeighborHit {
                chunk_id: chunks[idx].id.clone(),
                distance,
            })
            .collect())
    }

    pub fn get(&self, id: &str) -> Option<Chunk> {
        self.chunks.read().iter().find(|c| c.id == id).cloned()
    }

    /// Persists the index atomically: an opaque binary plus a sidecar
    /// metadata document, written-new-then-renamed (spec §6 "Persisted
    /// state").
    pub fn persist(&self, index_path: impl AsRef<Path>, sidecar_path: impl AsRef<Path>) -> std::io::Result<()> {
        let chunks = self.chunks.read();
        let embeddings: Vec<Vec<f32>> = chunks.iter().map(|c| c.embedding.clone()).collect();
        let embedding_bytes =
            bincode_like_encode(&embeddings).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let metadata: Vec<ChunkMetadata> = chunks
            .iter()
            .map(|c| ChunkMetadata {
                id: c.id.clone(),
                source_ref: c.source_ref.clone(),
                text: c.text.clone(),
            })
            .collect();
        let metadata_json =
            serde_json::to_vec_pretty(&metadata).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let index_tmp = index_path.as_ref().with_extension("tmp");
        std::fs::write(&index_tmp, embedding_bytes)?;
        std::fs::rename(&index_tmp, index_path.as_ref())?;

        let sidecar_tmp = sidecar_path.as_ref().with_extension("tmp");
        std::fs::write(&sidecar_tmp, metadata_json)?;
        std::fs::rename(&sidecar_tmp, sidecar_path.as_ref())?;
        Ok(())
    }

    pub fn load(dimension: usize, index_path: impl AsRef<Path>, sidecar_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let embedding_bytes = std::fs::read(index_path)?;
        let embeddings: Vec<Vec<f32>> = bincode_like_decode(&embedding_bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let metadata_json = std::fs::read(sidecar_path)?;
        let metadata: Vec<ChunkMetadata> = serde_json::from_slice(&metadata_json)?;

        let chunks = metadata
            .into_iter()
            .zip(embeddings)
            .map(|(m, embedding)| Chunk {
                id: m.id,
                source_ref: m.source_ref,
                text: m.text,
                embedding,
            })
            .collect();

        let store = Self::new(dimension);
        *store.chunks.write() = chunks;
        Ok(store)
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Minimal length-prefixed float encoding; kept dependency-free rather than
/// pulling in `bincode` for one call site.
fn bincode_like_encode(vectors: &[Vec<f32>]) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    out.extend_from_slice(&(vectors.len() as u64).to_le_bytes());
    for v in vectors {
        out.extend_from_slice(&(v.len() as u64).to_le_bytes());
        for f in v {
            out.extend_from_slice(&f.to_le_bytes());
        }
    }
    Ok(out)
}

fn bincode_like_decode(bytes: &[u8]) -> Result<Vec<Vec<f32>>, String> {
    let mut cursor = 0usize;
    let read_u64 = |cursor: &mut usize| -> Result<u64, String> {
        let slice = bytes
            .get(*cursor..*cursor + 8)
            .ok_or_else(|| "truncated length prefix".to_string())?;
        *cursor += 8;
        Ok(u64::from_le_bytes(slice.try_into().unwrap()))
    };
    let count = read_u64(&mut cursor)? as usize;
    let mut vectors = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_u64(&mut cursor)? as usize;
        let mut v = Vec::with_capacity(len);
        for _ in 0..len {
            let slice = bytes
                .get(cursor..cursor + 4)
                .ok_or_else(|| "truncated vector".to_string())?;
            cursor += 4;
            v.push(f32::from_le_bytes(slice.try_into().unwrap()));
        }
        vectors.push(v);
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            source_ref: format!("src/{id}"),
            text: format!("text for {id}"),
            embedding,
        }
    }

    #[test]
    fn search_on_empty_index_returns_empty() {
        let store = VectorStore::new(3);
        let hits = store.search(&[0.0, 0.0, 0.0], 5).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn mismatched_dimension_is_a_shape_error() {
        let store = VectorStore::new(3);
        let err = store.search(&[0.0, 0.0], 5);
        assert!(err.is_err());
    }

    #[test]
    fn search_orders_ascending_by_distance_ties_by_insertion() {
        let store = VectorStore::new(2);
        store
            .append(vec![
                chunk("far", vec![10.0, 10.0]),
                chunk("near", vec![0.1, 0.1]),
                chunk("tie-a", vec![1.0, 0.0]),
                chunk("tie-b", vec![1.0, 0.0]),
            ])
            .unwrap();
        let hits = store.search(&[0.0, 0.0], 4).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "tie-a", "tie-b", "far"]);
    }

    #[test]
    fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(2);
        store.append(vec![chunk("a", vec![1.0, 2.0])]).unwrap();
        let index_path = dir.path().join("index.bin");
        let sidecar_path = dir.path().join("index.json");
        store.persist(&index_path, &sidecar_path).unwrap();

        let loaded = VectorStore::load(2, &index_path, &sidecar_path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("a").unwrap().text, "text for a");
    }
}
