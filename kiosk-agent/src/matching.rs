//! In-memory similarity index with hot-swap
//!
//! Index file layout (little-endian):
//!
//! ```text
//! "KIDX" | u32 format version | u32 dimension | u32 count | count * dimension f32
//! ```
//!
//! The companion `.meta.json` holds one JSON record per vector. Searches
//! clone the `Arc` of the generation that is current when they start, so a
//! refresh never disturbs an in-flight lookup.

use std::path::Path;
use std::sync::{Arc, RwLock};

use kiosk_common::hash::hash_file_async;
use kiosk_common::models::DatabaseKind;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::sync::{DatabaseArtifacts, DatabaseSyncPipeline};

const MAGIC: &[u8; 4] = b"KIDX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

/// One search hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    /// Row in the index
    pub index: usize,
    pub similarity: f32,
    pub metadata: Value,
}

/// One immutable loaded generation
#[derive(Debug)]
pub struct LoadedIndex {
    dimension: usize,
    vectors: Vec<f32>,
    norms: Vec<f32>,
    metadata: Vec<Value>,
    file_hash: String,
    version_token: String,
}

impl LoadedIndex {
    /// Parse index bytes; metadata rows beyond the vector count are ignored
    pub fn parse(bytes: &[u8], metadata: Vec<Value>) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(AgentError::Index(format!("file too short ({} bytes)", bytes.len())));
        }
        if &bytes[0..4] != MAGIC {
            return Err(AgentError::Index("bad magic".into()));
        }
        let version = read_u32(bytes, 4);
        if version != FORMAT_VERSION {
            return Err(AgentError::Index(format!("unsupported format version {}", version)));
        }
        let dimension = read_u32(bytes, 8) as usize;
        let count = read_u32(bytes, 12) as usize;
        if dimension == 0 {
            return Err(AgentError::Index("zero dimension".into()));
        }

        let body_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| AgentError::Index("size overflow".into()))?;
        if bytes.len() - HEADER_LEN != body_len {
            return Err(AgentError::Index(format!(
                "expected {} body bytes for {}x{}, found {}",
                body_len,
                count,
                dimension,
                bytes.len() - HEADER_LEN
            )));
        }

        let vectors: Vec<f32> = bytes[HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if vectors.iter().any(|v| !v.is_finite()) {
            return Err(AgentError::Index("non-finite component".into()));
        }
        let norms = vectors.chunks_exact(dimension).map(norm).collect();

        let mut metadata = metadata;
        metadata.resize(count, Value::Null);

        Ok(Self {
            dimension,
            vectors,
            norms,
            metadata,
            file_hash: String::new(),
            version_token: String::new(),
        })
    }

    /// Read and parse the files named by `artifacts`
    pub async fn load(artifacts: &DatabaseArtifacts) -> Result<Self> {
        let bytes = tokio::fs::read(&artifacts.index_path).await?;
        let metadata = read_metadata(&artifacts.metadata_path).await?;
        let mut index = Self::parse(&bytes, metadata)?;
        index.file_hash = artifacts.version.file_hash.to_lowercase();
        index.version_token = artifacts.version.version_token.clone();
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.norms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.norms.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    pub fn version_token(&self) -> &str {
        &self.version_token
    }

    /// Cosine similarity of `query` against every row, best first
    pub fn search(&self, query: &[f32], threshold: f32, max_results: usize) -> Result<Vec<Match>> {
        if query.len() != self.dimension {
            return Err(AgentError::Index(format!(
                "query has dimension {}, index has {}",
                query.len(),
                self.dimension
            )));
        }
        let query_norm = norm(query);
        if query_norm == 0.0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<(usize, f32)> = self
            .vectors
            .chunks_exact(self.dimension)
            .zip(&self.norms)
            .enumerate()
            .filter(|(_, (_, n))| **n > 0.0)
            .map(|(i, (row, n))| {
                let dot: f32 = row.iter().zip(query).map(|(a, b)| a * b).sum();
                (i, dot / (n * query_norm))
            })
            .filter(|(_, similarity)| *similarity >= threshold)
            .collect();

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        hits.truncate(max_results);

        Ok(hits
            .into_iter()
            .map(|(index, similarity)| Match {
                index,
                similarity,
                metadata: self.metadata[index].clone(),
            })
            .collect())
    }
}

/// Searchable database for one kind, swapped atomically on refresh
pub struct MatchDatabase {
    kind: DatabaseKind,
    threshold: f32,
    max_results: usize,
    current: RwLock<Option<Arc<LoadedIndex>>>,
}

impl MatchDatabase {
    pub fn new(kind: DatabaseKind, threshold: f32, max_results: usize) -> Self {
        Self {
            kind,
            threshold,
            max_results,
            current: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    /// Generation currently in service
    pub fn generation(&self) -> Option<Arc<LoadedIndex>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.generation().is_some()
    }

    /// Ranked hits at or above the threshold; empty until an index is loaded
    pub fn search(&self, embedding: &[f32]) -> Result<Vec<Match>> {
        match self.generation() {
            Some(index) => index.search(embedding, self.threshold, self.max_results),
            None => Ok(Vec::new()),
        }
    }

    /// Put `index` into service
    pub fn swap(&self, index: LoadedIndex) {
        let index = Arc::new(index);
        info!(
            kind = %self.kind,
            version = %index.version_token(),
            rows = index.len(),
            "Match database loaded"
        );
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(index);
    }

    /// Reload if the backing file no longer matches the loaded generation
    ///
    /// Returns true when a new generation went into service. Any failure
    /// leaves the current generation untouched.
    pub async fn refresh(&self, pipeline: &DatabaseSyncPipeline) -> Result<bool> {
        let path = pipeline.index_path(self.kind);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }
        let on_disk = hash_file_async(path).await?;
        if let Some(current) = self.generation() {
            if current.file_hash().eq_ignore_ascii_case(&on_disk) {
                debug!(kind = %self.kind, "Match database current");
                return Ok(false);
            }
        }

        let Some(artifacts) = pipeline.reload(self.kind).await? else {
            return Ok(false);
        };
        match LoadedIndex::load(&artifacts).await {
            Ok(index) => {
                self.swap(index);
                Ok(true)
            }
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "Rejected index, keeping previous generation");
                Err(e)
            }
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

async fn read_metadata(path: &Path) -> Result<Vec<Value>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::Index(format!("bad metadata: {}", e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Encode vectors in the index file format
pub fn encode_index(dimension: u32, rows: &[Vec<f32>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + rows.len() * dimension as usize * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&dimension.to_le_bytes());
    out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    for value in rows.iter().flatten() {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}
