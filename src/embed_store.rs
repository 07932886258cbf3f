//! Per-document chunk embeddings, computed on demand and cached on disk.
//!
//! Vectors live at `<embedding_dir>/<file stem>.embeddings.gz`, gzip
//! compressed:
//!
//! ```text
//! magic    "DCEMB1"        6 bytes
//! count    u32 LE          number of vectors (= chunks)
//! dims     u32 LE
//! print    [u8; 32]        SHA-256 of model name + chunk content hashes
//! vectors  f32 LE × count × dims
//! ```
//!
//! The fingerprint ties a file to one model and one exact chunk list, so a
//! re-chunked document or a model change never pairs stale vectors with
//! chunks. Any embedding failure switches the shared
//! [`RetrievalCapabilities`] to keyword-only for the rest of the process.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use doc_context_core::capabilities::RetrievalCapabilities;
use doc_context_core::embedding::{blob_to_vec, vec_to_blob, Embedder};
use doc_context_core::models::{ChunkIndex, EmbeddingSet};

use crate::index::{file_stem, write_atomic};

const MAGIC: &[u8; 6] = b"DCEMB1";
const HEADER_LEN: usize = 6 + 4 + 4 + 32;

#[derive(Debug, Error)]
pub enum EmbeddingStoreError {
    #[error("failed to read embeddings {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write embeddings {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt embeddings {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

/// Why a document has no embeddings; retrieval continues keyword-only.
#[derive(Debug, Error)]
pub enum EmbeddingUnavailable {
    #[error("semantic scoring is disabled")]
    Disabled,
    #[error("document has no chunks")]
    NoChunks,
    #[error("embedding failed: {0}")]
    Failed(#[source] anyhow::Error),
}

pub struct EmbeddingStore {
    dir: PathBuf,
    embedder: Option<Arc<dyn Embedder>>,
    capabilities: Arc<RetrievalCapabilities>,
}

impl EmbeddingStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        embedder: Option<Arc<dyn Embedder>>,
        capabilities: Arc<RetrievalCapabilities>,
    ) -> Self {
        Self {
            dir: dir.into(),
            embedder,
            capabilities,
        }
    }

    pub fn path_for(&self, document_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.embeddings.gz", file_stem(document_id)))
    }

    /// Whether embeddings can currently be produced.
    pub fn is_active(&self) -> bool {
        self.embedder.is_some() && self.capabilities.embeddings_enabled()
    }

    /// Cached vectors for `index`, or freshly computed (and cached) ones.
    /// Returns `None` when semantic scoring is unavailable.
    pub fn get_or_compute(&self, index: &ChunkIndex) -> Option<EmbeddingSet> {
        if !self.is_active() || index.chunks.is_empty() {
            return None;
        }
        match self.load(index) {
            Ok(Some(set)) => return Some(set),
            Ok(None) => {}
            Err(e) => warn!(document_id = %index.document_id, error = %e, "ignoring unreadable embeddings"),
        }

        match self.compute(index) {
            Ok(set) => {
                if let Err(e) = self.save(index, &set) {
                    warn!(document_id = %index.document_id, error = %e, "failed to persist embeddings");
                }
                Some(set)
            }
            Err(e) => {
                debug!(document_id = %index.document_id, reason = %e, "no embeddings");
                None
            }
        }
    }

    /// Embed every chunk of `index`. A failure disables semantic scoring.
    pub fn compute(&self, index: &ChunkIndex) -> Result<EmbeddingSet, EmbeddingUnavailable> {
        let embedder = match &self.embedder {
            Some(e) if self.capabilities.embeddings_enabled() => e,
            _ => return Err(EmbeddingUnavailable::Disabled),
        };
        if index.chunks.is_empty() {
            return Err(EmbeddingUnavailable::NoChunks);
        }

        let texts: Vec<String> = index.chunks.iter().map(|c| c.content.clone()).collect();
        let result = embedder.embed(&texts).and_then(|vectors| {
            let set = EmbeddingSet {
                document_id: index.document_id.clone(),
                dims: embedder.dims(),
                vectors,
            };
            if set.matches(index) {
                Ok(set)
            } else {
                Err(anyhow::anyhow!(
                    "embedder returned {} vectors for {} chunks",
                    set.vectors.len(),
                    index.chunks.len()
                ))
            }
        });

        match result {
            Ok(set) => {
                info!(
                    document_id = %index.document_id,
                    chunks = set.vectors.len(),
                    model = embedder.model_name(),
                    "computed embeddings"
                );
                Ok(set)
            }
            Err(e) => {
                if self.capabilities.disable_embeddings() {
                    warn!(document_id = %index.document_id, error = %e, "embedding failed; semantic scoring disabled");
                }
                Err(EmbeddingUnavailable::Failed(e))
            }
        }
    }

    /// Load cached vectors if they were computed for exactly these chunks
    /// with the current model.
    pub fn load(&self, index: &ChunkIndex) -> Result<Option<EmbeddingSet>, EmbeddingStoreError> {
        let Some(embedder) = &self.embedder else {
            return Ok(None);
        };
        let path = self.path_for(&index.document_id);
        let compressed = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(EmbeddingStoreError::Read { path, source }),
        };

        let mut raw = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut raw)
            .map_err(|e| EmbeddingStoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        let (count, dims, print, data) = parse_header(&raw).ok_or_else(|| {
            EmbeddingStoreError::Corrupt {
                path: path.clone(),
                reason: "bad header".to_string(),
            }
        })?;

        if print != fingerprint(embedder.model_name(), index)
            || count != index.chunks.len()
            || dims != embedder.dims()
        {
            debug!(document_id = %index.document_id, "cached embeddings are stale");
            return Ok(None);
        }
        if data.len() != count * dims * 4 {
            return Err(EmbeddingStoreError::Corrupt {
                path,
                reason: format!("expected {} bytes of vectors, found {}", count * dims * 4, data.len()),
            });
        }

        let vectors = if dims == 0 {
            vec![Vec::new(); count]
        } else {
            data.chunks_exact(dims * 4).map(blob_to_vec).collect()
        };
        Ok(Some(EmbeddingSet {
            document_id: index.document_id.clone(),
            dims,
            vectors,
        }))
    }

    pub fn save(&self, index: &ChunkIndex, set: &EmbeddingSet) -> Result<(), EmbeddingStoreError> {
        let Some(embedder) = &self.embedder else {
            return Ok(());
        };
        let path = self.path_for(&index.document_id);

        let mut raw = Vec::with_capacity(HEADER_LEN + set.vectors.len() * set.dims * 4);
        raw.extend_from_slice(MAGIC);
        raw.extend_from_slice(&(set.vectors.len() as u32).to_le_bytes());
        raw.extend_from_slice(&(set.dims as u32).to_le_bytes());
        raw.extend_from_slice(&fingerprint(embedder.model_name(), index));
        for v in &set.vectors {
            raw.extend_from_slice(&vec_to_blob(v));
        }

        let write_err = |source| EmbeddingStoreError::Write {
            path: path.clone(),
            source,
        };
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).map_err(write_err)?;
        let compressed = encoder.finish().map_err(write_err)?;
        write_atomic(&path, &compressed).map_err(|source| EmbeddingStoreError::Write { path, source })
    }

    /// Delete cached vectors for a document. Missing files are not an error.
    pub fn remove(&self, document_id: &str) -> Result<(), EmbeddingStoreError> {
        let path = self.path_for(document_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(EmbeddingStoreError::Write { path, source }),
        }
    }
}

fn fingerprint(model_name: &str, index: &ChunkIndex) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    for chunk in &index.chunks {
        hasher.update(b"\n");
        hasher.update(chunk.content_hash.as_bytes());
    }
    hasher.finalize().into()
}

fn parse_header(raw: &[u8]) -> Option<(usize, usize, [u8; 32], &[u8])> {
    if raw.len() < HEADER_LEN || &raw[..6] != MAGIC {
        return None;
    }
    let count = u32::from_le_bytes(raw[6..10].try_into().ok()?) as usize;
    let dims = u32::from_le_bytes(raw[10..14].try_into().ok()?) as usize;
    let print: [u8; 32] = raw[14..46].try_into().ok()?;
    Some((count, dims, print, &raw[HEADER_LEN..]))
}
