//! Persistent chunk indexes.
//!
//! One JSON file per document at `<index_dir>/<file stem>.index.json`. The
//! stem is the document id with unsafe characters replaced, plus a short
//! hash of the raw id so distinct ids never share a file.
//!
//! Every index records the SHA-256 of the source bytes it was built from.
//! [`IndexStore::load_current`] only returns an index whose hash matches the
//! current source, so edited documents are rebuilt on next access.
//!
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so readers never observe a partial index.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use doc_context_core::chunk::chunk_text;
use doc_context_core::models::{ChunkIndex, ExtractedDocument};

#[derive(Debug, Error)]
pub enum IndexPersistenceError {
    #[error("failed to read index {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt index {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write index {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize index: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// SHA-256 of raw source bytes, hex-encoded.
pub fn source_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Filesystem-safe stem for a document id.
pub fn file_stem(document_id: &str) -> String {
    let safe: String = document_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = format!("{:x}", Sha256::digest(document_id.as_bytes()));
    format!("{}-{}", safe.trim_start_matches('.'), &digest[..8])
}

/// Chunk an extracted document and wrap the result in a [`ChunkIndex`].
pub fn build_index(
    document_id: &str,
    source_hash: &str,
    extracted: &ExtractedDocument,
    target_chars: usize,
) -> ChunkIndex {
    let chunks = chunk_text(&extracted.body, target_chars);
    ChunkIndex::new(document_id, source_hash, extracted, chunks)
}

/// Write `bytes` to `path` via a temporary file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, document_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.index.json", file_stem(document_id)))
    }

    /// Load the stored index for `document_id`, if any.
    pub fn load(&self, document_id: &str) -> Result<Option<ChunkIndex>, IndexPersistenceError> {
        let path = self.path_for(document_id);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(IndexPersistenceError::Read { path, source }),
        };
        let index: ChunkIndex = serde_json::from_slice(&content)
            .map_err(|source| IndexPersistenceError::Corrupt { path, source })?;
        Ok(Some(index))
    }

    /// Load the stored index only if it was built from `source_hash`.
    pub fn load_current(
        &self,
        document_id: &str,
        source_hash: &str,
    ) -> Result<Option<ChunkIndex>, IndexPersistenceError> {
        Ok(self.load(document_id)?.filter(|index| {
            let current = index.source_hash == source_hash && index.document_id == document_id;
            if !current {
                debug!(document_id, "stored index is stale");
            }
            current
        }))
    }

    pub fn save(&self, index: &ChunkIndex) -> Result<(), IndexPersistenceError> {
        let path = self.path_for(&index.document_id);
        let json = serde_json::to_vec_pretty(index)?;
        write_atomic(&path, &json).map_err(|source| IndexPersistenceError::Write { path, source })
    }

    /// Delete the stored index, if there is one.
    pub fn remove(&self, document_id: &str) -> Result<(), IndexPersistenceError> {
        let path = self.path_for(document_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(IndexPersistenceError::Write { path, source }),
        }
    }
}
