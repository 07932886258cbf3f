//! Document stores: where source bytes come from.
//!
//! The [`DocumentStore`] trait is the only way the retriever reaches source
//! documents, so the backing storage is pluggable. Two implementations ship:
//!
//! - [`FsDocumentStore`] serves files under a root directory; the document id
//!   is the path relative to that root.
//! - [`InMemoryDocumentStore`] holds documents in a map, for tests and
//!   embedding callers that already have the bytes.
//!
//! Implementations must be `Send + Sync`; the retriever calls them from
//! blocking worker threads.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use walkdir::WalkDir;

use crate::extract::guess_media_type;

/// Raw document content plus what is needed to interpret it.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub bytes: Vec<u8>,
    pub media_type: String,
    /// Human-readable name, used as the title when the document has none.
    pub display_name: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("invalid document id: {0}")]
    InvalidId(String),
    #[error("failed to read document {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

pub trait DocumentStore: Send + Sync {
    fn get_document(&self, id: &str) -> Result<StoredDocument, StoreError>;

    /// Every document id in the store, sorted.
    fn list_documents(&self) -> Result<Vec<String>, StoreError>;
}

// ============ Filesystem ============

pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an id to a path under the root. Absolute ids and ids that
    /// climb out of the root are rejected.
    fn resolve(&self, id: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(id);
        if id.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

impl DocumentStore for FsDocumentStore {
    fn get_document(&self, id: &str) -> Result<StoredDocument, StoreError> {
        let path = self.resolve(id)?;
        let bytes = std::fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(id.to_string())
            } else {
                StoreError::Io {
                    id: id.to_string(),
                    source,
                }
            }
        })?;
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());
        Ok(StoredDocument {
            bytes,
            media_type: guess_media_type(&path),
            display_name,
        })
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let walker = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|e| StoreError::Io {
                id: self.root.display().to_string(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let id = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            ids.push(id);
        }
        ids.sort();
        Ok(ids)
    }
}

// ============ In-memory ============

#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<BTreeMap<String, StoredDocument>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        id: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        media_type: &str,
        display_name: &str,
    ) {
        let doc = StoredDocument {
            bytes: bytes.into(),
            media_type: media_type.to_string(),
            display_name: display_name.to_string(),
        };
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), doc);
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn get_document(&self, id: &str) -> Result<StoredDocument, StoreError> {
        self.docs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .docs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }
}
