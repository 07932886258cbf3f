//! Core data models used throughout doc-context.
//!
//! These types represent the extracted documents, chunks, indexes, and
//! scored results that flow through the retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured text pulled out of a raw document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub title: String,
    /// Newline-joined heading lines classified as chapter markers.
    pub chapters: String,
    /// Newline-joined heading lines that are not chapter markers.
    pub headings: String,
    /// Remaining prose; pages are separated by blank lines.
    pub body: String,
}

/// A paragraph-aligned slice of a document's body text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    /// SHA-256 hex digest of `content`.
    pub content_hash: String,
    /// Length of `content` in characters.
    pub length: usize,
    /// Zero-based order within the document.
    pub position: usize,
}

/// Per-document chunk index.
///
/// Persisted as plain JSON by the application crate so it can be inspected
/// by hand. `source_hash` is the SHA-256 of the raw document bytes the index
/// was built from; a mismatch means the source changed and the index is stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkIndex {
    pub document_id: String,
    pub source_hash: String,
    pub title: String,
    pub chapters: String,
    pub headings: String,
    pub chunks: Vec<Chunk>,
    pub total_chunks: usize,
    /// Length of the extracted body in characters.
    pub total_length: usize,
    pub indexed_at: DateTime<Utc>,
}

impl ChunkIndex {
    /// Build an index from an extracted document and its chunks.
    pub fn new(
        document_id: &str,
        source_hash: &str,
        extracted: &ExtractedDocument,
        chunks: Vec<Chunk>,
    ) -> Self {
        Self {
            document_id: document_id.to_string(),
            source_hash: source_hash.to_string(),
            title: extracted.title.clone(),
            chapters: extracted.chapters.clone(),
            headings: extracted.headings.clone(),
            total_chunks: chunks.len(),
            total_length: extracted.body.chars().count(),
            chunks,
            indexed_at: Utc::now(),
        }
    }

    /// The chunk at position 0, if the document has any content.
    pub fn first_chunk(&self) -> Option<&Chunk> {
        self.chunks.first()
    }

    /// Rejoin all chunks in position order with blank lines.
    ///
    /// Equivalent to the original body up to whitespace normalization.
    pub fn full_text(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Dense vectors for a document's chunks, parallel to [`ChunkIndex::chunks`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSet {
    pub document_id: String,
    pub dims: usize,
    /// One vector per chunk, in chunk position order.
    pub vectors: Vec<Vec<f32>>,
}

impl EmbeddingSet {
    /// True when this set has exactly one vector per chunk of `index`.
    pub fn matches(&self, index: &ChunkIndex) -> bool {
        self.vectors.len() == index.chunks.len()
            && self.vectors.iter().all(|v| v.len() == self.dims)
    }
}

/// A chunk paired with its relevance score for one query.
#[derive(Debug, Clone, Copy)]
pub struct ScoredChunk<'a> {
    pub chunk: &'a Chunk,
    pub score: f64,
}
