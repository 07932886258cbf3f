//! Paragraph-boundary text chunker.
//!
//! Splits document body text into [`Chunk`]s near a target character size.
//! Splitting occurs only on blank-line paragraph boundaries, so a chunk
//! never starts or ends in the middle of a paragraph.
//!
//! # Algorithm
//!
//! 1. Split the body on blank lines (`\n\s*\n`) and drop empty paragraphs.
//! 2. Accumulate paragraphs into a buffer joined with `\n\n`.
//! 3. When appending the next paragraph would push the buffer past
//!    `target_size` characters, seal the buffer as a chunk and start a new
//!    one with that paragraph.
//! 4. Seal whatever remains as the final chunk.
//!
//! A single paragraph longer than `target_size` is kept whole, so a chunk
//! may exceed the target in that case.
//!
//! # Example
//!
//! ```rust
//! use doc_context_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", 5000);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].position, 0);
//! ```

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Default target chunk size in characters.
pub const DEFAULT_TARGET_CHARS: usize = 5000;

/// Separator placed between paragraphs inside a chunk.
const PARAGRAPH_SEPARATOR: &str = "\n\n";

static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("blank-line pattern is valid"));

/// Split `text` into trimmed, non-empty paragraphs.
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    BLANK_LINE
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split text into chunks on paragraph boundaries near `target_size` chars.
///
/// Returns chunks with contiguous positions starting at 0. Identical input
/// always yields an identical chunk sequence. Empty or whitespace-only text
/// yields no chunks.
pub fn chunk_text(text: &str, target_size: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0usize;

    for para in split_paragraphs(text) {
        let para_chars = para.chars().count();

        if !buf.is_empty() && buf_chars + PARAGRAPH_SEPARATOR.len() + para_chars > target_size {
            chunks.push(make_chunk(chunks.len(), &buf));
            buf.clear();
            buf_chars = 0;
        }

        if !buf.is_empty() {
            buf.push_str(PARAGRAPH_SEPARATOR);
            buf_chars += PARAGRAPH_SEPARATOR.len();
        }
        buf.push_str(para);
        buf_chars += para_chars;
    }

    if !buf.is_empty() {
        chunks.push(make_chunk(chunks.len(), &buf));
    }

    chunks
}

/// SHA-256 hex digest of a string.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(position: usize, text: &str) -> Chunk {
    Chunk {
        content: text.to_string(),
        content_hash: content_hash(text),
        length: text.chars().count(),
        position,
    }
}
