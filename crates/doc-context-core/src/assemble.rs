//! Context assembly: section selection, formatting, and budget enforcement.
//!
//! Output is built as a sequence of [`Block`]s. Markers (section headers,
//! separators, fixed notes) are atomic: they are emitted whole or not at
//! all. Content blocks may be cut at a character boundary. When anything is
//! cut or dropped, [`TRUNCATION_NOTICE`] is appended, so the output never
//! exceeds `max_chars + TRUNCATION_NOTICE.chars().count()` characters.
//!
//! # Multi-document layout
//!
//! ```text
//! ### DOCUMENT TITLES ###
//! <title per document>
//!
//! ### DOCUMENT CHAPTERS ###        (omitted when no document has chapters)
//! --- CHAPTERS FROM <title> ---
//!
//! ### DOCUMENT HEADINGS ###        (omitted when no document has headings)
//! --- HEADINGS FROM <title> ---
//!
//! ### DOCUMENT CONTENT ###
//! --- DOCUMENT CONTENT: <title> ---
//! ```
//!
//! Documents are ordered shortest first. Short documents that extracted
//! successfully get an importance banner so a reader does not skim past them.

use crate::models::{Chunk, ScoredChunk};

/// Appended whenever output was cut to fit the budget.
pub const TRUNCATION_NOTICE: &str =
    "\n\n[Content truncated to fit the context budget. The document contains more information.]";

/// Appended after query-filtered sections.
pub const FILTER_NOTE: &str = "[Note: Content has been filtered to show only the most relevant sections based on the query. The full document contains more information.]";

pub const TITLES_HEADER: &str = "### DOCUMENT TITLES ###";
pub const CHAPTERS_HEADER: &str = "### DOCUMENT CHAPTERS ###";
pub const HEADINGS_HEADER: &str = "### DOCUMENT HEADINGS ###";
pub const CONTENT_HEADER: &str = "### DOCUMENT CONTENT ###";

const IMPORTANT_BANNER: &str = "*** IMPORTANT DOCUMENT ***";
const READ_CAREFULLY_BANNER: &str = "*** PLEASE READ CAREFULLY ***";

/// One piece of assembled output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// Emitted whole or not at all.
    Marker(String),
    /// May be cut at a character boundary.
    Content(String),
}

impl Block {
    fn text(&self) -> &str {
        match self {
            Block::Marker(s) | Block::Content(s) => s,
        }
    }
}

/// Render blocks within `max_chars` characters (plus the truncation notice).
pub fn fit_to_budget(blocks: &[Block], max_chars: usize) -> String {
    let mut out = String::new();
    let mut used = 0usize;
    let mut truncated = false;

    for block in blocks {
        let text = block.text();
        let len = text.chars().count();
        if used + len <= max_chars {
            out.push_str(text);
            used += len;
            continue;
        }
        truncated = true;
        if let Block::Content(s) = block {
            out.extend(s.chars().take(max_chars - used));
        }
        break;
    }

    if truncated {
        out.push_str(TRUNCATION_NOTICE);
    }
    out
}

/// Pick the chunks to show: the top `max_chunks` by score, with the first
/// chunk of the document always present.
///
/// If the first chunk already ranks in the top `max_chunks`, the ranking is
/// used as is. Otherwise the first chunk leads, followed by the best
/// `max_chunks - 1` others. At least one chunk is always returned.
pub fn select_chunks<'a>(
    scored: &[ScoredChunk<'a>],
    first_chunk: &'a Chunk,
    max_chunks: usize,
) -> Vec<&'a Chunk> {
    let top: Vec<&'a Chunk> = scored.iter().take(max_chunks).map(|s| s.chunk).collect();
    if top.iter().any(|c| c.position == first_chunk.position) {
        return top;
    }

    let mut selected = vec![first_chunk];
    selected.extend(
        scored
            .iter()
            .map(|s| s.chunk)
            .filter(|c| c.position != first_chunk.position)
            .take(max_chunks.saturating_sub(1)),
    );
    selected
}

/// Blocks for the selected chunks, each under a numbered section marker,
/// followed by [`FILTER_NOTE`].
pub fn relevant_section_blocks(
    scored: &[ScoredChunk<'_>],
    first_chunk: &Chunk,
    max_chunks: usize,
) -> Vec<Block> {
    let selected = select_chunks(scored, first_chunk, max_chunks);
    let mut blocks = Vec::with_capacity(selected.len() * 2 + 1);
    for (i, chunk) in selected.iter().enumerate() {
        let sep = if i == 0 { "" } else { "\n\n" };
        blocks.push(Block::Marker(format!(
            "{sep}--- RELEVANT SECTION {} ---\n",
            i + 1
        )));
        blocks.push(Block::Content(chunk.content.clone()));
    }
    blocks.push(Block::Marker(format!("\n\n{FILTER_NOTE}")));
    blocks
}

/// Assemble a single document's context from its ranked chunks.
pub fn assemble(
    scored: &[ScoredChunk<'_>],
    first_chunk: &Chunk,
    max_chunks: usize,
    max_chars: usize,
) -> String {
    fit_to_budget(
        &relevant_section_blocks(scored, first_chunk, max_chunks),
        max_chars,
    )
}

/// One document's contribution to a multi-document context.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub title: String,
    pub chapters: String,
    pub headings: String,
    pub content: Vec<Block>,
    /// Combined character length of title, chapters, headings and content.
    pub length: usize,
    /// True when `content` is an error placeholder.
    pub failed: bool,
}

impl DocumentContext {
    pub fn new(title: String, chapters: String, headings: String, content: Vec<Block>) -> Self {
        let length = title.chars().count()
            + chapters.chars().count()
            + headings.chars().count()
            + content.iter().map(|b| b.text().chars().count()).sum::<usize>();
        Self {
            title,
            chapters,
            headings,
            content,
            length,
            failed: false,
        }
    }

    /// A document that could not be read; `placeholder` replaces its content.
    pub fn failed(title: String, placeholder: String) -> Self {
        Self {
            title,
            chapters: String::new(),
            headings: String::new(),
            content: vec![Block::Content(placeholder)],
            length: 0,
            failed: true,
        }
    }

    fn is_important(&self, important_doc_chars: usize) -> bool {
        !self.failed && self.length < important_doc_chars
    }
}

/// Lay out several documents' contexts in the fixed group order.
pub fn group_documents(
    mut docs: Vec<DocumentContext>,
    important_doc_chars: usize,
    max_chars: usize,
) -> String {
    docs.sort_by_key(|d| d.length);
    let mut blocks = Vec::new();

    blocks.push(Block::Marker(format!("{TITLES_HEADER}\n")));
    for (i, doc) in docs.iter().enumerate() {
        let sep = if i == 0 { "" } else { "\n" };
        blocks.push(Block::Content(format!("{sep}{}", doc.title)));
    }
    blocks.push(Block::Marker("\n\n".to_string()));

    push_labelled_group(&mut blocks, &docs, CHAPTERS_HEADER, "CHAPTERS", |d| {
        &d.chapters
    });
    push_labelled_group(&mut blocks, &docs, HEADINGS_HEADER, "HEADINGS", |d| {
        &d.headings
    });

    blocks.push(Block::Marker(format!("{CONTENT_HEADER}\n")));
    for (i, doc) in docs.iter().enumerate() {
        let sep = if i == 0 { "" } else { "\n" };
        let header = format!("--- DOCUMENT CONTENT: {} ---", doc.title);
        let header = if doc.is_important(important_doc_chars) {
            format!("{IMPORTANT_BANNER}\n{header}\n{READ_CAREFULLY_BANNER}")
        } else {
            header
        };
        blocks.push(Block::Marker(format!("{sep}{header}\n")));
        blocks.extend(doc.content.iter().cloned());
        blocks.push(Block::Marker("\n".to_string()));
    }

    fit_to_budget(&blocks, max_chars)
}

fn push_labelled_group(
    blocks: &mut Vec<Block>,
    docs: &[DocumentContext],
    header: &str,
    label: &str,
    field: impl Fn(&DocumentContext) -> &String,
) {
    let present: Vec<&DocumentContext> = docs.iter().filter(|d| !field(d).is_empty()).collect();
    if present.is_empty() {
        return;
    }
    blocks.push(Block::Marker(format!("{header}\n")));
    for (i, doc) in present.iter().enumerate() {
        let sep = if i == 0 { "" } else { "\n\n" };
        blocks.push(Block::Marker(format!(
            "{sep}--- {label} FROM {} ---\n",
            doc.title
        )));
        blocks.push(Block::Content(field(doc).clone()));
    }
    blocks.push(Block::Marker("\n\n".to_string()));
}
