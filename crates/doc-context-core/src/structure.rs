//! Line-level structure detection.
//!
//! Extractors hand physical text lines to a [`StructureDetector`], which
//! decides whether each line is a chapter marker, another heading, or body
//! prose. [`HeadingHeuristic`] is the default detector; extractors for
//! formats with real structure (HTML, DOCX) supply their own decisions and
//! feed them through [`DocumentBuilder`] directly.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::ExtractedDocument;

/// Classification of a single physical line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Chapter,
    Heading,
    Body,
}

/// Pluggable strategy for classifying lines of extracted text.
pub trait StructureDetector: Send + Sync {
    /// Classify one line. Implementations receive the untrimmed line.
    fn classify(&self, line: &str) -> LineKind;
}

/// Lines this long or longer are never headings.
pub const MAX_HEADING_CHARS: usize = 100;

static LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:CHAPTER|Chapter|SECTION|Section|PART|Part)\s+\d+")
        .expect("labelled heading pattern is valid")
});
static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\s+[A-Z]").expect("numbered heading pattern is valid"));
static ROMAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[IVXLCDM]+\.\s+[A-Z]").expect("roman heading pattern is valid")
});

/// Default pattern-based heading detector.
///
/// A trimmed, non-empty line shorter than [`MAX_HEADING_CHARS`] is a
/// heading when it is fully upper-case (and longer than three characters),
/// starts with `Chapter N` / `Section N` / `Part N`, or starts with a
/// numbered (`1. Intro`) or roman-numeral (`IV. Scope`) marker. Headings
/// mentioning "chapter" or "section" are chapter markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadingHeuristic;

impl HeadingHeuristic {
    pub fn is_heading(&self, line: &str) -> bool {
        let text = line.trim();
        if text.is_empty() {
            return false;
        }
        let len = text.chars().count();
        if len >= MAX_HEADING_CHARS {
            return false;
        }
        (is_upper(text) && len > 3)
            || LABELLED.is_match(text)
            || NUMBERED.is_match(text)
            || ROMAN.is_match(text)
    }
}

impl StructureDetector for HeadingHeuristic {
    fn classify(&self, line: &str) -> LineKind {
        if !self.is_heading(line) {
            return LineKind::Body;
        }
        if is_chapter_marker(line) {
            LineKind::Chapter
        } else {
            LineKind::Heading
        }
    }
}

/// True when a heading line names a chapter or section.
pub fn is_chapter_marker(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("chapter") || lower.contains("section")
}

/// At least one cased character, and no lower-case ones.
fn is_upper(text: &str) -> bool {
    let mut cased = false;
    for c in text.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            cased = true;
        }
    }
    cased
}

/// Accumulates classified lines, page by page, into an [`ExtractedDocument`].
///
/// Body lines keep their line breaks within a page; a run of blank lines
/// inside a page becomes a single paragraph break, and pages are joined
/// with blank lines.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    title: String,
    chapters: Vec<String>,
    headings: Vec<String>,
    pages: Vec<String>,
    page: String,
    pending_break: bool,
}

impl DocumentBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    pub fn push_chapter(&mut self, line: &str) {
        self.chapters.push(line.trim().to_string());
    }

    pub fn push_heading(&mut self, line: &str) {
        self.headings.push(line.trim().to_string());
    }

    /// Append a body line to the current page. Blank lines mark paragraph
    /// breaks.
    pub fn push_body(&mut self, line: &str) {
        let text = line.trim();
        if text.is_empty() {
            self.pending_break = !self.page.is_empty();
            return;
        }
        if !self.page.is_empty() {
            self.page
                .push_str(if self.pending_break { "\n\n" } else { "\n" });
        }
        self.page.push_str(text);
        self.pending_break = false;
    }

    /// Route a line according to `detector`.
    pub fn push_line(&mut self, detector: &dyn StructureDetector, line: &str) {
        if line.trim().is_empty() {
            self.push_body(line);
            return;
        }
        match detector.classify(line) {
            LineKind::Chapter => self.push_chapter(line),
            LineKind::Heading => self.push_heading(line),
            LineKind::Body => self.push_body(line),
        }
    }

    /// Classify every line of a page's text and close the page.
    pub fn push_page(&mut self, detector: &dyn StructureDetector, text: &str) {
        for line in text.lines() {
            self.push_line(detector, line);
        }
        self.end_page();
    }

    /// Close the current page. Pages without body text are dropped.
    pub fn end_page(&mut self) {
        if !self.page.is_empty() {
            self.pages.push(std::mem::take(&mut self.page));
        }
        self.pending_break = false;
    }

    pub fn finish(mut self) -> ExtractedDocument {
        self.end_page();
        ExtractedDocument {
            title: self.title,
            chapters: self.chapters.join("\n"),
            headings: self.headings.join("\n"),
            body: self.pages.join("\n\n"),
        }
    }
}
