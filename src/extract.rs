//! Structured text extraction for PDF, HTML, DOCX and plain-text documents.
//!
//! Every extractor produces an [`ExtractedDocument`]: a title, newline-joined
//! chapter and heading lists, and the body text with paragraph breaks
//! preserved as blank lines.
//!
//! Format detection looks at the bytes before the declared media type: a
//! `%PDF-` header always means PDF, and HTML markup is handled as HTML even
//! when it was stored under a PDF name.
//!
//! PDFs are read page by page with `lopdf`. A page that fails to decode
//! contributes an `[Error on page N: …]` marker instead of failing the whole
//! document. If no page yields any text, `pdf-extract` is tried over the
//! whole file as an alternative.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use lopdf::Object;
use scraper::{ElementRef, Html, Node, Selector};
use thiserror::Error;
use tracing::{debug, warn};

use doc_context_core::models::ExtractedDocument;
use doc_context_core::structure::{
    is_chapter_marker, DocumentBuilder, HeadingHeuristic, StructureDetector,
};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_HTML: &str = "text/html";
pub const MIME_XHTML: &str = "application/xhtml+xml";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_TEXT: &str = "text/plain";

/// Maximum decompressed bytes to read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("file is empty")]
    EmptyFile,
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("document is encrypted and could not be opened: {0}")]
    DecryptionFailed(String),
    #[error("no text could be extracted")]
    EmptyDocument,
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Pdf,
    Html,
    Docx,
    Text,
}

/// Turns raw document bytes into an [`ExtractedDocument`].
///
/// Line classification for PDF and plain text is delegated to a
/// [`StructureDetector`]; HTML and DOCX carry their own structure.
#[derive(Clone)]
pub struct Extractor {
    detector: Arc<dyn StructureDetector>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(Arc::new(HeadingHeuristic))
    }
}

impl Extractor {
    pub fn new(detector: Arc<dyn StructureDetector>) -> Self {
        Self { detector }
    }

    /// Extract a document. `display_name` is the title of last resort.
    pub fn extract(
        &self,
        bytes: &[u8],
        media_type: &str,
        display_name: &str,
    ) -> Result<ExtractedDocument, ExtractionError> {
        if bytes.is_empty() {
            return Err(ExtractionError::EmptyFile);
        }
        let format = detect_format(bytes, media_type)?;
        debug!(name = display_name, ?format, media_type, "extracting");
        match format {
            Format::Pdf => self.extract_pdf(bytes, display_name),
            Format::Html => Ok(extract_html(bytes, display_name)),
            Format::Docx => extract_docx(bytes, display_name),
            Format::Text => Ok(self.extract_text(bytes, display_name)),
        }
    }

    /// Read and extract a file, guessing its media type from the extension.
    pub fn extract_file(&self, path: &Path) -> Result<ExtractedDocument, ExtractionError> {
        if !path.is_file() {
            return Err(ExtractionError::FileNotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let media_type = guess_media_type(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.extract(&bytes, &media_type, &name)
    }

    fn extract_pdf(
        &self,
        bytes: &[u8],
        display_name: &str,
    ) -> Result<ExtractedDocument, ExtractionError> {
        let mut doc = match lopdf::Document::load_mem(bytes) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(name = display_name, error = %e, "PDF parse failed; trying alternative extractor");
                return match alternative_pdf_text(bytes) {
                    Some(text) => Ok(ExtractedDocument {
                        title: display_name.to_string(),
                        body: text,
                        ..Default::default()
                    }),
                    None => Err(ExtractionError::InvalidFormat(e.to_string())),
                };
            }
        };

        if doc.is_encrypted() {
            doc.decrypt("")
                .map_err(|e| ExtractionError::DecryptionFailed(e.to_string()))?;
        }

        let pages = doc.get_pages();
        if pages.is_empty() {
            return Err(ExtractionError::InvalidFormat("PDF has no pages".to_string()));
        }

        let title = pdf_title(&doc).unwrap_or_else(|| display_name.to_string());
        let mut builder = DocumentBuilder::new(title);
        let mut extracted_chars = 0usize;

        for &number in pages.keys() {
            match doc.extract_text(&[number]) {
                Ok(text) => {
                    extracted_chars += text.trim().chars().count();
                    builder.push_page(self.detector.as_ref(), &text);
                }
                Err(e) => {
                    warn!(name = display_name, page = number, error = %e, "page extraction failed");
                    builder.push_body(&format!("[Error on page {number}: {e}]"));
                    builder.end_page();
                }
            }
        }

        let mut extracted = builder.finish();
        if extracted_chars == 0 {
            debug!(name = display_name, "no text from page extraction; trying alternative extractor");
            match alternative_pdf_text(bytes) {
                Some(text) => extracted.body = text,
                None if extracted.body.trim().is_empty() => {
                    return Err(ExtractionError::EmptyDocument)
                }
                None => {}
            }
        }
        Ok(extracted)
    }

    fn extract_text(&self, bytes: &[u8], display_name: &str) -> ExtractedDocument {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_start_matches('\u{feff}');
        let mut builder = DocumentBuilder::new(display_name);
        builder.push_page(self.detector.as_ref(), text);
        builder.finish()
    }
}

/// Media type for a path, from its extension.
pub fn guess_media_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn detect_format(bytes: &[u8], media_type: &str) -> Result<Format, ExtractionError> {
    if bytes.starts_with(b"%PDF-") {
        return Ok(Format::Pdf);
    }
    if looks_like_html(bytes) {
        return Ok(Format::Html);
    }
    if looks_like_docx(bytes) {
        return Ok(Format::Docx);
    }
    let essence = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        MIME_PDF => Err(ExtractionError::InvalidFormat(
            "missing %PDF- header".to_string(),
        )),
        MIME_DOCX => Ok(Format::Docx),
        MIME_HTML | MIME_XHTML => Ok(Format::Html),
        t if t.starts_with("text/") => Ok(Format::Text),
        other => Err(ExtractionError::UnsupportedContentType(other.to_string())),
    }
}

fn looks_like_html(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(512)];
    let head = String::from_utf8_lossy(head);
    let head = head.trim_start_matches('\u{feff}').trim_start().to_ascii_lowercase();
    head.starts_with("<!doc") || head.starts_with("<html")
}

fn looks_like_docx(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04")
        && zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map(|archive| archive.index_for_name("word/document.xml").is_some())
            .unwrap_or(false)
}

/// Whole-file text from `pdf-extract`, or `None` if it fails or finds no text.
fn alternative_pdf_text(bytes: &[u8]) -> Option<String> {
    // pdf-extract can panic on malformed input
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem(bytes)
    }));
    match result {
        Ok(Ok(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!(error = %e, "alternative PDF extraction failed");
            None
        }
        Err(_) => {
            warn!("alternative PDF extractor panicked");
            None
        }
    }
}

/// The `/Title` entry of the document information dictionary.
fn pdf_title(doc: &lopdf::Document) -> Option<String> {
    let info = match doc.trailer.get(b"Info").ok()? {
        Object::Reference(id) => doc.get_dictionary(*id).ok()?,
        Object::Dictionary(dict) => dict,
        _ => return None,
    };
    let title = match info.get(b"Title").ok()? {
        Object::String(bytes, _) => decode_pdf_string(bytes),
        _ => return None,
    };
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}

/// Decode a PDF text string: UTF-16BE with a byte-order mark, else
/// single-byte.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

// ============ HTML ============

/// Elements whose text never reaches the body.
const HTML_SKIPPED: &[&str] = &["head", "script", "style", "template", "noscript", "svg"];

/// Elements that start and end a paragraph.
const HTML_BLOCKS: &[&str] = &[
    "p", "div", "br", "hr", "li", "ul", "ol", "dl", "dt", "dd", "tr", "td", "th", "table",
    "section", "article", "main", "nav", "aside", "blockquote", "pre", "header", "footer",
    "figure", "figcaption", "h1", "h2", "h3", "h4", "h5", "h6",
];

struct HtmlSelectors {
    title: Selector,
    headings: Selector,
}

static HTML_SELECTORS: LazyLock<HtmlSelectors> = LazyLock::new(|| HtmlSelectors {
    title: Selector::parse("title").expect("title selector"),
    headings: Selector::parse("h1, h2, h3, h4, h5, h6").expect("heading selector"),
});

/// Headings come from `<h1>`–`<h6>`, prefixed with one `#` per level; block
/// elements become paragraph breaks.
fn extract_html(bytes: &[u8], display_name: &str) -> ExtractedDocument {
    let html = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&html);
    let selectors = &*HTML_SELECTORS;

    let title = document
        .select(&selectors.title)
        .next()
        .map(|el| element_text(&el))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| display_name.to_string());
    let mut builder = DocumentBuilder::new(title);

    for heading in document.select(&selectors.headings) {
        let text = element_text(&heading);
        if text.is_empty() {
            continue;
        }
        let level = heading.value().name()[1..].parse::<usize>().unwrap_or(1);
        let heading = format!("{} {}", "#".repeat(level), text);
        if is_chapter_marker(&text) {
            builder.push_chapter(&heading);
        } else {
            builder.push_heading(&heading);
        }
    }

    let mut collector = ParagraphCollector::default();
    collector.walk(document.root_element());
    for para in collector.finish() {
        builder.push_body(&para);
        builder.push_body("");
    }
    builder.finish()
}

fn element_text(element: &ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Gathers body text into paragraphs split at block elements.
#[derive(Default)]
struct ParagraphCollector {
    paragraphs: Vec<String>,
    current: String,
}

impl ParagraphCollector {
    fn walk(&mut self, element: ElementRef<'_>) {
        let name = element.value().name();
        if HTML_SKIPPED.contains(&name) {
            return;
        }
        let block = HTML_BLOCKS.contains(&name);
        if block {
            self.flush();
        }
        for child in element.children() {
            match child.value() {
                Node::Text(text) => self.current.push_str(text),
                Node::Element(_) => {
                    if let Some(child) = ElementRef::wrap(child) {
                        self.walk(child);
                    }
                }
                _ => {}
            }
        }
        if block {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let para = collapse_whitespace(&self.current);
        self.current.clear();
        if !para.is_empty() {
            self.paragraphs.push(para);
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.paragraphs
    }
}

// ============ DOCX ============

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<Vec<u8>>, ExtractionError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(ExtractionError::InvalidFormat(e.to_string())),
    };
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractionError::InvalidFormat(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractionError::InvalidFormat(format!(
            "ZIP entry {name} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)"
        )));
    }
    Ok(Some(out))
}

/// Paragraph styles named `Heading N` or `Title` mark headings; the title is
/// taken from `docProps/core.xml`, then the first `Title` paragraph.
fn extract_docx(bytes: &[u8], display_name: &str) -> Result<ExtractedDocument, ExtractionError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractionError::InvalidFormat(e.to_string()))?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?.ok_or_else(|| {
        ExtractionError::InvalidFormat("word/document.xml not found".to_string())
    })?;
    let core_title = match read_zip_entry_bounded(&mut archive, "docProps/core.xml")? {
        Some(xml) => core_title(&xml)?,
        None => None,
    };

    let paragraphs = docx_paragraphs(&doc_xml)?;
    let mut builder = DocumentBuilder::new(display_name);
    let mut title = core_title;

    for para in paragraphs {
        let text = para.text.trim();
        if text.is_empty() {
            continue;
        }
        match para.style.as_deref().map(str::to_ascii_lowercase) {
            Some(style) if style == "title" => {
                if title.is_none() {
                    title = Some(text.to_string());
                }
                builder.push_heading(text);
            }
            Some(style) if style.starts_with("heading") => {
                if is_chapter_marker(text) {
                    builder.push_chapter(text);
                } else {
                    builder.push_heading(text);
                }
            }
            _ => {
                builder.push_body(text);
                builder.push_body("");
            }
        }
    }

    if let Some(title) = title {
        builder.set_title(title);
    }
    Ok(builder.finish())
}

#[derive(Debug, Default)]
struct DocxParagraph {
    style: Option<String>,
    text: String,
}

fn docx_paragraphs(xml: &[u8]) -> Result<Vec<DocxParagraph>, ExtractionError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current = DocxParagraph::default();
    let mut in_run = false;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => current = DocxParagraph::default(),
                b"r" => in_run = true,
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => {
                    current.style = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.local_name().as_ref() == b"val")
                        .map(|a| String::from_utf8_lossy(&a.value).into_owned());
                }
                b"tab" if in_run => current.text.push('\t'),
                b"br" if in_run => current.text.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractionError::InvalidFormat(e.to_string()))?;
                current.text.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"p" => paragraphs.push(std::mem::take(&mut current)),
                b"r" => in_run = false,
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::InvalidFormat(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(paragraphs)
}

fn core_title(xml: &[u8]) -> Result<Option<String>, ExtractionError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_title = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"title" => in_title = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"title" => in_title = false,
            Ok(Event::Text(te)) if in_title => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractionError::InvalidFormat(e.to_string()))?;
                let text = text.trim();
                if !text.is_empty() {
                    return Ok(Some(text.to_string()));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(ExtractionError::InvalidFormat(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
}
