//! Query-focused context retrieval over a [`DocumentStore`].
//!
//! For each requested document the retriever:
//!
//! 1. fetches the source bytes and hashes them,
//! 2. loads the persisted chunk index if it matches that hash, otherwise
//!    extracts, chunks, persists and embeds the document (once per id, even
//!    under concurrent requests),
//! 3. with a query, scores the chunks and keeps the most relevant sections
//!    (always including the opening chunk); without one, or for short
//!    documents, keeps the whole text,
//!
//! then lays all documents out in one grouped string within the character
//! budget. Failures never abort a request: a document that cannot be read
//! shows up as a bracketed placeholder, and embedding trouble degrades to
//! keyword scoring.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use doc_context_core::assemble::{group_documents, relevant_section_blocks, Block, DocumentContext};
use doc_context_core::capabilities::RetrievalCapabilities;
use doc_context_core::embedding::Embedder;
use doc_context_core::models::{ChunkIndex, EmbeddingSet, ExtractedDocument};
use doc_context_core::score::HybridScorer;

use crate::config::{ChunkingConfig, Config, RetrievalConfig};
use crate::embed_store::EmbeddingStore;
use crate::embedding::create_embedder;
use crate::extract::{ExtractionError, Extractor};
use crate::index::{build_index, source_hash, IndexStore};
use crate::store::{DocumentStore, FsDocumentStore, StoreError, StoredDocument};

/// Returned when none of the requested documents exist.
pub const NO_DOCUMENTS: &str = "[No documents found for the requested IDs]";

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

/// Outcome of indexing a batch of documents.
#[derive(Debug, Default, Serialize)]
pub struct IndexReport {
    /// Documents with a persisted index (built now or already current).
    pub indexed: Vec<String>,
    /// Documents too short to be worth indexing.
    pub skipped: Vec<String>,
    /// Documents that could not be read, with the reason.
    pub failed: Vec<(String, String)>,
}

/// What is known about a document's stored index.
#[derive(Debug, Serialize)]
pub struct IndexSummary {
    pub document_id: String,
    pub title: String,
    pub total_chunks: usize,
    pub total_length: usize,
    pub indexed_at: DateTime<Utc>,
    pub source_hash: String,
    /// The source has changed since the index was built.
    pub stale: bool,
    pub has_embeddings: bool,
}

struct DocumentOutcome {
    context: DocumentContext,
    found: bool,
}

/// A current index together with its vectors, if any.
struct Prepared {
    index: ChunkIndex,
    embeddings: Option<EmbeddingSet>,
    /// Why a freshly built index could not be written.
    persist_error: Option<String>,
}

/// Cheap to clone; clones share caches, locks and capabilities.
#[derive(Clone)]
pub struct Retriever {
    inner: Arc<RetrieverInner>,
}

struct RetrieverInner {
    store: Arc<dyn DocumentStore>,
    extractor: Extractor,
    indexes: IndexStore,
    embeddings: EmbeddingStore,
    scorer: HybridScorer,
    capabilities: Arc<RetrievalCapabilities>,
    chunking: ChunkingConfig,
    retrieval: RetrievalConfig,
    builds: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Retriever {
    /// A retriever over the configured documents directory, using the
    /// configured embedding provider.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(FsDocumentStore::new(&config.storage.documents_dir));
        let embedder = create_embedder(&config.embedding)?;
        Ok(Self::new(config, store, embedder))
    }

    pub fn new(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self::with_extractor(config, store, embedder, Extractor::default())
    }

    pub fn with_extractor(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        embedder: Option<Arc<dyn Embedder>>,
        extractor: Extractor,
    ) -> Self {
        let capabilities = Arc::new(RetrievalCapabilities::new(embedder.is_some()));
        let scorer = HybridScorer::new(
            capabilities.clone(),
            embedder.clone(),
            config.retrieval.fusion_weights(),
        );
        let embeddings = EmbeddingStore::new(
            &config.storage.embedding_dir,
            embedder,
            capabilities.clone(),
        );
        Self {
            inner: Arc::new(RetrieverInner {
                store,
                extractor,
                indexes: IndexStore::new(&config.storage.index_dir),
                embeddings,
                scorer,
                capabilities,
                chunking: config.chunking.clone(),
                retrieval: config.retrieval.clone(),
                builds: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn capabilities(&self) -> &Arc<RetrievalCapabilities> {
        &self.inner.capabilities
    }

    /// Build context for `document_ids`, answering `query` if given.
    ///
    /// Documents are processed concurrently on the blocking thread pool.
    /// `max_chars` defaults to `retrieval.max_context_chars`.
    pub async fn get_context(
        &self,
        document_ids: &[String],
        query: Option<&str>,
        max_chars: Option<usize>,
    ) -> String {
        let ids = dedup(document_ids);
        if ids.is_empty() {
            return NO_DOCUMENTS.to_string();
        }
        let query = query.map(str::to_string);

        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let this = self.clone();
                let id = id.clone();
                let query = query.clone();
                tokio::task::spawn_blocking(move || this.document_outcome(&id, query.as_deref()))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (id, handle) in ids.iter().zip(handles) {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(document_id = %id, error = %e, "document task failed");
                    outcomes.push(DocumentOutcome {
                        context: DocumentContext::failed(
                            id.clone(),
                            format!("[Error extracting text from {id}: {e}]"),
                        ),
                        found: true,
                    });
                }
            }
        }
        self.render(outcomes, max_chars)
    }

    /// Synchronous form of [`get_context`](Self::get_context), for callers
    /// already on a worker thread.
    pub fn get_context_blocking(
        &self,
        document_ids: &[String],
        query: Option<&str>,
        max_chars: Option<usize>,
    ) -> String {
        let ids = dedup(document_ids);
        if ids.is_empty() {
            return NO_DOCUMENTS.to_string();
        }
        let outcomes = ids
            .iter()
            .map(|id| self.document_outcome(id, query))
            .collect();
        self.render(outcomes, max_chars)
    }

    /// Extract a document without indexing it.
    pub fn extract_document(&self, document_id: &str) -> Result<ExtractedDocument, RetrieveError> {
        let stored = self.inner.store.get_document(document_id)?;
        Ok(self
            .inner
            .extractor
            .extract(&stored.bytes, &stored.media_type, &stored.display_name)?)
    }

    /// Extract a file outside the document store with this retriever's
    /// extraction settings.
    pub fn extract_file(&self, path: &Path) -> Result<ExtractedDocument, RetrieveError> {
        Ok(self.inner.extractor.extract_file(path)?)
    }

    /// Make sure each document has a current index (and embeddings, when
    /// enabled). Documents whose index could not be written are reported
    /// as failed.
    pub fn index_documents(&self, document_ids: &[String]) -> IndexReport {
        let mut report = IndexReport::default();
        for id in dedup(document_ids) {
            let result = self
                .inner
                .store
                .get_document(&id)
                .map_err(RetrieveError::from)
                .and_then(|stored| Ok(self.prepare(&id, &stored, true)?));
            match result {
                Ok(prepared) if !self.is_indexable(&prepared.index) => report.skipped.push(id),
                Ok(Prepared {
                    persist_error: Some(reason),
                    ..
                }) => report
                    .failed
                    .push((id, format!("index not persisted: {reason}"))),
                Ok(_) => report.indexed.push(id),
                Err(e) => {
                    warn!(document_id = %id, error = %e, "indexing failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        info!(
            indexed = report.indexed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "indexing complete"
        );
        report
    }

    /// Index every document in the store.
    pub fn index_all(&self) -> Result<IndexReport, RetrieveError> {
        let ids = self.inner.store.list_documents()?;
        info!(documents = ids.len(), "indexing all documents");
        Ok(self.index_documents(&ids))
    }

    /// Summary of a document's stored index, or `None` if it has none.
    pub fn inspect(&self, document_id: &str) -> Result<Option<IndexSummary>, RetrieveError> {
        let stored = self.inner.store.get_document(document_id)?;
        let index = match self.inner.indexes.load(document_id) {
            Ok(Some(index)) => index,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(document_id, error = %e, "stored index unreadable");
                return Ok(None);
            }
        };
        let has_embeddings = matches!(self.inner.embeddings.load(&index), Ok(Some(_)));
        Ok(Some(IndexSummary {
            stale: index.source_hash != source_hash(&stored.bytes),
            document_id: index.document_id,
            title: index.title,
            total_chunks: index.total_chunks,
            total_length: index.total_length,
            indexed_at: index.indexed_at,
            source_hash: index.source_hash,
            has_embeddings,
        }))
    }

    fn render(&self, outcomes: Vec<DocumentOutcome>, max_chars: Option<usize>) -> String {
        if outcomes.iter().all(|o| !o.found) {
            return NO_DOCUMENTS.to_string();
        }
        let budget = max_chars.unwrap_or(self.inner.retrieval.max_context_chars);
        group_documents(
            outcomes.into_iter().map(|o| o.context).collect(),
            self.inner.retrieval.important_doc_chars,
            budget,
        )
    }

    fn document_outcome(&self, document_id: &str, query: Option<&str>) -> DocumentOutcome {
        let stored = match self.inner.store.get_document(document_id) {
            Ok(stored) => stored,
            Err(StoreError::NotFound(_)) => {
                warn!(document_id, "document not found");
                return DocumentOutcome {
                    context: DocumentContext::failed(
                        document_id.to_string(),
                        format!("[Document {document_id} not found]"),
                    ),
                    found: false,
                };
            }
            Err(e) => {
                warn!(document_id, error = %e, "document unreadable");
                return DocumentOutcome {
                    context: DocumentContext::failed(
                        document_id.to_string(),
                        format!("[Error extracting text from {document_id}: {e}]"),
                    ),
                    found: true,
                };
            }
        };

        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let context = match self.prepare(document_id, &stored, query.is_some()) {
            Ok(prepared) => self.document_context(&prepared, query),
            Err(e) => {
                warn!(document_id, error = %e, "extraction failed");
                DocumentContext::failed(
                    stored.display_name.clone(),
                    format!("[Error extracting text from {}: {e}]", stored.display_name),
                )
            }
        };
        DocumentOutcome {
            context,
            found: true,
        }
    }

    fn document_context(&self, prepared: &Prepared, query: Option<&str>) -> DocumentContext {
        let index = &prepared.index;
        let first = index.first_chunk();

        let content = match (query, first) {
            (Some(query), Some(first)) if self.is_indexable(index) => {
                let scored = self
                    .inner
                    .scorer
                    .score(query, index, prepared.embeddings.as_ref());
                relevant_section_blocks(&scored, first, self.inner.retrieval.max_chunks)
            }
            _ => vec![Block::Content(index.full_text())],
        };

        DocumentContext::new(
            index.title.clone(),
            index.chapters.clone(),
            index.headings.clone(),
            content,
        )
    }

    fn is_indexable(&self, index: &ChunkIndex) -> bool {
        index.total_length > self.inner.chunking.min_index_chars
    }

    /// The current chunk index for a document, building it if needed,
    /// with its embeddings when `with_embeddings` is set or the index was
    /// just built.
    ///
    /// Only one build runs per document id, embeddings included; concurrent
    /// callers wait for it and then load the persisted result.
    fn prepare(
        &self,
        document_id: &str,
        stored: &StoredDocument,
        with_embeddings: bool,
    ) -> Result<Prepared, ExtractionError> {
        let lock = self.build_lock(document_id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.prepare_locked(document_id, stored, with_embeddings)
        };
        self.release_build_lock(document_id, lock);
        result
    }

    fn prepare_locked(
        &self,
        document_id: &str,
        stored: &StoredDocument,
        with_embeddings: bool,
    ) -> Result<Prepared, ExtractionError> {
        let hash = source_hash(&stored.bytes);
        match self.inner.indexes.load_current(document_id, &hash) {
            Ok(Some(index)) => {
                debug!(document_id, "using stored index");
                let embeddings = if with_embeddings {
                    self.inner.embeddings.get_or_compute(&index)
                } else {
                    None
                };
                return Ok(Prepared {
                    index,
                    embeddings,
                    persist_error: None,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(document_id, error = %e, "stored index unreadable; rebuilding"),
        }

        let extracted = self
            .inner
            .extractor
            .extract(&stored.bytes, &stored.media_type, &stored.display_name)?;
        let index = build_index(
            document_id,
            &hash,
            &extracted,
            self.inner.chunking.target_chars,
        );

        if !self.is_indexable(&index) {
            debug!(document_id, chars = index.total_length, "document below indexing threshold");
            self.discard_stored(document_id);
            return Ok(Prepared {
                index,
                embeddings: None,
                persist_error: None,
            });
        }

        if let Err(e) = self.inner.embeddings.remove(document_id) {
            warn!(document_id, error = %e, "failed to discard old embeddings");
        }
        let persist_error = match self.inner.indexes.save(&index) {
            Ok(()) => {
                info!(
                    document_id,
                    chunks = index.total_chunks,
                    chars = index.total_length,
                    "indexed document"
                );
                None
            }
            Err(e) => {
                warn!(document_id, error = %e, "failed to persist index; using it in memory");
                Some(e.to_string())
            }
        };
        let embeddings = self.inner.embeddings.get_or_compute(&index);
        Ok(Prepared {
            index,
            embeddings,
            persist_error,
        })
    }

    /// Remove a stored index and its vectors.
    fn discard_stored(&self, document_id: &str) {
        if let Err(e) = self.inner.indexes.remove(document_id) {
            warn!(document_id, error = %e, "failed to remove outdated index");
        }
        if let Err(e) = self.inner.embeddings.remove(document_id) {
            warn!(document_id, error = %e, "failed to remove outdated embeddings");
        }
    }

    fn build_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut builds = self
            .inner
            .builds
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        builds
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock for `document_id` once no other caller holds it.
    fn release_build_lock(&self, document_id: &str, lock: Arc<Mutex<()>>) {
        let mut builds = self
            .inner
            .builds
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if builds
            .get(document_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            builds.remove(document_id);
        }
    }
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed_store::tests::CountingEmbedder;
    use crate::extract::{MIME_HTML, MIME_TEXT};
    use crate::store::InMemoryDocumentStore;
    use doc_context_core::assemble::{FILTER_NOTE, TRUNCATION_NOTICE};
    use doc_context_core::structure::{HeadingHeuristic, LineKind, StructureDetector};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(tmp: &TempDir, min_index_chars: usize) -> Config {
        let mut cfg = Config::with_storage(tmp.path().join("docs"), tmp.path());
        cfg.chunking.target_chars = 200;
        cfg.chunking.min_index_chars = min_index_chars;
        cfg
    }

    /// A long text document with the answer buried in the middle.
    fn long_policy() -> String {
        let mut paras = vec!["STAFF POLICY".to_string(), "This policy covers all staff.".to_string()];
        for i in 0..20 {
            paras.push(format!("Filler paragraph number {i} about general operations and hours."));
        }
        paras.insert(
            12,
            "A background check is required before any new employee starts. The background check covers criminal history.".to_string(),
        );
        paras.join("\n\n")
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_query_selects_relevant_sections() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        let retriever = Retriever::new(&config(&tmp, 500), store, None);

        let out = retriever.get_context_blocking(&ids(&["policy.txt"]), Some("background check"), None);
        assert!(out.contains("--- RELEVANT SECTION 1 ---"));
        assert!(out.contains("A background check is required"));
        assert!(out.contains("This policy covers all staff."));
        assert!(out.contains(FILTER_NOTE));
        assert!(out.contains("### DOCUMENT HEADINGS ###\n--- HEADINGS FROM policy.txt ---\nSTAFF POLICY"));
        assert!(!out.contains("Filler paragraph number 19"));
    }

    #[test]
    fn test_no_query_returns_full_text() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        let retriever = Retriever::new(&config(&tmp, 500), store, None);

        for query in [None, Some("   ")] {
            let out = retriever.get_context_blocking(&ids(&["policy.txt"]), query, None);
            assert!(out.contains("Filler paragraph number 0"));
            assert!(out.contains("Filler paragraph number 19"));
            assert!(!out.contains("RELEVANT SECTION"));
        }
    }

    #[test]
    fn test_small_documents_are_returned_whole_and_not_persisted() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("memo.txt", "Short memo about parking.", MIME_TEXT, "memo.txt");
        let cfg = config(&tmp, 10_000);
        let retriever = Retriever::new(&cfg, store, None);

        let out = retriever.get_context_blocking(&ids(&["memo.txt"]), Some("unrelated words"), None);
        assert!(out.contains("Short memo about parking."));
        assert!(out.contains("*** IMPORTANT DOCUMENT ***"));
        assert!(!IndexStore::new(&cfg.storage.index_dir).path_for("memo.txt").exists());
    }

    #[test]
    fn test_missing_and_failed_documents() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("bad.pdf", "definitely not a pdf", "application/pdf", "bad.pdf");
        store.insert("ok.txt", "Fine text.", MIME_TEXT, "ok.txt");
        let retriever = Retriever::new(&config(&tmp, 10_000), store, None);

        assert_eq!(retriever.get_context_blocking(&ids(&["nope"]), None, None), NO_DOCUMENTS);
        assert_eq!(retriever.get_context_blocking(&[], None, None), NO_DOCUMENTS);

        let out = retriever.get_context_blocking(&ids(&["bad.pdf", "nope", "ok.txt"]), None, None);
        assert!(out.contains("[Error extracting text from bad.pdf: invalid format"));
        assert!(out.contains("[Document nope not found]"));
        assert!(out.contains("Fine text."));
    }

    #[test]
    fn test_budget_is_respected() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        let retriever = Retriever::new(&config(&tmp, 500), store, None);

        let out = retriever.get_context_blocking(&ids(&["policy.txt"]), None, Some(300));
        assert!(out.chars().count() <= 300 + TRUNCATION_NOTICE.chars().count());
        assert!(out.ends_with(TRUNCATION_NOTICE));
    }

    #[test]
    fn test_index_reused_until_source_changes() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        let cfg = config(&tmp, 500);
        let retriever = Retriever::new(&cfg, store.clone(), None);

        retriever.get_context_blocking(&ids(&["policy.txt"]), Some("background"), None);
        let indexes = IndexStore::new(&cfg.storage.index_dir);
        let first = indexes.load("policy.txt").unwrap().unwrap();

        retriever.get_context_blocking(&ids(&["policy.txt"]), Some("background"), None);
        let second = indexes.load("policy.txt").unwrap().unwrap();
        assert_eq!(first.indexed_at, second.indexed_at);

        store.insert(
            "policy.txt",
            format!("{}\n\nA brand new closing paragraph.", long_policy()),
            MIME_TEXT,
            "policy.txt",
        );
        let out = retriever.get_context_blocking(&ids(&["policy.txt"]), None, None);
        assert!(out.contains("A brand new closing paragraph."));
        let third = indexes.load("policy.txt").unwrap().unwrap();
        assert_ne!(first.source_hash, third.source_hash);
    }

    #[test]
    fn test_embedding_failure_falls_back_to_keywords() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        let embedder = Arc::new(CountingEmbedder::failing());
        let retriever = Retriever::new(&config(&tmp, 500), store, Some(embedder));
        assert!(retriever.capabilities().embeddings_enabled());

        let out = retriever.get_context_blocking(&ids(&["policy.txt"]), Some("background check"), None);
        assert!(out.contains("A background check is required"));
        assert!(!retriever.capabilities().embeddings_enabled());
    }

    #[test]
    fn test_embeddings_are_computed_once_and_persisted() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        let cfg = config(&tmp, 500);
        let embedder = Arc::new(CountingEmbedder::new());
        let retriever = Retriever::new(&cfg, store, Some(embedder.clone()));

        retriever.get_context_blocking(&ids(&["policy.txt"]), Some("background check"), None);
        retriever.get_context_blocking(&ids(&["policy.txt"]), Some("staff hours"), None);
        // one batch for the chunks, one per query
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        let report = retriever.inspect("policy.txt").unwrap().unwrap();
        assert!(report.has_embeddings);
        assert!(!report.stale);
    }

    struct CountingDetector {
        lines: AtomicUsize,
    }

    impl StructureDetector for CountingDetector {
        fn classify(&self, line: &str) -> LineKind {
            self.lines.fetch_add(1, Ordering::SeqCst);
            HeadingHeuristic.classify(line)
        }
    }

    #[test]
    fn test_concurrent_requests_build_once() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        let detector = Arc::new(CountingDetector {
            lines: AtomicUsize::new(0),
        });
        let retriever = Retriever::with_extractor(
            &config(&tmp, 500),
            store,
            None,
            Extractor::new(detector.clone()),
        );

        std::thread::scope(|s| {
            for _ in 0..8 {
                let retriever = retriever.clone();
                s.spawn(move || {
                    retriever.get_context_blocking(&ids(&["policy.txt"]), Some("background"), None)
                });
            }
        });

        let non_blank_lines = long_policy().lines().filter(|l| !l.trim().is_empty()).count();
        assert_eq!(detector.lines.load(Ordering::SeqCst), non_blank_lines);
    }

    /// Sleeps on chunk batches so concurrent callers overlap.
    struct SlowEmbedder {
        batches: AtomicUsize,
    }

    impl Embedder for SlowEmbedder {
        fn model_name(&self) -> &str {
            "slow"
        }

        fn dims(&self) -> usize {
            2
        }

        fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if texts.len() > 1 {
                self.batches.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[test]
    fn test_concurrent_queries_embed_stored_index_once() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        let cfg = config(&tmp, 500);

        // index persisted without vectors
        let report = Retriever::new(&cfg, store.clone(), None).index_documents(&ids(&["policy.txt"]));
        assert_eq!(report.indexed, vec!["policy.txt"]);

        let embedder = Arc::new(SlowEmbedder {
            batches: AtomicUsize::new(0),
        });
        let retriever = Retriever::new(&cfg, store, Some(embedder.clone()));
        std::thread::scope(|s| {
            for _ in 0..8 {
                let retriever = retriever.clone();
                s.spawn(move || {
                    retriever.get_context_blocking(&ids(&["policy.txt"]), Some("background check"), None)
                });
            }
        });

        assert_eq!(embedder.batches.load(Ordering::SeqCst), 1);
        assert!(retriever.inspect("policy.txt").unwrap().unwrap().has_embeddings);
        assert!(retriever.inner.builds.lock().unwrap().is_empty());
    }

    #[test]
    fn test_build_locks_are_released() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        store.insert("memo.txt", "Short memo.", MIME_TEXT, "memo.txt");
        let retriever = Retriever::new(&config(&tmp, 500), store, None);

        retriever.get_context_blocking(&ids(&["policy.txt", "memo.txt", "nope"]), Some("background"), None);
        retriever.index_documents(&ids(&["policy.txt"]));
        assert!(retriever.inner.builds.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unwritable_index_dir_is_reported() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let mut cfg = config(&tmp, 500);
        cfg.storage.index_dir = blocker.join("indexes");
        let retriever = Retriever::new(&cfg, store, None);

        let report = retriever.index_documents(&ids(&["policy.txt"]));
        assert!(report.indexed.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "policy.txt");
        assert!(report.failed[0].1.starts_with("index not persisted"));

        // the in-memory index still answers queries
        let out = retriever.get_context_blocking(&ids(&["policy.txt"]), Some("background check"), None);
        assert!(out.contains("A background check is required"));
    }

    #[test]
    fn test_shrunk_document_drops_stored_index_and_embeddings() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        let cfg = config(&tmp, 500);
        let retriever = Retriever::new(&cfg, store.clone(), Some(Arc::new(CountingEmbedder::new())));

        retriever.index_documents(&ids(&["policy.txt"]));
        let index_path = retriever.inner.indexes.path_for("policy.txt");
        let vectors_path = retriever.inner.embeddings.path_for("policy.txt");
        assert!(index_path.exists());
        assert!(vectors_path.exists());

        store.insert("policy.txt", "Policy withdrawn.", MIME_TEXT, "policy.txt");
        let out = retriever.get_context_blocking(&ids(&["policy.txt"]), Some("background"), None);
        assert!(out.contains("Policy withdrawn."));
        assert!(!index_path.exists());
        assert!(!vectors_path.exists());
        assert!(retriever.inspect("policy.txt").unwrap().is_none());
    }

    #[test]
    fn test_index_documents_report() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        store.insert("memo.txt", "tiny", MIME_TEXT, "memo.txt");
        store.insert("page.html", "", MIME_HTML, "page.html");
        let retriever = Retriever::new(&config(&tmp, 500), store, None);

        let report = retriever.index_all().unwrap();
        assert_eq!(report.indexed, vec!["policy.txt"]);
        assert_eq!(report.skipped, vec!["memo.txt"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "page.html");
    }

    #[tokio::test]
    async fn test_async_matches_blocking() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert("policy.txt", long_policy(), MIME_TEXT, "policy.txt");
        store.insert("memo.txt", "Short memo.", MIME_TEXT, "memo.txt");
        let retriever = Retriever::new(&config(&tmp, 500), store, None);
        let wanted = ids(&["policy.txt", "memo.txt", "policy.txt"]);

        let async_out = retriever.get_context(&wanted, Some("background check"), None).await;
        let blocking = retriever.clone();
        let blocking_out = tokio::task::spawn_blocking(move || {
            blocking.get_context_blocking(&wanted, Some("background check"), None)
        })
        .await
        .unwrap();
        assert_eq!(async_out, blocking_out);
        assert_eq!(async_out.matches("--- DOCUMENT CONTENT: policy.txt ---").count(), 1);
    }
}
