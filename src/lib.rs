//! # doc-context
//!
//! Query-focused context retrieval over document collections.
//!
//! Given a list of document ids and an optional question, doc-context returns
//! one text block that fits a character budget: the titles, chapters and
//! headings of every document, then the passages most relevant to the
//! question. Documents are extracted (PDF, HTML, DOCX, plain text), split
//! into paragraph-aligned chunks, persisted as JSON indexes, and scored with
//! a keyword heuristic optionally fused with embedding similarity.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ DocumentStore│──▶│  Extractor   │──▶│  IndexStore   │
//! │  fs / memory │   │ PDF/HTML/... │   │ JSON + vectors│
//! └──────────────┘   └─────────────┘   └──────┬───────┘
//!                                             │
//!                         ┌───────────────────┤
//!                         ▼                   ▼
//!                   ┌────────────┐      ┌────────────┐
//!                   │HybridScorer│─────▶│  Assembly   │
//!                   └────────────┘      └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docctx index --all
//! docctx context handbook.pdf --query "background check requirements"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`store`] | Document stores (filesystem, in-memory) |
//! | [`extract`] | PDF, HTML, DOCX and text extraction |
//! | [`index`] | Persistent chunk indexes |
//! | [`embedding`] | Embedding backends (OpenAI, Ollama, local) |
//! | [`embed_store`] | Cached per-document embeddings |
//! | [`retrieve`] | The retrieval entry points |
//!
//! Chunking, scoring and assembly live in the `doc-context-core` crate.

pub mod config;
pub mod embed_store;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod retrieve;
pub mod store;

pub use doc_context_core as core;
