//! # doc-context core
//!
//! Pure retrieval logic for doc-context: data models, structure detection,
//! paragraph chunking, the embedder trait, hybrid scoring, and context
//! assembly.
//!
//! This crate performs no filesystem or network I/O. Extraction of raw
//! document bytes, index persistence, and concrete embedding backends live
//! in the `doc-context` application crate.

pub mod assemble;
pub mod capabilities;
pub mod chunk;
pub mod embedding;
pub mod models;
pub mod score;
pub mod structure;
