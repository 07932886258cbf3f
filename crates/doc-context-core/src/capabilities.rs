//! Runtime retrieval capabilities.
//!
//! [`RetrievalCapabilities`] is shared (via `Arc`) between the scorer and
//! the embedding store of one retriever instance. Any embedding failure
//! flips it to keyword-only, and it stays that way for the lifetime of the
//! instance. There is no path back to semantic scoring short of building a
//! new instance.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct RetrievalCapabilities {
    embeddings: AtomicBool,
}

impl RetrievalCapabilities {
    pub fn new(embeddings_enabled: bool) -> Self {
        Self {
            embeddings: AtomicBool::new(embeddings_enabled),
        }
    }

    /// Capabilities with semantic scoring switched off from the start.
    pub fn keyword_only() -> Self {
        Self::new(false)
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.embeddings.load(Ordering::Acquire)
    }

    /// Permanently switch this instance to keyword-only scoring.
    ///
    /// Returns `true` if this call performed the switch.
    pub fn disable_embeddings(&self) -> bool {
        self.embeddings.swap(false, Ordering::AcqRel)
    }
}

impl Default for RetrievalCapabilities {
    fn default() -> Self {
        Self::new(true)
    }
}
