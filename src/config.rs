//! Configuration parsing and validation.
//!
//! `docctx` is configured via a TOML file (default: `./config/docctx.toml`).
//! Only `[storage]` is required; every other section falls back to defaults.
//!
//! ```toml
//! [storage]
//! documents_dir = "./documents"
//! index_dir = "./data/indexes"
//! embedding_dir = "./data/embeddings"
//!
//! [chunking]
//! target_chars = 5000
//! min_index_chars = 10000
//!
//! [retrieval]
//! max_chunks = 5
//! max_context_chars = 100000
//! semantic_weight = 0.7
//! keyword_ceiling = 10.0
//! important_doc_chars = 1000
//!
//! [embedding]
//! provider = "ollama"            # disabled | openai | ollama | local
//! model = "nomic-embed-text"
//! dims = 768
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use doc_context_core::chunk::DEFAULT_TARGET_CHARS;
use doc_context_core::score::FusionWeights;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of the filesystem document store. Document ids are paths
    /// relative to this directory.
    pub documents_dir: PathBuf,
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,
    #[serde(default = "default_embedding_dir")]
    pub embedding_dir: PathBuf,
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/indexes")
}
fn default_embedding_dir() -> PathBuf {
    PathBuf::from("./data/embeddings")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_chars")]
    pub target_chars: usize,
    /// Bodies at or below this many characters are never chunked or
    /// persisted; they are returned whole.
    #[serde(default = "default_min_index_chars")]
    pub min_index_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chars: default_target_chars(),
            min_index_chars: default_min_index_chars(),
        }
    }
}

fn default_target_chars() -> usize {
    DEFAULT_TARGET_CHARS
}
fn default_min_index_chars() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_keyword_ceiling")]
    pub keyword_ceiling: f64,
    #[serde(default = "default_important_doc_chars")]
    pub important_doc_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_chunks: default_max_chunks(),
            max_context_chars: default_max_context_chars(),
            semantic_weight: default_semantic_weight(),
            keyword_ceiling: default_keyword_ceiling(),
            important_doc_chars: default_important_doc_chars(),
        }
    }
}

impl RetrievalConfig {
    pub fn fusion_weights(&self) -> FusionWeights {
        FusionWeights {
            semantic_weight: self.semantic_weight,
            keyword_ceiling: self.keyword_ceiling,
        }
    }
}

fn default_max_chunks() -> usize {
    5
}
fn default_max_context_chars() -> usize {
    100_000
}
fn default_semantic_weight() -> f64 {
    0.7
}
fn default_keyword_ceiling() -> f64 {
    10.0
}
fn default_important_doc_chars() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// A default configuration over `documents_dir`, with indexes and
    /// embeddings stored under `data_dir`.
    pub fn with_storage(documents_dir: impl Into<PathBuf>, data_dir: &Path) -> Self {
        Self {
            storage: StorageConfig {
                documents_dir: documents_dir.into(),
                index_dir: data_dir.join("indexes"),
                embedding_dir: data_dir.join("embeddings"),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.target_chars == 0 {
            anyhow::bail!("chunking.target_chars must be > 0");
        }

        if self.retrieval.max_context_chars == 0 {
            anyhow::bail!("retrieval.max_context_chars must be > 0");
        }
        if self.retrieval.max_chunks == 0 {
            anyhow::bail!("retrieval.max_chunks must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.semantic_weight) {
            anyhow::bail!("retrieval.semantic_weight must be in [0.0, 1.0]");
        }
        if self.retrieval.keyword_ceiling.is_nan() || self.retrieval.keyword_ceiling <= 0.0 {
            anyhow::bail!("retrieval.keyword_ceiling must be > 0");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "local" => {}
            "openai" | "ollama" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    anyhow::bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.model.is_none() {
                    anyhow::bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
                other
            ),
        }
        if self.embedding.is_enabled() && self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
