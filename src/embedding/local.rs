//! In-process embeddings via fastembed.
//!
//! The model is downloaded from Hugging Face on first use and cached; it is
//! loaded lazily on the first `embed` call so that constructing the
//! retriever stays cheap.

use std::sync::Mutex;

use anyhow::{bail, Result};
use tracing::info;

use doc_context_core::embedding::Embedder;

use crate::config::EmbeddingConfig;

pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Mutex<Option<fastembed::TextEmbedding>>,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        // validate the name up front rather than on first query
        config_to_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
            "multilingual-e5-base" => 768,
            "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
            _ => 384,
        });
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size.max(1),
            model: Mutex::new(None),
        })
    }
}

fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
        if guard.is_none() {
            info!(model = %self.model_name, "loading local embedding model");
            let model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(config_to_fastembed_model(&self.model_name)?)
                    .with_show_download_progress(false),
            )
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
            *guard = Some(model);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("local embedding model not loaded"))?;
        model
            .embed(texts.to_vec(), Some(self.batch_size))
            .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
    }
}
