//! Embedding backends.
//!
//! Concrete implementations of [`Embedder`]:
//! - **[`OpenAIEmbedder`]** calls the OpenAI embeddings API.
//! - **[`OllamaEmbedder`]** calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`** runs a fastembed model in-process (feature
//!   `local-embeddings`); no network calls after model download.
//!
//! All backends are blocking and batch their input by
//! `embedding.batch_size`. The retriever only calls them from worker threads.
//!
//! # Retry Strategy
//!
//! The HTTP backends use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

#[cfg(feature = "local-embeddings")]
mod local;

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use doc_context_core::embedding::Embedder;

use crate::config::EmbeddingConfig;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Connection and retry settings shared by the HTTP backends.
#[derive(Debug, Clone)]
struct HttpSettings {
    base_url: String,
    batch_size: usize,
    max_retries: u32,
    timeout: Duration,
    backoff_base: Duration,
}

impl HttpSettings {
    fn from_config(config: &EmbeddingConfig, default_url: &str) -> Self {
        Self {
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| default_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
            backoff_base: Duration::from_secs(1),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * (1u32 << (attempt - 1).min(5))
    }
}

/// POST `body` to `url`, retrying transient failures. Returns the parsed
/// JSON response.
fn post_json_with_retry(
    settings: &HttpSettings,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    label: &str,
) -> Result<serde_json::Value> {
    let client = reqwest::blocking::Client::builder()
        .timeout(settings.timeout)
        .build()?;

    let mut last_err = None;

    for attempt in 0..=settings.max_retries {
        if attempt > 0 {
            let delay = settings.backoff(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "{label} retry");
            std::thread::sleep(delay);
        }

        let mut request = client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        match request.send() {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json()?);
                }

                let body_text = response.text().unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(%status, attempt, "{label} transient error");
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                warn!(error = %e, attempt, "{label} request failed");
                last_err = Some(anyhow::anyhow!("{} connection error ({}): {}", label, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", label)))
}

fn check_shape(vectors: &[Vec<f32>], expected: usize, dims: usize, label: &str) -> Result<()> {
    if vectors.len() != expected {
        bail!(
            "{} returned {} embeddings for {} inputs",
            label,
            vectors.len(),
            expected
        );
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        bail!(
            "{} returned {}-dimensional embeddings, expected {}",
            label,
            v.len(),
            dims
        );
    }
    Ok(())
}

fn json_vector(value: &serde_json::Value, label: &str) -> Result<Vec<f32>> {
    let arr = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid {} response: embedding is not an array", label))?;
    Ok(arr
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ OpenAI ============

/// Embedder backed by `POST {url}/embeddings` (default
/// `https://api.openai.com/v1`). Requires an API key, normally from
/// `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    http: HttpSettings,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        Ok(Self {
            model,
            dims,
            api_key,
            http: HttpSettings::from_config(config, OPENAI_DEFAULT_URL),
        })
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/embeddings", self.http.base_url);
        let json = post_json_with_retry(&self.http, &url, Some(&self.api_key), &body, "OpenAI")?;
        parse_openai_response(&json)
    }
}

impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.http.batch_size) {
            let vectors = self.embed_batch(batch)?;
            check_shape(&vectors, batch.len(), self.dims, "OpenAI")?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(pos, |i| i as usize);
        indexed.push((index, json_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embedder backed by a local Ollama instance (`POST {url}/api/embed`,
/// default `http://localhost:11434`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    http: HttpSettings,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        Ok(Self {
            model,
            dims,
            http: HttpSettings::from_config(config, OLLAMA_DEFAULT_URL),
        })
    }
}

impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.http.base_url);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.http.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let json = post_json_with_retry(&self.http, &url, None, &body, "Ollama")?;
            let vectors = parse_ollama_response(&json)?;
            check_shape(&vectors, batch.len(), self.dims, "Ollama")?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|e| json_vector(e, "Ollama"))
        .collect()
}

/// Build the embedder selected by `embedding.provider`.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | none: keyword-only retrieval |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires the `local-embeddings` feature) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAIEmbedder::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaEmbedder::new(config)?))),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Some(Arc::new(LocalEmbedder::new(config)?))),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    /// Serve one canned response per connection; returns the base URL and a
    /// handle yielding the request bodies received.
    fn serve(responses: Vec<(u16, String)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let mut bodies = Vec::new();
            for (status, body) in responses {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().unwrap();
                        }
                    }
                }
                let mut request_body = vec![0u8; content_length];
                reader.read_exact(&mut request_body).unwrap();
                bodies.push(String::from_utf8(request_body).unwrap());

                let mut stream = reader.into_inner();
                write!(
                    stream,
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
                .unwrap();
                stream.flush().unwrap();
            }
            bodies
        });
        (url, handle)
    }

    fn config(provider: &str, url: &str, dims: usize, batch_size: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: provider.to_string(),
            model: Some("test-model".to_string()),
            dims: Some(dims),
            url: Some(url.to_string()),
            batch_size,
            max_retries: 2,
            timeout_secs: 5,
        }
    }

    fn fast(mut http: HttpSettings) -> HttpSettings {
        http.backoff_base = Duration::from_millis(1);
        http
    }

    #[test]
    fn test_ollama_batches_and_retries() {
        let (url, handle) = serve(vec![
            (503, "{\"error\":\"loading\"}".to_string()),
            (200, "{\"embeddings\":[[1.0,0.0],[0.0,1.0]]}".to_string()),
            (200, "{\"embeddings\":[[0.5,0.5]]}".to_string()),
        ]);
        let mut embedder = OllamaEmbedder::new(&config("ollama", &url, 2, 2)).unwrap();
        embedder.http = fast(embedder.http);

        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vectors = embedder.embed(&texts).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]]);

        let bodies = handle.join().unwrap();
        assert_eq!(bodies.len(), 3);
        assert!(bodies[1].contains("\"input\":[\"a\",\"b\"]"));
        assert!(bodies[2].contains("\"input\":[\"c\"]"));
    }

    #[test]
    fn test_openai_client_error_is_not_retried() {
        let (url, handle) = serve(vec![(400, "{\"error\":\"bad input\"}".to_string())]);
        let mut embedder =
            OpenAIEmbedder::with_api_key(&config("openai", &url, 3, 8), "sk-test".into()).unwrap();
        embedder.http = fast(embedder.http);

        let err = embedder.embed(&["x".to_string()]).unwrap_err();
        assert!(err.to_string().contains("400"), "{err}");
        assert_eq!(handle.join().unwrap().len(), 1);
    }

    #[test]
    fn test_wrong_dimensions_are_rejected() {
        let (url, handle) = serve(vec![(
            200,
            "{\"data\":[{\"index\":0,\"embedding\":[1.0,2.0]}]}".to_string(),
        )]);
        let embedder =
            OpenAIEmbedder::with_api_key(&config("openai", &url, 3, 8), "sk-test".into()).unwrap();
        let err = embedder.embed(&["x".to_string()]).unwrap_err();
        assert!(err.to_string().contains("expected 3"), "{err}");
        handle.join().unwrap();
    }

    #[test]
    fn test_openai_response_ordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        assert_eq!(
            parse_openai_response(&json).unwrap(),
            vec![vec![1.0, 0.0], vec![0.0, 1.0]]
        );
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_create_embedder_disabled() {
        assert!(create_embedder(&EmbeddingConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_create_embedder_unknown() {
        let cfg = EmbeddingConfig {
            provider: "cohere".into(),
            ..Default::default()
        };
        assert!(create_embedder(&cfg).is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let http = HttpSettings::from_config(&EmbeddingConfig::default(), OLLAMA_DEFAULT_URL);
        assert_eq!(http.backoff(1), Duration::from_secs(1));
        assert_eq!(http.backoff(3), Duration::from_secs(4));
        assert_eq!(http.backoff(12), Duration::from_secs(32));
    }
}
