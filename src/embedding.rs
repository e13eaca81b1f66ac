//! Embedding provider abstraction and implementations.
//!
//! The embedding model is an external collaborator: text in, vector out.
//! Concrete backends:
//! - **[`HashEmbedder`]** — deterministic feature-hashing vectors; fully
//!   offline, used as the guaranteed fallback and in tests.
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's
//!   `/api/embed` endpoint with batching, retry, and backoff.
//! - **`FastembedEmbedder`** — runs models locally via fastembed
//!   (feature `local-embeddings-fastembed`); no network after download.
//!
//! # Retry Strategy
//!
//! The Ollama backend retries transient errors with exponential backoff:
//! HTTP 429 and 5xx retry, other 4xx fail immediately, network errors
//! retry. Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5).

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::lexical::tokenize;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;

    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, preserving input order. Encoding runs in
    /// sub-batches of `batch_size`.
    async fn encode(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let results = embedder.encode(&[text.to_string()], 1).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
}

// ============ Hashing Embedder ============

/// Deterministic feature-hashing embedder.
///
/// Each token is hashed into a bucket of a fixed-dimension vector and the
/// result is L2-normalized. No model, no network, stable across runs —
/// token overlap translates into cosine similarity.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().expect("8-byte prefix"))
                as usize
                % self.dims;
            // Second hash bit decides the sign, spreading collisions.
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "feature-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, texts: &[String], _batch_size: usize) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Ollama Embedder ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires an embedding model pulled, e.g.
/// `ollama pull nomic-embed-text`.
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    timeout_secs: u64,
    max_retries: u32,
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
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model,
            dims,
            url,
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(format!("{}/api/embed", self.url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_ollama_response(&json);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Ollama API error {}: {}", status, body_text));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Ollama API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Ollama embedding failed after retries")))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size.max(1)) {
            out.extend(self.encode_batch(batch).await?);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

// ============ Fastembed Embedder (feature-gated) ============

/// Local inference via fastembed; models are downloaded on first use and
/// cached, after which embeddings run entirely offline.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct FastembedEmbedder {
    model_name: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl FastembedEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "all-minilm-l6-v2" => 384,
            "bge-small-en-v1.5" => 384,
            "bge-base-en-v1.5" => 768,
            "multilingual-e5-small" => 384,
            "multilingual-e5-base" => 768,
            "multilingual-e5-large" => 1024,
            _ => 384,
        });
        Ok(Self { model_name, dims })
    }

    fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
        match name {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
            "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
            "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported: all-minilm-l6-v2, \
                 bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small, \
                 multilingual-e5-base, multilingual-e5-large",
                other
            ),
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for FastembedEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        let model = Self::fastembed_model(&self.model_name)?;
        let texts = texts.to_vec();
        let batch = batch_size.max(1);
        tokio::task::spawn_blocking(move || {
            let mut engine = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(model).with_show_download_progress(false),
            )
            .map_err(|e| anyhow::anyhow!("failed to initialize local embedding model: {}", e))?;
            engine
                .embed(texts, Some(batch))
                .map_err(|e| anyhow::anyhow!("local embedding failed: {}", e))
        })
        .await?
    }
}

/// Create the appropriate [`Embedder`] from configuration.
///
/// | Config value | Provider |
/// |--------------|----------|
/// | `"hash"` | [`HashEmbedder`] (default) |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `FastembedEmbedder` (needs `local-embeddings-fastembed`) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashEmbedder::new(config.dims.unwrap_or(256)))),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(FastembedEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!(
            "Local embedding provider requires --features local-embeddings-fastembed"
        ),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Cosine similarity between two embedding vectors, in `[-1, 1]`.
/// Returns `0.0` for empty or mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
