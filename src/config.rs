use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Directory holding the embedding/metadata/ann snapshot files.
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    500
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_topk")]
    pub topk: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            topk: default_topk(),
            min_similarity: default_min_similarity(),
            lexical_weight: default_lexical_weight(),
        }
    }
}

fn default_topk() -> usize {
    10
}
fn default_min_similarity() -> f32 {
    0.0
}
fn default_lexical_weight() -> f32 {
    0.3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_rerank_depth")]
    pub depth: usize,
    #[serde(default = "default_rerank_batch")]
    pub batch_size: usize,
    #[serde(default)]
    pub min_score: f32,
}

fn default_rerank_depth() -> usize {
    20
}
fn default_rerank_batch() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
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

impl EmbeddingConfig {
    /// Vector dimensionality the index is built with.
    pub fn resolved_dims(&self) -> usize {
        self.dims.unwrap_or(256)
    }
}

fn default_provider() -> String {
    "hash".to_string()
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

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            debounce_ms: default_debounce_ms(),
            allowed_extensions: default_allowed_extensions(),
            io_workers: default_io_workers(),
        }
    }
}

impl WatchConfig {
    /// Normalized allowed-extension set (lowercase, leading dot).
    pub fn allowed_ext_set(&self) -> HashSet<String> {
        self.allowed_extensions
            .iter()
            .map(|e| {
                let e = e.trim().to_lowercase();
                if e.starts_with('.') {
                    e
                } else {
                    format!(".{}", e)
                }
            })
            .collect()
    }
}

fn default_debounce_ms() -> u64 {
    1500
}
fn default_allowed_extensions() -> Vec<String> {
    [".txt", ".md", ".csv", ".log", ".pdf", ".docx", ".hwp", ".xlsx", ".pptx"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}
fn default_io_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// "snapshot" (JSON file) or "sqlite" for large corpora.
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Snapshot file path; defaults to `chunk_cache.json` under the
    /// index directory.
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            max_entries: default_cache_max_entries(),
            snapshot: None,
        }
    }
}

fn default_cache_backend() -> String {
    "snapshot".to_string()
}
fn default_cache_max_entries() -> usize {
    100_000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Path of the scan ledger file, kept next to the index snapshot.
    pub fn ledger_path(&self) -> PathBuf {
        self.index.dir.join("scan_ledger.csv")
    }

    /// Path of the chunk cache snapshot file.
    pub fn cache_snapshot_path(&self) -> PathBuf {
        self.cache
            .snapshot
            .clone()
            .unwrap_or_else(|| self.index.dir.join("chunk_cache.json"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    if config.retrieval.topk < 1 {
        anyhow::bail!("retrieval.topk must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }
    if config.retrieval.lexical_weight < 0.0 {
        anyhow::bail!("retrieval.lexical_weight must be >= 0");
    }

    if config.rerank.enabled {
        if config.rerank.depth == 0 {
            anyhow::bail!("rerank.depth must be >= 1 when rerank is enabled");
        }
        if config.rerank.url.is_none() {
            anyhow::bail!("rerank.url must be set when rerank is enabled");
        }
    }

    match config.embedding.provider.as_str() {
        "hash" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, ollama, or local.",
            other
        ),
    }
    if config.embedding.provider == "ollama"
        && (config.embedding.model.is_none() || config.embedding.dims.is_none())
    {
        anyhow::bail!("embedding.model and embedding.dims are required for the ollama provider");
    }

    if config.watch.debounce_ms == 0 {
        anyhow::bail!("watch.debounce_ms must be > 0");
    }

    match config.cache.backend.as_str() {
        "snapshot" | "sqlite" => {}
        other => anyhow::bail!("Unknown cache backend: '{}'. Must be snapshot or sqlite.", other),
    }

    Ok(config)
}
