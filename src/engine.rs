//! Engine context: one explicitly-constructed object owning the
//! configuration, the collaborators, and the mutable state every
//! component needs. Nothing here is a global; construction and teardown
//! are explicit, and all capability choices (embedding provider, ANN
//! acceleration, reranker) are resolved once, at construction time.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::cache::{DocCache, SnapshotCache, SqliteCache};
use crate::cancel::CancelFlag;
use crate::chunker::{Chunker, ChunkerConfig};
use crate::config::Config;
use crate::corpus;
use crate::db;
use crate::embedding::{create_embedder, embed_query, Embedder};
use crate::extractor::{Extractor, IdentityTranslator, PlainTextExtractor, Translator};
use crate::hints::HintTables;
use crate::index::IndexHandle;
use crate::ledger;
use crate::mask::{PiiMasker, RegexMasker};
use crate::models::SearchHit;
use crate::policy::{AccessPolicy, AllowAllPolicy, GlobPolicy};
use crate::rerank::{apply_rerank, create_reranker, Reranker};
use crate::scorer::{self, Candidate, RankRequest};
use crate::session::SessionState;

/// Vector-search candidates fetched per requested hit, before fusion.
const CANDIDATE_FACTOR: usize = 5;
const MIN_CANDIDATES: usize = 50;

pub struct Engine {
    pub config: Config,
    pub pool: SqlitePool,
    pub index: IndexHandle,
    pub cache: Box<dyn DocCache>,
    pub hints: HintTables,
    pub chunker: Chunker,
    pub embedder: Box<dyn Embedder>,
    pub reranker: Box<dyn Reranker>,
    pub extractor: Arc<dyn Extractor>,
    pub masker: Box<dyn PiiMasker>,
    pub translator: Box<dyn Translator>,
    pub cancel: CancelFlag,
    session: RwLock<SessionState>,
    policy: RwLock<Arc<dyn AccessPolicy>>,
    writer: Mutex<()>,
}

/// Counts shown by `ddx status`.
#[derive(Debug)]
pub struct StatusReport {
    pub ledger_rows: usize,
    pub corpus_rows: i64,
    pub index_entries: usize,
    pub cache_entries: usize,
    pub index_ready: bool,
}

impl Engine {
    /// Build the engine: connect storage, select collaborators, and
    /// start loading the index snapshot in the background.
    pub async fn new(config: Config) -> Result<Engine> {
        let pool = db::connect(&config).await?;
        db::migrate(&pool).await?;
        std::fs::create_dir_all(&config.index.dir)
            .with_context(|| format!("creating index dir {}", config.index.dir.display()))?;

        let cache: Box<dyn DocCache> = match config.cache.backend.as_str() {
            "sqlite" => Box::new(SqliteCache::new(pool.clone(), config.cache.max_entries)),
            _ => Box::new(SnapshotCache::open(
                &config.cache_snapshot_path(),
                config.cache.max_entries,
            )),
        };

        let policy: Arc<dyn AccessPolicy> = match &config.policy.path {
            Some(path) => Arc::new(
                GlobPolicy::load(path)
                    .with_context(|| format!("loading policy file {}", path.display()))?,
            ),
            None => Arc::new(AllowAllPolicy),
        };

        let embedder = create_embedder(&config.embedding)?;
        let reranker = create_reranker(&config.rerank)?;
        let index = IndexHandle::open_background(
            config.embedding.resolved_dims(),
            config.index.dir.clone(),
        );
        let chunker = Chunker::new(ChunkerConfig {
            max_tokens: config.chunking.max_tokens,
            overlap_tokens: config.chunking.overlap_tokens,
        });

        info!(
            embedder = embedder.model_name(),
            reranker = reranker.name(),
            "engine initialized"
        );

        Ok(Engine {
            hints: HintTables::new(),
            chunker,
            embedder,
            reranker,
            extractor: Arc::new(PlainTextExtractor),
            masker: Box::new(RegexMasker::new()),
            translator: Box::new(IdentityTranslator),
            cancel: CancelFlag::new(),
            session: RwLock::new(SessionState::new()),
            policy: RwLock::new(policy),
            writer: Mutex::new(()),
            cache,
            index,
            pool,
            config,
        })
    }

    /// The pipeline's single-logical-writer discipline: every cycle
    /// holds this guard across its ledger/corpus/index mutations.
    pub async fn writer_lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    pub fn policy_snapshot(&self) -> Arc<dyn AccessPolicy> {
        Arc::clone(&self.policy.read().unwrap())
    }

    pub fn set_policy(&self, policy: Arc<dyn AccessPolicy>) {
        *self.policy.write().unwrap() = policy;
    }

    /// Session feedback hook: the user opened a hit.
    pub fn record_click(&self, ext: &str, owner: &str) {
        self.session.write().unwrap().observe_click(ext, owner);
    }

    /// Answer a top-k query: hint analysis → query expansion → embedding
    /// → vector candidates → hybrid fusion → optional rerank → soft
    /// extension filter.
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let top_k = top_k.unwrap_or(self.config.retrieval.topk);

        let hints = self.hints.analyze(query);
        let lexical_weight = self.config.retrieval.lexical_weight + hints.lexical_boost;
        let query_tokens = crate::lexical::tokenize(&hints.expanded_query);
        let query_vec = embed_query(self.embedder.as_ref(), &hints.expanded_query).await?;

        let candidates: Vec<Candidate> = {
            let index = self.index.read().await;
            index
                .search(&query_vec, (top_k * CANDIDATE_FACTOR).max(MIN_CANDIDATES))
                .into_iter()
                .map(|(entry, similarity)| Candidate {
                    entry: entry.clone(),
                    vector_similarity: similarity,
                })
                .collect()
        };

        let session = self.session.read().unwrap().clone();
        let request = RankRequest {
            query_tokens: &query_tokens,
            desired_exts: &hints.desired_exts,
            lexical_weight,
            hint_reasons: &hints.reasons,
            session: &session,
            min_similarity: self.config.retrieval.min_similarity,
        };
        let mut hits = scorer::score_candidates(candidates, &request);

        if self.config.rerank.enabled {
            hits = apply_rerank(
                self.reranker.as_ref(),
                query,
                hits,
                self.config.rerank.depth,
                self.config.rerank.batch_size,
                self.config.rerank.min_score,
            )
            .await?;
        }

        Ok(scorer::prioritize_ext_hits(
            hits,
            &hints.desired_exts,
            top_k,
        ))
    }

    /// Block until the background index load finishes (or the timeout
    /// passes); zero polls.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.index.wait_until_ready(timeout).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let ledger_rows = ledger::read_ledger(&self.config.ledger_path())?.len();
        let corpus_rows = corpus::count_rows(&self.pool).await?;
        let cache_entries: HashSet<String> = self.cache.known_paths().await?;
        let index_ready = self.index.wait_until_ready(Duration::ZERO).await;
        let index_entries = self.index.read().await.len();
        Ok(StatusReport {
            ledger_rows,
            corpus_rows,
            index_entries,
            cache_entries: cache_entries.len(),
            index_ready,
        })
    }

    /// Explicit teardown: signal cancellation and close the pool.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.pool.close().await;
    }
}
