//! # deskdex CLI (`ddx`)
//!
//! The `ddx` binary drives the indexing engine: database initialization,
//! one-shot incremental syncs, hybrid search, and the live watch loop.
//!
//! ## Usage
//!
//! ```bash
//! ddx --config ./config/ddx.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ddx init` | Create the SQLite database and index directory |
//! | `ddx sync` | Scan watch roots and run one incremental cycle |
//! | `ddx search "<query>"` | Hybrid top-k search over the index |
//! | `ddx watch` | Follow filesystem changes until interrupted |
//! | `ddx status` | Show ledger/corpus/index/cache counts |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use deskdex::config::load_config;
use deskdex::engine::Engine;
use deskdex::pipeline;
use deskdex::rerank::{format_mtime, format_size};
use deskdex::watch;

/// deskdex — a local-first hybrid document search and incremental
/// indexing engine.
#[derive(Parser)]
#[command(
    name = "ddx",
    about = "deskdex — local-first hybrid document search and incremental indexing",
    version,
    long_about = "deskdex keeps a searchable representation of a continuously-changing local \
    document corpus and answers top-k queries by fusing vector similarity, lexical keyword \
    signals, extension hints, and per-session personalization."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ddx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and index directory.
    ///
    /// Creates the SQLite corpus database, the chunk-cache table, and
    /// the index snapshot directory. Idempotent.
    Init,

    /// Scan the watch roots and run one incremental cycle.
    ///
    /// Every discovered file is offered to the pipeline; the chunk cache
    /// skips unchanged content, and ledger rows whose file disappeared
    /// are removed from corpus and index.
    Sync,

    /// Search indexed documents.
    Search {
        /// The search query string.
        query: String,

        /// Number of hits to return (defaults to retrieval.topk).
        #[arg(long)]
        topk: Option<usize>,
    },

    /// Watch the configured roots and index changes as they happen.
    ///
    /// Runs the debounced watch loop until interrupted with ctrl-c; any
    /// pending work is flushed before exit.
    Watch,

    /// Show ledger, corpus, index, and cache counts.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let engine = Engine::new(config).await?;
            println!("initialized");
            println!("  corpus db: {}", engine.config.db.path.display());
            println!("  index dir: {}", engine.config.index.dir.display());
            engine.shutdown().await;
        }
        Commands::Sync => {
            let engine = Engine::new(config).await?;
            let stats = pipeline::sync_roots(&engine).await?;
            println!("sync");
            println!("  scanned adds: {}", stats.added);
            println!("  removed: {}", stats.removed);
            println!("  cache-fresh (skipped): {}", stats.skipped_fresh);
            println!("  extracted: {}", stats.extracted);
            println!("  indexed: {}", stats.indexed);
            println!("ok");
            engine.shutdown().await;
        }
        Commands::Search { query, topk } => {
            let engine = Engine::new(config).await?;
            engine.wait_until_ready(Duration::from_secs(60)).await;
            let hits = engine.search(&query, topk).await?;
            if hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!("{}. [{:.3}] {}", i + 1, hit.final_score, hit.path);
                    println!(
                        "    {} | {} | {} | {}",
                        hit.ext,
                        hit.owner,
                        format_mtime(hit.mtime),
                        format_size(hit.size)
                    );
                    println!(
                        "    vector: {:.3}  lexical: {:.3}",
                        hit.vector_similarity, hit.lexical_score
                    );
                    if !hit.match_reasons.is_empty() {
                        println!("    reasons: {}", hit.match_reasons.join(", "));
                    }
                    println!(
                        "    excerpt: \"{}\"",
                        hit.preview.replace('\n', " ").trim()
                    );
                    println!();
                }
            }
            engine.shutdown().await;
        }
        Commands::Watch => {
            let engine = Arc::new(Engine::new(config).await?);
            let debounce = Duration::from_millis(engine.config.watch.debounce_ms);
            let (tx, rx) = tokio::sync::mpsc::channel(watch::EVENT_QUEUE_CAPACITY);

            let watchers = watch::spawn_listeners(
                &engine.config.watch.roots,
                engine.config.policy.path.as_deref(),
                tx.clone(),
            )?;
            let loop_task = tokio::spawn(watch::run_loop(rx, debounce, Arc::clone(&engine)));

            tokio::signal::ctrl_c().await?;
            println!("shutting down; flushing pending work");
            // Dropping the senders closes the queue; the loop flushes
            // remaining work and exits.
            drop(watchers);
            drop(tx);
            loop_task.await?;
        }
        Commands::Status => {
            let engine = Engine::new(config).await?;
            let report = engine.status().await?;
            println!("status");
            println!("  ledger rows: {}", report.ledger_rows);
            println!("  corpus rows: {}", report.corpus_rows);
            println!("  index entries: {}", report.index_entries);
            println!("  cache entries: {}", report.cache_entries);
            println!("  index ready: {}", report.index_ready);
            engine.shutdown().await;
        }
    }

    Ok(())
}
