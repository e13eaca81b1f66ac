//! End-to-end tests over the engine: incremental freshness, tombstones,
//! policy reconciliation, and the debounced watch loop driven by
//! synthetic events.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use deskdex::config::{
    CacheConfig, ChunkingConfig, Config, DbConfig, EmbeddingConfig, IndexConfig, PolicyConfig,
    RerankConfig, RetrievalConfig, WatchConfig,
};
use deskdex::engine::Engine;
use deskdex::pipeline;
use deskdex::watch::{run_loop, WatchEvent};

fn test_config(tmp: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: tmp.path().join("corpus.sqlite"),
        },
        index: IndexConfig {
            dir: tmp.path().join("index"),
        },
        chunking: ChunkingConfig::default(),
        retrieval: RetrievalConfig::default(),
        rerank: RerankConfig::default(),
        embedding: EmbeddingConfig::default(),
        watch: WatchConfig {
            roots: vec![tmp.path().join("docs")],
            ..WatchConfig::default()
        },
        cache: CacheConfig::default(),
        policy: PolicyConfig::default(),
    }
}

fn docs_dir(tmp: &TempDir) -> std::path::PathBuf {
    let dir = tmp.path().join("docs");
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn norm(path: &Path) -> String {
    deskdex::models::normalize_path(&path.to_string_lossy()).unwrap()
}

#[tokio::test]
async fn sync_indexes_new_documents() {
    let tmp = TempDir::new().unwrap();
    let docs = docs_dir(&tmp);
    std::fs::write(docs.join("rust.md"), "# Rust\nownership and borrowing in rust").unwrap();
    std::fs::write(docs.join("deploy.txt"), "kubernetes deployment checklist").unwrap();

    let engine = Engine::new(test_config(&tmp)).await.unwrap();
    let stats = pipeline::sync_roots(&engine).await.unwrap();
    assert_eq!(stats.added, 2);
    assert_eq!(stats.indexed, 2);

    let report = engine.status().await.unwrap();
    assert_eq!(report.ledger_rows, 2);
    assert_eq!(report.index_entries, 2);
    assert_eq!(report.corpus_rows, 2);

    let hits = engine.search("ownership in rust", None).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits[0].path.ends_with("rust.md"));
    engine.shutdown().await;
}

#[tokio::test]
async fn second_sync_skips_unchanged_content() {
    let tmp = TempDir::new().unwrap();
    let docs = docs_dir(&tmp);
    std::fs::write(docs.join("a.txt"), "stable content").unwrap();

    let engine = Engine::new(test_config(&tmp)).await.unwrap();
    let first = pipeline::sync_roots(&engine).await.unwrap();
    assert_eq!(first.extracted, 1);

    let second = pipeline::sync_roots(&engine).await.unwrap();
    assert_eq!(second.skipped_fresh, 1);
    assert_eq!(second.extracted, 0);
    // The unchanged document keeps its corpus row and index entry.
    let report = engine.status().await.unwrap();
    assert_eq!(report.corpus_rows, 1);
    assert_eq!(report.index_entries, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn changed_content_is_reindexed_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let docs = docs_dir(&tmp);
    let file = docs.join("a.txt");
    std::fs::write(&file, "version one of the quarterly report").unwrap();

    let engine = Engine::new(test_config(&tmp)).await.unwrap();
    pipeline::sync_roots(&engine).await.unwrap();
    let h1 = deskdex::ledger::read_ledger(&engine.config.ledger_path()).unwrap()[0]
        .file_hash
        .clone();

    std::fs::write(&file, "version two with entirely different findings").unwrap();
    let stats = pipeline::sync_roots(&engine).await.unwrap();
    // Cache reports the path as changed, not fresh.
    assert_eq!(stats.skipped_fresh, 0);
    assert_eq!(stats.extracted, 1);

    // Exactly one index entry for the path, reflecting the new content.
    let report = engine.status().await.unwrap();
    assert_eq!(report.index_entries, 1);
    let h2 = deskdex::ledger::read_ledger(&engine.config.ledger_path()).unwrap()[0]
        .file_hash
        .clone();
    assert_ne!(h1, h2);

    let hits = engine.search("different findings", None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].preview.contains("version two"));
    engine.shutdown().await;
}

#[tokio::test]
async fn deleted_file_is_tombstoned_everywhere() {
    let tmp = TempDir::new().unwrap();
    let docs = docs_dir(&tmp);
    let file = docs.join("gone.txt");
    std::fs::write(&file, "soon to disappear").unwrap();

    let engine = Engine::new(test_config(&tmp)).await.unwrap();
    pipeline::sync_roots(&engine).await.unwrap();
    assert_eq!(engine.status().await.unwrap().index_entries, 1);

    std::fs::remove_file(&file).unwrap();
    pipeline::sync_roots(&engine).await.unwrap();

    let report = engine.status().await.unwrap();
    assert_eq!(report.index_entries, 0);
    assert_eq!(report.ledger_rows, 0);
    assert_eq!(report.corpus_rows, 0);
    assert_eq!(report.cache_entries, 0);
    let hits = engine.search("disappear", None).await.unwrap();
    assert!(hits.iter().all(|h| !h.path.ends_with("gone.txt")));
    engine.shutdown().await;
}

#[tokio::test]
async fn failed_extraction_is_not_retried_until_content_changes() {
    let tmp = TempDir::new().unwrap();
    let docs = docs_dir(&tmp);
    // .pptx is in the allowed set but the plain-text extractor reports
    // it unsupported.
    std::fs::write(docs.join("deck.pptx"), b"\x50\x4b\x03\x04").unwrap();

    let engine = Engine::new(test_config(&tmp)).await.unwrap();
    let first = pipeline::sync_roots(&engine).await.unwrap();
    assert_eq!(first.extracted, 0);
    assert_eq!(engine.status().await.unwrap().corpus_rows, 0);

    // Marked processed: the next cycle skips it instead of retrying.
    let second = pipeline::sync_roots(&engine).await.unwrap();
    assert_eq!(second.skipped_fresh, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn add_and_remove_same_path_in_one_cycle_keeps_invariant() {
    let tmp = TempDir::new().unwrap();
    let docs = docs_dir(&tmp);
    let file = docs.join("both.txt");
    std::fs::write(&file, "content present on disk").unwrap();

    let engine = Engine::new(test_config(&tmp)).await.unwrap();
    let path = norm(&file);
    let adds: HashSet<String> = [path.clone()].into();
    let removes: HashSet<String> = [path.clone()].into();
    pipeline::process(&engine, &adds, &removes).await.unwrap();

    // Remove-before-add: the surviving add wins with one live entry.
    assert!(engine.status().await.unwrap().index_entries <= 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn policy_reload_reconciles_visibility() {
    let tmp = TempDir::new().unwrap();
    let docs = docs_dir(&tmp);
    std::fs::create_dir_all(docs.join("open")).unwrap();
    std::fs::create_dir_all(docs.join("secret")).unwrap();
    std::fs::write(docs.join("open/a.txt"), "public knowledge base").unwrap();
    std::fs::write(docs.join("secret/b.txt"), "restricted payroll data").unwrap();

    let policy_path = tmp.path().join("policy.toml");
    std::fs::write(
        &policy_path,
        format!("allow = [\"{}/**\"]\n", docs.display()),
    )
    .unwrap();

    let mut config = test_config(&tmp);
    config.policy.path = Some(policy_path.clone());
    let engine = Engine::new(config).await.unwrap();
    pipeline::sync_roots(&engine).await.unwrap();
    assert_eq!(engine.status().await.unwrap().index_entries, 2);

    // New policy denies the secret subtree.
    std::fs::write(
        &policy_path,
        format!(
            "allow = [\"{}/**\"]\ndeny = [\"{}/secret/**\"]\n",
            docs.display(),
            docs.display()
        ),
    )
    .unwrap();
    pipeline::handle_policy_change(&engine).await.unwrap();

    let report = engine.status().await.unwrap();
    assert_eq!(report.index_entries, 1);
    let hits = engine.search("payroll data", None).await.unwrap();
    assert!(hits.iter().all(|h| !h.path.contains("secret")));

    // Reverting the policy re-admits the path as a synthetic add.
    std::fs::write(
        &policy_path,
        format!("allow = [\"{}/**\"]\n", docs.display()),
    )
    .unwrap();
    pipeline::handle_policy_change(&engine).await.unwrap();
    assert_eq!(engine.status().await.unwrap().index_entries, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn unparsable_policy_reload_keeps_previous_policy() {
    let tmp = TempDir::new().unwrap();
    let docs = docs_dir(&tmp);
    std::fs::write(docs.join("a.txt"), "visible document").unwrap();

    let policy_path = tmp.path().join("policy.toml");
    std::fs::write(
        &policy_path,
        format!("allow = [\"{}/**\"]\n", docs.display()),
    )
    .unwrap();

    let mut config = test_config(&tmp);
    config.policy.path = Some(policy_path.clone());
    let engine = Engine::new(config).await.unwrap();
    pipeline::sync_roots(&engine).await.unwrap();
    assert_eq!(engine.status().await.unwrap().index_entries, 1);

    // Corrupt policy: reload aborts, nothing is torn down.
    std::fs::write(&policy_path, "allow = [broken").unwrap();
    pipeline::handle_policy_change(&engine).await.unwrap();
    assert_eq!(engine.status().await.unwrap().index_entries, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn watch_loop_debounces_synthetic_events_into_one_index_pass() {
    let tmp = TempDir::new().unwrap();
    let docs = docs_dir(&tmp);
    let file = docs.join("note.txt");
    std::fs::write(&file, "watched note about budget planning").unwrap();

    let engine = Arc::new(Engine::new(test_config(&tmp)).await.unwrap());
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let loop_task = tokio::spawn(run_loop(
        rx,
        Duration::from_millis(50),
        Arc::clone(&engine),
    ));

    let path = norm(&file);
    // A burst of duplicate events within the debounce window.
    tx.send(WatchEvent::Add(path.clone())).await.unwrap();
    tx.send(WatchEvent::Add(path.clone())).await.unwrap();
    tx.send(WatchEvent::Add(path)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    drop(tx);
    loop_task.await.unwrap();

    let report = engine.status().await.unwrap();
    assert_eq!(report.index_entries, 1);
    let hits = engine.search("budget planning", None).await.unwrap();
    assert!(!hits.is_empty());
}

#[tokio::test]
async fn empty_query_returns_no_hits_without_error() {
    let tmp = TempDir::new().unwrap();
    docs_dir(&tmp);
    let engine = Engine::new(test_config(&tmp)).await.unwrap();
    assert!(engine.search("   ", None).await.unwrap().is_empty());
    // Empty index is also fine.
    assert!(engine.search("anything", None).await.unwrap().is_empty());
    engine.shutdown().await;
}
