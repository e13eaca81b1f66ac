//! Incremental indexing pipeline.
//!
//! One cycle runs scan-diff → extraction → embedding → index
//! upsert/remove → persistence, touching only the paths handed to it.
//! Policy reload is modeled as a synthetic diff over the watch roots fed
//! back through the same cycle. All ledger/index/cache mutations go
//! through atomic temp+rename writes, and index writes happen strictly
//! remove-before-add so the one-entry-per-path invariant holds even when
//! the same path is added and removed in one cycle.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::corpus;
use crate::engine::Engine;
use crate::ledger;
use crate::lexical::lexical_tokens;
use crate::models::{drive_of, normalize_ext, normalize_path, CacheEntry, ScanRow};
use crate::policy::{AccessPolicy, GlobPolicy};

/// Stored lexical tokens per index entry are capped to bound metadata.
const MAX_STORED_TOKENS: usize = 512;
/// Preview length in characters.
const PREVIEW_CHARS: usize = 240;

#[derive(Debug, Default)]
pub struct CycleStats {
    pub added: usize,
    pub removed: usize,
    pub skipped_fresh: usize,
    pub extracted: usize,
    pub appended: u64,
    pub indexed: usize,
}

/// Run one incremental cycle over the given add/remove path sets.
pub async fn process(
    engine: &Engine,
    add_paths: &HashSet<String>,
    remove_paths: &HashSet<String>,
) -> Result<CycleStats> {
    let _writer = engine.writer_lock().await;
    let mut stats = CycleStats::default();

    // 1. Filter by allowed extensions and the access policy. Paths the
    // policy denies are treated as removals so stale state is purged.
    let allowed_exts = engine.config.watch.allowed_ext_set();
    let policy = engine.policy_snapshot();

    let mut removes: HashSet<String> = remove_paths
        .iter()
        .filter_map(|p| normalize_path(p))
        .collect();
    let mut adds: Vec<String> = Vec::new();
    for raw in add_paths {
        let Some(path) = normalize_path(raw) else {
            warn!("ignoring add event with unresolvable path {:?}", raw);
            continue;
        };
        if !allowed_exts.contains(&normalize_ext(&path)) {
            debug!("skipping {}: extension not allowed", path);
            continue;
        }
        if !policy.allows(&path, None, true) {
            debug!("policy denies {}; scheduling removal", path);
            removes.insert(path);
            continue;
        }
        adds.push(path);
    }
    adds.sort();

    // 2. Collect filesystem metadata; files that vanished since the
    // event fired become removals.
    let mut scan_rows: Vec<ScanRow> = Vec::with_capacity(adds.len());
    for path in &adds {
        match collect_scan_row(path, policy.as_ref()) {
            Ok(row) => scan_rows.push(row),
            Err(e) => {
                debug!("{} not scannable ({}); scheduling removal", path, e);
                removes.insert(path.clone());
            }
        }
    }
    stats.added = scan_rows.len();
    stats.removed = removes.len();

    // 3. Atomic ledger rewrite: drop removed/denied rows, upsert added
    // rows, leave the rest untouched.
    ledger::rewrite_ledger(&engine.config.ledger_path(), &scan_rows, &removes)?;

    // 5 (ordered before 4 deliberately): cache-fresh paths keep their
    // corpus rows and index entries; only genuinely changed files are
    // torn down below.
    let batch: Vec<(String, String)> = scan_rows
        .iter()
        .map(|r| (r.path.clone(), r.file_hash.clone()))
        .collect();
    let fresh = engine.cache.unchanged(&batch).await?;
    stats.skipped_fresh = fresh.len();

    let changed_rows: Vec<ScanRow> = scan_rows
        .iter()
        .filter(|r| !fresh.contains(&r.path))
        .cloned()
        .collect();

    // 4. Remove stale corpus rows for removed paths and changed files.
    let mut stale: HashSet<String> = removes.clone();
    stale.extend(changed_rows.iter().map(|r| r.path.clone()));
    corpus::delete_rows(&engine.pool, &stale).await?;

    // 5/6. Extract the changed rows and append validated records.
    let records = corpus::process_rows(
        &changed_rows,
        corpus::Collaborators {
            extractor: Arc::clone(&engine.extractor),
            masker: engine.masker.as_ref(),
            translator: engine.translator.as_ref(),
        },
        engine.config.watch.io_workers,
        &engine.cancel,
    )
    .await?;
    stats.extracted = records.iter().filter(|r| r.ok).count();
    stats.appended = corpus::append_records(&engine.pool, &records).await?;

    // 7. Index: remove before add, then embed and upsert the new texts.
    engine
        .index
        .wait_until_ready(std::time::Duration::from_secs(300))
        .await;
    {
        let mut index = engine.index.write().await;
        let mut index_removals: HashSet<String> = removes.clone();
        index_removals.extend(records.iter().map(|r| r.path.clone()));
        index.remove_paths(index_removals.iter());

        let indexable: Vec<&crate::models::DocumentRecord> = records
            .iter()
            .filter(|r| r.ok && !r.text.trim().is_empty())
            .collect();

        let mut cache_entries: Vec<CacheEntry> = Vec::with_capacity(records.len());
        let now = chrono::Utc::now().timestamp();

        let mut doc_vectors: Vec<Vec<f32>> = Vec::with_capacity(indexable.len());
        let mut chunk_counts: Vec<usize> = Vec::with_capacity(indexable.len());
        for record in &indexable {
            engine.cancel.check()?;
            let chunks = engine
                .chunker
                .chunk(&record.text, &serde_json::json!({ "path_ext": record.ext }));
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = engine
                .embedder
                .encode(&texts, engine.config.embedding.batch_size)
                .await?;
            doc_vectors.push(mean_pool(&vectors, engine.embedder.dims()));
            chunk_counts.push(chunks.len());
        }

        for ((record, vector), chunk_count) in
            indexable.iter().zip(doc_vectors).zip(chunk_counts)
        {
            let row = scan_rows
                .iter()
                .find(|r| r.path == record.path)
                .expect("record always originates from a scan row");
            index.upsert(
                crate::models::IndexEntry {
                    path: record.path.clone(),
                    ext: record.ext.clone(),
                    preview: record.text.chars().take(PREVIEW_CHARS).collect(),
                    size: record.size,
                    mtime: record.mtime,
                    ctime: record.ctime,
                    owner: record.owner.clone(),
                    tokens: lexical_tokens(&record.text, MAX_STORED_TOKENS),
                },
                vector,
            );
            stats.indexed += 1;
            cache_entries.push(CacheEntry {
                path: record.path.clone(),
                doc_hash: row.file_hash.clone(),
                chunk_count: chunk_count as i64,
                updated_at: now,
            });
        }

        // Failed/empty rows are still marked processed so they are not
        // retried until their scan metadata changes.
        for record in records.iter().filter(|r| !r.ok || r.text.trim().is_empty()) {
            if let Some(row) = scan_rows.iter().find(|r| r.path == record.path) {
                cache_entries.push(CacheEntry {
                    path: record.path.clone(),
                    doc_hash: row.file_hash.clone(),
                    chunk_count: 0,
                    updated_at: now,
                });
            }
        }

        engine.cache.update(&cache_entries).await?;
        let remove_list: Vec<String> = removes.iter().cloned().collect();
        engine.cache.drop_paths(&remove_list).await?;

        index.save(&engine.config.index.dir)?;
    }

    info!(
        added = stats.added,
        removed = stats.removed,
        fresh = stats.skipped_fresh,
        extracted = stats.extracted,
        indexed = stats.indexed,
        "incremental cycle complete"
    );
    Ok(stats)
}

/// Policy hot-reload: swap in the new policy, recompute the allowed set
/// for all watch roots, and feed the diff back through `process` as a
/// synthetic add/remove pair. An unreadable or unparsable policy file
/// aborts the reload and keeps the previous policy.
pub async fn handle_policy_change(engine: &Engine) -> Result<CycleStats> {
    let Some(policy_path) = engine.config.policy.path.clone() else {
        debug!("policy change event without a configured policy file; ignoring");
        return Ok(CycleStats::default());
    };

    match GlobPolicy::load(&policy_path) {
        Ok(new_policy) => engine.set_policy(Arc::new(new_policy)),
        Err(e) => {
            warn!(
                "policy reload from {} failed ({}); keeping previous policy",
                policy_path.display(),
                e
            );
            return Ok(CycleStats::default());
        }
    }

    let policy = engine.policy_snapshot();
    let allowed_exts = engine.config.watch.allowed_ext_set();

    let mut now_allowed: HashSet<String> = HashSet::new();
    for root in &engine.config.watch.roots {
        for path in scan_root(root, &allowed_exts) {
            if policy.allows(&path, None, true) {
                now_allowed.insert(path);
            }
        }
    }

    // The ledger's allowed rows are the previously materialized set.
    let previous: HashSet<String> = ledger::read_ledger(&engine.config.ledger_path())?
        .into_iter()
        .filter(|r| r.allowed)
        .map(|r| r.path)
        .collect();

    let newly_allowed: HashSet<String> = now_allowed.difference(&previous).cloned().collect();
    let newly_denied: HashSet<String> = previous.difference(&now_allowed).cloned().collect();
    info!(
        allowed = newly_allowed.len(),
        denied = newly_denied.len(),
        "policy reloaded; reconciling"
    );
    process(engine, &newly_allowed, &newly_denied).await
}

/// Full scan of the watch roots diffed against the ledger, for one-shot
/// `sync` runs: every discovered file is an add candidate (the cache
/// skips the unchanged ones) and ledger rows whose file disappeared are
/// removals.
pub async fn sync_roots(engine: &Engine) -> Result<CycleStats> {
    let allowed_exts = engine.config.watch.allowed_ext_set();
    let mut discovered: HashSet<String> = HashSet::new();
    for root in &engine.config.watch.roots {
        discovered.extend(scan_root(root, &allowed_exts));
    }

    let gone: HashSet<String> = ledger::read_ledger(&engine.config.ledger_path())?
        .into_iter()
        .map(|r| r.path)
        .filter(|p| !discovered.contains(p))
        .collect();

    process(engine, &discovered, &gone).await
}

/// Discover allowed-extension files under one root.
pub fn scan_root(root: &Path, allowed_exts: &HashSet<String>) -> Vec<String> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("scan error under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = normalize_path(&entry.path().to_string_lossy()) else {
            continue;
        };
        if allowed_exts.contains(&normalize_ext(&path)) {
            out.push(path);
        }
    }
    out.sort();
    out
}

fn collect_scan_row(path: &str, policy: &dyn AccessPolicy) -> Result<ScanRow> {
    let fs_path = Path::new(path);
    let metadata = std::fs::metadata(fs_path)?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let ctime = metadata
        .created()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(mtime);

    Ok(ScanRow {
        ext: normalize_ext(path),
        drive: drive_of(path),
        owner: file_owner(&metadata),
        file_hash: corpus::file_hash(fs_path)?,
        size: metadata.len(),
        mtime,
        ctime,
        allowed: true,
        policy_mask_pii: policy.pii_mask_enabled_for_path(path, None),
        path: path.to_string(),
    })
}

#[cfg(unix)]
fn file_owner(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    format!("uid:{}", metadata.uid())
}

#[cfg(not(unix))]
fn file_owner(_metadata: &std::fs::Metadata) -> String {
    String::new()
}

/// Mean-pool chunk vectors into one document vector, L2-normalized.
fn mean_pool(vectors: &[Vec<f32>], dims: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; dims];
    if vectors.is_empty() {
        return out;
    }
    for vector in vectors {
        for (o, v) in out.iter_mut().zip(vector.iter()) {
            *o += v;
        }
    }
    let n = vectors.len() as f32;
    for o in &mut out {
        *o /= n;
    }
    let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for o in &mut out {
            *o /= norm;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_pool_averages_and_normalizes() {
        let pooled = mean_pool(&[vec![1.0, 0.0], vec![0.0, 1.0]], 2);
        assert!((pooled[0] - pooled[1]).abs() < 1e-6);
        let norm: f32 = pooled.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mean_pool_empty_is_zero_vector() {
        assert_eq!(mean_pool(&[], 3), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn scan_root_filters_extensions() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "x").unwrap();
        std::fs::write(tmp.path().join("b.bin"), "x").unwrap();
        let exts: HashSet<String> = [".txt".to_string()].into();
        let found = scan_root(tmp.path(), &exts);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("a.txt"));
    }
}
