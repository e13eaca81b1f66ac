//! Chunk/document cache: decides whether re-extraction and re-embedding
//! can be skipped for a path.
//!
//! Two interchangeable backends share one contract: an in-memory map
//! persisted to an atomically-rewritten JSON snapshot (temp-write +
//! rename, never truncates on crash), and a SQLite-table-backed variant
//! for large corpora. Both evict the least-recently-updated entries when
//! the configured maximum is exceeded. A corrupt or unreadable snapshot
//! is treated as an empty cache, forcing full re-embedding on the next
//! run rather than failing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::models::CacheEntry;

/// Contract shared by both cache backends.
#[async_trait]
pub trait DocCache: Send + Sync {
    /// Paths from `batch` whose stored doc_hash matches the given one —
    /// safe to skip re-extraction/re-embedding.
    async fn unchanged(&self, batch: &[(String, String)]) -> Result<HashSet<String>>;

    /// Upsert entries wholesale (replace, never merge), then evict down
    /// to the configured maximum.
    async fn update(&self, entries: &[CacheEntry]) -> Result<()>;

    async fn drop_paths(&self, paths: &[String]) -> Result<()>;

    async fn known_paths(&self) -> Result<HashSet<String>>;
}

// ============ Snapshot-file backend ============

/// In-memory map with an atomic JSON snapshot on disk.
pub struct SnapshotCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    snapshot_path: PathBuf,
    max_entries: usize,
}

impl SnapshotCache {
    /// Load the snapshot if present. Corrupt or unreadable snapshots are
    /// demoted to an empty cache with a warning.
    pub fn open(snapshot_path: &Path, max_entries: usize) -> Self {
        let entries = match std::fs::read_to_string(snapshot_path) {
            Ok(raw) => match serde_json::from_str::<Vec<CacheEntry>>(&raw) {
                Ok(list) => list.into_iter().map(|e| (e.path.clone(), e)).collect(),
                Err(e) => {
                    warn!(
                        "chunk cache snapshot {} is corrupt ({}); starting empty",
                        snapshot_path.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(
                    "chunk cache snapshot {} unreadable ({}); starting empty",
                    snapshot_path.display(),
                    e
                );
                HashMap::new()
            }
        };
        Self {
            entries: RwLock::new(entries),
            snapshot_path: snapshot_path.to_path_buf(),
            max_entries,
        }
    }

    fn persist(&self) -> Result<()> {
        let list: Vec<CacheEntry> = {
            let entries = self.entries.read().unwrap();
            let mut list: Vec<CacheEntry> = entries.values().cloned().collect();
            list.sort_by(|a, b| a.path.cmp(&b.path));
            list
        };
        let json = serde_json::to_string(&list)?;
        write_atomic(&self.snapshot_path, json.as_bytes())
    }

    fn evict_over_capacity(entries: &mut HashMap<String, CacheEntry>, max_entries: usize) {
        if max_entries == 0 || entries.len() <= max_entries {
            return;
        }
        let mut by_age: Vec<(String, i64)> = entries
            .values()
            .map(|e| (e.path.clone(), e.updated_at))
            .collect();
        by_age.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let excess = entries.len() - max_entries;
        for (path, _) in by_age.into_iter().take(excess) {
            entries.remove(&path);
        }
    }
}

#[async_trait]
impl DocCache for SnapshotCache {
    async fn unchanged(&self, batch: &[(String, String)]) -> Result<HashSet<String>> {
        let entries = self.entries.read().unwrap();
        Ok(batch
            .iter()
            .filter(|(path, doc_hash)| {
                entries
                    .get(path)
                    .map(|e| e.doc_hash == *doc_hash)
                    .unwrap_or(false)
            })
            .map(|(path, _)| path.clone())
            .collect())
    }

    async fn update(&self, new_entries: &[CacheEntry]) -> Result<()> {
        {
            let mut entries = self.entries.write().unwrap();
            for e in new_entries {
                entries.insert(e.path.clone(), e.clone());
            }
            Self::evict_over_capacity(&mut entries, self.max_entries);
        }
        self.persist()
    }

    async fn drop_paths(&self, paths: &[String]) -> Result<()> {
        {
            let mut entries = self.entries.write().unwrap();
            for p in paths {
                entries.remove(p);
            }
        }
        self.persist()
    }

    async fn known_paths(&self) -> Result<HashSet<String>> {
        Ok(self.entries.read().unwrap().keys().cloned().collect())
    }
}

// ============ SQLite backend ============

/// Relational-table-backed cache for large corpora; same contract and
/// eviction policy as [`SnapshotCache`].
pub struct SqliteCache {
    pool: SqlitePool,
    max_entries: usize,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool, max_entries: usize) -> Self {
        Self { pool, max_entries }
    }

    async fn evict_over_capacity(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Ok(());
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_cache")
            .fetch_one(&self.pool)
            .await?;
        let excess = count - self.max_entries as i64;
        if excess > 0 {
            sqlx::query(
                "DELETE FROM chunk_cache WHERE path IN \
                 (SELECT path FROM chunk_cache ORDER BY updated_at ASC, path ASC LIMIT ?)",
            )
            .bind(excess)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocCache for SqliteCache {
    async fn unchanged(&self, batch: &[(String, String)]) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        for (path, doc_hash) in batch {
            let stored: Option<String> =
                sqlx::query_scalar("SELECT doc_hash FROM chunk_cache WHERE path = ?")
                    .bind(path)
                    .fetch_optional(&self.pool)
                    .await?;
            if stored.as_deref() == Some(doc_hash.as_str()) {
                out.insert(path.clone());
            }
        }
        Ok(out)
    }

    async fn update(&self, entries: &[CacheEntry]) -> Result<()> {
        for e in entries {
            sqlx::query(
                r#"
                INSERT INTO chunk_cache (path, doc_hash, chunk_count, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(path) DO UPDATE SET
                    doc_hash = excluded.doc_hash,
                    chunk_count = excluded.chunk_count,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&e.path)
            .bind(&e.doc_hash)
            .bind(e.chunk_count)
            .bind(e.updated_at)
            .execute(&self.pool)
            .await?;
        }
        self.evict_over_capacity().await
    }

    async fn drop_paths(&self, paths: &[String]) -> Result<()> {
        for p in paths {
            sqlx::query("DELETE FROM chunk_cache WHERE path = ?")
                .bind(p)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn known_paths(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT path FROM chunk_cache")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("path")).collect())
    }
}

/// Write `bytes` to `path` via a temp file in the same directory followed
/// by a rename, so a crash mid-write never truncates the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating parent directory for {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot".to_string());
    let tmp = dir.join(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str, hash: &str, updated_at: i64) -> CacheEntry {
        CacheEntry {
            path: path.to_string(),
            doc_hash: hash.to_string(),
            chunk_count: 3,
            updated_at,
        }
    }

    #[tokio::test]
    async fn unchanged_matches_on_doc_hash() {
        let tmp = TempDir::new().unwrap();
        let cache = SnapshotCache::open(&tmp.path().join("cache.json"), 100);
        cache
            .update(&[entry("/x/a.pdf", "h1", 10), entry("/x/b.pdf", "h2", 11)])
            .await
            .unwrap();

        let batch = vec![
            ("/x/a.pdf".to_string(), "h1".to_string()),
            ("/x/b.pdf".to_string(), "changed".to_string()),
            ("/x/c.pdf".to_string(), "h3".to_string()),
        ];
        let fresh = cache.unchanged(&batch).await.unwrap();
        assert!(fresh.contains("/x/a.pdf"));
        assert!(!fresh.contains("/x/b.pdf"));
        assert!(!fresh.contains("/x/c.pdf"));
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.json");
        {
            let cache = SnapshotCache::open(&path, 100);
            cache.update(&[entry("/x/a.pdf", "h1", 10)]).await.unwrap();
        }
        let reopened = SnapshotCache::open(&path, 100);
        let known = reopened.known_paths().await.unwrap();
        assert!(known.contains("/x/a.pdf"));
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_empty_cache() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.json");
        std::fs::write(&path, b"{not json at all").unwrap();
        let cache = SnapshotCache::open(&path, 100);
        assert!(cache.known_paths().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn evicts_least_recently_updated() {
        let tmp = TempDir::new().unwrap();
        let cache = SnapshotCache::open(&tmp.path().join("cache.json"), 2);
        cache
            .update(&[
                entry("/old", "h", 1),
                entry("/mid", "h", 5),
                entry("/new", "h", 9),
            ])
            .await
            .unwrap();
        let known = cache.known_paths().await.unwrap();
        assert_eq!(known.len(), 2);
        assert!(!known.contains("/old"));
        assert!(known.contains("/new"));
    }

    #[tokio::test]
    async fn update_replaces_wholesale() {
        let tmp = TempDir::new().unwrap();
        let cache = SnapshotCache::open(&tmp.path().join("cache.json"), 100);
        cache.update(&[entry("/x/a.pdf", "h1", 10)]).await.unwrap();
        cache.update(&[entry("/x/a.pdf", "h2", 20)]).await.unwrap();
        let fresh = cache
            .unchanged(&[("/x/a.pdf".to_string(), "h1".to_string())])
            .await
            .unwrap();
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn drop_paths_forgets_entries() {
        let tmp = TempDir::new().unwrap();
        let cache = SnapshotCache::open(&tmp.path().join("cache.json"), 100);
        cache.update(&[entry("/x/a.pdf", "h1", 10)]).await.unwrap();
        cache.drop_paths(&["/x/a.pdf".to_string()]).await.unwrap();
        assert!(cache.known_paths().await.unwrap().is_empty());
    }
}
