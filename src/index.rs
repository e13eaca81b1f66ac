//! Persistent keyed vector index: one live entry per path.
//!
//! In-memory state is a dense embedding matrix plus parallel metadata
//! records and a path → row map. Persistence is a full snapshot under one
//! directory: `embeddings.bin` (count/dim header, little-endian f32
//! rows), `metadata.jsonl` (one record per line), and an optional
//! `ann.json` accelerator descriptor. The HNSW graph itself is rebuilt
//! from the embedding rows on load; a missing or corrupt descriptor
//! degrades to a brute-force cosine scan with a warning. A missing
//! embedding file yields an empty index.
//!
//! Within one process an `upsert` followed by `search` observes the
//! upsert; cross-process consistency holds only after `save`/`load`.
//! Writes are expected from the pipeline's single logical writer — the
//! engine serializes them behind its writer lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::ann::{AnnAccelerator, HnswAccelerator};
use crate::cache::write_atomic;
use crate::embedding::cosine_similarity;
use crate::models::IndexEntry;

pub const EMBEDDINGS_FILE: &str = "embeddings.bin";
pub const METADATA_FILE: &str = "metadata.jsonl";
pub const ANN_FILE: &str = "ann.json";

/// How many ANN candidates to exact-rescore per requested hit.
const SHORTLIST_FACTOR: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
struct AnnDescriptor {
    kind: String,
    count: usize,
    dims: usize,
}

pub struct VectorIndex {
    dims: usize,
    embeddings: Vec<Vec<f32>>,
    entries: Vec<IndexEntry>,
    by_path: HashMap<String, usize>,
    ann: Option<Box<dyn AnnAccelerator>>,
}

impl VectorIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            embeddings: Vec::new(),
            entries: Vec::new(),
            by_path: HashMap::new(),
            ann: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn contains(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn entry_for(&self, path: &str) -> Option<&IndexEntry> {
        self.by_path.get(path).map(|row| &self.entries[*row])
    }

    /// Insert-or-replace keyed by path: at most one live entry per path
    /// after the call. Any write invalidates the accelerator until the
    /// next save/load rebuild.
    pub fn upsert(&mut self, entry: IndexEntry, embedding: Vec<f32>) {
        match self.by_path.get(&entry.path) {
            Some(&row) => {
                self.embeddings[row] = embedding;
                self.entries[row] = entry;
            }
            None => {
                self.by_path.insert(entry.path.clone(), self.entries.len());
                self.embeddings.push(embedding);
                self.entries.push(entry);
            }
        }
        self.ann = None;
    }

    /// Delete entries for the given paths; unknown paths are a no-op.
    pub fn remove_paths<'a, I: IntoIterator<Item = &'a String>>(&mut self, paths: I) {
        let mut rows: Vec<usize> = paths
            .into_iter()
            .filter_map(|p| self.by_path.get(p).copied())
            .collect();
        if rows.is_empty() {
            return;
        }
        // Remove from the back so earlier row numbers stay valid.
        rows.sort_unstable_by(|a, b| b.cmp(a));
        for row in rows {
            let removed = self.entries.swap_remove(row);
            self.embeddings.swap_remove(row);
            self.by_path.remove(&removed.path);
            if row < self.entries.len() {
                // The former last row moved into `row`.
                self.by_path.insert(self.entries[row].path.clone(), row);
            }
        }
        self.ann = None;
    }

    /// Top-k rows by cosine similarity to `query`. Uses the accelerator
    /// for candidate generation when available (exact re-scoring the
    /// shortlist), otherwise brute-force scans every row. Empty index
    /// returns an empty result, never an error.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<(&IndexEntry, f32)> {
        if self.entries.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = match &self.ann {
            Some(accel) => accel
                .shortlist(query, (top_k * SHORTLIST_FACTOR).max(top_k))
                .into_iter()
                .filter(|row| *row < self.embeddings.len())
                .map(|row| (row, cosine_similarity(query, &self.embeddings[row])))
                .collect(),
            None => self
                .embeddings
                .iter()
                .enumerate()
                .map(|(row, emb)| (row, cosine_similarity(query, emb)))
                .collect(),
        };
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
            .into_iter()
            .map(|(row, sim)| (&self.entries[row], sim))
            .collect()
    }

    /// Write one consistent full snapshot, overwriting any prior one,
    /// and rebuild the in-memory accelerator.
    pub fn save(&mut self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating index directory {}", dir.display()))?;

        let mut emb_bytes =
            Vec::with_capacity(16 + self.embeddings.len() * self.dims * 4);
        emb_bytes.extend_from_slice(&(self.embeddings.len() as u64).to_le_bytes());
        emb_bytes.extend_from_slice(&(self.dims as u64).to_le_bytes());
        for row in &self.embeddings {
            for v in row {
                emb_bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        write_atomic(&dir.join(EMBEDDINGS_FILE), &emb_bytes)?;

        let mut meta_lines = String::new();
        for entry in &self.entries {
            meta_lines.push_str(&serde_json::to_string(entry)?);
            meta_lines.push('\n');
        }
        write_atomic(&dir.join(METADATA_FILE), meta_lines.as_bytes())?;

        let descriptor = AnnDescriptor {
            kind: "hnsw".to_string(),
            count: self.embeddings.len(),
            dims: self.dims,
        };
        write_atomic(
            &dir.join(ANN_FILE),
            serde_json::to_string(&descriptor)?.as_bytes(),
        )?;

        self.ann = Some(Box::new(HnswAccelerator::build(&self.embeddings)));
        info!(entries = self.entries.len(), "index snapshot saved to {}", dir.display());
        Ok(())
    }

    /// Reconstruct in-memory state from a snapshot.
    pub fn load(
        dims: usize,
        embedding_file: &Path,
        metadata_file: &Path,
        ann_file: Option<&Path>,
    ) -> Self {
        let raw = match std::fs::read(embedding_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no embedding snapshot at {}; starting empty", embedding_file.display());
                return Self::new(dims);
            }
            Err(e) => {
                warn!("embedding snapshot {} unreadable ({}); starting empty", embedding_file.display(), e);
                return Self::new(dims);
            }
        };

        let (rows, stored_dims) = match parse_embeddings(&raw) {
            Some(parsed) => parsed,
            None => {
                warn!("embedding snapshot {} is corrupt; starting empty", embedding_file.display());
                return Self::new(dims);
            }
        };

        let mut entries: Vec<IndexEntry> = Vec::new();
        match std::fs::read_to_string(metadata_file) {
            Ok(raw_meta) => {
                for (lineno, line) in raw_meta.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IndexEntry>(line) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => warn!(
                            "skipping malformed metadata line {} in {}: {}",
                            lineno + 1,
                            metadata_file.display(),
                            e
                        ),
                    }
                }
            }
            Err(e) => {
                warn!("metadata snapshot {} unreadable ({}); starting empty", metadata_file.display(), e);
                return Self::new(dims);
            }
        }

        let usable = entries.len().min(rows.len());
        if entries.len() != rows.len() {
            warn!(
                "index snapshot row mismatch: {} embeddings vs {} metadata records; keeping {}",
                rows.len(),
                entries.len(),
                usable
            );
        }

        let mut index = Self::new(stored_dims);
        for (entry, row) in entries.into_iter().zip(rows.into_iter()).take(usable) {
            index.upsert(entry, row);
        }

        index.ann = match ann_file {
            Some(path) => match load_ann_descriptor(path, index.len(), index.dims) {
                Some(()) => Some(Box::new(HnswAccelerator::build(&index.embeddings))),
                None => None,
            },
            None => None,
        };
        info!(entries = index.len(), ann = index.ann.is_some(), "index snapshot loaded");
        index
    }
}

fn parse_embeddings(raw: &[u8]) -> Option<(Vec<Vec<f32>>, usize)> {
    if raw.len() < 16 {
        return None;
    }
    let count = u64::from_le_bytes(raw[0..8].try_into().ok()?) as usize;
    let dims = u64::from_le_bytes(raw[8..16].try_into().ok()?) as usize;
    let expected = 16usize
        .checked_add(count.checked_mul(dims)?.checked_mul(4)?)?;
    if dims == 0 || raw.len() != expected {
        return None;
    }
    let mut rows = Vec::with_capacity(count);
    let mut offset = 16;
    for _ in 0..count {
        let mut row = Vec::with_capacity(dims);
        for _ in 0..dims {
            row.push(f32::from_le_bytes(raw[offset..offset + 4].try_into().ok()?));
            offset += 4;
        }
        rows.push(row);
    }
    Some((rows, dims))
}

/// Validate the accelerator descriptor against the loaded rows. Any
/// problem degrades to brute-force scanning.
fn load_ann_descriptor(path: &Path, count: usize, dims: usize) -> Option<()> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("ann descriptor {} unreadable ({}); brute-force scan", path.display(), e);
            } else {
                warn!("ann descriptor {} missing; brute-force scan", path.display());
            }
            return None;
        }
    };
    match serde_json::from_str::<AnnDescriptor>(&raw) {
        Ok(desc) if desc.kind == "hnsw" && desc.count == count && desc.dims == dims => Some(()),
        Ok(desc) => {
            warn!(
                "ann descriptor {} does not match snapshot (kind={}, count={}, dims={}); brute-force scan",
                path.display(),
                desc.kind,
                desc.count,
                desc.dims
            );
            None
        }
        Err(e) => {
            warn!("ann descriptor {} is corrupt ({}); brute-force scan", path.display(), e);
            None
        }
    }
}

/// Shared handle over the index: cheap to clone, readable concurrently,
/// writable by the single pipeline writer. Construction/loading may run
/// on a background task; `wait_until_ready` blocks up to a timeout or
/// polls non-blockingly with a zero timeout.
#[derive(Clone)]
pub struct IndexHandle {
    inner: Arc<RwLock<VectorIndex>>,
    ready: watch::Receiver<bool>,
}

impl IndexHandle {
    /// Wrap an already-constructed index; immediately ready.
    pub fn ready_now(index: VectorIndex) -> Self {
        let (_tx, rx) = watch::channel(true);
        Self {
            inner: Arc::new(RwLock::new(index)),
            ready: rx,
        }
    }

    /// Start loading the snapshot under `dir` on a background task. The
    /// handle serves an empty index until the load completes.
    pub fn open_background(dims: usize, dir: PathBuf) -> Self {
        let (tx, rx) = watch::channel(false);
        let inner = Arc::new(RwLock::new(VectorIndex::new(dims)));
        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let loaded = tokio::task::spawn_blocking(move || {
                VectorIndex::load(
                    dims,
                    &dir.join(EMBEDDINGS_FILE),
                    &dir.join(METADATA_FILE),
                    Some(&dir.join(ANN_FILE)),
                )
            })
            .await;
            match loaded {
                Ok(index) => {
                    let mut guard = task_inner.write().await;
                    if guard.is_empty() {
                        *guard = index;
                    } else {
                        // A writer got in before the load finished; its
                        // state is newer than the snapshot.
                        warn!("index already written during background load; keeping live state");
                    }
                }
                Err(e) => warn!("background index load panicked: {}; keeping empty index", e),
            }
            let _ = tx.send(true);
        });
        Self { inner, ready: rx }
    }

    /// True once the background load (if any) has finished. A zero
    /// timeout polls without blocking.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        if *self.ready.borrow() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let mut rx = self.ready.clone();
        let ok = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .is_ok();
        ok
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, VectorIndex> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, VectorIndex> {
        self.inner.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str, ext: &str) -> IndexEntry {
        IndexEntry {
            path: path.to_string(),
            ext: ext.to_string(),
            preview: format!("preview of {}", path),
            size: 10,
            mtime: 1_700_000_000,
            ctime: 1_690_000_000,
            owner: "alice".to_string(),
            tokens: vec!["preview".to_string()],
        }
    }

    fn unit_vec(dims: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn upsert_twice_keeps_one_entry_with_latest_data() {
        let mut index = VectorIndex::new(4);
        index.upsert(entry("/x/a.pdf", ".pdf"), unit_vec(4, 0));
        let mut second = entry("/x/a.pdf", ".pdf");
        second.owner = "bob".to_string();
        index.upsert(second, unit_vec(4, 1));

        assert_eq!(index.len(), 1);
        let hits = index.search(&unit_vec(4, 1), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.path, "/x/a.pdf");
        assert_eq!(hits[0].0.owner, "bob");
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn removed_path_never_surfaces() {
        let mut index = VectorIndex::new(4);
        index.upsert(entry("/x/a.pdf", ".pdf"), unit_vec(4, 0));
        index.upsert(entry("/x/b.pdf", ".pdf"), unit_vec(4, 1));
        index.remove_paths(&["/x/a.pdf".to_string()]);

        let hits = index.search(&unit_vec(4, 0), 10);
        assert!(hits.iter().all(|(e, _)| e.path != "/x/a.pdf"));
        assert_eq!(index.len(), 1);
        // Unknown path removal is a no-op.
        index.remove_paths(&["/nope".to_string()]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_fixes_row_mapping_for_moved_entries() {
        let mut index = VectorIndex::new(4);
        index.upsert(entry("/a", ".txt"), unit_vec(4, 0));
        index.upsert(entry("/b", ".txt"), unit_vec(4, 1));
        index.upsert(entry("/c", ".txt"), unit_vec(4, 2));
        index.remove_paths(&["/a".to_string()]);

        // "/c" was swapped into row 0; searching for it must still work.
        let hits = index.search(&unit_vec(4, 2), 1);
        assert_eq!(hits[0].0.path, "/c");
    }

    #[test]
    fn empty_index_search_is_empty() {
        let index = VectorIndex::new(4);
        assert!(index.search(&unit_vec(4, 0), 5).is_empty());
    }

    #[test]
    fn save_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut index = VectorIndex::new(4);
        index.upsert(entry("/x/a.pdf", ".pdf"), unit_vec(4, 0));
        index.upsert(entry("/x/b.hwp", ".hwp"), unit_vec(4, 1));
        index.save(tmp.path()).unwrap();

        let loaded = VectorIndex::load(
            4,
            &tmp.path().join(EMBEDDINGS_FILE),
            &tmp.path().join(METADATA_FILE),
            Some(&tmp.path().join(ANN_FILE)),
        );
        assert_eq!(loaded.len(), 2);
        let hits = loaded.search(&unit_vec(4, 1), 1);
        assert_eq!(hits[0].0.path, "/x/b.hwp");
    }

    #[test]
    fn missing_embedding_file_is_empty_index() {
        let tmp = TempDir::new().unwrap();
        let loaded = VectorIndex::load(
            8,
            &tmp.path().join(EMBEDDINGS_FILE),
            &tmp.path().join(METADATA_FILE),
            None,
        );
        assert!(loaded.is_empty());
        assert_eq!(loaded.dims(), 8);
    }

    #[test]
    fn corrupt_ann_descriptor_degrades_to_brute_force() {
        let tmp = TempDir::new().unwrap();
        let mut index = VectorIndex::new(4);
        index.upsert(entry("/x/a.pdf", ".pdf"), unit_vec(4, 0));
        index.save(tmp.path()).unwrap();
        std::fs::write(tmp.path().join(ANN_FILE), b"garbage").unwrap();

        let loaded = VectorIndex::load(
            4,
            &tmp.path().join(EMBEDDINGS_FILE),
            &tmp.path().join(METADATA_FILE),
            Some(&tmp.path().join(ANN_FILE)),
        );
        // Still searchable via brute force.
        let hits = loaded.search(&unit_vec(4, 0), 1);
        assert_eq!(hits[0].0.path, "/x/a.pdf");
    }

    #[tokio::test]
    async fn background_open_becomes_ready() {
        let tmp = TempDir::new().unwrap();
        {
            let mut index = VectorIndex::new(4);
            index.upsert(entry("/x/a.pdf", ".pdf"), unit_vec(4, 0));
            index.save(tmp.path()).unwrap();
        }
        let handle = IndexHandle::open_background(4, tmp.path().to_path_buf());
        assert!(handle.wait_until_ready(Duration::from_secs(5)).await);
        assert_eq!(handle.read().await.len(), 1);
    }

    #[tokio::test]
    async fn zero_timeout_polls() {
        let handle = IndexHandle::ready_now(VectorIndex::new(4));
        assert!(handle.wait_until_ready(Duration::ZERO).await);
    }
}
