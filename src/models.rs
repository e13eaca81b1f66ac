//! Core data models used throughout deskdex.
//!
//! These types represent the scan rows, documents, chunks, and search hits
//! that flow through the incremental indexing and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// One discovered file with its filesystem metadata, as recorded in the
/// scan ledger. Produced by a filesystem scan, consumed once per
/// incremental cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRow {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub ext: String,
    pub drive: String,
    pub owner: String,
    pub file_hash: String,
    pub allowed: bool,
    pub policy_mask_pii: bool,
}

/// Extracted document produced by the corpus orchestrator and stored in
/// the corpus table. Superseded wholesale on re-extraction.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub path: String,
    pub ext: String,
    pub ok: bool,
    pub text: String,
    pub text_original: Option<String>,
    pub meta: String,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub owner: String,
    /// Content-based hash of the normalized extracted text, independent
    /// of filesystem timestamps.
    pub doc_hash: String,
    pub file_hash: String,
}

/// A chunk of document text produced by the semantic chunker. Immutable.
///
/// Character offsets are exact for non-overlapping splits; for chunks
/// whose prefix was seeded with an overlap window from the previous
/// chunk, `start_char` points at the first non-overlap unit and the
/// overlap text is not reflected in the recorded range.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub token_count: usize,
    pub meta: serde_json::Value,
}

impl Chunk {
    pub fn heading(&self) -> Option<&str> {
        self.meta.get("heading").and_then(|h| h.as_str())
    }
}

/// One cache entry per path; replaced wholesale on update, never merged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub path: String,
    pub doc_hash: String,
    pub chunk_count: i64,
    pub updated_at: i64,
}

/// Metadata stored alongside each embedding row in the vector index.
/// Exactly one live entry per path at all times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub ext: String,
    pub preview: String,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub owner: String,
    pub tokens: Vec<String>,
}

/// A ranked search hit. Derived deterministically from stored fields plus
/// session state; never mutates the index, discarded after the response.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub ext: String,
    pub drive: String,
    pub owner: String,
    pub mtime: i64,
    pub size: u64,
    pub preview: String,
    pub vector_similarity: f32,
    pub lexical_score: f32,
    pub final_score: f32,
    /// Which bonuses and keyword hints fired, for explainability.
    pub match_reasons: Vec<String>,
}

/// Normalize a raw path string: strip `file://`, unify separators,
/// collapse duplicate slashes, trim. Returns `None` when nothing
/// resolvable remains.
pub fn normalize_path(raw: &str) -> Option<String> {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("file://") {
        s = rest;
    }
    let replaced = s.replace('\\', "/");
    let mut out = String::with_capacity(replaced.len());
    let mut prev_slash = false;
    for c in replaced.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Normalized, lowercased extension with a leading dot (`".pdf"`), or an
/// empty string for extensionless paths.
pub fn normalize_ext(path: &str) -> String {
    match path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && !ext.contains('/') => {
            format!(".{}", ext.to_lowercase())
        }
        _ => String::new(),
    }
}

/// Lowercased, trimmed owner name used as the session-prior key.
pub fn normalize_owner(owner: &str) -> String {
    owner.trim().to_lowercase()
}

/// Drive component of a normalized path: `"C:"` for Windows-style paths,
/// `"/"` for rooted Unix paths, empty otherwise.
pub fn drive_of(path: &str) -> String {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => {
            format!("{}:", letter.to_ascii_uppercase())
        }
        (Some('/'), _) => "/".to_string(),
        _ => String::new(),
    }
}

/// Basename of a path; the full path is never exposed to the reranker or
/// to composed document strings.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_strips_scheme_and_backslashes() {
        assert_eq!(
            normalize_path("file://C:\\Docs\\report.pdf").as_deref(),
            Some("C:/Docs/report.pdf")
        );
        assert_eq!(normalize_path("  /x//a.pdf ").as_deref(), Some("/x/a.pdf"));
    }

    #[test]
    fn normalize_path_rejects_empty() {
        assert_eq!(normalize_path("   "), None);
        assert_eq!(normalize_path("file://"), None);
    }

    #[test]
    fn normalize_ext_lowercases_with_dot() {
        assert_eq!(normalize_ext("/x/a.PDF"), ".pdf");
        assert_eq!(normalize_ext("/x/report.docx"), ".docx");
        assert_eq!(normalize_ext("/x/Makefile"), "");
        assert_eq!(normalize_ext("/x/.hidden"), "");
    }

    #[test]
    fn drive_of_handles_both_conventions() {
        assert_eq!(drive_of("C:/Docs/a.pdf"), "C:");
        assert_eq!(drive_of("/home/u/a.pdf"), "/");
        assert_eq!(drive_of("relative/a.pdf"), "");
    }

    #[test]
    fn basename_is_last_component() {
        assert_eq!(basename("/x/y/보고서.hwp"), "보고서.hwp");
        assert_eq!(basename("plain.txt"), "plain.txt");
    }
}
