//! Corpus store and extraction orchestrator.
//!
//! For each scan row needing (re)processing: extract text, compute the
//! content-based `doc_hash`, apply PII masking when the row's policy
//! flag is set, optionally translate, and append the resulting record to
//! the corpus table. Failed or empty extractions are excluded from the
//! corpus but still reported so the pipeline records them as processed
//! and does not retry every cycle.
//!
//! Extraction is I/O-bound and runs on a bounded worker pool; the cancel
//! flag is polled between items.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cancel::CancelFlag;
use crate::extractor::{Extraction, Extractor, Translator};
use crate::mask::PiiMasker;
use crate::models::{DocumentRecord, ScanRow};

/// Stable content hash of extracted text: line endings unified and
/// surrounding whitespace trimmed before hashing, so the hash is
/// independent of filesystem timestamps and trailing-newline noise.
pub fn doc_hash(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Streaming SHA-256 of a file's raw bytes.
pub fn file_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Collaborators the orchestrator drives. The extractor fans out onto
/// worker tasks, so it is shared; masking and translation run inline.
pub struct Collaborators<'a> {
    pub extractor: Arc<dyn Extractor>,
    pub masker: &'a dyn PiiMasker,
    pub translator: &'a dyn Translator,
}

/// Extract and post-process one batch of scan rows. Returns one record
/// per input row (failed extractions come back with `ok == false` and
/// empty text). Order follows the input batch.
pub async fn process_rows(
    rows: &[ScanRow],
    collab: Collaborators<'_>,
    io_workers: usize,
    cancel: &CancelFlag,
) -> Result<Vec<DocumentRecord>> {
    let semaphore = Arc::new(Semaphore::new(io_workers.max(1)));
    let mut records: Vec<Option<DocumentRecord>> = Vec::with_capacity(rows.len());
    records.resize_with(rows.len(), || None);

    // Extraction fans out; post-processing (mask/translate) is cheap and
    // runs inline as results arrive.
    let mut join = tokio::task::JoinSet::new();
    for (i, row) in rows.iter().enumerate() {
        cancel.check()?;
        let permit = Arc::clone(&semaphore).acquire_owned().await?;
        let path = std::path::PathBuf::from(&row.path);
        let extractor = Arc::clone(&collab.extractor);
        join.spawn(async move {
            let result = extractor.extract(&path).await;
            drop(permit);
            (i, result)
        });
    }

    while let Some(joined) = join.join_next().await {
        let (i, result) = joined?;
        let row = &rows[i];
        let extraction = match result {
            Ok(extraction) => extraction,
            Err(e) => {
                warn!("extraction failed for {}: {}", row.path, e);
                Extraction::failed(&e.to_string())
            }
        };
        records[i] = Some(finish_record(row, extraction, &collab, cancel).await?);
    }

    Ok(records.into_iter().flatten().collect())
}

async fn finish_record(
    row: &ScanRow,
    extraction: Extraction,
    collab: &Collaborators<'_>,
    cancel: &CancelFlag,
) -> Result<DocumentRecord> {
    cancel.check()?;

    if !extraction.ok {
        debug!("extraction not ok for {}: excluded from corpus", row.path);
        return Ok(empty_record(row, &extraction));
    }

    let raw = extraction.text;
    let hash = doc_hash(&raw);

    let mut text = if row.policy_mask_pii {
        collab.masker.mask(&raw)
    } else {
        raw.clone()
    };
    match collab.translator.translate(&text).await {
        Ok(translated) => text = translated,
        Err(e) => {
            warn!("translation failed for {}; keeping untranslated text: {}", row.path, e);
        }
    }
    let text_original = if text != raw { Some(raw) } else { None };

    Ok(DocumentRecord {
        path: row.path.clone(),
        ext: row.ext.clone(),
        ok: true,
        text,
        text_original,
        meta: extraction.meta.to_string(),
        size: row.size,
        mtime: row.mtime,
        ctime: row.ctime,
        owner: row.owner.clone(),
        doc_hash: hash,
        file_hash: row.file_hash.clone(),
    })
}

fn empty_record(row: &ScanRow, extraction: &Extraction) -> DocumentRecord {
    DocumentRecord {
        path: row.path.clone(),
        ext: row.ext.clone(),
        ok: false,
        text: String::new(),
        text_original: None,
        meta: extraction.meta.to_string(),
        size: row.size,
        mtime: row.mtime,
        ctime: row.ctime,
        owner: row.owner.clone(),
        doc_hash: String::new(),
        file_hash: row.file_hash.clone(),
    }
}

/// Append validated records. Rows with failed extraction or empty text
/// are skipped here — the caller still marks them processed.
pub async fn append_records(pool: &SqlitePool, records: &[DocumentRecord]) -> Result<u64> {
    let mut appended = 0u64;
    for record in records {
        if !record.ok || record.text.trim().is_empty() {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO corpus (path, ext, ok, text, text_original, meta, size, mtime, ctime, owner, doc_hash, file_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path, doc_hash) DO UPDATE SET
                ext = excluded.ext,
                ok = excluded.ok,
                text = excluded.text,
                text_original = excluded.text_original,
                meta = excluded.meta,
                size = excluded.size,
                mtime = excluded.mtime,
                ctime = excluded.ctime,
                owner = excluded.owner,
                file_hash = excluded.file_hash
            "#,
        )
        .bind(&record.path)
        .bind(&record.ext)
        .bind(record.ok as i64)
        .bind(&record.text)
        .bind(&record.text_original)
        .bind(&record.meta)
        .bind(record.size as i64)
        .bind(record.mtime)
        .bind(record.ctime)
        .bind(&record.owner)
        .bind(&record.doc_hash)
        .bind(&record.file_hash)
        .execute(pool)
        .await?;
        appended += 1;
    }
    Ok(appended)
}

/// Drop every corpus row for the given paths; a changed file's old row
/// must not linger.
pub async fn delete_rows(pool: &SqlitePool, paths: &HashSet<String>) -> Result<u64> {
    let mut deleted = 0u64;
    for path in paths {
        let result = sqlx::query("DELETE FROM corpus WHERE path = ?")
            .bind(path)
            .execute(pool)
            .await?;
        deleted += result.rows_affected();
    }
    Ok(deleted)
}

pub async fn count_rows(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM corpus")
        .fetch_one(pool)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{IdentityTranslator, PlainTextExtractor};
    use crate::mask::RegexMasker;
    use tempfile::TempDir;

    fn scan_row(path: &str, mask: bool) -> ScanRow {
        ScanRow {
            path: path.to_string(),
            size: 10,
            mtime: 1,
            ctime: 1,
            ext: crate::models::normalize_ext(path),
            drive: "/".to_string(),
            owner: "alice".to_string(),
            file_hash: "fh".to_string(),
            allowed: true,
            policy_mask_pii: mask,
        }
    }

    fn collaborators<'a>(
        masker: &'a RegexMasker,
        translator: &'a IdentityTranslator,
    ) -> Collaborators<'a> {
        Collaborators {
            extractor: Arc::new(PlainTextExtractor),
            masker,
            translator,
        }
    }

    #[test]
    fn doc_hash_ignores_line_endings_and_trailing_space() {
        assert_eq!(doc_hash("a\r\nb\n"), doc_hash("a\nb"));
        assert_ne!(doc_hash("a"), doc_hash("b"));
    }

    #[tokio::test]
    async fn failed_extraction_yields_not_ok_record() {
        let tmp = TempDir::new().unwrap();
        let bin = tmp.path().join("img.pptx");
        std::fs::write(&bin, b"zz").unwrap();

        let masker = RegexMasker::new();
        let translator = IdentityTranslator;
        let rows = vec![scan_row(&bin.to_string_lossy(), false)];
        let records = process_rows(
            &rows,
            collaborators(&masker, &translator),
            2,
            &CancelFlag::new(),
        )
        .await
        .unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].ok);
        assert!(records[0].text.is_empty());
    }

    #[tokio::test]
    async fn masking_applies_when_flagged() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("hr.txt");
        std::fs::write(&file, "주민번호 900101-1234567 문서").unwrap();

        let masker = RegexMasker::new();
        let translator = IdentityTranslator;
        let rows = vec![scan_row(&file.to_string_lossy(), true)];
        let records = process_rows(
            &rows,
            collaborators(&masker, &translator),
            2,
            &CancelFlag::new(),
        )
        .await
        .unwrap();
        assert!(records[0].ok);
        assert!(!records[0].text.contains("900101-1234567"));
        assert!(records[0]
            .text_original
            .as_deref()
            .unwrap()
            .contains("900101-1234567"));
    }

    #[tokio::test]
    async fn cancel_aborts_between_items() {
        let masker = RegexMasker::new();
        let translator = IdentityTranslator;
        let cancel = CancelFlag::new();
        cancel.cancel();
        let rows = vec![scan_row("/x/a.txt", false)];
        let result = process_rows(
            &rows,
            collaborators(&masker, &translator),
            2,
            &cancel,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn append_skips_failed_and_empty() {
        let tmp = TempDir::new().unwrap();
        let config = crate::config::Config {
            db: crate::config::DbConfig {
                path: tmp.path().join("c.sqlite"),
            },
            index: crate::config::IndexConfig {
                dir: tmp.path().join("index"),
            },
            chunking: Default::default(),
            retrieval: Default::default(),
            rerank: Default::default(),
            embedding: Default::default(),
            watch: Default::default(),
            cache: Default::default(),
            policy: Default::default(),
        };
        let pool = crate::db::connect(&config).await.unwrap();
        crate::db::migrate(&pool).await.unwrap();

        let good = DocumentRecord {
            path: "/x/a.txt".to_string(),
            ext: ".txt".to_string(),
            ok: true,
            text: "본문".to_string(),
            text_original: None,
            meta: "{}".to_string(),
            size: 2,
            mtime: 1,
            ctime: 1,
            owner: "alice".to_string(),
            doc_hash: doc_hash("본문"),
            file_hash: "fh".to_string(),
        };
        let mut failed = good.clone();
        failed.path = "/x/bad.txt".to_string();
        failed.ok = false;
        failed.text = String::new();

        let appended = append_records(&pool, &[good, failed]).await.unwrap();
        assert_eq!(appended, 1);
        assert_eq!(count_rows(&pool).await.unwrap(), 1);
        pool.close().await;
    }
}
