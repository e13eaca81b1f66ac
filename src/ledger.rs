//! Scan ledger: the tabular record of every discovered file.
//!
//! One header row plus one row per path:
//! `path,size,mtime,ctime,ext,drive,owner,hash,allowed,policy_mask_pii`.
//! The file is only ever rewritten whole via temp-file + rename, so a
//! reader observes either the pre-rewrite or the post-rewrite content in
//! full, never a truncated ledger. Rows without a resolvable path are
//! skipped with a warning naming the offending columns; numeric fields
//! that fail to parse coerce to 0.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::cache::write_atomic;
use crate::models::{normalize_path, ScanRow};

pub const LEDGER_HEADER: &str = "path,size,mtime,ctime,ext,drive,owner,hash,allowed,policy_mask_pii";

/// Read all rows; a missing ledger is an empty corpus, not an error.
pub fn read_ledger(path: &Path) -> Result<Vec<ScanRow>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut rows = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        if lineno == 0 || line.trim().is_empty() {
            continue;
        }
        match parse_row(line) {
            Some(row) => rows.push(row),
            None => warn!(
                "scan ledger {}: skipping malformed row {} ({:?})",
                path.display(),
                lineno + 1,
                line
            ),
        }
    }
    Ok(rows)
}

/// Atomically rewrite the ledger: drop rows for `remove` paths, upsert
/// `upserts`, leave all other rows untouched.
pub fn rewrite_ledger(
    path: &Path,
    upserts: &[ScanRow],
    remove: &HashSet<String>,
) -> Result<Vec<ScanRow>> {
    let mut by_path: HashMap<String, ScanRow> = read_ledger(path)?
        .into_iter()
        .map(|r| (r.path.clone(), r))
        .collect();
    for p in remove {
        by_path.remove(p);
    }
    for row in upserts {
        by_path.insert(row.path.clone(), row.clone());
    }

    let mut rows: Vec<ScanRow> = by_path.into_values().collect();
    rows.sort_by(|a, b| a.path.cmp(&b.path));
    write_ledger(path, &rows)?;
    Ok(rows)
}

pub fn write_ledger(path: &Path, rows: &[ScanRow]) -> Result<()> {
    let mut out = String::with_capacity(64 * (rows.len() + 1));
    out.push_str(LEDGER_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&format_row(row));
        out.push('\n');
    }
    write_atomic(path, out.as_bytes())
}

fn format_row(row: &ScanRow) -> String {
    [
        escape_field(&row.path),
        row.size.to_string(),
        row.mtime.to_string(),
        row.ctime.to_string(),
        escape_field(&row.ext),
        escape_field(&row.drive),
        escape_field(&row.owner),
        escape_field(&row.file_hash),
        (row.allowed as u8).to_string(),
        (row.policy_mask_pii as u8).to_string(),
    ]
    .join(",")
}

fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split one line into fields, honoring double-quote escaping.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

fn parse_row(line: &str) -> Option<ScanRow> {
    let fields = split_fields(line);
    if fields.len() != 10 {
        return None;
    }
    let path = normalize_path(&fields[0])?;
    Some(ScanRow {
        path,
        size: fields[1].trim().parse().unwrap_or(0),
        mtime: fields[2].trim().parse().unwrap_or(0),
        ctime: fields[3].trim().parse().unwrap_or(0),
        ext: fields[4].trim().to_lowercase(),
        drive: fields[5].trim().to_string(),
        owner: fields[6].trim().to_string(),
        file_hash: fields[7].trim().to_string(),
        allowed: matches!(fields[8].trim(), "1" | "true"),
        policy_mask_pii: matches!(fields[9].trim(), "1" | "true"),
    })
}
