//! Approximate tokenization shared by the chunker, the index, and the
//! hybrid scorer.
//!
//! Token counting is deliberately cheap: contiguous Korean-syllable runs
//! and alphanumeric runs of length >= 2 each count as one token. Pure
//! symbol/whitespace text falls back to `len / 4` so downstream chunking
//! never degenerates to zero tokens.

use std::collections::HashSet;

fn is_korean_syllable(c: char) -> bool {
    ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

#[derive(PartialEq)]
enum RunKind {
    Korean,
    Alnum,
    Other,
}

fn run_kind(c: char) -> RunKind {
    if is_korean_syllable(c) {
        RunKind::Korean
    } else if c.is_alphanumeric() {
        RunKind::Alnum
    } else {
        RunKind::Other
    }
}

fn scan_runs(text: &str, mut emit: impl FnMut(&str, &RunKind)) {
    let mut run_start = None::<usize>;
    let mut current = RunKind::Other;
    for (i, c) in text.char_indices() {
        let kind = run_kind(c);
        if kind == current && run_start.is_some() {
            continue;
        }
        if let Some(start) = run_start.take() {
            emit(&text[start..i], &current);
        }
        if kind != RunKind::Other {
            run_start = Some(i);
        }
        current = kind;
    }
    if let Some(start) = run_start {
        emit(&text[start..], &current);
    }
}

fn run_counts_as_token(run: &str, kind: &RunKind) -> bool {
    match kind {
        RunKind::Korean => true,
        RunKind::Alnum => run.chars().count() >= 2,
        RunKind::Other => false,
    }
}

/// Approximate token count of `text`; falls back to `chars / 4` for pure
/// symbol input.
pub fn approx_token_count(text: &str) -> usize {
    let mut count = 0usize;
    scan_runs(text, |run, kind| {
        if run_counts_as_token(run, kind) {
            count += 1;
        }
    });
    if count == 0 {
        text.chars().count() / 4
    } else {
        count
    }
}

/// Lowercased token sequence (duplicates preserved, in order).
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    scan_runs(text, |run, kind| {
        if run_counts_as_token(run, kind) {
            out.push(run.to_lowercase());
        }
    });
    out
}

/// Unique lexical tokens for storage in the index, capped at `limit` to
/// bound metadata size.
pub fn lexical_tokens(text: &str, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    scan_runs(text, |run, kind| {
        if out.len() < limit && run_counts_as_token(run, kind) {
            let tok = run.to_lowercase();
            if seen.insert(tok.clone()) {
                out.push(tok);
            }
        }
    });
    out
}

/// Keyword-overlap score in [0, 1]: fraction of query tokens present in
/// the stored token set. Empty query tokens score 0.
pub fn overlap_score(query_tokens: &[String], doc_tokens: &[String]) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc: HashSet<&str> = doc_tokens.iter().map(String::as_str).collect();
    let hits = query_tokens
        .iter()
        .filter(|t| doc.contains(t.as_str()))
        .count();
    hits as f32 / query_tokens.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_korean_and_alnum_runs() {
        // Two Korean runs and two alnum runs.
        assert_eq!(approx_token_count("인공지능 기반 search engine"), 4);
    }

    #[test]
    fn single_letter_runs_fall_back() {
        // No run qualifies, so the quarter-length fallback kicks in.
        assert_eq!(approx_token_count("a b c"), 1);
    }

    #[test]
    fn symbol_only_falls_back_to_quarter_length() {
        let sym = "!@#$%^&*()_+!@#$";
        assert_eq!(approx_token_count(sym), sym.chars().count() / 4);
    }

    #[test]
    fn tokenize_lowercases() {
        assert_eq!(tokenize("Annual REPORT 2024"), vec!["annual", "report", "2024"]);
    }

    #[test]
    fn lexical_tokens_dedup_and_cap() {
        let toks = lexical_tokens("data data data plan plan", 10);
        assert_eq!(toks, vec!["data", "plan"]);
        let capped = lexical_tokens("one two three four", 2);
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn overlap_is_query_fraction() {
        let q = tokenize("사업 계획서");
        let d = lexical_tokens("올해 사업 목표와 계획서 초안", 64);
        assert!((overlap_score(&q, &d) - 1.0).abs() < 1e-6);
        let d2 = lexical_tokens("전혀 관련없는 문서", 64);
        assert_eq!(overlap_score(&q, &d2), 0.0);
    }
}
