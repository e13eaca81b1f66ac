//! Hybrid score fusion and extension-biased re-ranking.
//!
//! Fuses vector similarity, lexical keyword overlap, extension/owner and
//! session bonuses into one final ranking. Raw heterogeneous scores are
//! min-max normalized to [0, 1] before summation; all-equal inputs
//! normalize to 0.5 so a degenerate candidate set neither dominates nor
//! vanishes. The extension preference is a soft filter: desired-extension
//! hits are moved ahead of others up to a 95% quota of `top_k`, but the
//! result is always topped up to `top_k` from the remaining candidates.

use std::collections::HashSet;

use crate::models::{drive_of, IndexEntry, SearchHit};
use crate::session::SessionState;

/// Fixed bonus for an entry whose extension is in the desired set.
const EXT_BONUS: f32 = 0.05;
/// Multiplier for session extension preference scores.
const SESSION_EXT_WEIGHT: f32 = 0.05;
/// Multiplier for session owner prior scores.
const SESSION_OWNER_WEIGHT: f32 = 0.04;
/// Fraction of `top_k` slots reserved for desired-extension hits.
const EXT_QUOTA_RATIO: f32 = 0.95;

/// One scoring candidate: an index entry plus its raw cosine similarity.
pub struct Candidate {
    pub entry: IndexEntry,
    pub vector_similarity: f32,
}

/// Query-side inputs to a scoring pass.
pub struct RankRequest<'a> {
    pub query_tokens: &'a [String],
    pub desired_exts: &'a HashSet<String>,
    /// Configured lexical weight plus any keyword-hint boost.
    pub lexical_weight: f32,
    /// Query-level hint reasons, attached to hits with lexical overlap.
    pub hint_reasons: &'a [String],
    pub session: &'a SessionState,
    pub min_similarity: f32,
}

/// Min-max normalize to [0, 1]; all-equal inputs normalize to 0.5.
pub fn normalize(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if (max - min).abs() < f32::EPSILON {
        return vec![0.5; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}

/// Score and order all candidates. Truncation and the soft extension
/// filter happen afterwards in [`prioritize_ext_hits`], after any
/// reranking pass.
pub fn score_candidates(candidates: Vec<Candidate>, req: &RankRequest) -> Vec<SearchHit> {
    let survivors: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.vector_similarity >= req.min_similarity)
        .collect();
    if survivors.is_empty() {
        return Vec::new();
    }

    let vector_raw: Vec<f32> = survivors.iter().map(|c| c.vector_similarity).collect();
    let lexical_raw: Vec<f32> = survivors
        .iter()
        .map(|c| crate::lexical::overlap_score(req.query_tokens, &c.entry.tokens))
        .collect();
    let vector_norm = normalize(&vector_raw);
    let lexical_norm = normalize(&lexical_raw);

    let mut hits: Vec<SearchHit> = survivors
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let mut reasons: Vec<String> = Vec::new();
            let mut score = vector_norm[i] + req.lexical_weight * lexical_norm[i];

            if lexical_raw[i] > 0.0 {
                reasons.extend(req.hint_reasons.iter().cloned());
            }
            if req.desired_exts.contains(&c.entry.ext) {
                score += EXT_BONUS;
                reasons.push(format!("ext-bonus:{}", c.entry.ext));
            }
            let session_ext = req.session.ext_score(&c.entry.ext);
            if session_ext > 0.0 {
                score += session_ext * SESSION_EXT_WEIGHT;
                reasons.push(format!("session-ext:{}", c.entry.ext));
            }
            let session_owner = req.session.owner_score(&c.entry.owner);
            if session_owner > 0.0 {
                score += session_owner * SESSION_OWNER_WEIGHT;
                reasons.push("session-owner".to_string());
            }

            SearchHit {
                drive: drive_of(&c.entry.path),
                path: c.entry.path,
                ext: c.entry.ext,
                owner: c.entry.owner,
                mtime: c.entry.mtime,
                size: c.entry.size,
                preview: c.entry.preview,
                vector_similarity: vector_raw[i],
                lexical_score: lexical_raw[i],
                final_score: score,
                match_reasons: reasons,
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
    });
    hits
}

/// Soft extension filter: desired-extension hits fill up to
/// `ceil(0.95 * top_k)` of the returned slots before non-matching hits
/// are used for the remainder. Never under-fills: when fewer matching
/// hits exist than the quota, the rest of the slots come from the other
/// candidates in rank order.
pub fn prioritize_ext_hits(
    hits: Vec<SearchHit>,
    desired_exts: &HashSet<String>,
    top_k: usize,
) -> Vec<SearchHit> {
    if desired_exts.is_empty() || hits.len() <= 1 {
        let mut hits = hits;
        hits.truncate(top_k);
        return hits;
    }

    let quota = ((top_k as f32 * EXT_QUOTA_RATIO).ceil() as usize).min(top_k);
    let (matching, rest): (Vec<SearchHit>, Vec<SearchHit>) = hits
        .into_iter()
        .partition(|h| desired_exts.contains(&h.ext));

    let mut out: Vec<SearchHit> = Vec::with_capacity(top_k);
    let mut matching = matching.into_iter();
    for hit in matching.by_ref() {
        if out.len() >= quota {
            // Quota reached; the hit is still a candidate for leftover
            // slots below.
            let mut remainder: Vec<SearchHit> = vec![hit];
            remainder.extend(matching);
            return fill_remainder(out, remainder, rest, top_k);
        }
        out.push(hit);
    }
    fill_remainder(out, Vec::new(), rest, top_k)
}

fn fill_remainder(
    mut out: Vec<SearchHit>,
    leftover_matching: Vec<SearchHit>,
    rest: Vec<SearchHit>,
    top_k: usize,
) -> Vec<SearchHit> {
    for hit in rest {
        if out.len() >= top_k {
            return out;
        }
        out.push(hit);
    }
    for hit in leftover_matching {
        if out.len() >= top_k {
            break;
        }
        out.push(hit);
    }
    out
}
