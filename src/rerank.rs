//! Cross-encoder reranking collaborator.
//!
//! The reranker is a black box scoring (query, document) pairs. Composed
//! document strings carry the masked filename (basename only — the full
//! path is never exposed to the reranker), extension, drive, owner, a
//! human-formatted modification date and size, and the preview text.
//!
//! Backends: [`IdentityReranker`] (guaranteed fallback, preserves the
//! incoming order) and [`HttpReranker`] for a local cross-encoder
//! service, with the same retry/backoff discipline as the embedding
//! client.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::config::RerankConfig;
use crate::models::{basename, drive_of, SearchHit};
use crate::scorer::normalize;

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Relevance score per document, higher is better, same order as the
    /// input.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

/// Fallback reranker: scores preserve the incoming order.
pub struct IdentityReranker;

#[async_trait]
impl Reranker for IdentityReranker {
    fn name(&self) -> &str {
        "identity"
    }

    async fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let n = documents.len();
        Ok((0..n).map(|i| (n - i) as f32).collect())
    }
}

/// HTTP cross-encoder client (`POST {url}/rerank` with query + documents,
/// expecting `{"scores": [...]}`).
pub struct HttpReranker {
    url: String,
    model: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rerank.url required for the HTTP reranker"))?;
        Ok(Self {
            url,
            model: config.model.clone().unwrap_or_default(),
            timeout_secs: 30,
            max_retries: 3,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        if self.model.is_empty() {
            "http"
        } else {
            &self.model
        }
    }

    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            let resp = client
                .post(format!("{}/rerank", self.url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;
            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let scores = json
                            .get("scores")
                            .and_then(|s| s.as_array())
                            .ok_or_else(|| {
                                anyhow::anyhow!("invalid rerank response: missing scores array")
                            })?;
                        return Ok(scores
                            .iter()
                            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                            .collect());
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("rerank API error {}: {}", status, body_text));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("rerank API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("rerank failed after retries")))
    }
}

/// Create the configured reranker, falling back to identity.
pub fn create_reranker(config: &RerankConfig) -> Result<Box<dyn Reranker>> {
    if config.enabled && config.url.is_some() {
        Ok(Box::new(HttpReranker::new(config)?))
    } else {
        Ok(Box::new(IdentityReranker))
    }
}

/// Compose the document string fed to the cross-encoder. Only the
/// basename of the path appears.
pub fn compose_document(hit: &SearchHit) -> String {
    format!(
        "{} | {} | {} | {} | {} | {} | {}",
        basename(&hit.path),
        hit.ext,
        drive_of(&hit.path),
        hit.owner,
        format_mtime(hit.mtime),
        format_size(hit.size),
        hit.preview
    )
}

/// Re-score the top `depth` hits through the reranker. Reranked hits are
/// reordered by fused score (normalized rerank score added to the
/// existing final score) and hits scoring below `min_score` are dropped;
/// hits beyond `depth` keep their positions after the reranked block.
pub async fn apply_rerank(
    reranker: &dyn Reranker,
    query: &str,
    hits: Vec<SearchHit>,
    depth: usize,
    batch_size: usize,
    min_score: f32,
) -> Result<Vec<SearchHit>> {
    if hits.len() <= 1 || depth == 0 {
        return Ok(hits);
    }
    let depth = depth.min(hits.len());
    let mut head: Vec<SearchHit> = hits.into_iter().collect();
    let tail = head.split_off(depth);

    let documents: Vec<String> = head.iter().map(compose_document).collect();
    let mut scores: Vec<f32> = Vec::with_capacity(documents.len());
    for batch in documents.chunks(batch_size.max(1)) {
        scores.extend(reranker.score(query, batch).await?);
    }
    if scores.len() != head.len() {
        bail!(
            "reranker returned {} scores for {} documents",
            scores.len(),
            head.len()
        );
    }

    let fused = normalize(&scores);
    let mut reranked: Vec<(SearchHit, f32)> = head
        .into_iter()
        .zip(scores.iter().copied())
        .zip(fused.into_iter())
        .filter_map(|((mut hit, raw), norm)| {
            if raw < min_score {
                debug!("rerank dropped {} (score {:.3})", basename(&hit.path), raw);
                return None;
            }
            hit.match_reasons.push("rerank".to_string());
            hit.final_score += norm;
            Some((hit, raw))
        })
        .collect();
    reranked.sort_by(|a, b| {
        b.0.final_score
            .partial_cmp(&a.0.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out: Vec<SearchHit> = reranked.into_iter().map(|(h, _)| h).collect();
    out.extend(tail);
    Ok(out)
}

/// `2026-08-01` style date for composed documents.
pub fn format_mtime(mtime: i64) -> String {
    chrono::DateTime::from_timestamp(mtime, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| mtime.to_string())
}

/// Human-formatted size: `532 B`, `1.2 KB`, `3.4 MB`, `5.6 GB`.
pub fn format_size(size: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let s = size as f64;
    if s >= GB {
        format!("{:.1} GB", s / GB)
    } else if s >= MB {
        format!("{:.1} MB", s / MB)
    } else if s >= KB {
        format!("{:.1} KB", s / KB)
    } else {
        format!("{} B", size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, score: f32) -> SearchHit {
        SearchHit {
            path: path.to_string(),
            ext: ".pdf".to_string(),
            drive: "/".to_string(),
            owner: "alice".to_string(),
            mtime: 1_722_470_400,
            size: 1_300_000,
            preview: "미리보기".to_string(),
            vector_similarity: score,
            lexical_score: 0.0,
            final_score: score,
            match_reasons: Vec::new(),
        }
    }

    struct FixedReranker(Vec<f32>);

    #[async_trait]
    impl Reranker for FixedReranker {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
            Ok(self.0[..documents.len()].to_vec())
        }
    }

    #[test]
    fn composed_document_masks_path() {
        let h = hit("/secret/dir/연봉계약서.pdf", 0.9);
        let doc = compose_document(&h);
        assert!(doc.contains("연봉계약서.pdf"));
        assert!(!doc.contains("/secret/dir"));
        assert!(doc.contains("1.2 MB"));
        assert!(doc.contains("2024") || doc.contains("2026") || doc.contains("-"));
    }

    #[tokio::test]
    async fn rerank_reorders_head_and_keeps_tail() {
        let hits = vec![hit("/a", 0.9), hit("/b", 0.8), hit("/c", 0.7)];
        let reranker = FixedReranker(vec![0.1, 0.9]);
        let out = apply_rerank(&reranker, "q", hits, 2, 16, 0.0).await.unwrap();
        // /b overtakes /a inside the reranked block; /c stays behind.
        assert_eq!(out[0].path, "/b");
        assert_eq!(out[1].path, "/a");
        assert_eq!(out[2].path, "/c");
        assert!(out[0].match_reasons.contains(&"rerank".to_string()));
    }

    #[tokio::test]
    async fn rerank_drops_below_min_score() {
        let hits = vec![hit("/a", 0.9), hit("/b", 0.8)];
        let reranker = FixedReranker(vec![0.05, 0.9]);
        let out = apply_rerank(&reranker, "q", hits, 2, 16, 0.2).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, "/b");
    }

    #[tokio::test]
    async fn identity_reranker_preserves_order() {
        let hits = vec![hit("/a", 0.9), hit("/b", 0.8)];
        let out = apply_rerank(&IdentityReranker, "q", hits, 2, 16, 0.0)
            .await
            .unwrap();
        assert_eq!(out[0].path, "/a");
        assert_eq!(out[1].path, "/b");
    }

    #[test]
    fn sizes_format_humanly() {
        assert_eq!(format_size(900), "900 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
