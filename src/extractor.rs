//! Text extraction collaborator.
//!
//! Format-specific parsing (PDF/DOCX/HWP/XLSX) lives outside this crate;
//! the [`Extractor`] trait is the boundary. The shipped
//! [`PlainTextExtractor`] handles UTF-8 text formats and reports binary
//! office formats as unsupported, which the corpus orchestrator records
//! as a failed row rather than an error.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

/// Extraction result: `ok == false` implies empty text.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub ok: bool,
    pub text: String,
    pub meta: serde_json::Value,
}

impl Extraction {
    pub fn failed(reason: &str) -> Self {
        Self {
            ok: false,
            text: String::new(),
            meta: json!({ "error": reason }),
        }
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract raw text from the file at `path`. Per-file failures are
    /// reported through `Extraction::ok`, not as errors; an `Err` is
    /// reserved for conditions the orchestrator also demotes to a failed
    /// row.
    async fn extract(&self, path: &Path) -> Result<Extraction>;
}

/// Extensions the plain-text extractor reads directly.
const TEXT_EXTS: &[&str] = &[
    ".txt", ".md", ".markdown", ".csv", ".log", ".json", ".xml", ".html", ".htm", ".rst",
];

/// Reads UTF-8 text formats; everything else is reported unsupported so
/// an external format extractor can take over.
pub struct PlainTextExtractor;

#[async_trait]
impl Extractor for PlainTextExtractor {
    async fn extract(&self, path: &Path) -> Result<Extraction> {
        let ext = crate::models::normalize_ext(&path.to_string_lossy());
        if !TEXT_EXTS.contains(&ext.as_str()) {
            return Ok(Extraction::failed(&format!(
                "unsupported format: {}",
                if ext.is_empty() { "(none)" } else { &ext }
            )));
        }
        let path = path.to_path_buf();
        let read = tokio::task::spawn_blocking(move || std::fs::read(&path)).await?;
        match read {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
                let chars = text.chars().count();
                Ok(Extraction {
                    ok: true,
                    meta: json!({ "chars": chars }),
                    text,
                })
            }
            Err(e) => Ok(Extraction::failed(&format!("read error: {}", e))),
        }
    }
}

/// Translation collaborator; the identity implementation is the default.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> Result<String>;
}

pub struct IdentityTranslator;

#[async_trait]
impl Translator for IdentityTranslator {
    async fn translate(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_utf8_text_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.md");
        std::fs::write(&path, "# 제목\n본문 내용\r\nnext line").unwrap();
        let out = PlainTextExtractor.extract(&path).await.unwrap();
        assert!(out.ok);
        assert!(out.text.contains("본문 내용\nnext line"));
    }

    #[tokio::test]
    async fn unsupported_format_is_failed_not_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deck.pptx");
        std::fs::write(&path, b"\x50\x4b").unwrap();
        let out = PlainTextExtractor.extract(&path).await.unwrap();
        assert!(!out.ok);
        assert!(out.text.is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_failed_row() {
        let out = PlainTextExtractor
            .extract(Path::new("/no/such/file.txt"))
            .await
            .unwrap();
        assert!(!out.ok);
    }
}
