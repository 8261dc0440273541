//! Document loading and ingestion into vector memory.
//!
//! Loaders are thin: they produce [`Document`] values and hand off to the
//! shared pipeline `load → chunk → embed → upsert`.  Heavy per-format
//! parsers (PDF, CSV, XML readers) are external collaborators that
//! implement [`DocumentLoader`] and emit documents; the text and directory
//! loaders here cover plain files.
//!
//! Chunking respects `chunk_size` in approximate tokens (one token per
//! four characters) with `overlap`; identical chunk content is
//! deduplicated by SHA-256 before storage.
//!
//! # Example
//!
//! ```rust,no_run
//! use omnillm::omnillm::documents::{documents, IngestOptions};
//! use omnillm::omnillm::memory::{vector_memory, MemoryConfig};
//!
//! # async fn run() -> Result<(), omnillm::AiError> {
//! let memory = vector_memory("boxvector", MemoryConfig::default())?;
//! let report = documents("notes/meeting.txt")
//!     .to_memory(memory, IngestOptions { chunk_size: 400, overlap: 40, ..Default::default() })
//!     .await?;
//! println!("stored {} chunks ({} deduped)", report.stored, report.deduped);
//! # Ok(())
//! # }
//! ```

use crate::omnillm::error::AiError;
use crate::omnillm::memory::vector::VectorMemory;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// A loaded document: content plus source metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// The text content.
    pub content: String,
    /// Source metadata (path, format, caller-supplied keys).
    pub metadata: Map<String, Value>,
}

impl Document {
    /// A document with the given content and empty metadata.
    pub fn new(content: impl Into<String>) -> Self {
        Document {
            content: content.into(),
            metadata: Map::new(),
        }
    }

    /// Attach a metadata key.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// Documents produced by the loader.
    pub documents_in: usize,
    /// Chunks produced by splitting.
    pub chunks_out: usize,
    /// Chunks upserted into the memory.
    pub stored: usize,
    /// Chunks skipped (empty after trimming).
    pub skipped: usize,
    /// Chunks dropped as duplicates of already-seen content.
    pub deduped: usize,
    /// Approximate token count across stored chunks.
    pub token_count: usize,
    /// Number of embedding batch calls issued (via the memory's embedder).
    pub embedding_calls: usize,
    /// `token_count / 1000 * cost_per_1k_tokens`.
    pub estimated_cost: f64,
    /// Per-chunk errors that did not abort the run.
    pub errors: Vec<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Options for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Chunk size in approximate tokens.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks, in approximate tokens.
    pub overlap: usize,
    /// Embedding price per 1k tokens, for [`IngestReport::estimated_cost`].
    pub cost_per_1k_tokens: f64,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            chunk_size: 500,
            overlap: 50,
            cost_per_1k_tokens: 0.0,
        }
    }
}

/// A source of documents.
#[async_trait::async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Loader kind (`"text"`, `"directory"`, `"pdf"`, ...).
    fn loader_type(&self) -> &str;

    /// Produce the documents.
    async fn load(&self) -> Result<Vec<Document>, AiError>;

    /// Load, chunk, embed, and upsert into `memory`.
    async fn load_to(
        &self,
        memory: Arc<dyn VectorMemory>,
        options: IngestOptions,
    ) -> Result<IngestReport, AiError> {
        let started = Instant::now();
        let documents = self.load().await?;
        let mut report = IngestReport {
            documents_in: documents.len(),
            ..Default::default()
        };

        let mut seen_hashes = std::collections::HashSet::new();
        for (doc_index, document) in documents.iter().enumerate() {
            let chunks = chunk_text(&document.content, options.chunk_size, options.overlap);
            report.chunks_out += chunks.len();
            for (chunk_index, chunk) in chunks.into_iter().enumerate() {
                if chunk.trim().is_empty() {
                    report.skipped += 1;
                    continue;
                }
                let hash = hex::encode(Sha256::digest(chunk.as_bytes()));
                if !seen_hashes.insert(hash.clone()) {
                    report.deduped += 1;
                    continue;
                }
                let mut metadata = document.metadata.clone();
                metadata.insert("chunkIndex".into(), Value::from(chunk_index));
                metadata.insert("documentIndex".into(), Value::from(doc_index));
                metadata.insert("contentHash".into(), Value::String(hash.clone()));
                let id = format!("{}-{}", &hash[..16], chunk_index);
                match memory.upsert(&id, &chunk, metadata).await {
                    Ok(()) => {
                        report.stored += 1;
                        report.embedding_calls += 1;
                        report.token_count += estimate_tokens(&chunk);
                    }
                    Err(e) => report.errors.push(format!("chunk {}: {}", id, e)),
                }
            }
        }

        report.estimated_cost =
            report.token_count as f64 / 1000.0 * options.cost_per_1k_tokens;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }
}

/// Approximate token count: one token per four characters.
pub(crate) fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Split text into chunks of ~`chunk_size` tokens with `overlap` tokens of
/// carry-over, preferring paragraph and sentence boundaries.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_chars = chunk_size.max(1) * 4;
    let overlap_chars = overlap * 4;
    if text.len() <= chunk_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < text.len() {
        let hard_end = (start + chunk_chars).min(text.len());
        let end = if hard_end == text.len() {
            hard_end
        } else {
            break_point(text, start, hard_end)
        };
        chunks.push(text[start..end].to_string());
        if end == text.len() {
            break;
        }
        let mut next = end.saturating_sub(overlap_chars).max(start + 1);
        while next < text.len() && !text.is_char_boundary(next) {
            next += 1;
        }
        start = next;
    }
    chunks
}

/// Best split position at or before `hard_end`: paragraph break, then
/// sentence end, then whitespace, then the hard cut (aligned to a char
/// boundary).
fn break_point(text: &str, start: usize, hard_end: usize) -> usize {
    let mut hard_end = hard_end;
    while hard_end > start && !text.is_char_boundary(hard_end) {
        hard_end -= 1;
    }
    let window = &text[start..hard_end];
    for pattern in ["\n\n", ". ", "\n", " "] {
        if let Some(pos) = window.rfind(pattern) {
            if pos > window.len() / 2 {
                return start + pos + pattern.len();
            }
        }
    }
    hard_end
}

/// Loader for one plain-text file.
pub struct TextFileLoader {
    path: PathBuf,
}

impl TextFileLoader {
    /// A loader for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TextFileLoader { path: path.into() }
    }
}

#[async_trait::async_trait]
impl DocumentLoader for TextFileLoader {
    fn loader_type(&self) -> &str {
        "text"
    }

    async fn load(&self) -> Result<Vec<Document>, AiError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AiError::InvalidArgument(format!("cannot read {:?}: {}", self.path, e)))?;
        Ok(vec![Document::new(content).with_metadata(
            "source",
            Value::String(self.path.display().to_string()),
        )])
    }
}

/// Loader for every readable text file directly under a directory.
pub struct DirectoryLoader {
    path: PathBuf,
}

impl DirectoryLoader {
    /// A loader over the directory at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DirectoryLoader { path: path.into() }
    }
}

#[async_trait::async_trait]
impl DocumentLoader for DirectoryLoader {
    fn loader_type(&self) -> &str {
        "directory"
    }

    async fn load(&self) -> Result<Vec<Document>, AiError> {
        let mut reader = tokio::fs::read_dir(&self.path)
            .await
            .map_err(|e| AiError::InvalidArgument(format!("cannot list {:?}: {}", self.path, e)))?;
        let mut documents = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| AiError::Protocol(format!("directory read failed: {}", e)))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => documents.push(Document::new(content).with_metadata(
                    "source",
                    Value::String(path.display().to_string()),
                )),
                // Binary files are another loader's problem.
                Err(e) => log::debug!("skipping unreadable file {:?}: {}", path, e),
            }
        }
        documents.sort_by(|a, b| {
            a.metadata
                .get("source")
                .and_then(|s| s.as_str())
                .cmp(&b.metadata.get("source").and_then(|s| s.as_str()))
        });
        Ok(documents)
    }
}

/// A source ready to ingest: the entry point for the documents surface.
pub struct DocumentSource {
    loader: Arc<dyn DocumentLoader>,
}

impl DocumentSource {
    /// Wrap an explicit loader (external parsers plug in here).
    pub fn from_loader(loader: Arc<dyn DocumentLoader>) -> Self {
        DocumentSource { loader }
    }

    /// Produce the documents without ingesting.
    pub async fn load(&self) -> Result<Vec<Document>, AiError> {
        self.loader.load().await
    }

    /// Run the full pipeline into `memory`.
    pub async fn to_memory(
        &self,
        memory: Arc<dyn VectorMemory>,
        options: IngestOptions,
    ) -> Result<IngestReport, AiError> {
        self.loader.load_to(memory, options).await
    }
}

/// Build a [`DocumentSource`] for a path: directories get the directory
/// loader, files the text loader.
pub fn documents(source: impl AsRef<Path>) -> DocumentSource {
    let path = source.as_ref().to_path_buf();
    let loader: Arc<dyn DocumentLoader> = if path.is_dir() {
        Arc::new(DirectoryLoader::new(path))
    } else {
        Arc::new(TextFileLoader::new(path))
    };
    DocumentSource { loader }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omnillm::memory::vector::test_support::box_memory;
    use crate::omnillm::memory::TenantScope;

    #[test]
    fn chunking_respects_size_and_overlap() {
        let text = "word ".repeat(500);
        let chunks = chunk_text(&text, 50, 10);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // chunk_size 50 tokens ≈ 200 chars, plus boundary slack.
            assert!(chunk.len() <= 220);
        }
        // Overlap: the last overlap window of chunk N heads chunk N+1.
        let overlap_chars = 10 * 4;
        let tail = &chunks[0][chunks[0].len() - overlap_chars..];
        assert!(chunks[1].starts_with(tail));
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("short", 100, 10);
        assert_eq!(chunks, vec!["short"]);
    }

    #[tokio::test]
    async fn ingest_reports_and_dedupes() {
        struct Repeats;

        #[async_trait::async_trait]
        impl DocumentLoader for Repeats {
            fn loader_type(&self) -> &str {
                "stub"
            }

            async fn load(&self) -> Result<Vec<Document>, AiError> {
                Ok(vec![
                    Document::new("identical content"),
                    Document::new("identical content"),
                    Document::new("something else entirely"),
                ])
            }
        }

        let memory = Arc::new(box_memory(TenantScope::default()));
        let report = Repeats
            .load_to(memory.clone(), IngestOptions::default())
            .await
            .unwrap();

        assert_eq!(report.documents_in, 3);
        assert_eq!(report.chunks_out, 3);
        assert_eq!(report.stored, 2);
        // Identical documents dedupe down to |D| - 1 drops.
        assert_eq!(report.deduped, 1);
        assert!(report.token_count > 0);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn text_and_directory_loaders() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "alpha contents")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("b.txt"), "beta contents")
            .await
            .unwrap();

        let single = documents(dir.path().join("a.txt")).load().await.unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].content, "alpha contents");

        let all = documents(dir.path()).load().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "alpha contents");
    }

    #[tokio::test]
    async fn estimated_cost_uses_configured_rate() {
        struct One;

        #[async_trait::async_trait]
        impl DocumentLoader for One {
            fn loader_type(&self) -> &str {
                "stub"
            }

            async fn load(&self) -> Result<Vec<Document>, AiError> {
                Ok(vec![Document::new("x".repeat(4000))])
            }
        }

        let memory = Arc::new(box_memory(TenantScope::default()));
        let report = One
            .load_to(
                memory,
                IngestOptions {
                    chunk_size: 10_000,
                    overlap: 0,
                    cost_per_1k_tokens: 0.1,
                },
            )
            .await
            .unwrap();
        assert_eq!(report.token_count, 1000);
        assert!((report.estimated_cost - 0.1).abs() < 1e-9);
    }
}
