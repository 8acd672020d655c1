//! Code example extraction from stored documents.
//!
//! Each page's full markdown is scanned for fenced blocks, every block gets a
//! short summary, and `code + summary` is embedded and stored. Pages fail
//! independently.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use docharvest_markdown::{CodeBlock, extract_code_blocks};
use docharvest_shared::{
    CancellationToken, CodeExample, CrawlRequest, CrawlResult, CrawlSettings, HarvestError,
    Metadata, Result, SourceId, SourceRepository,
};

use crate::embeddings::EmbeddingService;

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+(.+?)\s*#*\s*$").unwrap());

/// Longest context sentence used in a heuristic summary.
const MAX_SENTENCE_CHARS: usize = 200;

/// Progress of the extraction stage, reported once per page.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeExtractionProgress {
    pub processed: usize,
    pub total: usize,
    pub found: usize,
    pub url: String,
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Produces a one-line description of a code block.
#[async_trait]
pub trait CodeSummarizer: Send + Sync {
    async fn summarize(&self, block: &CodeBlock) -> Result<String>;
}

/// Summary from the block's language and the prose leading into it.
///
/// Prefers the nearest heading above the block, then the last sentence
/// before it, then the first sentence after it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicSummarizer;

#[async_trait]
impl CodeSummarizer for HeuristicSummarizer {
    async fn summarize(&self, block: &CodeBlock) -> Result<String> {
        Ok(heuristic_summary(block))
    }
}

fn heuristic_summary(block: &CodeBlock) -> String {
    let label = match block.language.as_deref() {
        Some(lang) if !lang.is_empty() => format!("{lang} example"),
        _ => "Code example".to_string(),
    };

    let heading = HEADING_RE
        .captures_iter(&block.context_before)
        .last()
        .map(|c| c[1].trim().to_string());
    if let Some(heading) = heading {
        return format!("{label}: {heading}");
    }

    let before = last_sentence(&block.context_before);
    let after = first_sentence(&block.context_after);
    match before.or(after) {
        Some(sentence) => format!("{label}: {sentence}"),
        None => label,
    }
}

fn prose_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```") && !l.starts_with("~~~"))
}

fn last_sentence(text: &str) -> Option<String> {
    let line = prose_lines(text).last()?;
    let line = line.trim_end_matches(':').trim();
    let sentence = line
        .rsplit_terminator(['.', '!', '?'])
        .map(str::trim)
        .find(|s| !s.is_empty())?;
    Some(truncate_chars(sentence, MAX_SENTENCE_CHARS))
}

fn first_sentence(text: &str) -> Option<String> {
    let line = prose_lines(text).next()?;
    let sentence = line
        .split_terminator(['.', '!', '?'])
        .map(str::trim)
        .find(|s| !s.is_empty())?;
    Some(truncate_chars(sentence, MAX_SENTENCE_CHARS))
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs the code example stage over processed pages.
pub struct CodeExamplesOrchestrator {
    repository: Arc<dyn SourceRepository>,
    embedder: Arc<dyn EmbeddingService>,
    summarizer: Arc<dyn CodeSummarizer>,
    min_block_length: usize,
    context_chars: usize,
}

impl CodeExamplesOrchestrator {
    pub fn new(
        repository: Arc<dyn SourceRepository>,
        embedder: Arc<dyn EmbeddingService>,
        settings: &CrawlSettings,
    ) -> Self {
        Self {
            repository,
            embedder,
            summarizer: Arc::new(HeuristicSummarizer),
            min_block_length: settings.min_code_block_length,
            context_chars: settings.code_context_chars,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn CodeSummarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Extract, summarize, embed and store the code blocks of every stored page.
    ///
    /// Only pages present in `url_to_full_document` are scanned. Returns the
    /// number of examples stored.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(source_id = %source_id, pages = url_to_full_document.len()))]
    pub async fn extract_code_examples(
        &self,
        request: &CrawlRequest,
        results: &[CrawlResult],
        url_to_full_document: &HashMap<String, String>,
        source_id: &SourceId,
        cancel: &CancellationToken,
        on_progress: Option<&(dyn Fn(CodeExtractionProgress) + Send + Sync)>,
        total_pages: usize,
    ) -> Result<usize> {
        let mut found = 0usize;
        let mut processed = 0usize;

        for result in results {
            let Some(document) = url_to_full_document.get(&result.url) else {
                continue;
            };
            cancel.check()?;

            match self.extract_page(request, &result.url, document, source_id).await {
                Ok(stored) => found += stored,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => warn!(url = %result.url, error = %e, "code extraction failed for page"),
            }
            processed += 1;

            if let Some(cb) = on_progress {
                cb(CodeExtractionProgress {
                    processed,
                    total: total_pages,
                    found,
                    url: result.url.clone(),
                });
            }
        }

        info!(found, pages = processed, "code examples stored");
        Ok(found)
    }

    async fn extract_page(
        &self,
        request: &CrawlRequest,
        url: &str,
        document: &str,
        source_id: &SourceId,
    ) -> Result<usize> {
        let blocks = extract_code_blocks(document, self.min_block_length, self.context_chars);
        if blocks.is_empty() {
            return Ok(0);
        }
        debug!(url, blocks = blocks.len(), "code blocks found");

        let mut summaries = Vec::with_capacity(blocks.len());
        for block in &blocks {
            summaries.push(self.summarizer.summarize(block).await?);
        }

        let texts: Vec<String> = blocks
            .iter()
            .zip(&summaries)
            .map(|(block, summary)| format!("{}\n\nSummary: {summary}", block.code))
            .collect();
        let embeddings = self.embedder.create_embeddings_batch(&texts).await?;
        if embeddings.len() != blocks.len() {
            return Err(HarvestError::Embedding(format!(
                "{} embeddings for {} code blocks",
                embeddings.len(),
                blocks.len()
            )));
        }

        let mut examples = Vec::new();
        for (index, ((block, summary), embedding)) in
            blocks.into_iter().zip(summaries).zip(embeddings).enumerate()
        {
            let embedding = match embedding {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!(url, block = index, error = %e, "skipping code example");
                    continue;
                }
            };

            let mut metadata = Metadata::new();
            metadata.insert("url".into(), json!(url));
            metadata.insert("char_count".into(), json!(block.code.chars().count()));
            metadata.insert("knowledge_type".into(), json!(request.knowledge_type));
            if let Some(lang) = &block.language {
                metadata.insert("language".into(), json!(lang));
            }

            examples.push(CodeExample {
                source_id: source_id.clone(),
                url: url.to_string(),
                chunk_number: index as u32,
                language: block.language,
                content: block.code,
                summary,
                metadata,
                embedding,
            });
        }

        if examples.is_empty() {
            return Ok(0);
        }
        self.repository.insert_code_examples_batch(&examples).await
    }
}
