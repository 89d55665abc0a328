//! Knowledge retrieval for explanations

use crate::models::configuration::RetrievalConfig;
use crate::models::workflow::{Snippet, WorkflowState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Source of supporting snippets attached before the explanation stage
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return at most `top_k` snippets, best match first
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Snippet>>;
}

/// Retriever that never finds anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetrieval;

#[async_trait]
impl Retriever for NoRetrieval {
    async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<Snippet>> {
        Ok(Vec::new())
    }
}

/// Query text built from the parsed problem and the routed topic
pub fn retrieval_query(state: &WorkflowState) -> Option<String> {
    let parsed = state.parsed_expression.as_ref()?;
    let mut parts = vec![parsed.expression.clone()];
    if let Some(problem_type) = &parsed.problem_type {
        parts.push(problem_type.clone());
    }
    if let Some(intent) = &state.intent {
        parts.push(intent.topic.clone());
        if let Some(subtopic) = &intent.subtopic {
            parts.push(subtopic.clone());
        }
    }
    Some(parts.join(" "))
}

#[derive(Debug, Clone)]
struct Chunk {
    source: String,
    text: String,
    terms: HashSet<String>,
}

/// Keyword retriever over a directory of markdown and text notes
///
/// Documents are split into paragraphs; a paragraph scores the fraction of
/// query terms it contains.
#[derive(Debug, Clone)]
pub struct KnowledgeBaseRetriever {
    chunks: Vec<Chunk>,
    min_score: f64,
}

impl KnowledgeBaseRetriever {
    /// Load every `.md` and `.txt` file directly under `dir`
    pub fn load<P: AsRef<Path>>(dir: P, min_score: f64) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read knowledge directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("md") | Some("txt")
                    )
            })
            .collect();
        paths.sort();

        let mut retriever = Self {
            chunks: Vec::new(),
            min_score,
        };
        for path in paths {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            retriever.add_document(&source, &contents);
        }

        tracing::info!(
            "Loaded {} knowledge chunks from {}",
            retriever.chunks.len(),
            dir.display()
        );
        Ok(retriever)
    }

    /// Build from configuration; empty when no directory is configured
    pub fn from_config(config: &RetrievalConfig) -> Result<Self> {
        match &config.knowledge_dir {
            Some(dir) => Self::load(dir, config.min_score),
            None => Ok(Self {
                chunks: Vec::new(),
                min_score: config.min_score,
            }),
        }
    }

    /// Split a document into paragraph chunks
    pub fn add_document(&mut self, source: &str, contents: &str) {
        for paragraph in contents.split("\n\n") {
            let text = paragraph.trim();
            if text.is_empty() {
                continue;
            }
            let terms = terms(text);
            if terms.is_empty() {
                continue;
            }
            self.chunks.push(Chunk {
                source: source.to_string(),
                text: text.to_string(),
                terms,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn search(&self, query: &str, top_k: usize) -> Vec<Snippet> {
        let query_terms = terms(query);
        if query_terms.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<Snippet> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let hits = query_terms.intersection(&chunk.terms).count();
                let score = hits as f64 / query_terms.len() as f64;
                (hits > 0 && score >= self.min_score).then(|| Snippet {
                    source: chunk.source.clone(),
                    text: chunk.text.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        scored
    }
}

#[async_trait]
impl Retriever for KnowledgeBaseRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Snippet>> {
        Ok(self.search(query, top_k))
    }
}

/// Lowercase alphanumeric terms, ignoring very short tokens
fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}
