//! Knowledge corpus seam used by the retrieval loop, with an in-memory
//! keyword index for local files and tests.

#[cfg(feature = "qdrant-retriever")]
pub mod qdrant;
#[cfg(feature = "qdrant-retriever")]
pub use qdrant::{HybridRetriever, QdrantConfig};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BackendError;

const MIN_KEYWORD_LEN: usize = 3;
const CHUNK_KEYWORDS: usize = 256;

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f32,
    pub source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub source: Option<String>,
}

/// A pre-built similarity index. Population happens outside the retrieval loop.
#[async_trait]
pub trait KnowledgeCorpus: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, BackendError>;
}

pub type DynCorpus = Arc<dyn KnowledgeCorpus>;

/// Lowercased unique keywords of at least three characters, at most `limit`.
pub(crate) fn tokenize(text: &str, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for token in text.split(|c: char| !c.is_alphanumeric()) {
        let token = token.trim().to_lowercase();
        if token.chars().count() < MIN_KEYWORD_LEN {
            continue;
        }
        if seen.insert(token.clone()) {
            keywords.push(token);
        }
        if keywords.len() >= limit {
            break;
        }
    }

    keywords
}

/// Share of query keywords present in the document keywords.
pub(crate) fn lexical_boost(query_tokens: &HashSet<String>, doc_keywords: &[String]) -> f32 {
    if query_tokens.is_empty() || doc_keywords.is_empty() {
        return 0.0;
    }

    let overlap = doc_keywords
        .iter()
        .filter(|kw| query_tokens.contains(kw.as_str()))
        .count();

    overlap as f32 / query_tokens.len() as f32
}

/// Split `text` into windows of `size` characters overlapping by `overlap`.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || size == 0 {
        return Vec::new();
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

struct IndexedChunk {
    text: String,
    source: Option<String>,
    keywords: Vec<String>,
}

/// Keyword-overlap corpus held in memory.
pub struct InMemoryCorpus {
    chunks: Vec<IndexedChunk>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for InMemoryCorpus {
    fn default() -> Self {
        Self::new(1_000, 100)
    }
}

impl InMemoryCorpus {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunks: Vec::new(),
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn add_document(&mut self, document: Document) {
        let source = document.source.or(Some(document.id));
        for text in chunk_text(&document.text, self.chunk_size, self.chunk_overlap) {
            let keywords = tokenize(&text, CHUNK_KEYWORDS);
            self.chunks.push(IndexedChunk {
                text,
                source: source.clone(),
                keywords,
            });
        }
    }

    pub fn with_documents<I>(mut self, documents: I) -> Self
    where
        I: IntoIterator<Item = Document>,
    {
        for document in documents {
            self.add_document(document);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[async_trait]
impl KnowledgeCorpus for InMemoryCorpus {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, BackendError> {
        let query_tokens: HashSet<String> = tokenize(query, CHUNK_KEYWORDS).into_iter().collect();

        let mut hits: Vec<RetrievedChunk> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let score = lexical_boost(&query_tokens, &chunk.keywords);
                (score > 0.0).then(|| RetrievedChunk {
                    text: chunk.text.clone(),
                    score,
                    source: chunk.source.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }
}
