use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use fastembed::TextEmbedding;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::{Document, KnowledgeCorpus, RetrievedChunk, chunk_text, lexical_boost, tokenize};
use crate::error::BackendError;

const KEY_TEXT: &str = "text";
const KEY_SOURCE: &str = "source";
const KEY_KEYWORDS: &str = "keywords";
const MAX_KEYWORDS: usize = 32;

#[derive(Clone, Debug)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
    pub concurrency_limit: usize,
}

/// Dense FastEmbed search in Qdrant, re-ranked with keyword overlap.
pub struct HybridRetriever {
    client: Qdrant,
    collection: String,
    semaphore: Arc<Semaphore>,
    dense_model: Arc<Mutex<TextEmbedding>>,
}

impl HybridRetriever {
    pub async fn new(config: QdrantConfig) -> anyhow::Result<Self> {
        let (dense_model, dimension) = tokio::task::spawn_blocking(|| -> anyhow::Result<_> {
            let mut model = TextEmbedding::try_new(Default::default())
                .map_err(|err| anyhow!("failed to initialise FastEmbed model: {err}"))?;

            let warmup = model
                .embed(vec!["deepreport warmup"], Some(1))
                .map_err(|err| anyhow!("failed to warm up FastEmbed model: {err}"))?;
            let dimension = warmup
                .first()
                .map(|vector| vector.len())
                .filter(|len| *len > 0)
                .ok_or_else(|| anyhow!("FastEmbed warmup returned no embedding rows"))?;

            Ok((model, dimension))
        })
        .await??;

        let client = Qdrant::from_url(&config.url)
            .build()
            .map_err(|err| anyhow!("failed to create Qdrant client: {err}"))?;

        ensure_collection(&client, &config.collection, dimension).await?;

        Ok(Self {
            client,
            collection: config.collection,
            semaphore: Arc::new(Semaphore::new(config.concurrency_limit.max(1))),
            dense_model: Arc::new(Mutex::new(dense_model)),
        })
    }

    /// Chunk, embed and upsert documents. Chunk ids are `<document id>#<n>`.
    pub async fn ingest(
        &self,
        documents: Vec<Document>,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> anyhow::Result<usize> {
        let chunks: Vec<(String, String, Option<String>)> = documents
            .into_iter()
            .flat_map(|doc| {
                let source = doc.source.clone().or_else(|| Some(doc.id.clone()));
                chunk_text(&doc.text, chunk_size, chunk_overlap)
                    .into_iter()
                    .enumerate()
                    .map(move |(idx, text)| (format!("{}#{idx}", doc.id), text, source.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        if chunks.is_empty() {
            return Ok(0);
        }

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("semaphore closed unexpectedly")?;

        let texts: Vec<String> = chunks.iter().map(|(_, text, _)| text.clone()).collect();
        let dense_model = self.dense_model.clone();

        let embeddings = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Vec<f32>>> {
            let mut model = dense_model
                .lock()
                .map_err(|_| anyhow!("embedding model poisoned"))?;
            model
                .embed(texts, Some(32))
                .map_err(|err| anyhow!("failed to embed documents: {err}"))
        })
        .await??;

        let mut points = Vec::with_capacity(chunks.len());
        for ((id, text, source), vector) in chunks.iter().zip(embeddings.into_iter()) {
            let payload = build_payload(text, source.as_ref(), tokenize(text, MAX_KEYWORDS))?;
            points.push(PointStruct::new(
                uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, id.as_bytes()).to_string(),
                vector,
                payload,
            ));
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(|err| anyhow!("failed to upsert chunks into qdrant: {err}"))?;

        debug!(count = chunks.len(), "ingested chunks into qdrant");
        Ok(chunks.len())
    }

    async fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<RetrievedChunk>> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("semaphore closed unexpectedly")?;

        let dense_model = self.dense_model.clone();
        let owned_query = query.to_string();
        let query_embedding = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<f32>> {
            let mut model = dense_model
                .lock()
                .map_err(|_| anyhow!("embedding model poisoned"))?;
            let embeddings = model
                .embed(vec![owned_query], Some(1))
                .map_err(|err| anyhow!("failed to embed query: {err}"))?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("embedding model returned empty result"))
        })
        .await??;

        let search = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query_embedding, limit as u64)
                    .with_payload(true),
            )
            .await
            .map_err(|err| anyhow!("qdrant search failed: {err}"))?;

        let query_tokens: HashSet<String> = tokenize(query, MAX_KEYWORDS).into_iter().collect();

        let mut chunks: Vec<RetrievedChunk> = search
            .result
            .into_iter()
            .map(|point| {
                let (text, source, keywords) = payload_parts(point.payload);
                let lexical = lexical_boost(&query_tokens, &keywords);
                RetrievedChunk {
                    text,
                    score: point.score + lexical,
                    source,
                }
            })
            .collect();

        chunks.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chunks.truncate(limit);
        Ok(chunks)
    }
}

async fn ensure_collection(
    client: &Qdrant,
    collection: &str,
    dimension: usize,
) -> anyhow::Result<()> {
    if client.collection_exists(collection).await? {
        return Ok(());
    }

    client
        .create_collection(
            CreateCollectionBuilder::new(collection)
                .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
        )
        .await
        .map_err(|err| anyhow!("failed to create qdrant collection '{collection}': {err}"))?;
    info!(collection, dimension, "created qdrant collection");
    Ok(())
}

fn payload_parts(
    payload: HashMap<String, qdrant_client::qdrant::Value>,
) -> (String, Option<String>, Vec<String>) {
    let mut map: HashMap<String, Value> = qdrant_client::Payload::from(payload).into();
    let text = map
        .remove(KEY_TEXT)
        .and_then(|value| value.as_str().map(|s| s.to_string()))
        .unwrap_or_default();
    let source = map
        .remove(KEY_SOURCE)
        .and_then(|value| value.as_str().map(|s| s.to_string()));
    let keywords = map
        .remove(KEY_KEYWORDS)
        .and_then(|value| value.as_array().cloned())
        .map(|values| {
            values
                .into_iter()
                .filter_map(|value| value.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    (text, source, keywords)
}

fn build_payload(
    text: &str,
    source: Option<&String>,
    keywords: Vec<String>,
) -> anyhow::Result<qdrant_client::Payload> {
    let payload = serde_json::json!({
        KEY_TEXT: text,
        KEY_SOURCE: source,
        KEY_KEYWORDS: keywords,
    });

    payload
        .try_into()
        .map_err(|err| anyhow!("failed to convert payload: {err}"))
}

#[async_trait]
impl KnowledgeCorpus for HybridRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, BackendError> {
        self.search(query, k)
            .await
            .map_err(|err| BackendError::Unavailable(format!("qdrant: {err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_text_source_and_keywords() {
        let payload = build_payload(
            "Mortgage rates climbed",
            Some(&"rates.md".to_string()),
            tokenize("Mortgage rates climbed", MAX_KEYWORDS),
        )
        .expect("payload");

        let map: HashMap<String, Value> = payload.into();
        assert_eq!(map[KEY_TEXT], "Mortgage rates climbed");
        assert_eq!(map[KEY_SOURCE], "rates.md");
        assert_eq!(map[KEY_KEYWORDS].as_array().map(Vec::len), Some(3));
    }
}
