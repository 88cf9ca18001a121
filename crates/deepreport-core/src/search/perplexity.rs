use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Deserialize;
use serde_json::json;

use super::SearchBackend;
use crate::error::BackendError;
use crate::security::SecretValue;
use crate::sources::SourceRecord;

const SERVICE: &str = "perplexity";
const DEFAULT_PERPLEXITY_BASE: &str = "https://api.perplexity.ai";
const FALLBACK_CITATION: &str = "https://perplexity.ai";
const SECONDARY_CONTENT: &str = "See primary source for full content";
const SYSTEM_PROMPT: &str = "Search the web and provide factual information with sources.";

#[derive(Debug, Clone)]
pub struct PerplexityConfig {
    pub api_key: SecretValue,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl PerplexityConfig {
    pub fn new(api_key: SecretValue) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_PERPLEXITY_BASE.to_string(),
            model: "sonar-pro".to_string(),
            timeout: Duration::from_secs(90),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

/// Answer-engine backend: one synthesized answer per query plus its citations.
pub struct PerplexityBackend {
    client: Client,
    config: PerplexityConfig,
}

impl PerplexityBackend {
    pub fn new(config: PerplexityConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| BackendError::http(SERVICE, err))?;
        Ok(Self { client, config })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: String,
}

/// The first citation carries the full answer; the rest point back to it.
fn citations_to_records(answer: &str, mut citations: Vec<String>) -> Vec<SourceRecord> {
    if citations.is_empty() {
        citations.push(FALLBACK_CITATION.to_string());
    }

    citations
        .into_iter()
        .enumerate()
        .map(|(idx, url)| {
            let title = format!("Perplexity Search, Source {}", idx + 1);
            if idx == 0 {
                SourceRecord {
                    title,
                    url,
                    content: answer.to_string(),
                    raw_content: Some(answer.to_string()),
                    score: 1.0,
                }
            } else {
                SourceRecord {
                    title,
                    url,
                    content: SECONDARY_CONTENT.to_string(),
                    raw_content: None,
                    score: 0.5,
                }
            }
        })
        .collect()
}

#[async_trait]
impl SearchBackend for PerplexityBackend {
    fn name(&self) -> &str {
        SERVICE
    }

    /// The answer engine returns a fixed citation list, so `max_results` is
    /// applied by the caller. `time_range` is not supported and is ignored.
    async fn search(
        &self,
        query: &str,
        _max_results: usize,
        _time_range: Option<&str>,
    ) -> Result<Vec<SourceRecord>, BackendError> {
        let payload = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": query }
            ]
        });

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, self.config.api_key.bearer())
            .header(header::ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|err| BackendError::http(SERVICE, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| BackendError::decode(SERVICE, err.to_string()))?;

        let answer = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| BackendError::decode(SERVICE, "response contained no choices"))?;

        Ok(citations_to_records(&answer, parsed.citations))
    }
}
