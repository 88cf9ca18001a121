use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};

use super::SearchBackend;
use crate::error::BackendError;
use crate::security::SecretValue;
use crate::sources::SourceRecord;

const SERVICE: &str = "tavily";
const DEFAULT_TAVILY_BASE: &str = "https://api.tavily.com";

#[derive(Debug, Clone)]
pub struct TavilyConfig {
    pub api_key: SecretValue,
    pub base_url: String,
    /// `general`, `news` or `finance`.
    pub topic: String,
    pub include_raw_content: bool,
    pub timeout: Duration,
}

impl TavilyConfig {
    pub fn new(api_key: SecretValue) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_TAVILY_BASE.to_string(),
            topic: "general".to_string(),
            include_raw_content: true,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

pub struct TavilyBackend {
    client: Client,
    config: TavilyConfig,
}

impl TavilyBackend {
    pub fn new(config: TavilyConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| BackendError::http(SERVICE, err))?;
        Ok(Self { client, config })
    }

    fn search_url(&self) -> String {
        format!("{}/search", self.config.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    max_results: usize,
    topic: &'a str,
    include_raw_content: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_range: Option<&'a str>,
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    raw_content: Option<String>,
}

impl From<TavilyResult> for SourceRecord {
    fn from(result: TavilyResult) -> Self {
        SourceRecord {
            title: result.title,
            url: result.url,
            content: result.content,
            raw_content: result.raw_content,
            score: result.score,
        }
    }
}

#[async_trait]
impl SearchBackend for TavilyBackend {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        time_range: Option<&str>,
    ) -> Result<Vec<SourceRecord>, BackendError> {
        let body = TavilyRequest {
            query,
            max_results,
            topic: &self.config.topic,
            include_raw_content: self.config.include_raw_content,
            time_range,
        };

        let response = self
            .client
            .post(self.search_url())
            .header(header::AUTHORIZATION, self.config.api_key.bearer())
            .json(&body)
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

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|err| BackendError::decode(SERVICE, err.to_string()))?;

        Ok(parsed.results.into_iter().map(SourceRecord::from).collect())
    }
}
