//! OpenAI-compatible chat-completions backend (OpenAI, Groq, Ollama, vLLM...).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{LanguageModel, OutputSchema};
use crate::config::LlmConfig;
use crate::error::{BackendError, ReportError};
use crate::security::SecretValue;

const SERVICE: &str = "llm";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: SecretValue,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn from_config(config: &LlmConfig, api_key: SecretValue) -> Self {
        Self {
            api_key,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.timeout(),
        }
    }
}

pub struct OpenAiModel {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiModel {
    pub fn new(config: OpenAiConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| BackendError::http(SERVICE, err))?;
        Ok(Self { client, config })
    }

    /// Build from the `[llm]` table, resolving the key from the environment.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ReportError> {
        let api_key = crate::require_env(&config.api_key_env)?;
        Ok(Self::new(OpenAiConfig::from_config(config, api_key))?)
    }

    fn request_body(&self, system: &str, user: &str, schema: Option<&OutputSchema>) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ]
        });
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(schema) = schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "schema": schema.schema,
                    "strict": false
                }
            });
        }
        body
    }

    async fn chat(&self, body: Value) -> Result<String, BackendError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(url)
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

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| BackendError::decode(SERVICE, err.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| BackendError::decode(SERVICE, "completion had no message content"))?;

        debug!(model = %self.config.model, chars = content.len(), "model completion received");
        Ok(content)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String, BackendError> {
        self.chat(self.request_body(system, user, None)).await
    }

    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema: &OutputSchema,
    ) -> Result<String, BackendError> {
        self.chat(self.request_body(system, user, Some(schema))).await
    }
}
