//! Language-model seam: free-text completion plus schema-constrained JSON output.

mod openai;

pub use openai::{OpenAiConfig, OpenAiModel};

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{BackendError, ReportError};

/// JSON schema handed to the model for structured output.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: &'static str,
    pub schema: Value,
}

/// A chat model reachable over the network. Implementations are shared by
/// every concurrently running loop, so each call must be self-contained.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, BackendError>;

    /// Returns the raw model text; the caller parses it against `schema`.
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema: &OutputSchema,
    ) -> Result<String, BackendError>;
}

pub type DynLanguageModel = Arc<dyn LanguageModel>;

/// A type the model can be asked to produce directly.
pub trait StructuredOutput: DeserializeOwned {
    fn schema() -> OutputSchema;
}

/// Ask for `T` and decode it. Transport failures stay [`ReportError::Backend`];
/// output that does not fit the schema is a [`ReportError::Structural`] failure.
pub async fn complete_structured<T: StructuredOutput>(
    model: &dyn LanguageModel,
    system: &str,
    user: &str,
) -> Result<T, ReportError> {
    let schema = T::schema();
    let raw = model.complete_json(system, user, &schema).await?;
    let value = extract_json(&raw).ok_or_else(|| {
        ReportError::structural(format!("{} output was not valid JSON", schema.name))
    })?;
    debug!(schema = schema.name, "decoded structured model output");
    serde_json::from_value(value).map_err(|err| {
        ReportError::structural(format!("{} output did not match schema: {err}", schema.name))
    })
}

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("invalid code fence regex")
});

/// Parse JSON from model text, tolerating Markdown code fences and leading prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(inner) = CODE_FENCE.captures(trimmed).and_then(|caps| caps.get(1)) {
        if let Ok(value) = serde_json::from_str(inner.as_str()) {
            return Some(value);
        }
    }

    let start = trimmed.find(['{', '['])?;
    let end = trimmed.rfind(['}', ']'])?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Verdict {
        ok: bool,
    }

    impl StructuredOutput for Verdict {
        fn schema() -> OutputSchema {
            OutputSchema {
                name: "verdict",
                schema: json!({
                    "type": "object",
                    "properties": { "ok": { "type": "boolean" } },
                    "required": ["ok"]
                }),
            }
        }
    }

    struct Canned(&'static str);

    #[async_trait]
    impl LanguageModel for Canned {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, BackendError> {
            Ok(self.0.to_string())
        }

        async fn complete_json(
            &self,
            _system: &str,
            _user: &str,
            _schema: &OutputSchema,
        ) -> Result<String, BackendError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn extracts_plain_fenced_and_embedded_json() {
        assert_eq!(extract_json(r#"{"ok": true}"#), Some(json!({"ok": true})));
        assert_eq!(
            extract_json("```json\n{\"ok\": false}\n```"),
            Some(json!({"ok": false}))
        );
        assert_eq!(
            extract_json("Here you go: {\"ok\": true} hope it helps"),
            Some(json!({"ok": true}))
        );
        assert_eq!(extract_json("no json here"), None);
    }

    #[tokio::test]
    async fn shape_mismatch_is_structural() {
        let err = complete_structured::<Verdict>(&Canned(r#"{"ok": "maybe"}"#), "s", "u")
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::Structural(_)));

        let verdict = complete_structured::<Verdict>(&Canned("```\n{\"ok\": true}\n```"), "s", "u")
            .await
            .expect("fenced output should decode");
        assert!(verdict.ok);
    }
}
