#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deepreport_core::{
    BackendError, DeepReport, LanguageModel, OutputSchema, SearchBackend, Section, SourceRecord,
};
use serde_json::json;

/// How a scripted research section behaves.
#[derive(Debug, Clone)]
pub struct SectionScript {
    pub verdict: &'static str,
    pub draft_delay: Duration,
    pub broken: bool,
}

impl Default for SectionScript {
    fn default() -> Self {
        Self {
            verdict: "pass",
            draft_delay: Duration::ZERO,
            broken: false,
        }
    }
}

/// Model that answers every prompt from a fixed script.
///
/// Structured calls dispatch on the schema name; free-text calls dispatch on
/// which prompt they were rendered from.
#[derive(Default)]
pub struct ScriptedModel {
    pub plan: Vec<Section>,
    pub raw_plan: Option<String>,
    pub sections: HashMap<String, SectionScript>,
    pub decisions: Mutex<Vec<String>>,
    pub relevance: &'static str,
    pub drafts: AtomicUsize,
    pub grades: AtomicUsize,
    pub rewrites: AtomicUsize,
}

impl ScriptedModel {
    pub fn with_plan(plan: Vec<Section>) -> Self {
        Self {
            plan,
            relevance: "yes",
            ..Self::default()
        }
    }

    pub fn script(mut self, section: &str, script: SectionScript) -> Self {
        self.sections.insert(section.to_string(), script);
        self
    }

    /// Decisions are consumed in order; the last one repeats.
    pub fn with_decisions(decisions: &[&str], relevance: &'static str) -> Self {
        Self {
            decisions: Mutex::new(decisions.iter().rev().map(|d| d.to_string()).collect()),
            relevance,
            ..Self::default()
        }
    }

    fn script_for(&self, name: &str) -> SectionScript {
        self.sections.get(name).cloned().unwrap_or_default()
    }

    fn section_by_description(&self, prompt: &str) -> Option<&Section> {
        self.plan.iter().find(|section| {
            prompt.contains(&format!("<Section topic>\n{}\n</Section topic>", section.description))
        })
    }

    fn next_decision(&self) -> String {
        let mut decisions = self.decisions.lock().unwrap();
        if decisions.len() > 1 {
            decisions.pop().unwrap()
        } else {
            decisions.last().cloned().unwrap_or_default()
        }
    }
}

pub fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(text[start..end].trim())
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String, BackendError> {
        if let Some(name) = between(user, "<Section name>", "</Section name>") {
            let script = self.script_for(name);
            if script.broken {
                return Err(BackendError::Unavailable(format!("model refused {name}")));
            }
            if !script.draft_delay.is_zero() {
                tokio::time::sleep(script.draft_delay).await;
            }
            let n = self.drafts.fetch_add(1, Ordering::SeqCst) + 1;
            return Ok(format!("## {name}\n\nFindings on {name} (draft {n})."));
        }

        if system.contains("synthesizes information from the rest of the report") {
            let name = between(system, "<Section name>", "</Section name>").unwrap_or_default();
            let script = self.script_for(name);
            if script.broken {
                return Err(BackendError::Unavailable(format!("model refused {name}")));
            }
            assert!(
                system.contains("<Available report content>"),
                "final sections must see research context"
            );
            return Ok(format!("## {name}\n\nSynthesis for {name}."));
        }

        if system.contains("Formulate an improved question") {
            let n = self.rewrites.fetch_add(1, Ordering::SeqCst) + 1;
            let question = between(system, "-------", "-------").unwrap_or_default();
            return Ok(format!("{question} (rephrased {n})"));
        }

        if system.contains("question-answering tasks") {
            let context = system
                .split("Context:")
                .nth(1)
                .map(str::trim)
                .unwrap_or_default();
            return Ok(format!("Answer grounded in: {context}"));
        }

        panic!("unexpected free-text prompt: {system}");
    }

    async fn complete_json(
        &self,
        system: &str,
        _user: &str,
        schema: &OutputSchema,
    ) -> Result<String, BackendError> {
        let body = match schema.name {
            "queries" => match self.section_by_description(system) {
                Some(section) => json!({ "queries": [format!("{} sources", section.name)] }),
                None => json!({ "queries": ["overview", { "search_query": "background" }] }),
            },
            "sections" => match &self.raw_plan {
                Some(raw) => return Ok(raw.clone()),
                None => json!({ "sections": self.plan }),
            },
            "feedback" => {
                self.grades.fetch_add(1, Ordering::SeqCst);
                let section = self
                    .section_by_description(system)
                    .map(|section| section.name.clone())
                    .unwrap_or_default();
                let verdict = self.script_for(&section).verdict;
                let follow_ups: Vec<String> = if verdict == "pass" {
                    Vec::new()
                } else {
                    vec![format!("{section} follow-up")]
                };
                json!({ "grade": verdict, "follow_up_queries": follow_ups })
            }
            "decision" => return Ok(self.next_decision()),
            "relevance" => json!({ "binary_score": self.relevance }),
            other => panic!("unexpected schema {other}"),
        };
        Ok(body.to_string())
    }
}

/// Search backend returning one deterministic record per query.
#[derive(Default)]
pub struct ScriptedSearch {
    pub calls: AtomicUsize,
    pub queries: Mutex<Vec<String>>,
}

impl ScriptedSearch {
    pub fn calls_for(&self, needle: &str) -> usize {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|query| query.contains(needle))
            .count()
    }
}

#[async_trait]
impl SearchBackend for ScriptedSearch {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn search(
        &self,
        query: &str,
        _max_results: usize,
        _time_range: Option<&str>,
    ) -> Result<Vec<SourceRecord>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());
        Ok(vec![SourceRecord {
            title: format!("About {query}"),
            url: format!("https://example.com/{}", query.replace(' ', "-")),
            content: format!("Snippet about {query}."),
            raw_content: Some(format!("Full text about {query}.")),
            score: 0.8,
        }])
    }
}

pub fn housing_plan() -> Vec<Section> {
    vec![
        Section::new("Rates", "Mortgage rate trends", true),
        Section::new("Supply", "New housing construction", true),
        Section::new("Conclusion", "Summary of the housing outlook", false),
    ]
}

pub fn engine(model: Arc<ScriptedModel>, search: Arc<ScriptedSearch>) -> DeepReport {
    DeepReport::new(model, search)
}
