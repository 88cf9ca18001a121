//! Section research loop: generate queries, search, draft, reflect, and
//! repeat with follow-up queries until the draft passes or the search
//! budget is spent.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{ReportError, SectionFailure};
use crate::events::{EventCollector, EventKind};
use crate::llm::{DynLanguageModel, OutputSchema, StructuredOutput, complete_structured};
use crate::metrics;
use crate::prompts::{self, render};
use crate::search::SourceFetcher;
use crate::section::{Section, SectionStatus};
use crate::sources::DigestBuilder;

/// Search queries produced by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct Queries {
    pub queries: Vec<QueryItem>,
}

/// Models answer with plain strings or `{ "search_query": ... }` objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QueryItem {
    Plain(String),
    Object { search_query: String },
}

impl Queries {
    /// Non-blank query strings, trimmed, at most `limit`.
    pub fn into_strings(self, limit: usize) -> Vec<String> {
        self.queries
            .into_iter()
            .map(|item| match item {
                QueryItem::Plain(query) | QueryItem::Object { search_query: query } => query,
            })
            .map(|query| query.trim().to_string())
            .filter(|query| !query.is_empty())
            .take(limit)
            .collect()
    }
}

impl StructuredOutput for Queries {
    fn schema() -> OutputSchema {
        OutputSchema {
            name: "queries",
            schema: json!({
                "type": "object",
                "properties": {
                    "queries": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "List of search queries."
                    }
                },
                "required": ["queries"]
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Reflection output for one drafted section.
#[derive(Debug, Clone, Deserialize)]
pub struct Feedback {
    pub grade: Verdict,
    #[serde(default)]
    pub follow_up_queries: Vec<QueryItem>,
}

impl StructuredOutput for Feedback {
    fn schema() -> OutputSchema {
        OutputSchema {
            name: "feedback",
            schema: json!({
                "type": "object",
                "properties": {
                    "grade": {
                        "type": "string",
                        "enum": ["pass", "fail"],
                        "description": "Whether the section meets the requirements."
                    },
                    "follow_up_queries": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Search queries for missing information."
                    }
                },
                "required": ["grade", "follow_up_queries"]
            }),
        }
    }
}

/// Knobs shared by every section loop of a run.
#[derive(Debug, Clone)]
pub struct ResearchSettings {
    pub number_of_queries: usize,
    pub max_search_depth: u32,
    pub max_results: usize,
    pub time_range: Option<String>,
    pub digest: DigestBuilder,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            number_of_queries: 2,
            max_search_depth: 2,
            max_results: 5,
            time_range: None,
            digest: DigestBuilder::default(),
        }
    }
}

impl ResearchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            number_of_queries: config.research.number_of_queries,
            max_search_depth: config.research.max_search_depth,
            max_results: config.search.max_results,
            time_range: config.search.time_range.clone(),
            digest: DigestBuilder::from_config(
                &config.research,
                &config.boost,
                config.search.include_raw_content,
            ),
        }
    }

    pub fn with_time_range(mut self, time_range: Option<String>) -> Self {
        if time_range.is_some() {
            self.time_range = time_range;
        }
        self
    }
}

/// A finalized section plus the number of search rounds it consumed.
#[derive(Debug, Clone)]
pub struct ResearchedSection {
    pub section: Section,
    pub rounds: u32,
}

/// Per-invocation working state. Never shared between sections.
struct IterationState {
    queries: Vec<String>,
    source_digest: String,
    draft: String,
    iteration: u32,
    max_iterations: u32,
}

impl IterationState {
    fn exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}

/// Runs the research loop for one section at a time. Cheap to clone; clones
/// share the model and search clients.
#[derive(Clone)]
pub struct SectionResearcher {
    model: DynLanguageModel,
    fetcher: SourceFetcher,
    settings: ResearchSettings,
    events: EventCollector,
}

impl SectionResearcher {
    pub fn new(
        model: DynLanguageModel,
        fetcher: SourceFetcher,
        settings: ResearchSettings,
        events: EventCollector,
    ) -> Self {
        Self {
            model,
            fetcher,
            settings,
            events,
        }
    }

    /// Research `section` (the `index`-th entry of the plan) to completion.
    ///
    /// At most `max_search_depth` search rounds are issued. A failing grade on
    /// the last round still finalizes the section with its latest draft.
    #[instrument(name = "section.research", skip(self, topic, section), fields(section = %section.name))]
    pub async fn research(
        &self,
        topic: &str,
        index: usize,
        mut section: Section,
    ) -> Result<ResearchedSection, SectionFailure> {
        self.events.emit(EventKind::SectionStarted {
            index,
            section: section.name.clone(),
        });

        let outcome = self.run_loop(topic, index, &section).await;
        match outcome {
            Ok((draft, status, rounds)) => {
                section.finalize(draft, status);
                info!(status = status.as_str(), rounds, "section finalized");
                metrics::record_section(status, rounds);
                self.events.emit(EventKind::SectionFinalized {
                    index,
                    section: section.name.clone(),
                    status,
                    iterations: rounds,
                });
                Ok(ResearchedSection { section, rounds })
            }
            Err(err) => {
                warn!(error = %err, "section research aborted");
                metrics::record_section(SectionStatus::Failed, 0);
                self.events.emit(EventKind::SectionFailed {
                    index,
                    section: section.name.clone(),
                    reason: err.to_string(),
                });
                Err(SectionFailure::new(section.name, err.to_string()))
            }
        }
    }

    async fn run_loop(
        &self,
        topic: &str,
        index: usize,
        section: &Section,
    ) -> Result<(String, SectionStatus, u32), ReportError> {
        let mut state = IterationState {
            queries: self.generate_queries(topic, section).await?,
            source_digest: String::new(),
            draft: String::new(),
            iteration: 0,
            max_iterations: self.settings.max_search_depth.max(1),
        };

        loop {
            let fetched = self
                .fetcher
                .fetch(
                    &state.queries,
                    self.settings.max_results,
                    self.settings.time_range.as_deref(),
                )
                .await;
            state.iteration += 1;
            let results = fetched.total_results();
            metrics::record_search_round(results);
            self.events.emit(EventKind::SearchRound {
                index,
                section: section.name.clone(),
                iteration: state.iteration,
                queries: state.queries.clone(),
                results,
            });
            state.source_digest = self.settings.digest.digest(fetched.batches);

            state.draft = self.draft(topic, section, &state).await?;

            let feedback = self.reflect(topic, section, &state.draft).await?;
            let passed = feedback.grade == Verdict::Pass;
            let follow_ups = Queries {
                queries: feedback.follow_up_queries,
            }
            .into_strings(self.settings.number_of_queries);
            self.events.emit(EventKind::SectionGraded {
                index,
                section: section.name.clone(),
                iteration: state.iteration,
                passed,
                follow_up_queries: follow_ups.clone(),
            });

            if passed {
                return Ok((state.draft, SectionStatus::Passed, state.iteration));
            }
            if state.exhausted() {
                return Ok((state.draft, SectionStatus::Exhausted, state.iteration));
            }

            if follow_ups.is_empty() {
                debug!("failing grade without follow-up queries; reusing previous queries");
            } else {
                state.queries = follow_ups;
            }
        }
    }

    async fn generate_queries(
        &self,
        topic: &str,
        section: &Section,
    ) -> Result<Vec<String>, ReportError> {
        let number = self.settings.number_of_queries.to_string();
        let today = prompts::today();
        let system = render(
            prompts::SECTION_QUERY_WRITER,
            &[
                ("topic", topic),
                ("section_topic", &section.description),
                ("number_of_queries", &number),
                ("today", &today),
            ],
        );
        let queries: Queries = complete_structured(
            self.model.as_ref(),
            &system,
            prompts::SECTION_QUERY_WRITER_USER,
        )
        .await?;

        let mut queries = queries.into_strings(self.settings.number_of_queries);
        if queries.is_empty() {
            queries.push(format!("{topic} {}", section.description));
        }
        debug!(?queries, "generated section queries");
        Ok(queries)
    }

    async fn draft(
        &self,
        topic: &str,
        section: &Section,
        state: &IterationState,
    ) -> Result<String, ReportError> {
        let today = prompts::today();
        let system = render(prompts::SECTION_WRITER, &[("today", &today)]);
        let user = render(
            prompts::SECTION_WRITER_INPUTS,
            &[
                ("topic", topic),
                ("section_name", &section.name),
                ("section_topic", &section.description),
                ("section_content", &state.draft),
                ("context", &state.source_digest),
            ],
        );
        let draft = self.model.complete(&system, &user).await?;
        if draft.trim().is_empty() {
            return Err(ReportError::structural("model returned an empty section draft"));
        }
        Ok(draft)
    }

    async fn reflect(
        &self,
        topic: &str,
        section: &Section,
        draft: &str,
    ) -> Result<Feedback, ReportError> {
        let number = self.settings.number_of_queries.to_string();
        let system = render(
            prompts::SECTION_GRADER,
            &[
                ("topic", topic),
                ("section_topic", &section.description),
                ("section", draft),
                ("number_of_follow_up_queries", &number),
            ],
        );
        complete_structured(self.model.as_ref(), &system, prompts::SECTION_GRADER_USER).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::llm::LanguageModel;
    use crate::search::SearchBackend;
    use crate::sources::SourceRecord;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSearch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchBackend for CountingSearch {
        fn name(&self) -> &str {
            "counting"
        }

        async fn search(
            &self,
            query: &str,
            _max_results: usize,
            _time_range: Option<&str>,
        ) -> Result<Vec<SourceRecord>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![SourceRecord {
                title: query.to_string(),
                url: format!("https://example.com/{}", query.replace(' ', "-")),
                content: "snippet".into(),
                raw_content: None,
                score: 0.5,
            }])
        }
    }

    /// Grades every draft with `verdict`; drafting fails when `broken`.
    struct ScriptedModel {
        verdict: &'static str,
        broken: bool,
        drafts: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _system: &str, user: &str) -> Result<String, BackendError> {
            if self.broken {
                return Err(BackendError::Unavailable("model offline".into()));
            }
            let n = self.drafts.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(user.contains("<Source material>"));
            Ok(format!("## Rates\n\ndraft {n}"))
        }

        async fn complete_json(
            &self,
            _system: &str,
            _user: &str,
            schema: &OutputSchema,
        ) -> Result<String, BackendError> {
            Ok(match schema.name {
                "queries" => r#"{"queries": ["policy rate", {"search_query": "mortgage demand"}]}"#
                    .to_string(),
                "feedback" => format!(
                    r#"{{"grade": "{}", "follow_up_queries": ["follow up"]}}"#,
                    self.verdict
                ),
                other => panic!("unexpected schema {other}"),
            })
        }
    }

    fn researcher(model: ScriptedModel, search: Arc<CountingSearch>, depth: u32) -> SectionResearcher {
        SectionResearcher::new(
            Arc::new(model),
            SourceFetcher::new(search),
            ResearchSettings {
                max_search_depth: depth,
                ..ResearchSettings::default()
            },
            EventCollector::disabled(),
        )
    }

    fn model(verdict: &'static str) -> ScriptedModel {
        ScriptedModel {
            verdict,
            broken: false,
            drafts: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn failing_grades_stop_at_search_budget() {
        let search = Arc::new(CountingSearch {
            calls: AtomicUsize::new(0),
        });
        let researcher = researcher(model("fail"), search.clone(), 3);

        let done = researcher
            .research("housing", 0, Section::new("Rates", "policy rates", true))
            .await
            .expect("exhaustion is not an error");

        assert_eq!(done.rounds, 3);
        assert_eq!(done.section.status, SectionStatus::Exhausted);
        assert_eq!(done.section.content, "## Rates\n\ndraft 3");
        // two initial queries, then one follow-up per retry
        assert_eq!(search.calls.load(Ordering::SeqCst), 2 + 1 + 1);
    }

    #[tokio::test]
    async fn passing_grade_finalizes_after_one_round() {
        let search = Arc::new(CountingSearch {
            calls: AtomicUsize::new(0),
        });
        let done = researcher(model("pass"), search, 2)
            .research("housing", 0, Section::new("Rates", "policy rates", true))
            .await
            .expect("section");

        assert_eq!(done.rounds, 1);
        assert_eq!(done.section.status, SectionStatus::Passed);
    }

    #[tokio::test]
    async fn model_outage_fails_only_this_section() {
        let search = Arc::new(CountingSearch {
            calls: AtomicUsize::new(0),
        });
        let broken = ScriptedModel {
            verdict: "pass",
            broken: true,
            drafts: AtomicUsize::new(0),
        };
        let failure = researcher(broken, search, 2)
            .research("housing", 0, Section::new("Rates", "policy rates", true))
            .await
            .unwrap_err();

        assert_eq!(failure.section, "Rates");
        assert!(failure.reason.contains("model offline"));
    }

    #[test]
    fn query_items_accept_both_shapes() {
        let parsed: Queries =
            serde_json::from_str(r#"{"queries": ["a", {"search_query": "b"}, "  "]}"#).unwrap();
        assert_eq!(parsed.into_strings(5), vec!["a".to_string(), "b".to_string()]);
    }
}
