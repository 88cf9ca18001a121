//! Report planner: exploratory search followed by a structured section list.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::error::ReportError;
use crate::events::{EventCollector, EventKind};
use crate::llm::{DynLanguageModel, OutputSchema, StructuredOutput, complete_structured};
use crate::prompts::{self, DEFAULT_REPORT_STRUCTURE, render};
use crate::research::{Queries, ResearchSettings};
use crate::search::SourceFetcher;
use crate::section::{Section, SectionStatus};

const FEEDBACK_SEPARATOR: &str = " /// ";

#[derive(Debug, Clone, Deserialize)]
pub struct Sections {
    pub sections: Vec<Section>,
}

impl StructuredOutput for Sections {
    fn schema() -> OutputSchema {
        OutputSchema {
            name: "sections",
            schema: json!({
                "type": "object",
                "properties": {
                    "sections": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "description": { "type": "string" },
                                "research": { "type": "boolean" },
                                "content": { "type": "string" }
                            },
                            "required": ["name", "description", "research"]
                        }
                    }
                },
                "required": ["sections"]
            }),
        }
    }
}

pub struct ReportPlanner {
    model: DynLanguageModel,
    fetcher: SourceFetcher,
    settings: ResearchSettings,
    report_structure: String,
    events: EventCollector,
}

impl ReportPlanner {
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
            report_structure: DEFAULT_REPORT_STRUCTURE.to_string(),
            events,
        }
    }

    pub fn with_report_structure(mut self, structure: impl Into<String>) -> Self {
        let structure = structure.into();
        if !structure.trim().is_empty() {
            self.report_structure = structure;
        }
        self
    }

    /// Produce the ordered section plan for `topic`.
    ///
    /// A plan that cannot be decoded, or that has no usable sections, fails
    /// the whole request.
    #[instrument(name = "report.plan", skip(self, prior_feedback))]
    pub async fn plan(
        &self,
        topic: &str,
        prior_feedback: &[String],
    ) -> Result<Vec<Section>, ReportError> {
        let number = self.settings.number_of_queries.to_string();
        let today = prompts::today();
        let query_prompt = render(
            prompts::PLANNER_QUERY_WRITER,
            &[
                ("topic", topic),
                ("report_organization", &self.report_structure),
                ("number_of_queries", &number),
                ("today", &today),
            ],
        );
        let queries: Queries = complete_structured(
            self.model.as_ref(),
            &query_prompt,
            prompts::PLANNER_QUERY_WRITER_USER,
        )
        .await?;
        let queries = queries.into_strings(self.settings.number_of_queries);
        debug!(?queries, "exploratory planning queries");

        let fetched = self
            .fetcher
            .fetch(
                &queries,
                self.settings.max_results,
                self.settings.time_range.as_deref(),
            )
            .await;
        let context = self.settings.digest.digest(fetched.batches);

        let feedback = join_feedback(prior_feedback);
        let sections_prompt = render(
            prompts::PLANNER_SECTIONS,
            &[
                ("topic", topic),
                ("report_organization", &self.report_structure),
                ("context", &context),
                ("feedback", &feedback),
            ],
        );
        let planned: Sections = complete_structured(
            self.model.as_ref(),
            &sections_prompt,
            prompts::PLANNER_SECTIONS_USER,
        )
        .await?;

        let sections = normalize(planned.sections)?;
        let research_sections = sections.iter().filter(|s| s.needs_research).count();
        info!(
            sections = sections.len(),
            research_sections, "report plan ready"
        );
        self.events.emit(EventKind::PlanReady {
            sections: sections.len(),
            research_sections,
        });
        Ok(sections)
    }
}

fn join_feedback(prior_feedback: &[String]) -> String {
    prior_feedback
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .collect::<Vec<_>>()
        .join(FEEDBACK_SEPARATOR)
}

/// Reject empty plans and unnamed sections; every section starts unwritten.
fn normalize(sections: Vec<Section>) -> Result<Vec<Section>, ReportError> {
    if sections.is_empty() {
        return Err(ReportError::structural("planner returned no sections"));
    }
    sections
        .into_iter()
        .enumerate()
        .map(|(idx, mut section)| {
            section.name = section.name.trim().to_string();
            if section.name.is_empty() {
                return Err(ReportError::structural(format!(
                    "planned section {} has no name",
                    idx + 1
                )));
            }
            section.content.clear();
            section.status = SectionStatus::Planned;
            Ok(section)
        })
        .collect()
}
