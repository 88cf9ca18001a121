//! Fan-out/fan-in coordinator.
//!
//! Research sections run as independent tokio tasks; their results are merged
//! back by plan index. Sections that need no research are then drafted
//! concurrently from the combined research context.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::error::{ReportError, SectionFailure};
use crate::events::{EventCollector, EventKind};
use crate::llm::DynLanguageModel;
use crate::metrics;
use crate::prompts::{self, render};
use crate::research::{ResearchedSection, SectionResearcher};
use crate::section::{Section, SectionStatus, format_sections};

/// Configuration for coordinator behavior
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum section loops running at once
    pub max_concurrent_sections: usize,
    /// Deadline for the whole research fan-out
    pub timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sections: 8,
            timeout: None,
        }
    }
}

/// Sections in plan order plus the failures recorded along the way.
#[derive(Debug, Clone)]
pub struct CoordinatedReport {
    pub sections: Vec<Section>,
    pub failures: Vec<SectionFailure>,
}

#[derive(Clone)]
pub struct ReportCoordinator {
    researcher: SectionResearcher,
    model: DynLanguageModel,
    config: CoordinatorConfig,
    events: EventCollector,
}

impl ReportCoordinator {
    pub fn new(
        researcher: SectionResearcher,
        model: DynLanguageModel,
        config: CoordinatorConfig,
        events: EventCollector,
    ) -> Self {
        Self {
            researcher,
            model,
            config,
            events,
        }
    }

    /// Research, gather and draft every section of `plan`.
    pub async fn run(&self, topic: &str, mut plan: Vec<Section>) -> CoordinatedReport {
        let mut failures = self.research_sections(topic, &mut plan).await;
        let context = gather_research_context(&plan);
        failures.extend(self.write_final_sections(topic, &mut plan, &context).await);
        CoordinatedReport {
            sections: plan,
            failures,
        }
    }

    /// Run one research loop per section flagged `needs_research`.
    ///
    /// Completion order is irrelevant: each result is written back to its
    /// plan index. Failed, panicked or timed-out sections get placeholders.
    #[instrument(name = "report.fan_out", skip(self, topic, plan))]
    pub async fn research_sections(
        &self,
        topic: &str,
        plan: &mut [Section],
    ) -> Vec<SectionFailure> {
        let topic: Arc<str> = Arc::from(topic);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sections.max(1)));
        let mut tasks = JoinSet::new();
        let mut pending: Vec<usize> = Vec::new();

        for (index, section) in plan.iter().enumerate() {
            if !section.needs_research || section.status.is_final() {
                continue;
            }
            pending.push(index);
            let researcher = self.researcher.clone();
            let topic = topic.clone();
            let section = section.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, researcher.research(&topic, index, section).await)
            });
        }

        info!(sections = pending.len(), "research fan-out started");
        let mut deadline = self.config.timeout.map(|timeout| Instant::now() + timeout);
        let mut timed_out = false;
        let mut failures = Vec::new();

        loop {
            let joined = match deadline {
                Some(at) => match tokio::time::timeout_at(at, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            unfinished = pending.len(),
                            "research deadline reached; abandoning unfinished sections"
                        );
                        // Sections that already finished are still collected below.
                        tasks.abort_all();
                        timed_out = true;
                        deadline = None;
                        continue;
                    }
                },
                None => tasks.join_next().await,
            };

            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((index, outcome)) => {
                    pending.retain(|pending_index| *pending_index != index);
                    match outcome {
                        Ok(ResearchedSection { section, .. }) => plan[index] = section,
                        Err(failure) => {
                            plan[index].fail(&failure.reason);
                            failures.push(failure);
                        }
                    }
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    // A panicked task's index stays in `pending`.
                    warn!(error = %err, "section task ended abnormally");
                }
            }
        }

        for index in pending {
            let reason = if timed_out {
                "research timed out"
            } else {
                "research task ended abnormally"
            };
            let section = &mut plan[index];
            section.fail(reason);
            metrics::record_section(SectionStatus::Failed, 0);
            self.events.emit(EventKind::SectionFailed {
                index,
                section: section.name.clone(),
                reason: reason.to_string(),
            });
            failures.push(SectionFailure::new(section.name.clone(), reason));
        }

        failures
    }

    /// Draft every non-research section once, concurrently, from `context`.
    #[instrument(name = "report.final_sections", skip(self, topic, plan, context))]
    pub async fn write_final_sections(
        &self,
        topic: &str,
        plan: &mut [Section],
        context: &str,
    ) -> Vec<SectionFailure> {
        let drafts = plan
            .iter()
            .enumerate()
            .filter(|(_, section)| !section.needs_research && !section.status.is_final())
            .map(|(index, section)| {
                let section = section.clone();
                async move { (index, self.draft_final_section(topic, &section, context).await) }
            });

        let outcomes = join_all(drafts).await;

        let mut failures = Vec::new();
        for (index, outcome) in outcomes {
            let section = &mut plan[index];
            match outcome {
                Ok(content) => {
                    section.finalize(content, SectionStatus::Drafted);
                    metrics::record_section(SectionStatus::Drafted, 0);
                    self.events.emit(EventKind::SectionFinalized {
                        index,
                        section: section.name.clone(),
                        status: SectionStatus::Drafted,
                        iterations: 0,
                    });
                }
                Err(err) => {
                    warn!(section = %section.name, error = %err, "final section drafting failed");
                    let reason = err.to_string();
                    section.fail(&reason);
                    metrics::record_section(SectionStatus::Failed, 0);
                    self.events.emit(EventKind::SectionFailed {
                        index,
                        section: section.name.clone(),
                        reason: reason.clone(),
                    });
                    failures.push(SectionFailure::new(section.name.clone(), reason));
                }
            }
        }
        failures
    }

    async fn draft_final_section(
        &self,
        topic: &str,
        section: &Section,
        context: &str,
    ) -> Result<String, ReportError> {
        let system = render(
            prompts::FINAL_SECTION_WRITER,
            &[
                ("topic", topic),
                ("section_name", &section.name),
                ("section_topic", &section.description),
                ("context", context),
            ],
        );
        let content = self
            .model
            .complete(&system, prompts::FINAL_SECTION_WRITER_USER)
            .await?;
        if content.trim().is_empty() {
            return Err(ReportError::structural("model returned an empty section"));
        }
        Ok(content)
    }
}

/// Shared context for the non-research sections: every research section, in plan order.
pub fn gather_research_context(plan: &[Section]) -> String {
    let researched: Vec<Section> = plan
        .iter()
        .filter(|section| section.needs_research)
        .cloned()
        .collect();
    format_sections(&researched)
}
