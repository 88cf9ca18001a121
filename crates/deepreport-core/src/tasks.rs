//! `graph_flow` tasks for the report pipeline:
//! plan -> research fan-out -> gather -> final sections -> compile.
//!
//! Tasks exchange state through the session context. A task that hits a
//! request-level failure stores it under [`keys::ERROR`] and ends the flow.

use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Task, TaskResult};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::compiler::compile;
use crate::error::{BackendError, ReportError, SectionFailure};
use crate::orchestrator::{ReportCoordinator, gather_research_context};
use crate::planner::ReportPlanner;
use crate::section::Section;

pub mod keys {
    pub const TOPIC: &str = "report.topic";
    pub const FEEDBACK: &str = "report.feedback";
    pub const SECTIONS: &str = "report.sections";
    pub const FAILURES: &str = "report.failures";
    pub const RESEARCH_CONTEXT: &str = "report.research_context";
    pub const FINAL: &str = "report.final";
    pub const ERROR: &str = "report.error";
}

async fn load_sections(context: &Context) -> Vec<Section> {
    context.get(keys::SECTIONS).await.unwrap_or_default()
}

async fn append_failures(context: &Context, failures: Vec<SectionFailure>) {
    if failures.is_empty() {
        return;
    }
    let mut recorded: Vec<SectionFailure> = context.get(keys::FAILURES).await.unwrap_or_default();
    recorded.extend(failures);
    context.set(keys::FAILURES, recorded).await;
}

/// Request-level failure carried through the session context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowError {
    pub kind: FlowErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowErrorKind {
    Backend,
    Structural,
    Other,
}

impl From<&ReportError> for FlowError {
    fn from(err: &ReportError) -> Self {
        let kind = match err {
            ReportError::Backend(_) => FlowErrorKind::Backend,
            ReportError::Structural(_) => FlowErrorKind::Structural,
            _ => FlowErrorKind::Other,
        };
        let message = match err {
            ReportError::Structural(message) => message.clone(),
            other => other.to_string(),
        };
        Self { kind, message }
    }
}

impl From<FlowError> for ReportError {
    fn from(err: FlowError) -> Self {
        match err.kind {
            FlowErrorKind::Backend => ReportError::Backend(BackendError::Unavailable(err.message)),
            FlowErrorKind::Structural => ReportError::Structural(err.message),
            FlowErrorKind::Other => ReportError::Other(anyhow::anyhow!(err.message)),
        }
    }
}

async fn abort(context: &Context, err: FlowError) -> graph_flow::Result<TaskResult> {
    let message = err.message.clone();
    context.set(keys::ERROR, err).await;
    Ok(TaskResult::new(Some(message), NextAction::End))
}

pub struct PlanTask {
    planner: Arc<ReportPlanner>,
}

impl PlanTask {
    pub fn new(planner: Arc<ReportPlanner>) -> Self {
        Self { planner }
    }
}

#[async_trait]
impl Task for PlanTask {
    fn id(&self) -> &str {
        "plan"
    }

    #[instrument(name = "task.plan", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let topic: String = context.get(keys::TOPIC).await.unwrap_or_default();
        let feedback: Vec<String> = context.get(keys::FEEDBACK).await.unwrap_or_default();

        match self.planner.plan(&topic, &feedback).await {
            Ok(sections) => {
                let count = sections.len();
                context.set(keys::SECTIONS, sections).await;
                Ok(TaskResult::new(
                    Some(format!("Planned {count} sections")),
                    NextAction::ContinueAndExecute,
                ))
            }
            Err(err) => {
                error!(error = %err, "report planning failed");
                abort(&context, FlowError::from(&err)).await
            }
        }
    }
}

pub struct ResearchSectionsTask {
    coordinator: Arc<ReportCoordinator>,
}

impl ResearchSectionsTask {
    pub fn new(coordinator: Arc<ReportCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Task for ResearchSectionsTask {
    fn id(&self) -> &str {
        "research_sections"
    }

    #[instrument(name = "task.research_sections", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let topic: String = context.get(keys::TOPIC).await.unwrap_or_default();
        let mut sections = load_sections(&context).await;

        let failures = self
            .coordinator
            .research_sections(&topic, &mut sections)
            .await;
        let failed = failures.len();

        context.set(keys::SECTIONS, sections).await;
        append_failures(&context, failures).await;

        Ok(TaskResult::new(
            Some(format!("Research finished with {failed} failed sections")),
            NextAction::ContinueAndExecute,
        ))
    }
}

#[derive(Default)]
pub struct GatherTask;

#[async_trait]
impl Task for GatherTask {
    fn id(&self) -> &str {
        "gather_sections"
    }

    #[instrument(name = "task.gather", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let sections = load_sections(&context).await;
        let research_context = gather_research_context(&sections);
        context
            .set(keys::RESEARCH_CONTEXT, research_context)
            .await;

        Ok(TaskResult::new(
            Some("Gathered research sections".to_string()),
            NextAction::ContinueAndExecute,
        ))
    }
}

pub struct WriteFinalSectionsTask {
    coordinator: Arc<ReportCoordinator>,
}

impl WriteFinalSectionsTask {
    pub fn new(coordinator: Arc<ReportCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Task for WriteFinalSectionsTask {
    fn id(&self) -> &str {
        "write_final_sections"
    }

    #[instrument(name = "task.write_final_sections", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let topic: String = context.get(keys::TOPIC).await.unwrap_or_default();
        let research_context: String = context
            .get(keys::RESEARCH_CONTEXT)
            .await
            .unwrap_or_default();
        let mut sections = load_sections(&context).await;

        let failures = self
            .coordinator
            .write_final_sections(&topic, &mut sections, &research_context)
            .await;

        context.set(keys::SECTIONS, sections).await;
        append_failures(&context, failures).await;

        Ok(TaskResult::new(
            Some("Drafted sections without research".to_string()),
            NextAction::ContinueAndExecute,
        ))
    }
}

#[derive(Default)]
pub struct CompileTask;

#[async_trait]
impl Task for CompileTask {
    fn id(&self) -> &str {
        "compile_report"
    }

    #[instrument(name = "task.compile", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let sections = load_sections(&context).await;
        if let Some(section) = sections.iter().find(|s| !s.status.is_final()) {
            // Only reachable if a task was skipped; surface it instead of panicking.
            let err = FlowError {
                kind: FlowErrorKind::Other,
                message: format!("section '{}' was never written", section.name),
            };
            return abort(&context, err).await;
        }

        let report = compile(&sections);
        info!(
            sections = sections.len(),
            chars = report.len(),
            "report compiled"
        );
        context.set(keys::FINAL, report.clone()).await;

        Ok(TaskResult::new(Some(report), NextAction::End))
    }
}
