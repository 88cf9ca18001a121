use std::sync::Arc;

use anyhow::anyhow;
use graph_flow::{
    ExecutionStatus, FlowRunner, Graph, GraphBuilder, InMemorySessionStorage, Session,
    SessionStorage, Task,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::Config;
use crate::corpus::DynCorpus;
use crate::error::{ReportError, SectionFailure};
use crate::events::EventCollector;
use crate::llm::{DynLanguageModel, OpenAiModel};
use crate::orchestrator::{CoordinatorConfig, ReportCoordinator};
use crate::planner::ReportPlanner;
use crate::prompts::DEFAULT_REPORT_STRUCTURE;
use crate::research::{ResearchSettings, SectionResearcher};
use crate::retrieval::{RetrievalOutcome, RetrievalSettings, SelfCorrectingRetriever};
use crate::search::{DynSearchBackend, SourceFetcher, backend_from_config};
use crate::section::Section;
use crate::tasks::{
    CompileTask, FlowError, GatherTask, PlanTask, ResearchSectionsTask, WriteFinalSectionsTask,
    keys,
};

/// Upper bound on runner invocations for one report; every task continues
/// or ends, so a healthy run needs one.
const MAX_RUNNER_STEPS: usize = 16;

/// Result of one report run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub run_id: String,
    pub report: String,
    /// Sections in plan order, with their final status.
    pub sections: Vec<Section>,
    pub failures: Vec<SectionFailure>,
}

/// Entry point owning the configured clients. Built once and reused.
pub struct DeepReport {
    model: DynLanguageModel,
    fetcher: SourceFetcher,
    corpus: Option<DynCorpus>,
    research: ResearchSettings,
    report_structure: String,
    coordinator: CoordinatorConfig,
    retrieval: RetrievalSettings,
    events: EventCollector,
}

impl DeepReport {
    /// Default settings around the given clients.
    pub fn new(model: DynLanguageModel, search: DynSearchBackend) -> Self {
        Self {
            model,
            fetcher: SourceFetcher::new(search),
            corpus: None,
            research: ResearchSettings::default(),
            report_structure: DEFAULT_REPORT_STRUCTURE.to_string(),
            coordinator: CoordinatorConfig::default(),
            retrieval: RetrievalSettings::default(),
            events: EventCollector::disabled(),
        }
    }

    /// Build the OpenAI-compatible model and search backend named in `config`.
    pub fn from_config(config: &Config) -> Result<Self, ReportError> {
        let model: DynLanguageModel = Arc::new(OpenAiModel::from_config(&config.llm)?);
        let search = backend_from_config(&config.search)?;
        Ok(Self::new(model, search).with_config(config))
    }

    /// Apply the `[research]`, `[search]`, `[boost]` and `[retrieval]` settings.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.research = ResearchSettings::from_config(config);
        self.report_structure = config.research.report_structure.clone();
        self.coordinator.timeout = config.research.timeout();
        self.coordinator.max_concurrent_sections = config.research.max_concurrent_sections;
        self.retrieval = RetrievalSettings::from(&config.retrieval);
        self
    }

    pub fn with_research_settings(mut self, settings: ResearchSettings) -> Self {
        self.research = settings;
        self
    }

    pub fn with_coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator = config;
        self
    }

    pub fn with_retrieval_settings(mut self, settings: RetrievalSettings) -> Self {
        self.retrieval = settings;
        self
    }

    pub fn with_corpus(mut self, corpus: DynCorpus) -> Self {
        self.corpus = Some(corpus);
        self
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = events;
        self
    }

    pub async fn run_report(
        &self,
        topic: &str,
        time_range: Option<&str>,
    ) -> Result<ReportOutcome, ReportError> {
        self.run_report_with_feedback(topic, time_range, &[]).await
    }

    /// Plan, research and compile a report on `topic`.
    ///
    /// Section-level failures appear as placeholders and in
    /// [`ReportOutcome::failures`]; only planning failures abort the run.
    #[instrument(name = "report.run", skip(self, feedback))]
    pub async fn run_report_with_feedback(
        &self,
        topic: &str,
        time_range: Option<&str>,
        feedback: &[String],
    ) -> Result<ReportOutcome, ReportError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ReportError::InvalidConfiguration(
                "report topic must not be empty".into(),
            ));
        }

        let (graph, start) = self.build_graph(time_range.map(str::to_string));
        let storage = Arc::new(InMemorySessionStorage::new());
        let runner = FlowRunner::new(graph, storage.clone());

        let run_id = format!("report-{}", uuid::Uuid::new_v4());
        let session = Session::new_from_task(run_id.clone(), &start);
        session.context.set(keys::TOPIC, topic.to_string()).await;
        session.context.set(keys::FEEDBACK, feedback.to_vec()).await;

        storage
            .save(session)
            .await
            .map_err(|err| anyhow!("failed to persist session: {err}"))?;

        let mut completed = false;
        for _ in 0..MAX_RUNNER_STEPS {
            let result = runner
                .run(&run_id)
                .await
                .map_err(|err| anyhow!("graph execution failure: {err}"))?;

            match result.status {
                ExecutionStatus::Completed => {
                    completed = true;
                    break;
                }
                ExecutionStatus::Error(message) => return Err(anyhow!(message).into()),
                ExecutionStatus::WaitingForInput => continue,
            }
        }
        if !completed {
            return Err(anyhow!("report graph did not complete within {MAX_RUNNER_STEPS} steps").into());
        }

        let session = storage
            .get(&run_id)
            .await
            .map_err(|err| anyhow!("failed to reload session: {err}"))?
            .ok_or_else(|| anyhow!("session missing after execution"))?;

        if let Some(err) = session.context.get::<FlowError>(keys::ERROR).await {
            return Err(err.into());
        }

        let report: String = session
            .context
            .get(keys::FINAL)
            .await
            .ok_or_else(|| anyhow!("report graph finished without a compiled report"))?;
        let sections: Vec<Section> = session.context.get(keys::SECTIONS).await.unwrap_or_default();
        let failures: Vec<SectionFailure> =
            session.context.get(keys::FAILURES).await.unwrap_or_default();

        info!(
            %run_id,
            sections = sections.len(),
            failures = failures.len(),
            "report run completed"
        );

        Ok(ReportOutcome {
            run_id,
            report,
            sections,
            failures,
        })
    }

    /// Answer one question against the configured knowledge corpus.
    pub async fn run_retrieval(&self, question: &str) -> Result<RetrievalOutcome, ReportError> {
        let corpus = self.corpus.clone().ok_or_else(|| {
            ReportError::InvalidConfiguration("no knowledge corpus configured".into())
        })?;
        SelfCorrectingRetriever::new(
            self.model.clone(),
            corpus,
            self.retrieval.clone(),
            self.events.clone(),
        )
        .run(question)
        .await
    }

    fn build_graph(&self, time_range: Option<String>) -> (Arc<Graph>, String) {
        let settings = self.research.clone().with_time_range(time_range);

        let planner = Arc::new(
            ReportPlanner::new(
                self.model.clone(),
                self.fetcher.clone(),
                settings.clone(),
                self.events.clone(),
            )
            .with_report_structure(self.report_structure.clone()),
        );
        let researcher = SectionResearcher::new(
            self.model.clone(),
            self.fetcher.clone(),
            settings,
            self.events.clone(),
        );
        let coordinator = Arc::new(ReportCoordinator::new(
            researcher,
            self.model.clone(),
            self.coordinator.clone(),
            self.events.clone(),
        ));

        let plan = Arc::new(PlanTask::new(planner));
        let research = Arc::new(ResearchSectionsTask::new(coordinator.clone()));
        let gather = Arc::new(GatherTask);
        let final_sections = Arc::new(WriteFinalSectionsTask::new(coordinator));
        let compile = Arc::new(CompileTask);

        let graph = GraphBuilder::new("deepreport_workflow")
            .add_task(plan.clone())
            .add_task(research.clone())
            .add_task(gather.clone())
            .add_task(final_sections.clone())
            .add_task(compile.clone())
            .add_edge(plan.id(), research.id())
            .add_edge(research.id(), gather.id())
            .add_edge(gather.id(), final_sections.id())
            .add_edge(final_sections.id(), compile.id())
            .set_start_task(plan.id())
            .build();

        (Arc::new(graph), plan.id().to_string())
    }
}
