//! DeepReport core: sectioned research reports and self-correcting corpus
//! answers, orchestrated with `graph_flow`.
//!
//! A report run plans sections from an exploratory search, researches each
//! section concurrently in a bounded draft/reflect loop, drafts the remaining
//! sections from the research, and compiles everything in plan order. The
//! retrieval entry point answers a single question from a knowledge corpus,
//! rewriting the question when retrieved text is graded irrelevant.

pub mod compiler;
pub mod config;
pub mod corpus;
mod error;
pub mod events;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod research;
pub mod retrieval;
pub mod search;
pub mod section;
mod security;
pub mod sources;
pub mod tasks;
mod telemetry;
mod trace;
mod workflow;

pub use compiler::compile;
pub use config::{Config, ConfigLoader};
pub use corpus::{Document, DynCorpus, InMemoryCorpus, KnowledgeCorpus, RetrievedChunk};
pub use error::{BackendError, ReportError, SectionFailure};
pub use events::{EventCollector, EventKind, ResearchEvent};
pub use llm::{DynLanguageModel, LanguageModel, OutputSchema, StructuredOutput};
pub use orchestrator::{CoordinatorConfig, ReportCoordinator};
pub use research::{ResearchSettings, SectionResearcher};
pub use retrieval::{AnswerSource, RetrievalOutcome, RetrievalSettings, SelfCorrectingRetriever};
pub use search::{DynSearchBackend, SearchBackend, SourceFetcher};
pub use section::{Section, SectionStatus};
pub use security::{SecretValue, require_env};
pub use sources::{DedupStrategy, SourceRecord};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace};
pub use workflow::{DeepReport, ReportOutcome};
