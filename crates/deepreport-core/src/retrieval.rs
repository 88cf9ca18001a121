//! Self-correcting retrieval: decide, retrieve, grade against the original
//! question, then answer, rewrite and retry, or give up.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::config::RetrievalConfig;
use crate::corpus::DynCorpus;
use crate::error::ReportError;
use crate::events::{EventCollector, EventKind};
use crate::llm::{DynLanguageModel, OutputSchema, StructuredOutput, complete_structured};
use crate::metrics;
use crate::prompts::{self, render};

pub const EXHAUSTED_ANSWER: &str = "Unable to find relevant information after multiple attempts.";

/// The model's routing choice. Any other `action` fails to decode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Retrieve {
        #[serde(default)]
        query: String,
    },
    Respond {
        #[serde(default)]
        answer: String,
    },
}

impl StructuredOutput for Decision {
    fn schema() -> OutputSchema {
        OutputSchema {
            name: "decision",
            schema: json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["retrieve", "respond"] },
                    "query": { "type": "string", "description": "Search query when retrieving." },
                    "answer": { "type": "string", "description": "Complete answer when responding." }
                },
                "required": ["action"]
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BinaryScore {
    Yes,
    No,
}

#[derive(Debug, Clone, Deserialize)]
struct Relevance {
    binary_score: BinaryScore,
}

impl StructuredOutput for Relevance {
    fn schema() -> OutputSchema {
        OutputSchema {
            name: "relevance",
            schema: json!({
                "type": "object",
                "properties": {
                    "binary_score": {
                        "type": "string",
                        "enum": ["yes", "no"],
                        "description": "Relevance score 'yes' or 'no'."
                    }
                },
                "required": ["binary_score"]
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Direct,
    Corpus,
    Exhausted,
}

impl AnswerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            AnswerSource::Direct => "direct",
            AnswerSource::Corpus => "corpus",
            AnswerSource::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub answer: String,
    pub source: AnswerSource,
    /// Corpus retrievals performed.
    pub iterations: u32,
    /// Text the corpus answer was grounded on.
    pub retrieved_text: Option<String>,
    pub rewritten_question: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub max_iterations: u32,
    pub top_k: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            top_k: 5,
        }
    }
}

impl From<&RetrievalConfig> for RetrievalSettings {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            top_k: config.top_k,
        }
    }
}

struct RetrievalState {
    question: String,
    rewritten_question: Option<String>,
    retrieved_text: String,
    iteration: u32,
    max_iterations: u32,
}

impl RetrievalState {
    fn current_question(&self) -> &str {
        self.rewritten_question.as_deref().unwrap_or(&self.question)
    }

    fn finish(self, answer: String, source: AnswerSource) -> RetrievalOutcome {
        let retrieved_text = (source == AnswerSource::Corpus).then_some(self.retrieved_text);
        RetrievalOutcome {
            answer,
            source,
            iterations: self.iteration,
            retrieved_text,
            rewritten_question: self.rewritten_question,
        }
    }
}

pub struct SelfCorrectingRetriever {
    model: DynLanguageModel,
    corpus: DynCorpus,
    settings: RetrievalSettings,
    events: EventCollector,
}

impl SelfCorrectingRetriever {
    pub fn new(
        model: DynLanguageModel,
        corpus: DynCorpus,
        settings: RetrievalSettings,
        events: EventCollector,
    ) -> Self {
        Self {
            model,
            corpus,
            settings,
            events,
        }
    }

    /// Answer `question`, retrieving from the corpus at most `max_iterations` times.
    ///
    /// Running out of retries yields an [`AnswerSource::Exhausted`] outcome,
    /// not an error. Backend failures and undecodable model output are errors.
    #[instrument(name = "retrieval.run", skip(self))]
    pub async fn run(&self, question: &str) -> Result<RetrievalOutcome, ReportError> {
        let mut state = RetrievalState {
            question: question.trim().to_string(),
            rewritten_question: None,
            retrieved_text: String::new(),
            iteration: 0,
            max_iterations: self.settings.max_iterations.max(1),
        };
        if state.question.is_empty() {
            return Err(ReportError::InvalidConfiguration(
                "retrieval question must not be empty".into(),
            ));
        }

        let outcome = loop {
            let decision = self.decide(state.current_question()).await?;
            let query = match decision {
                Decision::Respond { answer } => {
                    self.emit_decision(&state, false);
                    if answer.trim().is_empty() {
                        return Err(ReportError::structural("direct response was empty"));
                    }
                    break state.finish(answer, AnswerSource::Direct);
                }
                Decision::Retrieve { query } => {
                    self.emit_decision(&state, true);
                    if query.trim().is_empty() {
                        state.current_question().to_string()
                    } else {
                        query
                    }
                }
            };

            state.iteration += 1;
            let chunks = self.corpus.retrieve(&query, self.settings.top_k).await?;
            state.retrieved_text = chunks
                .iter()
                .map(|chunk| chunk.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            debug!(
                iteration = state.iteration,
                chunks = chunks.len(),
                %query,
                "retrieved corpus chunks"
            );

            let relevant = !state.retrieved_text.trim().is_empty()
                && self.grade(&state.question, &state.retrieved_text).await?;
            self.events.emit(EventKind::RetrievalGraded {
                iteration: state.iteration,
                relevant,
            });

            if relevant {
                let answer = self.answer(&state.question, &state.retrieved_text).await?;
                break state.finish(answer, AnswerSource::Corpus);
            }
            if state.iteration >= state.max_iterations {
                break state.finish(EXHAUSTED_ANSWER.to_string(), AnswerSource::Exhausted);
            }

            let rewritten = self.rewrite(&state.question).await?;
            self.events.emit(EventKind::QuestionRewritten {
                iteration: state.iteration,
                question: rewritten.clone(),
            });
            state.rewritten_question = Some(rewritten);
        };

        info!(
            source = outcome.source.as_str(),
            iterations = outcome.iterations,
            "retrieval finished"
        );
        metrics::record_retrieval(outcome.source.as_str(), outcome.iterations);
        self.events.emit(EventKind::RetrievalFinished {
            source: outcome.source.as_str().to_string(),
            iterations: outcome.iterations,
        });
        Ok(outcome)
    }

    fn emit_decision(&self, state: &RetrievalState, retrieve: bool) {
        self.events.emit(EventKind::RetrievalDecision {
            iteration: state.iteration + 1,
            retrieve,
        });
    }

    async fn decide(&self, question: &str) -> Result<Decision, ReportError> {
        let today = prompts::today();
        let system = render(prompts::RETRIEVAL_DECIDE, &[("today", &today)]);
        complete_structured(self.model.as_ref(), &system, question).await
    }

    async fn grade(&self, original_question: &str, context: &str) -> Result<bool, ReportError> {
        let system = render(
            prompts::RETRIEVAL_GRADER,
            &[("question", original_question), ("context", context)],
        );
        let relevance: Relevance =
            complete_structured(self.model.as_ref(), &system, original_question).await?;
        Ok(relevance.binary_score == BinaryScore::Yes)
    }

    async fn rewrite(&self, original_question: &str) -> Result<String, ReportError> {
        let system = render(
            prompts::RETRIEVAL_REWRITER,
            &[("question", original_question)],
        );
        let rewritten = self.model.complete(&system, original_question).await?;
        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            return Ok(original_question.to_string());
        }
        Ok(rewritten.to_string())
    }

    async fn answer(&self, original_question: &str, context: &str) -> Result<String, ReportError> {
        let system = render(
            prompts::RETRIEVAL_ANSWER,
            &[("question", original_question), ("context", context)],
        );
        Ok(self.model.complete(&system, original_question).await?)
    }
}
