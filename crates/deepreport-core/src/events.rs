//! Event bus for research and retrieval progress.
//!
//! Loops emit events as they change state; callers drain the receiver after a
//! run to build a trace of what happened.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::section::SectionStatus;

/// Unique identifier for an event
pub type EventId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchEvent {
    pub event_id: EventId,
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PlanReady {
        sections: usize,
        research_sections: usize,
    },
    SectionStarted {
        index: usize,
        section: String,
    },
    SearchRound {
        index: usize,
        section: String,
        iteration: u32,
        queries: Vec<String>,
        results: usize,
    },
    SectionGraded {
        index: usize,
        section: String,
        iteration: u32,
        passed: bool,
        follow_up_queries: Vec<String>,
    },
    SectionFinalized {
        index: usize,
        section: String,
        status: SectionStatus,
        iterations: u32,
    },
    SectionFailed {
        index: usize,
        section: String,
        reason: String,
    },
    RetrievalDecision {
        iteration: u32,
        retrieve: bool,
    },
    RetrievalGraded {
        iteration: u32,
        relevant: bool,
    },
    QuestionRewritten {
        iteration: u32,
        question: String,
    },
    RetrievalFinished {
        source: String,
        iterations: u32,
    },
}

impl EventKind {
    /// Short scope label, e.g. `section:Rates` or `retrieval`.
    pub fn scope(&self) -> String {
        match self {
            EventKind::PlanReady { .. } => "planner".to_string(),
            EventKind::SectionStarted { section, .. }
            | EventKind::SearchRound { section, .. }
            | EventKind::SectionGraded { section, .. }
            | EventKind::SectionFinalized { section, .. }
            | EventKind::SectionFailed { section, .. } => format!("section:{section}"),
            EventKind::RetrievalDecision { .. }
            | EventKind::RetrievalGraded { .. }
            | EventKind::QuestionRewritten { .. }
            | EventKind::RetrievalFinished { .. } => "retrieval".to_string(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            EventKind::PlanReady {
                sections,
                research_sections,
            } => format!("planned {sections} sections ({research_sections} need research)"),
            EventKind::SectionStarted { .. } => "research started".to_string(),
            EventKind::SearchRound {
                iteration,
                queries,
                results,
                ..
            } => format!(
                "search round {iteration}: {} queries, {results} results",
                queries.len()
            ),
            EventKind::SectionGraded {
                iteration, passed, ..
            } => format!(
                "iteration {iteration} graded {}",
                if *passed { "pass" } else { "fail" }
            ),
            EventKind::SectionFinalized {
                status, iterations, ..
            } => format!("finalized as {} after {iterations} rounds", status.as_str()),
            EventKind::SectionFailed { reason, .. } => format!("failed: {reason}"),
            EventKind::RetrievalDecision {
                iteration,
                retrieve,
            } => format!(
                "iteration {iteration}: {}",
                if *retrieve {
                    "retrieve from corpus"
                } else {
                    "respond directly"
                }
            ),
            EventKind::RetrievalGraded {
                iteration,
                relevant,
            } => format!(
                "iteration {iteration}: retrieved text {}",
                if *relevant { "relevant" } else { "not relevant" }
            ),
            EventKind::QuestionRewritten { question, .. } => format!("rewrote question: {question}"),
            EventKind::RetrievalFinished { source, iterations } => {
                format!("finished ({source}) after {iterations} retrievals")
            }
        }
    }
}

/// Cloneable emitter shared by every loop of a run. A disabled collector
/// silently drops events.
#[derive(Clone, Default)]
pub struct EventCollector {
    sender: Option<mpsc::UnboundedSender<ResearchEvent>>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResearchEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn emit(&self, kind: EventKind) {
        let Some(sender) = &self.sender else {
            return;
        };
        let event = ResearchEvent {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            kind,
        };
        if let Err(e) = sender.send(event) {
            tracing::warn!(error = %e, "failed to emit research event");
        }
    }
}

/// Collect every event already queued on the receiver without waiting.
pub fn drain(receiver: &mut mpsc::UnboundedReceiver<ResearchEvent>) -> Vec<ResearchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

fn generate_event_id() -> EventId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("evt_{}", id)
}

/// Unix timestamp in milliseconds
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
