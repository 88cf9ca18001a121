//! Human-readable traces built from drained [`ResearchEvent`]s.
//!
//! Section loops run concurrently, so their events interleave on the bus.
//! The summary regroups them by scope while keeping global step numbers.

use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::ResearchEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub scope: String,
    pub message: String,
    pub timestamp_ms: u64,
}

impl From<&ResearchEvent> for TraceEvent {
    fn from(event: &ResearchEvent) -> Self {
        Self {
            scope: event.kind.scope(),
            message: event.kind.describe(),
            timestamp_ms: event.timestamp,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCollector {
    events: Vec<TraceEvent>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: &[ResearchEvent]) -> Self {
        Self {
            events: events.iter().map(TraceEvent::from).collect(),
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_events(&self.events)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    /// 1-based position in emission order.
    pub index: usize,
    pub scope: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: Vec<TraceStep>,
    /// Milliseconds between the first and last event.
    pub elapsed_ms: u64,
}

impl TraceSummary {
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let steps = events
            .iter()
            .enumerate()
            .map(|(idx, event)| TraceStep {
                index: idx + 1,
                scope: event.scope.clone(),
                message: event.message.clone(),
            })
            .collect();
        let first = events.iter().map(|event| event.timestamp_ms).min();
        let last = events.iter().map(|event| event.timestamp_ms).max();
        let elapsed_ms = match (first, last) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        };
        Self { steps, elapsed_ms }
    }

    /// Scopes in order of first appearance.
    pub fn scopes(&self) -> Vec<&str> {
        let mut scopes: Vec<&str> = Vec::new();
        for step in &self.steps {
            if !scopes.contains(&step.scope.as_str()) {
                scopes.push(&step.scope);
            }
        }
        scopes
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No trace events recorded.".to_string();
        }

        let mut output = format!(
            "### Trace Summary ({} steps over {} ms)\n",
            self.steps.len(),
            self.elapsed_ms
        );
        for scope in self.scopes() {
            let _ = writeln!(output, "\n#### {scope}");
            for step in self.steps.iter().filter(|step| step.scope == scope) {
                let _ = writeln!(output, "{}. {}", step.index, step.message);
            }
        }
        output
    }
}

/// Write the raw events of one run to `<dir>/<run_id>.json`.
pub fn persist_trace<P: AsRef<Path>>(
    dir: P,
    run_id: &str,
    events: &[ResearchEvent],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;

    let path = dir.join(format!("{run_id}.json"));
    let file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, events)
        .with_context(|| format!("failed to serialise trace for {run_id}"))?;
    writer
        .flush()
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventCollector, EventKind, drain};
    use crate::section::SectionStatus;

    fn sample_events() -> Vec<ResearchEvent> {
        let (collector, mut receiver) = EventCollector::new();
        collector.emit(EventKind::PlanReady {
            sections: 3,
            research_sections: 2,
        });
        collector.emit(EventKind::SearchRound {
            index: 1,
            section: "Rates".into(),
            iteration: 1,
            queries: vec!["policy rate 2024".into()],
            results: 4,
        });
        collector.emit(EventKind::SearchRound {
            index: 2,
            section: "Supply".into(),
            iteration: 1,
            queries: vec!["housing starts".into()],
            results: 2,
        });
        collector.emit(EventKind::SectionFinalized {
            index: 1,
            section: "Rates".into(),
            status: SectionStatus::Exhausted,
            iterations: 2,
        });
        drain(&mut receiver)
    }

    #[test]
    fn markdown_groups_interleaved_steps_by_scope() {
        let markdown = TraceCollector::from_events(&sample_events())
            .summary()
            .render_markdown();

        assert!(markdown.starts_with("### Trace Summary (4 steps over "));
        let rates = markdown.find("#### section:Rates").expect("rates group");
        let supply = markdown.find("#### section:Supply").expect("supply group");
        assert!(rates < supply);

        let rates_block = &markdown[rates..supply];
        assert!(rates_block.contains("2. search round 1: 1 queries, 4 results"));
        assert!(rates_block.contains("4. finalized as exhausted after 2 rounds"));
        assert!(markdown[supply..].contains("3. search round 1"));
    }

    #[test]
    fn scopes_keep_first_appearance_order() {
        let summary = TraceCollector::from_events(&sample_events()).summary();
        assert_eq!(
            summary.scopes(),
            vec!["planner", "section:Rates", "section:Supply"]
        );
    }

    #[test]
    fn empty_trace_has_explicit_message() {
        let summary = TraceCollector::new().summary();
        assert_eq!(summary.elapsed_ms, 0);
        assert_eq!(summary.render_markdown(), "No trace events recorded.");
    }

    #[test]
    fn persist_writes_json_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = persist_trace(dir.path().join("traces"), "run-1", &sample_events())
            .expect("persist");

        let raw = std::fs::read_to_string(&path).expect("read back");
        let parsed: Vec<ResearchEvent> = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(parsed.len(), 4);
        assert!(path.ends_with("run-1.json"));
    }
}
