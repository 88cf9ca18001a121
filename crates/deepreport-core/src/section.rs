use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

const BANNER: &str = "============================================================";
const NOT_YET_WRITTEN: &str = "[Not yet written]";

/// How a section reached its final content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    /// Planned but not yet written.
    #[default]
    Planned,
    /// The last reflection graded the draft as passing.
    Passed,
    /// The search budget ran out on a failing grade; the last draft is kept.
    Exhausted,
    /// Research or drafting aborted; content is a placeholder.
    Failed,
    /// Single-pass draft of a section that needed no research.
    Drafted,
}

impl SectionStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, SectionStatus::Planned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SectionStatus::Planned => "planned",
            SectionStatus::Passed => "passed",
            SectionStatus::Exhausted => "exhausted",
            SectionStatus::Failed => "failed",
            SectionStatus::Drafted => "drafted",
        }
    }
}

/// One entry of a report plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub description: String,
    #[serde(default, alias = "research")]
    pub needs_research: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: SectionStatus,
}

impl Section {
    pub fn new(name: impl Into<String>, description: impl Into<String>, needs_research: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            needs_research,
            content: String::new(),
            status: SectionStatus::Planned,
        }
    }

    /// Freeze the section. Later calls are ignored so finalized content never changes.
    pub fn finalize(&mut self, content: impl Into<String>, status: SectionStatus) {
        if self.status.is_final() {
            tracing::warn!(section = %self.name, "ignoring second finalization");
            return;
        }
        self.content = content.into();
        self.status = status;
    }

    /// Replace the content with a visible marker for a section that could not be produced.
    pub fn fail(&mut self, reason: &str) {
        let placeholder = failure_placeholder(&self.name, reason);
        self.finalize(placeholder, SectionStatus::Failed);
    }
}

pub fn failure_placeholder(name: &str, reason: &str) -> String {
    format!("## {name}\n\n> [Section unavailable: {reason}]")
}

/// Numbered rendering of sections, used as shared context for drafting
/// the sections that need no research.
pub fn format_sections(sections: &[Section]) -> String {
    let mut output = String::new();
    for (idx, section) in sections.iter().enumerate() {
        let content = if section.content.trim().is_empty() {
            NOT_YET_WRITTEN
        } else {
            section.content.as_str()
        };
        let _ = write!(
            output,
            "\n{BANNER}\nSection {}: {}\n{BANNER}\nDescription:\n{}\nRequires Research:\n{}\n\nContent:\n{}\n\n",
            idx + 1,
            section.name,
            section.description,
            section.needs_research,
            content
        );
    }
    output
}
