use crate::section::Section;

const SECTION_JOINER: &str = "\n\n";

/// Concatenate section contents in plan order.
///
/// # Panics
///
/// Panics if any section has empty content. Every section must be finalized
/// or carry a failure placeholder before compilation.
pub fn compile(plan: &[Section]) -> String {
    for section in plan {
        assert!(
            !section.content.trim().is_empty(),
            "section '{}' reached compilation without content",
            section.name
        );
    }

    plan.iter()
        .map(|section| section.content.trim_end())
        .collect::<Vec<_>>()
        .join(SECTION_JOINER)
}
