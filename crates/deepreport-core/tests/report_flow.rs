mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{ScriptedModel, ScriptedSearch, SectionScript, engine, housing_plan};
use deepreport_core::events::drain;
use deepreport_core::{
    CoordinatorConfig, EventCollector, EventKind, ReportError, ResearchSettings, SectionStatus,
};

const HOUSING_TOPIC: &str = "effects of interest-rate changes on housing demand";

fn position(report: &str, needle: &str) -> usize {
    report
        .find(needle)
        .unwrap_or_else(|| panic!("report should contain {needle:?}: {report}"))
}

#[tokio::test]
async fn housing_report_compiles_every_section_in_plan_order() {
    let model = Arc::new(ScriptedModel::with_plan(housing_plan()));
    let search = Arc::new(ScriptedSearch::default());

    let outcome = engine(model.clone(), search.clone())
        .run_report(HOUSING_TOPIC, None)
        .await
        .expect("report should succeed");

    let statuses: Vec<SectionStatus> = outcome.sections.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            SectionStatus::Passed,
            SectionStatus::Passed,
            SectionStatus::Drafted
        ]
    );
    assert!(outcome.failures.is_empty());
    assert!(!outcome.report.contains("Section unavailable"));

    let rates = position(&outcome.report, "## Rates");
    let supply = position(&outcome.report, "## Supply");
    let conclusion = position(&outcome.report, "## Conclusion");
    assert!(rates < supply && supply < conclusion);
    assert_eq!(outcome.report.matches("## ").count(), 3);

    // one grade per research section, passing on the first round
    assert_eq!(model.grades.load(Ordering::SeqCst), 2);
    assert_eq!(search.calls_for("Rates"), 1);
    assert_eq!(search.calls_for("Supply"), 1);
    assert!(outcome.run_id.starts_with("report-"));
}

#[tokio::test]
async fn failing_grades_stop_at_configured_search_depth() {
    let model = Arc::new(ScriptedModel::with_plan(housing_plan()).script(
        "Rates",
        SectionScript {
            verdict: "fail",
            ..SectionScript::default()
        },
    ));
    let search = Arc::new(ScriptedSearch::default());

    let outcome = engine(model, search.clone())
        .with_research_settings(ResearchSettings {
            max_search_depth: 3,
            ..ResearchSettings::default()
        })
        .run_report(HOUSING_TOPIC, None)
        .await
        .expect("exhausted sections do not fail the report");

    assert_eq!(outcome.sections[0].status, SectionStatus::Exhausted);
    assert!(outcome.sections[0].content.starts_with("## Rates"));
    assert_eq!(outcome.sections[1].status, SectionStatus::Passed);
    // initial query, then one follow-up round per remaining budget
    assert_eq!(search.calls_for("Rates sources"), 1);
    assert_eq!(search.calls_for("Rates follow-up"), 2);
    assert!(outcome.failures.is_empty());
}

#[tokio::test]
async fn slow_sections_do_not_reorder_the_report() {
    let model = Arc::new(ScriptedModel::with_plan(housing_plan()).script(
        "Rates",
        SectionScript {
            draft_delay: Duration::from_millis(150),
            ..SectionScript::default()
        },
    ));
    let (events, mut receiver) = EventCollector::new();

    let outcome = engine(model, Arc::new(ScriptedSearch::default()))
        .with_events(events)
        .run_report(HOUSING_TOPIC, None)
        .await
        .expect("report should succeed");

    assert!(position(&outcome.report, "## Rates") < position(&outcome.report, "## Supply"));

    let finished: Vec<String> = drain(&mut receiver)
        .into_iter()
        .filter_map(|event| match event.kind {
            EventKind::SectionFinalized { section, .. } => Some(section),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec!["Supply", "Rates", "Conclusion"]);
}

#[tokio::test]
async fn broken_section_becomes_placeholder_without_failing_siblings() {
    let model = Arc::new(ScriptedModel::with_plan(housing_plan()).script(
        "Supply",
        SectionScript {
            broken: true,
            ..SectionScript::default()
        },
    ));

    let outcome = engine(model, Arc::new(ScriptedSearch::default()))
        .run_report(HOUSING_TOPIC, None)
        .await
        .expect("section failures are isolated");

    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].section, "Supply");
    assert!(outcome.failures[0].reason.contains("model refused Supply"));

    assert_eq!(outcome.sections[0].status, SectionStatus::Passed);
    assert_eq!(outcome.sections[1].status, SectionStatus::Failed);
    assert_eq!(outcome.sections[2].status, SectionStatus::Drafted);

    assert!(
        outcome
            .report
            .contains("## Supply\n\n> [Section unavailable: ")
    );
    assert!(position(&outcome.report, "## Rates") < position(&outcome.report, "## Supply"));
    assert!(outcome.report.contains("Synthesis for Conclusion."));
}

#[tokio::test]
async fn research_deadline_abandons_unfinished_sections() {
    let model = Arc::new(ScriptedModel::with_plan(housing_plan()).script(
        "Supply",
        SectionScript {
            draft_delay: Duration::from_secs(30),
            ..SectionScript::default()
        },
    ));

    let outcome = engine(model, Arc::new(ScriptedSearch::default()))
        .with_coordinator_config(CoordinatorConfig {
            max_concurrent_sections: 4,
            timeout: Some(Duration::from_millis(300)),
        })
        .run_report(HOUSING_TOPIC, None)
        .await
        .expect("timeouts are section-level failures");

    assert_eq!(outcome.sections[0].status, SectionStatus::Passed);
    assert_eq!(outcome.sections[1].status, SectionStatus::Failed);
    assert!(outcome.sections[1].content.contains("research timed out"));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].reason, "research timed out");
    assert_eq!(outcome.sections[2].status, SectionStatus::Drafted);
}

#[tokio::test]
async fn undecodable_plan_aborts_the_request() {
    let mut model = ScriptedModel::with_plan(housing_plan());
    model.raw_plan = Some("I could not come up with a plan.".to_string());

    let err = engine(Arc::new(model), Arc::new(ScriptedSearch::default()))
        .run_report(HOUSING_TOPIC, None)
        .await
        .expect_err("planning failures fail the request");

    assert!(matches!(err, ReportError::Structural(_)), "got {err:?}");
}

#[tokio::test]
async fn empty_plan_is_a_structural_failure() {
    let mut model = ScriptedModel::with_plan(housing_plan());
    model.raw_plan = Some(r#"{"sections": []}"#.to_string());

    let err = engine(Arc::new(model), Arc::new(ScriptedSearch::default()))
        .run_report(HOUSING_TOPIC, None)
        .await
        .expect_err("an empty plan cannot be compiled");

    assert!(matches!(err, ReportError::Structural(_)), "got {err:?}");
}

#[tokio::test]
async fn blank_topic_is_rejected() {
    let model = Arc::new(ScriptedModel::with_plan(housing_plan()));
    let err = engine(model, Arc::new(ScriptedSearch::default()))
        .run_report("   ", None)
        .await
        .expect_err("blank topic");
    assert!(matches!(err, ReportError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn plan_event_precedes_section_events() {
    let (events, mut receiver) = EventCollector::new();
    let model = Arc::new(ScriptedModel::with_plan(housing_plan()));

    engine(model, Arc::new(ScriptedSearch::default()))
        .with_events(events)
        .run_report(HOUSING_TOPIC, None)
        .await
        .expect("report should succeed");

    let events = drain(&mut receiver);
    assert!(matches!(
        events.first().map(|event| &event.kind),
        Some(EventKind::PlanReady {
            sections: 3,
            research_sections: 2
        })
    ));
    let rounds = events
        .iter()
        .filter(|event| matches!(event.kind, EventKind::SearchRound { .. }))
        .count();
    assert_eq!(rounds, 2);
}
