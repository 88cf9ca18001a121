use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

use crate::section::SectionStatus;

struct ReportMetrics {
    search_failures: Counter<u64>,
    search_rounds: Counter<u64>,
    sections: Counter<u64>,
    section_rounds: Histogram<f64>,
    retrievals: Counter<u64>,
    retrieval_iterations: Histogram<f64>,
}

static METRICS: OnceCell<ReportMetrics> = OnceCell::new();

fn handles() -> &'static ReportMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("deepreport");
        ReportMetrics {
            search_failures: meter
                .u64_counter("search_failures_total")
                .with_description("Search queries that failed and yielded no results")
                .init(),
            search_rounds: meter
                .u64_counter("search_rounds_total")
                .with_description("Search rounds issued by section research loops")
                .init(),
            sections: meter
                .u64_counter("sections_total")
                .with_description("Finalized report sections by status")
                .init(),
            section_rounds: meter
                .f64_histogram("section_search_rounds")
                .with_description("Search rounds used per researched section")
                .init(),
            retrievals: meter
                .u64_counter("retrievals_total")
                .with_description("Retrieval loop invocations by answer source")
                .init(),
            retrieval_iterations: meter
                .f64_histogram("retrieval_iterations")
                .with_description("Corpus retrievals used per question")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) -> Result<()> {
    if std::env::var("DEEPREPORT_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "DEEPREPORT_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export report metrics."
        );
    }
    Ok(())
}

pub fn record_search_failure(backend: &str) {
    handles()
        .search_failures
        .add(1, &[KeyValue::new("backend", backend.to_string())]);
}

pub fn record_search_round(results: usize) {
    handles()
        .search_rounds
        .add(1, &[KeyValue::new("empty", results == 0)]);
}

pub fn record_section(status: SectionStatus, rounds: u32) {
    let metrics = handles();
    let attrs = [KeyValue::new("status", status.as_str())];
    metrics.sections.add(1, &attrs);
    if rounds > 0 {
        metrics.section_rounds.record(f64::from(rounds), &attrs);
    }
}

pub fn record_retrieval(source: &'static str, iterations: u32) {
    let metrics = handles();
    let attrs = [KeyValue::new("source", source)];
    metrics.retrievals.add(1, &attrs);
    metrics
        .retrieval_iterations
        .record(f64::from(iterations), &attrs);
}
