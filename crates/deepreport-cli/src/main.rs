use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use deepreport_core::events::drain;
use deepreport_core::{
    ConfigLoader, DeepReport, Document, DynCorpus, EventCollector, InMemoryCorpus,
    TelemetryOptions, TraceCollector, init_telemetry, metrics, persist_trace,
};
use tokio::runtime::Runtime;
use tracing::{info, warn};
use walkdir::WalkDir;

#[cfg(feature = "qdrant-retriever")]
use deepreport_core::corpus::{HybridRetriever, QdrantConfig};

#[derive(Parser, Debug)]
#[command(
    name = "deepreport-cli",
    version,
    about = "Sectioned research reports and corpus answers"
)]
struct Cli {
    /// Path to the TOML configuration (falls back to DEEPREPORT_CONFIG, then ./config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan, research and compile a report on a topic.
    Report(ReportArgs),
    /// Answer one question from a local document corpus.
    Ask(AskArgs),
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Topic to write the report about.
    #[arg(long)]
    topic: String,

    /// Search recency filter (day, week, month, year).
    #[arg(long)]
    time_range: Option<String>,

    /// Feedback on a previous plan, repeatable.
    #[arg(long = "feedback")]
    feedback: Vec<String>,

    /// Print the trace summary after the report.
    #[arg(long, default_value_t = false)]
    explain: bool,

    /// Directory to write the run's events to as JSON.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Emit the outcome as JSON instead of markdown.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct AskArgs {
    /// Question to answer.
    #[arg(long)]
    question: String,

    /// File or directory of text documents forming the corpus.
    #[arg(long)]
    corpus: PathBuf,

    /// Recurse into subdirectories when loading the corpus (`--recursive false` to disable).
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    recursive: bool,

    /// Print the trace summary after the answer.
    #[arg(long, default_value_t = false)]
    explain: bool,

    /// Qdrant endpoint; when set, documents are ingested there instead of held in memory.
    #[arg(long)]
    qdrant_url: Option<String>,

    /// Qdrant collection name.
    #[arg(long, default_value = "deepreport")]
    qdrant_collection: String,

    /// Maximum concurrent Qdrant operations.
    #[arg(long, default_value_t = 8)]
    qdrant_concurrency: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.clone())?;

    init_telemetry(TelemetryOptions::from(&config.logging))?;
    metrics::init_metrics_from_env("deepreport-cli")?;

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let (events, receiver) = EventCollector::new();
        let engine = DeepReport::from_config(&config)?.with_events(events);

        match cli.command {
            Command::Report(args) => report_command(engine, receiver, args).await?,
            Command::Ask(args) => {
                let corpus = load_corpus(&args, &config.retrieval).await?;
                ask_command(engine.with_corpus(corpus), receiver, args).await?
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<deepreport_core::ResearchEvent>;

async fn report_command(
    engine: DeepReport,
    mut receiver: EventReceiver,
    args: ReportArgs,
) -> Result<()> {
    info!(topic = %args.topic, "starting report");

    let outcome = engine
        .run_report_with_feedback(&args.topic, args.time_range.as_deref(), &args.feedback)
        .await?;

    for failure in &outcome.failures {
        warn!(section = %failure.section, reason = %failure.reason, "section unavailable");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.report);
    }

    let events = drain(&mut receiver);
    if let Some(dir) = &args.trace_dir {
        let path = persist_trace(dir, &outcome.run_id, &events)?;
        info!(path = %path.display(), "trace persisted");
    }
    if args.explain {
        println!(
            "\n{}",
            TraceCollector::from_events(&events).summary().render_markdown()
        );
    }
    Ok(())
}

async fn ask_command(engine: DeepReport, mut receiver: EventReceiver, args: AskArgs) -> Result<()> {
    let outcome = engine.run_retrieval(&args.question).await?;
    info!(
        source = outcome.source.as_str(),
        iterations = outcome.iterations,
        "question answered"
    );
    println!("{}", outcome.answer);

    if args.explain {
        let events = drain(&mut receiver);
        println!(
            "\n{}",
            TraceCollector::from_events(&events).summary().render_markdown()
        );
    }
    Ok(())
}

async fn load_corpus(
    args: &AskArgs,
    settings: &deepreport_core::config::RetrievalConfig,
) -> Result<DynCorpus> {
    let documents = collect_documents(&args.corpus, args.recursive)?;
    if documents.is_empty() {
        warn!(path = %args.corpus.display(), "no documents found for the corpus");
    }

    if let Some(url) = &args.qdrant_url {
        return qdrant_corpus(url, args, documents, settings).await;
    }

    let corpus = InMemoryCorpus::new(settings.chunk_size, settings.chunk_overlap)
        .with_documents(documents);
    info!(chunks = corpus.len(), "loaded in-memory corpus");
    Ok(Arc::new(corpus))
}

#[cfg(feature = "qdrant-retriever")]
async fn qdrant_corpus(
    url: &str,
    args: &AskArgs,
    documents: Vec<Document>,
    settings: &deepreport_core::config::RetrievalConfig,
) -> Result<DynCorpus> {
    let retriever = HybridRetriever::new(QdrantConfig {
        url: url.to_string(),
        collection: args.qdrant_collection.clone(),
        concurrency_limit: args.qdrant_concurrency,
    })
    .await?;
    let ingested = retriever
        .ingest(documents, settings.chunk_size, settings.chunk_overlap)
        .await?;
    info!(ingested, collection = %args.qdrant_collection, "ingested corpus into qdrant");
    Ok(Arc::new(retriever))
}

#[cfg(not(feature = "qdrant-retriever"))]
async fn qdrant_corpus(
    _url: &str,
    _args: &AskArgs,
    _documents: Vec<Document>,
    _settings: &deepreport_core::config::RetrievalConfig,
) -> Result<DynCorpus> {
    anyhow::bail!(
        "qdrant retriever feature not enabled; rebuild with `--features deepreport-cli/qdrant-retriever`"
    )
}

fn collect_documents(path: &Path, recursive: bool) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    let entries: Box<dyn Iterator<Item = PathBuf>> = if path.is_file() {
        Box::new(std::iter::once(path.to_path_buf()))
    } else {
        let walker = WalkDir::new(path)
            .min_depth(0)
            .max_depth(if recursive { usize::MAX } else { 1 });
        Box::new(
            walker
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path()),
        )
    };

    for file in entries {
        let text = fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        if text.trim().is_empty() {
            continue;
        }
        let source = file.display().to_string();
        docs.push(Document {
            id: uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, source.as_bytes()).to_string(),
            text,
            source: Some(source),
        });
    }

    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ask_args(extra: &[&str]) -> AskArgs {
        let mut argv = vec!["deepreport-cli", "ask", "--question", "q", "--corpus", "docs"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("valid arguments").command {
            Command::Ask(args) => args,
            other => panic!("expected ask, got {other:?}"),
        }
    }

    #[test]
    fn corpus_recursion_defaults_on_and_can_be_disabled() {
        assert!(ask_args(&[]).recursive);
        assert!(ask_args(&["--recursive", "true"]).recursive);
        assert!(!ask_args(&["--recursive", "false"]).recursive);
    }
}
