use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use disaster_alert_pipeline::classifier::{Classifier, ClassifierConfig, KeywordSet};
use disaster_alert_pipeline::diagnostics::{CountingSink, DiagnosticSink, TracingSink};
use disaster_alert_pipeline::source::{self, InputFormat};
use disaster_alert_pipeline::{output, pipeline, report};

#[derive(Parser)]
#[command(name = "disaster-alerts")]
#[command(about = "Filter disaster posts and roll them up into per-location alerts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct InputArgs {
    /// Input file with one post per record
    #[arg(long)]
    input: PathBuf,
    /// Input encoding; inferred from the extension when omitted
    #[arg(long, value_enum)]
    format: Option<InputFormat>,
}

#[derive(Args)]
struct ClassifyArgs {
    /// Comma-separated relevance keywords, replacing the built-in set
    #[arg(long, env = "DISASTER_KEYWORDS", value_delimiter = ',')]
    keywords: Option<Vec<String>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify and aggregate in one pass, writing summaries as NDJSON
    Run {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        classify: ClassifyArgs,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, env = "DISASTER_WORKERS", default_value_t = pipeline::default_workers())]
        workers: usize,
    },
    /// Classify only, writing keyed relevant records as NDJSON
    Classify {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        classify: ClassifyArgs,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, env = "DISASTER_WORKERS", default_value_t = pipeline::default_workers())]
        workers: usize,
    },
    /// Aggregate the output of `classify` into summaries
    Aggregate {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Generate a markdown report from summary NDJSON
    Report {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn build_classifier(args: &ClassifyArgs) -> anyhow::Result<Classifier> {
    let keywords = match &args.keywords {
        Some(list) => {
            let keywords = KeywordSet::new(list);
            anyhow::ensure!(!keywords.is_empty(), "--keywords must name at least one keyword");
            keywords
        }
        None => KeywordSet::default(),
    };
    let list: Vec<&str> = keywords.iter().collect();
    info!(keywords = %list.join(","), "classifier configured");
    Ok(Classifier::new(ClassifierConfig { keywords }))
}

fn log_diagnostics(counting: &CountingSink) {
    let counts = counting.counts();
    info!(
        source_rejected = counts.source_rejected,
        classify_rejected = counts.classify_rejected,
        aggregate_rejected = counts.aggregate_rejected,
        field_warnings = counts.field_warnings,
        "diagnostics"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let counting = Arc::new(CountingSink::new(Arc::new(TracingSink)));
    let sink: Arc<dyn DiagnosticSink> = counting.clone();

    match cli.command {
        Commands::Run {
            input,
            classify,
            out,
            workers,
        } => {
            let classifier = Arc::new(build_classifier(&classify)?);
            let records = source::load(&input.input, input.format, &*sink)?;
            let outcome = pipeline::run_batch(records, classifier, workers, sink).await?;

            let mut writer = output::open_output(out.as_deref())?;
            output::write_summaries(&mut writer, outcome.run_id, &outcome.summaries)?;
            if let Some(path) = &out {
                info!("Wrote {} summaries to {}.", outcome.summaries.len(), path.display());
            }
        }
        Commands::Classify {
            input,
            classify,
            out,
            workers,
        } => {
            let classifier = Arc::new(build_classifier(&classify)?);
            let records = source::load(&input.input, input.format, &*sink)?;
            let read = records.len();
            let batch = pipeline::classify_batch(records, classifier, workers, sink).await?;

            let mut writer = output::open_output(out.as_deref())?;
            output::write_shuffle(&mut writer, &batch.pairs)?;
            info!(
                read,
                relevant = batch.counts.relevant,
                irrelevant = batch.counts.irrelevant,
                rejected = batch.counts.rejected,
                "classification complete"
            );
        }
        Commands::Aggregate { input, out } => {
            let file = File::open(&input)
                .with_context(|| format!("failed to open input {}", input.display()))?;
            let pairs = output::read_shuffle(BufReader::new(file), &*sink)?;
            let groups = pipeline::group_by_key(pairs);
            let batch = pipeline::aggregate_groups(groups, sink).await?;
            let run_id = uuid::Uuid::new_v4();

            let mut writer = output::open_output(out.as_deref())?;
            output::write_summaries(&mut writer, run_id, &batch.summaries)?;
            info!(
                run_id = %run_id,
                records = batch.records_in,
                aggregated = batch.records_aggregated,
                groups = batch.summaries.len(),
                groups_dropped = batch.groups_dropped,
                "aggregation complete"
            );
        }
        Commands::Report { input, out, limit } => {
            let file = File::open(&input)
                .with_context(|| format!("failed to open summaries {}", input.display()))?;
            let lines = output::read_summaries(BufReader::new(file))?;
            let report = report::build_report(&lines, limit);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    log_diagnostics(&counting);
    Ok(())
}
