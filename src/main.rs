// unitgrade command-line entry point
// Computes, stores and relabels unit quality metrics

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use unitgrade_lib::classify::{ClassificationLabel, LabelAssignment, ThresholdConfig};
use unitgrade_lib::metrics::MetricsConfig;
use unitgrade_lib::pipeline::{relabel, PipelineOutput, QualityPipeline, TraceWriter};
use unitgrade_lib::state;
use unitgrade_lib::units::read_recording;

#[derive(Parser, Debug)]
#[command(name = "unitgrade")]
#[command(version, about = "Quality metrics and rule-based classification for spike-sorted units", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute metrics for every unit of a recording and label them
    Compute {
        /// Recording JSON produced by the loader
        #[arg(short, long)]
        input: PathBuf,

        /// Classification rules
        #[arg(short, long)]
        thresholds: PathBuf,

        /// Extraction parameters; defaults apply when omitted
        #[arg(short, long)]
        params: Option<PathBuf>,

        /// Write metrics and labels here as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Store the run in this SQLite database
        #[arg(long)]
        db: Option<PathBuf>,

        /// Append stage progress to this JSONL file
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Worker threads (default: one per core)
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Relabel a stored run with new rules, without recomputing metrics
    Classify {
        #[arg(long)]
        db: PathBuf,

        /// Run id printed by `compute`
        #[arg(long)]
        run: Uuid,

        #[arg(short, long)]
        thresholds: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate rules (and optionally extraction parameters) without running anything
    CheckConfig {
        #[arg(short, long)]
        thresholds: PathBuf,

        #[arg(short, long)]
        params: Option<PathBuf>,
    },

    /// List stored runs
    Runs {
        #[arg(long)]
        db: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Compute {
            input,
            thresholds,
            params,
            output,
            db,
            trace,
            threads,
        } => compute(&input, &thresholds, params.as_deref(), output.as_deref(), db.as_deref(), trace, threads),
        Commands::Classify {
            db,
            run,
            thresholds,
            output,
        } => classify(&db, run, &thresholds, output.as_deref()),
        Commands::CheckConfig { thresholds, params } => check_config(&thresholds, params.as_deref()),
        Commands::Runs { db } => list_runs(&db),
    }
}

fn load_params(path: Option<&Path>) -> anyhow::Result<MetricsConfig> {
    match path {
        Some(path) => MetricsConfig::from_file(path)
            .with_context(|| format!("Invalid extraction parameters in {}", path.display())),
        None => Ok(MetricsConfig::default()),
    }
}

fn load_thresholds(path: &Path) -> anyhow::Result<ThresholdConfig> {
    ThresholdConfig::from_file(path).with_context(|| format!("Failed to read rules from {}", path.display()))
}

fn print_summary(labels: &[LabelAssignment]) {
    for label in ClassificationLabel::ALL {
        let n = labels.iter().filter(|a| a.result.label == label).count();
        println!("{:>12}: {}", label.display_name(), n);
    }
}

fn compute(
    input: &Path,
    thresholds_path: &Path,
    params: Option<&Path>,
    output: Option<&Path>,
    db: Option<&Path>,
    trace: Option<PathBuf>,
    threads: Option<usize>,
) -> anyhow::Result<()> {
    let mut config = load_params(params)?;
    if threads.is_some() {
        config.threads = threads;
    }
    let thresholds = load_thresholds(thresholds_path)?;

    let mut pipeline = QualityPipeline::new(config, &thresholds).context("Configuration rejected")?;
    if let Some(trace) = trace {
        pipeline = pipeline.with_trace(TraceWriter::new(trace));
    }

    let recording =
        read_recording(input).with_context(|| format!("Failed to load recording {}", input.display()))?;
    let result = pipeline.run(&recording).context("Run failed")?;

    if let Some(output) = output {
        let sha = state::write_json(output, &result)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        log::info!("Wrote {} (sha256 {})", output.display(), sha);
    }

    if let Some(db_path) = db {
        let db = state::init_db(db_path)?;
        let input_sha256 = state::hash_file(input)?;
        state::save_run(
            &db,
            result.run_id,
            &input.display().to_string(),
            &input_sha256,
            pipeline.config(),
            &result.metrics,
        )?;
        state::save_labels(&db, &result.run_id, &thresholds, &result.labels)?;
    }

    println!("Run {}", result.run_id);
    print_summary(&result.labels);
    Ok(())
}

fn classify(db_path: &Path, run_id: Uuid, thresholds_path: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let thresholds = load_thresholds(thresholds_path)?;
    let db = state::init_db(db_path)?;
    let metrics = state::load_metrics_table(&db, &run_id)?
        .ok_or_else(|| anyhow!("No run {} in {}", run_id, db_path.display()))?;

    let labels = relabel(&metrics, &thresholds).context("Configuration rejected")?;
    let label_set = state::save_labels(&db, &run_id, &thresholds, &labels)?;
    log::info!("Stored label set {} for run {}", label_set.id, run_id);

    if let Some(output) = output {
        let result = PipelineOutput {
            run_id,
            metrics,
            labels: labels.clone(),
        };
        state::write_json(output, &result).with_context(|| format!("Failed to write {}", output.display()))?;
    }

    print_summary(&labels);
    Ok(())
}

fn check_config(thresholds_path: &Path, params: Option<&Path>) -> anyhow::Result<()> {
    let rules = load_thresholds(thresholds_path)?.validate()?;
    let config = load_params(params)?;
    println!("{} rule(s) in evaluation order:", rules.len());
    for rule in rules.rules() {
        println!("  {:>4}  {:<24} -> {}", rule.priority, rule.id, rule.label.display_name());
    }
    if let Some(threads) = config.threads {
        println!("Worker threads: {}", threads);
    }
    Ok(())
}

fn list_runs(db_path: &Path) -> anyhow::Result<()> {
    let db = state::init_db(db_path)?;
    for summary in state::list_runs(&db)? {
        println!(
            "{}  {}  {:>5} units  {} label set(s)  {}",
            summary.run.id,
            summary.run.created_at.format("%Y-%m-%d %H:%M:%S"),
            summary.run.n_units,
            summary.label_set_count,
            summary.run.input_path
        );
    }
    Ok(())
}
