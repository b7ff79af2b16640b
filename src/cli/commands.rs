//! CLI command definitions for tern-forge.
//!
//! Every command reads the same run configuration: an optional YAML file,
//! then `TERNFORGE_*` environment variables, then the flags below.

use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use uuid::Uuid;

use crate::export::{export_store, ExportOptions, DEFAULT_BATCH_ROWS};
use crate::labels::{encode_store, LabelEncoder};
use crate::pipeline::{
    PipelineConfig, PipelineDriver, RetryFilter, RunStatus, RunSummary, SolverSelection,
};
use crate::storage::{FailureKind, OutputStore};

/// Checkpointed generator of ternary equilibrium datasets.
#[derive(Parser)]
#[command(name = "tern-forge")]
#[command(about = "Generate thermodynamic equilibrium datasets over element triples")]
#[command(version)]
#[command(
    long_about = "tern-forge walks every element triple of a catalogue over a concentration grid, \
runs an equilibrium solver for each composition and appends the results to a JSON Lines store.\n\n\
Runs are checkpointed after every triple and resume where they stopped.\n\n\
Example usage:\n  tern-forge generate --elements AL,CU,FE,NI --data-dir ./run-01\n  \
tern-forge status --data-dir ./run-01\n  tern-forge export --data-dir ./run-01 --out dataset.parquet --dedup"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Process every combination after the checkpoint.
    #[command(alias = "gen")]
    Generate(GenerateArgs),

    /// Re-run combinations and points recorded in the failure log.
    Retry(RetryArgs),

    /// Show checkpoint position and failure counts.
    Status(StatusArgs),

    /// Write a copy of the store with integer-encoded phase labels.
    Encode(EncodeArgs),

    /// Convert the store into a Parquet dataset.
    Export(ExportArgs),
}

/// Run configuration flags shared by every command.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// YAML configuration file.
    #[arg(short = 'c', long, env = "TERNFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding results.jsonl, checkpoint.json and failures.jsonl.
    #[arg(short = 'd', long)]
    pub data_dir: Option<PathBuf>,

    /// Output store path (overrides --data-dir).
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Checkpoint path (overrides --data-dir).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Failure log path (overrides --data-dir).
    #[arg(long)]
    pub failure_log: Option<PathBuf>,

    /// Comma-separated element catalogue, in enumeration order.
    #[arg(short = 'e', long, value_delimiter = ',')]
    pub elements: Option<Vec<String>>,

    /// Concentration grid step.
    #[arg(long)]
    pub w_step: Option<f64>,

    /// Concentration rounding in decimals.
    #[arg(long)]
    pub precision: Option<u32>,

    /// First temperature of the sweep (K).
    #[arg(long)]
    pub t_start: Option<f64>,

    /// Sweep upper bound, exclusive (K).
    #[arg(long)]
    pub t_end: Option<f64>,

    /// Sweep step (K).
    #[arg(long)]
    pub t_step: Option<f64>,

    /// Pressure (Pa).
    #[arg(long)]
    pub pressure: Option<f64>,

    /// YAML phase list (`name`, `phases`).
    #[arg(long)]
    pub phase_database: Option<PathBuf>,

    /// External solver program; the built-in ideal model is used otherwise.
    #[arg(long)]
    pub solver_command: Option<PathBuf>,

    /// Argument passed to the solver program (repeatable).
    #[arg(long = "solver-arg", allow_hyphen_values = true)]
    pub solver_args: Vec<String>,

    /// Concurrent solver calls (default: available cores minus two).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Per-item solver timeout in seconds.
    #[arg(long)]
    pub item_timeout: Option<u64>,
}

impl RunArgs {
    /// Layers file, environment and flags into a validated configuration.
    pub fn to_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_yaml_file(path)?,
            None => PipelineConfig::default(),
        };
        config.apply_env()?;

        if let Some(dir) = &self.data_dir {
            config = config.with_data_dir(dir);
        }
        if let Some(path) = &self.output {
            config.output_path = path.clone();
        }
        if let Some(path) = &self.checkpoint {
            config.checkpoint_path = path.clone();
        }
        if let Some(path) = &self.failure_log {
            config.failure_log_path = path.clone();
        }
        if let Some(elements) = &self.elements {
            config.elements = elements.clone();
        }
        if let Some(step) = self.w_step {
            config.grid.step = step;
        }
        if let Some(precision) = self.precision {
            config.grid.precision = precision;
        }
        if let Some(t) = self.t_start {
            config.sweep.start = t;
        }
        if let Some(t) = self.t_end {
            config.sweep.end = t;
        }
        if let Some(t) = self.t_step {
            config.sweep.step = t;
        }
        if let Some(p) = self.pressure {
            config.pressure = p;
        }
        if let Some(path) = &self.phase_database {
            config.phase_database = Some(path.clone());
        }
        if let Some(program) = &self.solver_command {
            config.solver = SolverSelection::Command {
                program: program.clone(),
                args: self.solver_args.clone(),
            };
        }
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(secs) = self.item_timeout {
            config.item_timeout_secs = Some(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Arguments for `tern-forge generate`.
#[derive(Parser, Debug)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Stop after this many combinations.
    #[arg(short = 'n', long)]
    pub limit: Option<u64>,

    /// Plain-text last-combination marker (e.g. `['LI', 'BE', 'NA']`) to
    /// import when no checkpoint exists.
    #[arg(long)]
    pub legacy_marker: Option<PathBuf>,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `tern-forge retry`.
#[derive(Parser, Debug)]
pub struct RetryArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Only retry failures recorded by this run.
    #[arg(long)]
    pub run_id: Option<Uuid>,

    /// Only retry failures of this kind (solver, dispatch, aggregate; repeatable).
    ///
    /// Persist failures are never retried: generation redoes that combination.
    #[arg(long = "kind", value_parser = parse_failure_kind)]
    pub kinds: Vec<FailureKind>,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `tern-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `tern-forge encode`.
#[derive(Parser, Debug)]
pub struct EncodeArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Encoded JSON Lines output.
    #[arg(short = 'o', long)]
    pub out: PathBuf,

    /// Add labels found in the store but missing from the phase database.
    #[arg(long)]
    pub fit_observed: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `tern-forge export`.
#[derive(Parser, Debug)]
pub struct ExportArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Parquet output file.
    #[arg(short = 'o', long)]
    pub out: PathBuf,

    /// Drop repeated (elements, concentration, temperature) rows.
    #[arg(long)]
    pub dedup: bool,

    /// Add three integer-encoded phase columns.
    #[arg(long)]
    pub encode_phases: bool,

    /// Rows per Parquet row group.
    #[arg(long, default_value_t = DEFAULT_BATCH_ROWS)]
    pub batch_rows: usize,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

fn parse_failure_kind(value: &str) -> Result<FailureKind, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "solver" => Ok(FailureKind::Solver),
        "dispatch" => Ok(FailureKind::Dispatch),
        "aggregate" => Ok(FailureKind::Aggregate),
        "persist" => Err("persist failures are redone by generate, not retried".to_string()),
        other => Err(format!(
            "unknown failure kind '{}' (expected solver, dispatch or aggregate)",
            other
        )),
    }
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Generate(args) => run_generate_command(args).await?,
        Commands::Retry(args) => run_retry_command(args).await?,
        Commands::Status(args) => run_status_command(args).await?,
        Commands::Encode(args) => run_encode_command(args).await?,
        Commands::Export(args) => run_export_command(args).await?,
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json_output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

#[derive(Serialize)]
struct RunOutput {
    run_id: String,
    status: String,
    total_combinations: u64,
    resumed_from: Option<u64>,
    processed: u64,
    succeeded: u64,
    failed: u64,
    item_failures: u64,
    rows_written: u64,
    last_rank: Option<u64>,
}

impl From<&RunSummary> for RunOutput {
    fn from(summary: &RunSummary) -> Self {
        let status = if summary.interrupted {
            "interrupted"
        } else if summary.complete {
            "complete"
        } else {
            "partial"
        };
        Self {
            run_id: summary.run_id.to_string(),
            status: status.to_string(),
            total_combinations: summary.total_combinations,
            resumed_from: summary.resumed_from,
            processed: summary.processed,
            succeeded: summary.succeeded,
            failed: summary.failed,
            item_failures: summary.item_failures,
            rows_written: summary.rows_written,
            last_rank: summary.last_rank,
        }
    }
}

fn print_run_summary(title: &str, summary: &RunSummary, config: &PipelineConfig) {
    let output = RunOutput::from(summary);
    println!("✓ {} {}", title, output.status);
    println!("  Run: {}", output.run_id);
    println!("  Output: {}", config.output_path.display());
    println!(
        "  Combinations: {} processed ({} clean, {} failed), {} total",
        summary.processed, summary.succeeded, summary.failed, summary.total_combinations
    );
    println!(
        "  Rows: {} written, {} item failures",
        summary.rows_written, summary.item_failures
    );
    if let Some(rank) = summary.last_rank {
        println!("  Last rank: {}", rank);
    }
}

async fn run_generate_command(args: GenerateArgs) -> anyhow::Result<()> {
    let mut config = args.run.to_config()?;
    if let Some(limit) = args.limit {
        config = config.with_limit(limit);
    }
    if let Some(marker) = &args.legacy_marker {
        config = config.with_legacy_marker(marker);
    }

    let mut driver = PipelineDriver::new(&config).await?;
    driver.shutdown_handle().listen_for_ctrl_c();
    let summary = driver.run().await?;

    if args.json {
        print_json(&RunOutput::from(&summary))?;
    } else {
        print_run_summary("Generation", &summary, &config);
    }
    Ok(())
}

async fn run_retry_command(args: RetryArgs) -> anyhow::Result<()> {
    let config = args.run.to_config()?;

    let mut driver = PipelineDriver::new(&config).await?;
    let filter = RetryFilter {
        run_id: args.run_id,
        kinds: args.kinds.clone(),
    };
    let targets = driver.pending_retries(&filter).await?;
    if targets.is_empty() {
        println!("Nothing to retry");
        return Ok(());
    }

    driver.shutdown_handle().listen_for_ctrl_c();
    let summary = driver.reprocess(&targets).await?;

    if args.json {
        print_json(&RunOutput::from(&summary))?;
    } else {
        print_run_summary("Retry", &summary, &config);
    }
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = args.run.to_config()?;
    let status = RunStatus::collect(&config).await?;

    if args.json {
        return print_json(&status);
    }

    println!("Run directory status");
    println!("  Output: {} ({} bytes)", config.output_path.display(), status.store_bytes);
    println!(
        "  Progress: {}/{} combinations ({:.1}%)",
        status.completed_combinations,
        status.total_combinations,
        status.progress_pct()
    );
    match (&status.last_rank, &status.last_elements) {
        (Some(rank), Some(elements)) => {
            println!("  Last finished: #{} {}", rank, elements.join("-"))
        }
        _ => println!("  Last finished: none"),
    }
    if status.uncommitted_bytes > 0 {
        println!(
            "  Uncommitted: {} bytes will be dropped on resume",
            status.uncommitted_bytes
        );
    }
    println!("  Failed combinations: {}", status.failed_combinations);
    for (kind, count) in &status.failures_by_kind {
        println!("    {}: {}", kind, count);
    }
    if status.resolved_failures > 0 {
        println!("  Resolved by retry: {}", status.resolved_failures);
    }
    Ok(())
}

async fn run_encode_command(args: EncodeArgs) -> anyhow::Result<()> {
    let config = args.run.to_config()?;
    let database = config.solver_context()?.database;
    let store = OutputStore::open(&config.output_path).await?;

    let summary = encode_store(&store, &database, &args.out, args.fit_observed).await?;

    if args.json {
        print_json(&summary)?;
    } else {
        println!("✓ Encoded {} rows", summary.rows);
        println!("  Output: {}", args.out.display());
        println!("  Classes:");
        for (code, class) in summary.classes.iter().enumerate() {
            let shown = if class.is_empty() { "<empty>" } else { class.as_str() };
            println!("    {}: {}", code, shown);
        }
    }
    Ok(())
}

async fn run_export_command(args: ExportArgs) -> anyhow::Result<()> {
    let config = args.run.to_config()?;
    let store = OutputStore::open(&config.output_path).await?;
    let encoder = if args.encode_phases {
        Some(LabelEncoder::from_database(&config.solver_context()?.database))
    } else {
        None
    };

    let options = ExportOptions {
        dedup: args.dedup,
        encoder,
        batch_rows: args.batch_rows,
    };
    let summary = export_store(&store, &args.out, options).await?;

    if args.json {
        print_json(&summary)?;
    } else {
        println!("✓ Exported {} rows", summary.rows_written);
        println!("  Output: {}", args.out.display());
        if summary.duplicates_dropped > 0 {
            println!("  Duplicates dropped: {}", summary.duplicates_dropped);
        }
    }
    Ok(())
}
