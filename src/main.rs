use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use time::macros::format_description;

use placement_recon::consolidate::RawTables;
use placement_recon::merge::MergeStatus;
use placement_recon::output::{read_merged, DirectorySink};
use placement_recon::pipeline::{
    consolidate_to_sink, merge_to_sink, reconcile_to_sink, reconciled_file_name, ReconcileStatus, RunSummary,
};
use placement_recon::retry::with_retry;
use placement_recon::source::{read_text, DirectoryReports, MetadataFile, MetadataSource};
use placement_recon::{Config, DeliveryRecord};

#[derive(Parser, Debug)]
#[command(author, version, about = "Merge ad-server delivery reports and reconcile them against creative metadata", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, global = true, help = "YAML configuration file (defaults apply when omitted)")]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,

    #[arg(short, long, global = true, help = "Number of threads to use (0 for auto)")]
    threads: Option<usize>,

    #[arg(long, global = true, help = "Delivery rows per reconciliation batch")]
    batch_size: Option<usize>,

    #[arg(long, global = true, help = "Write a JSON run summary to this path")]
    summary: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge every delivery report in a directory into one deduplicated CSV
    Merge {
        #[arg(short, long, help = "Directory containing delivery reports")]
        input: PathBuf,
        #[arg(short, long, help = "Output directory")]
        output: PathBuf,
    },
    /// Reconcile a merged delivery CSV against creative metadata
    Reconcile {
        #[arg(short, long, help = "Merged delivery CSV")]
        delivery: PathBuf,
        #[arg(short, long, help = "Metadata report, or a directory holding timestamped reports")]
        metadata: PathBuf,
        #[arg(short, long, help = "Output directory")]
        output: PathBuf,
    },
    /// Merge then reconcile, writing both outputs
    Run {
        #[arg(short, long, help = "Directory containing delivery reports")]
        input: PathBuf,
        #[arg(short, long, help = "Metadata report, or a directory holding timestamped reports")]
        metadata: PathBuf,
        #[arg(short, long, help = "Output directory")]
        output: PathBuf,
    },
    /// Flatten campaign, line item and creative dumps into a metadata report
    Consolidate {
        #[arg(short, long, help = "Directory containing the raw table dumps")]
        input: PathBuf,
        #[arg(short, long, help = "Output directory")]
        output: PathBuf,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Merge { .. } => "merge",
            Command::Reconcile { .. } => "reconcile",
            Command::Run { .. } => "run",
            Command::Consolidate { .. } => "consolidate",
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = elapsed.subsec_millis();
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, millis)
    }
}

fn progress_bar(len: u64) -> ProgressBar {
    let progress_bar = ProgressBar::new(len);
    match ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta} @ {per_sec}) {msg}")
    {
        Ok(style) => progress_bar.set_style(style.progress_chars("=> ")),
        Err(e) => warn!("Invalid progress bar template: {}", e),
    }
    progress_bar
}

fn open_sink(output: &Path) -> Result<DirectorySink> {
    let sink = DirectorySink::new(output)
        .with_context(|| format!("Failed to create output directory: {}", output.display()))?;
    info!("Output directory: {}", output.display());
    Ok(sink)
}

fn merge_step(config: &Config, input: &Path, sink: &DirectorySink, summary: &mut RunSummary) -> Result<Vec<DeliveryRecord>> {
    let source = DirectoryReports::new(input, &config.delivery.file_patterns, &config.io);
    let progress_bar = progress_bar(0);
    progress_bar.set_message("Parsing delivery reports...");

    let (outcome, output) = merge_to_sink(&source, config, sink, &progress_bar)
        .with_context(|| format!("Failed to merge delivery reports from {}", input.display()))?;
    progress_bar.finish_with_message(format!(
        "Merge finished. {} files OK, {} skipped.",
        outcome.processed.len(),
        outcome.skipped.len()
    ));
    let malformed = outcome.malformed_rows();
    if malformed > 0 {
        warn!("Dropped {} malformed delivery rows.", malformed);
    }
    if outcome.status() == MergeStatus::NoData {
        warn!("No valid delivery rows; {} holds only a header.", output.name);
    }

    summary.record_merge(&outcome);
    summary.record_output(output);
    Ok(outcome.records)
}

fn reconcile_step(
    config: &Config,
    records: &[DeliveryRecord],
    metadata: &Path,
    sink: &DirectorySink,
    summary: &mut RunSummary,
) -> Result<()> {
    let metadata_records = MetadataFile::new(metadata, &config.metadata, &config.io)
        .load()
        .with_context(|| format!("Failed to load creative metadata from {}", metadata.display()))?;

    let name = reconciled_file_name(&config.output, Local::now().naive_local());
    let progress_bar = progress_bar(records.len() as u64);
    progress_bar.set_message("Matching placements...");

    let result = reconcile_to_sink(records, &metadata_records, sink, &name, &config.io, &progress_bar)
        .with_context(|| format!("Failed to write reconciled report {}", sink.path_of(&name).display()))?;
    progress_bar.finish_with_message(format!("Reconciliation finished. {} rows written.", result.output.rows));
    if result.status == ReconcileStatus::NoMetadata {
        warn!("No metadata records; {} holds only a header.", name);
    }

    summary.record_reconcile(result);
    Ok(())
}

fn load_merged(config: &Config, delivery: &Path, summary: &mut RunSummary) -> Result<Vec<DeliveryRecord>> {
    let label = delivery.display().to_string();
    let text = with_retry(config.io.read_attempts, config.io.retry_delay(), &label, || read_text(delivery))
        .with_context(|| format!("Failed to read merged delivery report: {}", label))?;
    let (records, dropped) = read_merged(text.as_bytes())
        .with_context(|| format!("Failed to parse merged delivery report: {}", label))?;
    info!("Loaded {} merged delivery rows from {}", records.len(), label);

    summary.files_found = 1;
    summary.files_processed = vec![label];
    summary.record_dropped(&dropped);
    Ok(records)
}

fn execute(cli: &Cli, config: &Config, summary: &mut RunSummary) -> Result<()> {
    match &cli.command {
        Command::Merge { input, output } => {
            let sink = open_sink(output)?;
            merge_step(config, input, &sink, summary)?;
        }
        Command::Reconcile { delivery, metadata, output } => {
            let records = load_merged(config, delivery, summary)?;
            let sink = open_sink(output)?;
            reconcile_step(config, &records, metadata, &sink, summary)?;
        }
        Command::Run { input, metadata, output } => {
            let sink = open_sink(output)?;
            let records = merge_step(config, input, &sink, summary)?;
            reconcile_step(config, &records, metadata, &sink, summary)?;
        }
        Command::Consolidate { input, output } => {
            let tables = RawTables::load(input)
                .with_context(|| format!("Failed to read raw table dumps from {}", input.display()))?;
            let sink = open_sink(output)?;
            match consolidate_to_sink(&tables, &config.metadata, &sink, Local::now().naive_local())? {
                Some(output) => summary.record_output(output),
                None => warn!("Consolidation produced no data."),
            }
        }
    }
    Ok(())
}

fn log_final_summary(summary: &RunSummary, elapsed: Duration) {
    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Run ID: {}", summary.run_id);
    info!("Total execution time: {}", format_elapsed(elapsed));
    if summary.files_found > 0 {
        info!("Total input files found: {}", summary.files_found);
        info!("Files processed successfully: {}", summary.files_processed.len());
    }
    if !summary.files_skipped.is_empty() {
        warn!("Files skipped: {}", summary.files_skipped.len());
        for skipped in summary.files_skipped.iter().take(10) {
            warn!("  - {}: {}", skipped.name, skipped.reason);
        }
        if summary.files_skipped.len() > 10 {
            warn!("  ... (and {} more)", summary.files_skipped.len() - 10);
        }
    }
    for (reason, count) in &summary.rows_dropped {
        info!("Rows skipped ({}): {}", reason, count);
    }
    if summary.duplicates_removed > 0 {
        info!("Duplicate delivery rows removed: {}", summary.duplicates_removed);
    }
    if let Some(reconcile) = &summary.reconcile {
        info!(
            "Placements matched: {} rows, not found: {} rows, duplicates dropped: {}",
            reconcile.matched_rows, reconcile.unmatched_rows, reconcile.duplicates_dropped
        );
    }
    if !summary.outputs.is_empty() {
        info!("Rows written per output:");
        for output in &summary.outputs {
            info!("  - {}: {} (sha256 {})", output.name, output.rows, output.sha256);
        }
    }
    info!("-------------------------------------------------------");
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", cli.log_level);
            LevelFilter::Info
        }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    info!("Starting Placement Reconciler ({})", cli.command.name());

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(threads) = cli.threads {
        config.io.threads = threads;
    }
    if let Some(batch_size) = cli.batch_size {
        config.io.batch_size = batch_size;
    }
    config.validate().context("Invalid configuration after applying command-line overrides")?;

    let num_threads = config.io.effective_threads();
    info!("Using {} threads.", num_threads);
    if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
        error!("Failed to build global thread pool: {}. Proceeding with default.", e);
    }

    let mut summary = RunSummary::new(cli.command.name());
    let result = execute(&cli, &config, &mut summary);

    log_final_summary(&summary, start_time.elapsed());
    if let Some(path) = &cli.summary {
        if let Err(e) = summary.write(path) {
            error!("Failed to write run summary to {}: {}", path.display(), e);
        }
    }

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
