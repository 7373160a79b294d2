//! Entry points that wire the stages together. Each takes its inputs,
//! configuration and sink explicitly; nothing here reads process state.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;

use chrono::{DateTime, NaiveDateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{Config, IoConfig, MetadataConfig, OutputConfig};
use crate::consolidate::{consolidate, persist_consolidated, RawTables};
use crate::error::{PipelineError, Result, RowDrop};
use crate::finalize::{FinalizeStats, ReconciledCsvWriter};
use crate::merge::{merge_reports, DeliveryRecord, MergeOutcome, MergeStatus, SkippedFile};
use crate::metadata::CreativeMetadataRecord;
use crate::output::{persist_merged, DigestWriter, OutputFile, ReportSink};
use crate::reconcile::{CreativeIndex, ReconciledRecord};
use crate::source::DeliverySource;

type SinkWriter = DigestWriter<Box<dyn Write + Send>>;

/// Pulls every report from `source` and merges them. Fails only when no
/// report at all could be used.
pub fn merge_delivery(source: &dyn DeliverySource, config: &Config, progress: &ProgressBar) -> Result<MergeOutcome> {
    let batch = source.reports()?;
    progress.set_length(batch.reports.len() as u64);

    let mut outcome = merge_reports(&batch.reports, &config.delivery, progress);
    outcome.skipped.extend(batch.unreadable);
    if outcome.processed.is_empty() {
        error!("All {} delivery reports were skipped.", batch.found);
        return Err(PipelineError::NoUsableReports { found: batch.found });
    }
    Ok(outcome)
}

/// Merges and persists the merged dataset under `output.merged_file_name`.
/// A merge with no surviving rows still writes the header.
pub fn merge_to_sink(
    source: &dyn DeliverySource,
    config: &Config,
    sink: &dyn ReportSink,
    progress: &ProgressBar,
) -> Result<(MergeOutcome, OutputFile)> {
    let outcome = merge_delivery(source, config, progress)?;
    let output = persist_merged(&outcome.records, sink, &config.output.merged_file_name)?;
    info!("Wrote {} merged rows to {}", output.rows, output.name);
    Ok((outcome, output))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    Reconciled,
    NoMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub status: ReconcileStatus,
    pub delivery_rows: usize,
    pub metadata_records: usize,
    pub matched_rows: usize,
    pub unmatched_rows: usize,
    pub duplicates_dropped: usize,
    pub output: OutputFile,
}

/// Joins `records` against `metadata` in `io.batch_size` chunks and streams
/// each chunk to a writer thread that dedups and persists the final rows.
pub fn reconcile_to_sink(
    records: &[DeliveryRecord],
    metadata: &[CreativeMetadataRecord],
    sink: &dyn ReportSink,
    name: &str,
    io: &IoConfig,
    progress: &ProgressBar,
) -> Result<ReconcileSummary> {
    let index = CreativeIndex::new(metadata);
    let status = if index.is_empty() {
        warn!("No creative metadata records available; writing header-only {}", name);
        ReconcileStatus::NoMetadata
    } else {
        ReconcileStatus::Reconciled
    };

    let writer = ReconciledCsvWriter::new(DigestWriter::new(sink.open(name)?))?;
    let channel_capacity = (io.effective_threads() * 2).max(16);
    let (batch_sender, batch_receiver): (Sender<Vec<ReconciledRecord>>, Receiver<Vec<ReconciledRecord>>) =
        bounded(channel_capacity);
    debug!("Using writer channel with capacity: {}", channel_capacity);

    let writer_thread = thread::spawn(move || -> Result<(SinkWriter, FinalizeStats)> {
        let mut writer = writer;
        let mut batches = 0;
        for batch in batch_receiver {
            let written = writer.write_batch(batch)?;
            batches += 1;
            debug!("Writer thread processed batch {}, {} new rows", batches, written);
        }
        debug!("Writer thread finished receiving. Processed {} batches.", batches);
        writer.finish()
    });

    let mut matched_rows = 0;
    let mut unmatched_rows = 0;
    if status == ReconcileStatus::Reconciled {
        progress.set_length(records.len() as u64);
        for chunk in records.chunks(io.batch_size.max(1)) {
            let batch = index.reconcile(chunk);
            let misses = batch.iter().filter(|r| r.is_unmatched()).count();
            unmatched_rows += misses;
            matched_rows += batch.len() - misses;
            progress.inc(chunk.len() as u64);
            if batch_sender.send(batch).is_err() {
                error!("Writer channel closed unexpectedly; stopping reconciliation.");
                break;
            }
        }
    }
    drop(batch_sender);

    let (digest_writer, stats) = writer_thread
        .join()
        .map_err(|e| PipelineError::Writer(format!("writer thread panicked: {:?}", e)))??;
    let (_, sha256) = digest_writer.finish()?;

    info!(
        "Reconciled {} delivery rows against {} metadata records: {} matched, {} not found, {} duplicates dropped.",
        records.len(),
        index.len(),
        matched_rows,
        unmatched_rows,
        stats.duplicates_dropped
    );
    Ok(ReconcileSummary {
        status,
        delivery_rows: records.len(),
        metadata_records: index.len(),
        matched_rows,
        unmatched_rows,
        duplicates_dropped: stats.duplicates_dropped,
        output: OutputFile {
            name: name.to_string(),
            rows: stats.rows_written,
            sha256,
        },
    })
}

/// `Third_Party_Data_20240301_120000.csv`
pub fn reconciled_file_name(config: &OutputConfig, now: NaiveDateTime) -> String {
    format!(
        "{}{}.csv",
        config.reconciled_file_prefix,
        now.format(&config.reconciled_timestamp_format)
    )
}

/// `beeswax_filtered_report_03012024120000.csv`
pub fn consolidated_file_name(config: &MetadataConfig, now: NaiveDateTime) -> String {
    format!(
        "{}{}.csv",
        config.report_prefix,
        now.format(&config.report_timestamp_format)
    )
}

/// Builds the flat metadata report from the raw dumps. Returns `None`, and
/// writes nothing, when no creative resolves.
pub fn consolidate_to_sink(
    tables: &RawTables,
    config: &MetadataConfig,
    sink: &dyn ReportSink,
    now: NaiveDateTime,
) -> Result<Option<OutputFile>> {
    let rows = consolidate(tables);
    if rows.is_empty() {
        warn!(
            "No creatives resolved from {} campaigns; nothing written.",
            tables.campaigns.len()
        );
        return Ok(None);
    }
    let name = consolidated_file_name(config, now);
    let output = persist_consolidated(&rows, sink, &name)?;
    info!("Wrote {} metadata rows to {}", output.rows, output.name);
    Ok(Some(output))
}

/// Machine-readable record of one command invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub files_found: usize,
    pub files_processed: Vec<String>,
    pub files_skipped: Vec<SkippedFile>,
    pub rows_dropped: BTreeMap<RowDrop, usize>,
    pub duplicates_removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_status: Option<MergeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<ReconcileSummary>,
    pub outputs: Vec<OutputFile>,
}

impl RunSummary {
    pub fn new(command: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            command: command.to_string(),
            started_at: Utc::now(),
            files_found: 0,
            files_processed: Vec::new(),
            files_skipped: Vec::new(),
            rows_dropped: BTreeMap::new(),
            duplicates_removed: 0,
            merge_status: None,
            reconcile: None,
            outputs: Vec::new(),
        }
    }

    pub fn record_merge(&mut self, outcome: &MergeOutcome) {
        self.files_found = outcome.processed.len() + outcome.skipped.len();
        self.files_processed = outcome.processed.clone();
        self.files_skipped = outcome.skipped.clone();
        for (reason, count) in &outcome.rows_dropped {
            *self.rows_dropped.entry(*reason).or_insert(0) += count;
        }
        self.duplicates_removed = outcome.duplicates_removed;
        self.merge_status = Some(outcome.status());
    }

    pub fn record_dropped(&mut self, dropped: &BTreeMap<RowDrop, usize>) {
        for (reason, count) in dropped {
            *self.rows_dropped.entry(*reason).or_insert(0) += count;
        }
    }

    pub fn record_reconcile(&mut self, summary: ReconcileSummary) {
        self.outputs.push(summary.output.clone());
        self.reconcile = Some(summary);
    }

    pub fn record_output(&mut self, output: OutputFile) {
        self.outputs.push(output);
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self).map_err(std::io::Error::from)?;
        writer.flush()?;
        info!("Run summary written to {}", path.display());
        Ok(())
    }
}
