use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::NaiveDate;
use dashmap::DashMap;
use indicatif::ProgressBar;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::DeliveryConfig;
use crate::error::{FileRejection, RowDrop};
use crate::parse::{locate_header, split_fields, HeaderMap};

/// One delivery report as handed over by whatever fetched it.
#[derive(Debug, Clone)]
pub struct RawReport {
    pub name: String,
    pub content: String,
}

impl RawReport {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryRecord {
    pub placement_id: String,
    pub date: NaiveDate,
    pub impressions: u64,
    pub clicks: Option<u64>,
    pub video_completions: Option<u64>,
}

/// A record still tagged with the report it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcedRecord {
    pub source_file: String,
    pub record: DeliveryRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub name: String,
    pub reason: FileRejection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Merged,
    NoData,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub records: Vec<DeliveryRecord>,
    pub processed: Vec<String>,
    pub skipped: Vec<SkippedFile>,
    pub rows_dropped: BTreeMap<RowDrop, usize>,
    pub duplicates_removed: usize,
}

impl MergeOutcome {
    pub fn status(&self) -> MergeStatus {
        if self.records.is_empty() {
            MergeStatus::NoData
        } else {
            MergeStatus::Merged
        }
    }

    pub fn malformed_rows(&self) -> usize {
        self.rows_dropped
            .iter()
            .filter(|(reason, _)| reason.is_malformed())
            .map(|(_, count)| count)
            .sum()
    }
}

/// Row-drop tallies shared by the per-file workers.
#[derive(Debug, Default)]
pub struct DropCounters {
    counts: DashMap<RowDrop, AtomicUsize>,
}

impl DropCounters {
    pub fn record(&self, reason: RowDrop) {
        self.counts
            .entry(reason)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BTreeMap<RowDrop, usize> {
        self.counts
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

struct Columns {
    date: usize,
    placement_id: usize,
    impressions: usize,
    clicks: Option<usize>,
    video_completions: Option<usize>,
}

impl Columns {
    fn resolve(header: &HeaderMap, config: &DeliveryConfig) -> Result<Self, FileRejection> {
        let missing = header.missing(&config.required_columns());
        match (
            header.index(&config.date_column),
            header.index(&config.placement_id_column),
            header.index(&config.impressions_column),
        ) {
            (Some(date), Some(placement_id), Some(impressions)) => Ok(Self {
                date,
                placement_id,
                impressions,
                clicks: header.index(&config.clicks_column),
                video_completions: header.index(&config.video_completions_column),
            }),
            _ => Err(FileRejection::MissingColumns {
                missing: missing.into_iter().map(str::to_string).collect(),
            }),
        }
    }
}

fn required_cell(fields: &[String], idx: usize) -> Result<&str, RowDrop> {
    fields
        .get(idx)
        .map(String::as_str)
        .filter(|cell| !cell.is_empty())
        .ok_or(RowDrop::MissingCell)
}

fn optional_count(fields: &[String], idx: Option<usize>) -> Result<Option<u64>, RowDrop> {
    match idx.and_then(|i| fields.get(i)).filter(|cell| !cell.is_empty()) {
        Some(cell) => cell.parse::<u64>().map(Some).map_err(|_| RowDrop::BadCount),
        None => Ok(None),
    }
}

fn build_record(fields: &[String], columns: &Columns, config: &DeliveryConfig) -> Result<DeliveryRecord, RowDrop> {
    if fields.iter().all(|f| f.is_empty()) {
        return Err(RowDrop::Empty);
    }
    if fields
        .first()
        .is_some_and(|first| first.starts_with(config.grand_total_prefix.as_str()))
    {
        return Err(RowDrop::GrandTotal);
    }

    let date = NaiveDate::parse_from_str(required_cell(fields, columns.date)?, &config.date_format)
        .map_err(|_| RowDrop::BadDate)?;
    let placement_id = required_cell(fields, columns.placement_id)?.to_string();
    let impressions = required_cell(fields, columns.impressions)?
        .parse::<u64>()
        .map_err(|_| RowDrop::BadImpressions)?;

    Ok(DeliveryRecord {
        placement_id,
        date,
        impressions,
        clicks: optional_count(fields, columns.clicks)?,
        video_completions: optional_count(fields, columns.video_completions)?,
    })
}

/// Parses one delivery report. A file-level problem rejects the whole file;
/// bad rows are counted in `drops` and skipped.
pub fn parse_report(
    report: &RawReport,
    config: &DeliveryConfig,
    drops: &DropCounters,
) -> Result<Vec<SourcedRecord>, FileRejection> {
    let content = report.content.strip_prefix('\u{feff}').unwrap_or(&report.content);
    let lines: Vec<&str> = content.lines().collect();

    let header = locate_header(&lines, config)?;
    let columns = Columns::resolve(&header, config)?;

    let mut records = Vec::new();
    for line in lines.iter().skip(header.data_start()) {
        let fields = split_fields(line, config.delimiter);
        match build_record(&fields, &columns, config) {
            Ok(record) => records.push(SourcedRecord {
                source_file: report.name.clone(),
                record,
            }),
            Err(reason) => drops.record(reason),
        }
    }
    debug!("Parsed {}: {} records", report.name, records.len());
    Ok(records)
}

/// Drops repeats of the full tuple including the source file.
pub fn dedup_within_sources(records: Vec<SourcedRecord>) -> Vec<SourcedRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert((r.source_file.clone(), r.record.clone())))
        .collect()
}

/// Drops repeats of the delivery tuple regardless of which file they came from.
pub fn dedup_records(records: Vec<DeliveryRecord>) -> Vec<DeliveryRecord> {
    let mut seen = HashSet::new();
    records.into_iter().filter(|r| seen.insert(r.clone())).collect()
}

/// Parses every report (in parallel), then runs both dedup passes over the
/// combined set in input order.
pub fn merge_reports(reports: &[RawReport], config: &DeliveryConfig, progress: &ProgressBar) -> MergeOutcome {
    let drops = DropCounters::default();

    let results: Vec<(String, Result<Vec<SourcedRecord>, FileRejection>)> = reports
        .par_iter()
        .map(|report| {
            let result = parse_report(report, config, &drops);
            match &result {
                Ok(records) => progress.set_message(format!("OK: {} ({} rows)", report.name, records.len())),
                Err(_) => progress.set_message(format!("SKIP: {}", report.name)),
            }
            progress.inc(1);
            (report.name.clone(), result)
        })
        .collect();

    let mut processed = Vec::new();
    let mut skipped = Vec::new();
    let mut combined = Vec::new();
    for (name, result) in results {
        match result {
            Ok(records) => {
                combined.extend(records);
                processed.push(name);
            }
            Err(reason) => {
                warn!("Skipping {}: {}", name, reason);
                skipped.push(SkippedFile { name, reason });
            }
        }
    }

    let parsed_rows = combined.len();
    let with_source = dedup_within_sources(combined);
    let records = dedup_records(with_source.into_iter().map(|r| r.record).collect());
    let duplicates_removed = parsed_rows - records.len();

    let rows_dropped = drops.snapshot();
    if records.is_empty() {
        warn!("No valid data found across {} processed files.", processed.len());
    } else {
        info!(
            "Merged {} rows from {} files ({} duplicates removed).",
            records.len(),
            processed.len(),
            duplicates_removed
        );
    }
    for (reason, count) in &rows_dropped {
        info!("  Rows skipped ({}): {}", reason, count);
    }

    MergeOutcome {
        records,
        processed,
        skipped,
        rows_dropped,
        duplicates_removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\u{feff}Campaign Delivery\nDate Range: 2024-03-01 - 2024-03-02\nReport Fields\nDate,Placement ID,Impressions,Clicks,Video Completions\n\n\n\n\n\n2024-03-01,555,100,10,5\n2024-03-02,\"0042\",200,,\n2024-03-02,777,oops,1,1\n,,,,\nGrand Total:,,300,10,5\n";

    /// Header row followed by blank lines filling out the 6-line window.
    fn report(header: &str, rows: &str) -> String {
        format!("Report Fields\n{}\n\n\n\n\n\n{}", header, rows)
    }

    fn parse(text: &str) -> (Result<Vec<SourcedRecord>, FileRejection>, BTreeMap<RowDrop, usize>) {
        let drops = DropCounters::default();
        let result = parse_report(&RawReport::new("a.csv", text), &DeliveryConfig::default(), &drops);
        (result, drops.snapshot())
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parses_rows_and_counts_drops() {
        let (result, drops) = parse(REPORT);
        let records = result.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].record,
            DeliveryRecord {
                placement_id: "555".to_string(),
                date: date("2024-03-01"),
                impressions: 100,
                clicks: Some(10),
                video_completions: Some(5),
            }
        );
        assert_eq!(records[1].record.placement_id, "0042");
        assert_eq!(records[1].record.clicks, None);
        assert_eq!(records[1].record.video_completions, None);
        assert_eq!(drops.get(&RowDrop::BadImpressions), Some(&1));
        assert_eq!(drops.get(&RowDrop::Empty), Some(&1));
        assert_eq!(drops.get(&RowDrop::GrandTotal), Some(&1));
    }

    #[test]
    fn grand_total_row_is_excluded_whatever_it_holds() {
        let text = report("Placement ID,Date,Impressions", "Grand Total: 42,2024-03-01,9\n1,2024-03-01,9\n");
        let (result, drops) = parse(&text);
        let records = result.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.placement_id, "1");
        assert_eq!(drops.get(&RowDrop::GrandTotal), Some(&1));
    }

    #[test]
    fn rows_inside_header_window_are_never_data() {
        let text = "Report Fields\nDate,Placement ID,Impressions\n\
2024-03-01,1,1\n2024-03-01,2,1\n2024-03-01,3,1\n2024-03-01,4,1\n2024-03-01,5,1\n2024-03-01,6,1\n";
        let (result, drops) = parse(text);
        let ids: Vec<String> = result
            .unwrap()
            .into_iter()
            .map(|r| r.record.placement_id)
            .collect();
        assert_eq!(ids, vec!["6"]);
        assert!(drops.is_empty());
    }

    #[test]
    fn missing_required_column_rejects_file() {
        let text = "Report Fields\nDate,Impressions,Clicks\n2024-03-01,1,1\n";
        let (result, _) = parse(text);
        assert_eq!(
            result.unwrap_err(),
            FileRejection::MissingColumns {
                missing: vec!["placement id".to_string()]
            }
        );
    }

    #[test]
    fn short_and_badly_dated_rows_are_dropped_individually() {
        let text = report(
            "Date,Placement ID,Impressions,Clicks",
            "03/01/2024,1,5,1\n2024-03-01,2\n2024-03-01,3,5,x\n2024-03-01,4,5,2\n",
        );
        let (result, drops) = parse(&text);
        let records = result.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.placement_id, "4");
        assert_eq!(drops.get(&RowDrop::BadDate), Some(&1));
        assert_eq!(drops.get(&RowDrop::MissingCell), Some(&1));
        assert_eq!(drops.get(&RowDrop::BadCount), Some(&1));
    }

    #[test]
    fn overlapping_exports_collapse_to_one_row() {
        let a = RawReport::new("a.csv", REPORT);
        let b = RawReport::new("b.csv", REPORT);
        let broken = RawReport::new("c.csv", "no marker here\n");
        let outcome = merge_reports(&[a, b, broken], &DeliveryConfig::default(), &ProgressBar::hidden());
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.processed, vec!["a.csv", "b.csv"]);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].name, "c.csv");
        assert_eq!(outcome.duplicates_removed, 2);
        assert_eq!(outcome.status(), MergeStatus::Merged);
        assert_eq!(outcome.rows_dropped.get(&RowDrop::BadImpressions), Some(&2));
        assert_eq!(outcome.malformed_rows(), 2);
    }

    #[test]
    fn usable_files_without_rows_report_no_data() {
        let text = report("Date,Placement ID,Impressions", "Grand Total:,,0\n");
        let outcome = merge_reports(&[RawReport::new("a.csv", text)], &DeliveryConfig::default(), &ProgressBar::hidden());
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.status(), MergeStatus::NoData);
    }

    #[test]
    fn dedup_passes_keep_first_occurrence() {
        let record = DeliveryRecord {
            placement_id: "1".to_string(),
            date: date("2024-03-01"),
            impressions: 1,
            clicks: None,
            video_completions: None,
        };
        let sourced = vec![
            SourcedRecord { source_file: "a".into(), record: record.clone() },
            SourcedRecord { source_file: "a".into(), record: record.clone() },
            SourcedRecord { source_file: "b".into(), record: record.clone() },
        ];
        let first = dedup_within_sources(sourced);
        assert_eq!(first.len(), 2);
        let second = dedup_records(first.into_iter().map(|r| r.record).collect());
        assert_eq!(second, vec![record]);
    }
}
