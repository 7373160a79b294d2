use std::collections::HashSet;
use std::io::Write;

use chrono::NaiveDate;
use csv::Writer;

use crate::error::Result;
use crate::reconcile::ReconciledRecord;

pub const RECONCILED_HEADER: [&str; 6] = [
    "Placement ID",
    "Bees_Name",
    "Date",
    "Impressions",
    "Clicks",
    "Video Completions",
];

const LONG_DATE: &str = "%B %-d, %Y";

/// `March 1, 2024`.
pub fn format_long_date(date: NaiveDate) -> String {
    date.format(LONG_DATE).to_string()
}

/// The exact tuple written to the reconciled file; equality on it is the
/// final dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputRow {
    pub placement_id: String,
    pub bees_name: String,
    pub date: String,
    pub impressions: u64,
    pub clicks: Option<u64>,
    pub video_completions: Option<u64>,
}

impl From<ReconciledRecord> for OutputRow {
    fn from(record: ReconciledRecord) -> Self {
        Self {
            placement_id: record.placement_id,
            bees_name: record.bees_name,
            date: format_long_date(record.date),
            impressions: record.impressions,
            clicks: record.clicks,
            video_completions: record.video_completions,
        }
    }
}

impl OutputRow {
    fn to_fields(&self) -> [String; 6] {
        let count = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_default();
        [
            self.placement_id.clone(),
            self.bees_name.clone(),
            self.date.clone(),
            self.impressions.to_string(),
            count(self.clicks),
            count(self.video_completions),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeStats {
    pub rows_written: usize,
    pub duplicates_dropped: usize,
}

/// Writes reconciled batches as they arrive, skipping any row already written.
pub struct ReconciledCsvWriter<W: Write> {
    writer: Writer<W>,
    seen: HashSet<OutputRow>,
    stats: FinalizeStats,
}

impl<W: Write> ReconciledCsvWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = Writer::from_writer(inner);
        writer.write_record(RECONCILED_HEADER)?;
        Ok(Self {
            writer,
            seen: HashSet::new(),
            stats: FinalizeStats::default(),
        })
    }

    pub fn write_batch(&mut self, batch: Vec<ReconciledRecord>) -> Result<usize> {
        let mut written = 0;
        for record in batch {
            let row = OutputRow::from(record);
            if self.seen.contains(&row) {
                self.stats.duplicates_dropped += 1;
                continue;
            }
            self.writer.write_record(row.to_fields())?;
            self.seen.insert(row);
            written += 1;
        }
        self.stats.rows_written += written;
        Ok(written)
    }

    /// Flushes and hands back the underlying writer.
    pub fn finish(self) -> Result<(W, FinalizeStats)> {
        let stats = self.stats;
        let inner = self
            .writer
            .into_inner()
            .map_err(|e| std::io::Error::new(e.error().kind(), e.error().to_string()))?;
        Ok((inner, stats))
    }
}
