use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Writer};
use log::{info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, RowDrop};
use crate::merge::DeliveryRecord;

pub const MERGED_HEADER: [&str; 5] = ["Date", "Placement ID", "Impressions", "Clicks", "Video Completions"];

/// What was persisted for one output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    pub name: String,
    pub rows: usize,
    pub sha256: String,
}

/// Pass-through writer that hashes every byte written.
pub struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finish(mut self) -> io::Result<(W, String)> {
        self.inner.flush()?;
        Ok((self.inner, hex::encode(self.hasher.finalize())))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Destination for finished datasets.
pub trait ReportSink: Send + Sync {
    fn open(&self, name: &str) -> Result<Box<dyn Write + Send>>;
}

/// Writes each dataset as a file under one directory.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl ReportSink for DirectorySink {
    fn open(&self, name: &str) -> Result<Box<dyn Write + Send>> {
        let path = self.path_of(name);
        info!("Writing {}", path.display());
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }
}

fn count(v: Option<u64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_default()
}

/// Writes the merged delivery dataset (no provenance column).
pub fn write_merged<W: Write>(records: &[DeliveryRecord], inner: W) -> Result<(W, usize)> {
    let mut writer = Writer::from_writer(inner);
    writer.write_record(MERGED_HEADER)?;
    for record in records {
        writer.write_record([
            record.date.format("%Y-%m-%d").to_string(),
            record.placement_id.clone(),
            record.impressions.to_string(),
            count(record.clicks),
            count(record.video_completions),
        ])?;
    }
    let inner = writer
        .into_inner()
        .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string()))?;
    Ok((inner, records.len()))
}

/// Persists the merged dataset through `sink`, hashing as it goes.
pub fn persist_merged(records: &[DeliveryRecord], sink: &dyn ReportSink, name: &str) -> Result<OutputFile> {
    let (digest_writer, rows) = write_merged(records, DigestWriter::new(sink.open(name)?))?;
    let (_, sha256) = digest_writer.finish()?;
    Ok(OutputFile {
        name: name.to_string(),
        rows,
        sha256,
    })
}

/// Column positions of a merged report, resolved from its header row.
struct MergedColumns {
    date: Option<usize>,
    placement_id: Option<usize>,
    impressions: Option<usize>,
    clicks: Option<usize>,
    video_completions: Option<usize>,
}

impl MergedColumns {
    fn resolve(headers: &StringRecord) -> Self {
        let position = |name: &str| headers.iter().position(|h| h.trim() == name);
        let [date, placement_id, impressions, clicks, video_completions] = MERGED_HEADER;
        Self {
            date: position(date),
            placement_id: position(placement_id),
            impressions: position(impressions),
            clicks: position(clicks),
            video_completions: position(video_completions),
        }
    }

    fn record(&self, row: &StringRecord) -> std::result::Result<DeliveryRecord, RowDrop> {
        let cell = |idx: Option<usize>| idx.and_then(|i| row.get(i)).map(str::trim).filter(|s| !s.is_empty());
        let required = |idx: Option<usize>| cell(idx).ok_or(RowDrop::MissingCell);
        let optional = |idx: Option<usize>| -> std::result::Result<Option<u64>, RowDrop> {
            cell(idx)
                .map(|s| s.parse().map_err(|_| RowDrop::BadCount))
                .transpose()
        };

        if row.iter().all(|f| f.trim().is_empty()) {
            return Err(RowDrop::Empty);
        }
        Ok(DeliveryRecord {
            date: NaiveDate::parse_from_str(required(self.date)?, "%Y-%m-%d").map_err(|_| RowDrop::BadDate)?,
            placement_id: required(self.placement_id)?.to_string(),
            impressions: required(self.impressions)?
                .parse()
                .map_err(|_| RowDrop::BadImpressions)?,
            clicks: optional(self.clicks)?,
            video_completions: optional(self.video_completions)?,
        })
    }
}

/// Reads a merged delivery CSV back; rows that no longer parse, short rows
/// included, are counted and skipped.
pub fn read_merged<R: Read>(reader: R) -> Result<(Vec<DeliveryRecord>, BTreeMap<RowDrop, usize>)> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
    let columns = MergedColumns::resolve(rdr.headers()?);
    let mut records = Vec::new();
    let mut dropped: BTreeMap<RowDrop, usize> = BTreeMap::new();
    for row in rdr.records() {
        match columns.record(&row?) {
            Ok(record) => records.push(record),
            Err(reason) => *dropped.entry(reason).or_insert(0) += 1,
        }
    }
    for (reason, n) in &dropped {
        warn!("Merged report rows skipped ({}): {}", reason, n);
    }
    Ok((records, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: &str, clicks: Option<u64>) -> DeliveryRecord {
        DeliveryRecord {
            placement_id: pid.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            impressions: 100,
            clicks,
            video_completions: None,
        }
    }

    #[test]
    fn merged_file_layout() {
        let (bytes, rows) = write_merged(&[record("0042", Some(3)), record("555", None)], Vec::new()).unwrap();
        assert_eq!(rows, 2);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "Date,Placement ID,Impressions,Clicks,Video Completions\n\
2024-03-01,0042,100,3,\n\
2024-03-01,555,100,,\n"
        );
    }

    #[test]
    fn read_back_keeps_leading_zeros_and_counts_bad_rows() {
        let text = "Date,Placement ID,Impressions,Clicks,Video Completions\n\
2024-03-01,0042,100,3,\n\
March 1,1,1,,\n\
2024-03-01,7,x,,\n";
        let (records, dropped) = read_merged(text.as_bytes()).unwrap();
        assert_eq!(records, vec![record("0042", Some(3))]);
        assert_eq!(dropped.get(&RowDrop::BadDate), Some(&1));
        assert_eq!(dropped.get(&RowDrop::BadImpressions), Some(&1));
    }

    #[test]
    fn short_rows_are_dropped_not_fatal() {
        let text = "Date,Placement ID,Impressions,Clicks,Video Completions\n\
2024-03-01,1,5,,\n\
2024-03-01,2\n\
2024-03-01,3,7,,\n";
        let (records, dropped) = read_merged(text.as_bytes()).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.placement_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(dropped.get(&RowDrop::MissingCell), Some(&1));
    }

    #[test]
    fn digest_is_stable_for_identical_content() {
        let hash = |data: &[u8]| {
            let mut w = DigestWriter::new(Vec::new());
            w.write_all(data).unwrap();
            w.finish().unwrap().1
        };
        assert_eq!(hash(b"abc"), hash(b"abc"));
        assert_eq!(
            hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
