//! Creative metadata: the flat report whose free-text columns embed the
//! placement ids we join on.

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use csv::ReaderBuilder;
use glob::glob;
use log::{info, warn};

use crate::config::MetadataConfig;
use crate::error::{PipelineError, Result};

pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreativeMetadataRecord {
    pub creative_name: String,
    pub campaign_id: String,
    search_text: String,
}

impl CreativeMetadataRecord {
    /// `search_fields` are joined with single spaces, once, here.
    pub fn new<S: AsRef<str>>(
        creative_name: impl Into<String>,
        campaign_id: impl Into<String>,
        search_fields: &[S],
    ) -> Self {
        let search_text = search_fields
            .iter()
            .map(|field| AsRef::<str>::as_ref(field))
            .collect::<Vec<&str>>()
            .join(" ");
        Self {
            creative_name: creative_name.into(),
            campaign_id: campaign_id.into(),
            search_text,
        }
    }

    pub fn search_text(&self) -> &str {
        &self.search_text
    }

    /// Exact, case-sensitive substring test with no word boundaries.
    pub fn mentions(&self, placement_id: &str) -> bool {
        self.search_text.contains(placement_id)
    }
}

/// Reads the flat metadata report. Missing name/campaign cells become
/// `"Unknown"`; missing search cells become empty strings.
pub fn read_metadata<R: Read>(
    reader: R,
    source_name: &str,
    config: &MetadataConfig,
) -> Result<Vec<CreativeMetadataRecord>> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = rdr.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h.trim() == name);

    let search_indices: Vec<(String, usize)> = config
        .search_columns
        .iter()
        .filter_map(|col| position(col).map(|idx| (col.clone(), idx)))
        .collect();
    if search_indices.is_empty() {
        return Err(PipelineError::NoSearchColumns {
            source_name: source_name.to_string(),
            columns: config.search_columns.clone(),
        });
    }
    info!(
        "Using columns for search: {}",
        search_indices
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let name_idx = position(&config.creative_name_column);
    let campaign_idx = position(&config.campaign_id_column);
    if name_idx.is_none() {
        warn!("{}: column '{}' not found, creative names default to {}", source_name, config.creative_name_column, UNKNOWN);
    }
    if campaign_idx.is_none() {
        warn!("{}: column '{}' not found, campaign ids default to {}", source_name, config.campaign_id_column, UNKNOWN);
    }

    let mut records = Vec::new();
    for result in rdr.records() {
        let row = result?;
        let cell_or_unknown = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .filter(|v| !v.is_empty())
                .unwrap_or(UNKNOWN)
                .to_string()
        };
        let search_fields: Vec<&str> = search_indices
            .iter()
            .map(|(_, idx)| row.get(*idx).unwrap_or(""))
            .collect();
        records.push(CreativeMetadataRecord::new(
            cell_or_unknown(name_idx),
            cell_or_unknown(campaign_idx),
            &search_fields,
        ));
    }
    info!("Loaded {} creative metadata records from {}", records.len(), source_name);
    Ok(records)
}

/// Picks the newest `{prefix}{timestamp}.csv` in `dir`, ordering by the
/// timestamp embedded in the name.
pub fn find_latest_report(dir: &Path, config: &MetadataConfig) -> Result<PathBuf> {
    let pattern = dir.join(format!("{}*.csv", config.report_prefix));
    let pattern_str = pattern.to_string_lossy();
    info!("Searching for metadata reports matching: {}", pattern_str);

    let mut latest: Option<(NaiveDateTime, PathBuf)> = None;
    for path in glob(&pattern_str)?.filter_map(std::result::Result::ok) {
        let Some(stamp) = report_timestamp(&path, config) else {
            warn!("Ignoring {}: no '{}' timestamp in name", path.display(), config.report_timestamp_format);
            continue;
        };
        if latest.as_ref().map_or(true, |(best, _)| stamp > *best) {
            latest = Some((stamp, path));
        }
    }

    latest.map(|(_, path)| path).ok_or_else(|| PipelineError::NoMetadataReport {
        dir: dir.to_path_buf(),
        prefix: config.report_prefix.clone(),
    })
}

fn report_timestamp(path: &Path, config: &MetadataConfig) -> Option<NaiveDateTime> {
    let stem = path.file_stem()?.to_str()?;
    let stamp = stem.strip_prefix(config.report_prefix.as_str())?;
    NaiveDateTime::parse_from_str(stamp, &config.report_timestamp_format).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const REPORT: &str = "campaign_campaign_id,creative_creative_name,creative_pixels,creative_scripts\n\
CAMP1,MO_BA_test,https://ad.example/pix?pid=555,\n\
CAMP2,,,<script src=x?p=777></script>\n\
,DE_VI_spot,img 9,js 10\n";

    #[test]
    fn search_text_joins_present_columns() {
        let records = read_metadata(REPORT.as_bytes(), "mem", &MetadataConfig::default()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].search_text(), "https://ad.example/pix?pid=555 ");
        assert_eq!(records[1].creative_name, UNKNOWN);
        assert_eq!(records[1].search_text(), " <script src=x?p=777></script>");
        assert_eq!(records[2].campaign_id, UNKNOWN);
        assert_eq!(records[2].search_text(), "img 9 js 10");
        assert!(records[0].mentions("555"));
        assert!(records[0].mentions("55"));
        assert!(!records[0].mentions("PID=555"));
    }

    #[test]
    fn no_search_columns_is_an_error() {
        let text = "campaign_campaign_id,creative_creative_name\nC,N\n";
        let err = read_metadata(text.as_bytes(), "mem", &MetadataConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::NoSearchColumns { .. }));
    }

    #[test]
    fn latest_report_follows_embedded_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "beeswax_filtered_report_12312023235959.csv",
            "beeswax_filtered_report_01152024080000.csv",
            "beeswax_filtered_report_garbage.csv",
            "other_01162024080000.csv",
        ] {
            fs::write(dir.path().join(name), "x\n").unwrap();
        }
        let latest = find_latest_report(dir.path(), &MetadataConfig::default()).unwrap();
        assert_eq!(
            latest.file_name().unwrap().to_str().unwrap(),
            "beeswax_filtered_report_01152024080000.csv"
        );
    }

    #[test]
    fn empty_directory_has_no_report() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_latest_report(dir.path(), &MetadataConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::NoMetadataReport { .. }));
    }
}
