//! File-system producers of the two inputs. Anything that can hand over raw
//! report text or metadata records can stand in for these.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use glob::glob;
use log::{info, warn};

use crate::config::{IoConfig, MetadataConfig};
use crate::error::{FileRejection, PipelineError, Result};
use crate::merge::{RawReport, SkippedFile};
use crate::metadata::{find_latest_report, read_metadata, CreativeMetadataRecord};
use crate::retry::with_retry;

/// Delivery reports that were read, plus the ones that could not be.
#[derive(Debug, Default)]
pub struct ReportBatch {
    pub found: usize,
    pub reports: Vec<RawReport>,
    pub unreadable: Vec<SkippedFile>,
}

pub trait DeliverySource {
    fn reports(&self) -> Result<ReportBatch>;
}

pub trait MetadataSource {
    fn load(&self) -> Result<Vec<CreativeMetadataRecord>>;
}

/// Reads a file, gunzipping `.gz`, replacing invalid UTF-8 and dropping a
/// leading BOM.
pub fn read_text(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut bytes = Vec::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(file).read_to_end(&mut bytes)?;
    } else {
        let mut file = file;
        file.read_to_end(&mut bytes)?;
    }
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.strip_prefix('\u{feff}').unwrap_or(&text).to_string())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Every report in one directory matching the configured patterns.
pub struct DirectoryReports {
    dir: PathBuf,
    patterns: Vec<String>,
    io: IoConfig,
}

impl DirectoryReports {
    pub fn new(dir: impl Into<PathBuf>, patterns: &[String], io: &IoConfig) -> Self {
        Self {
            dir: dir.into(),
            patterns: patterns.to_vec(),
            io: io.clone(),
        }
    }

    pub fn find(&self) -> Result<Vec<PathBuf>> {
        let mut paths = BTreeSet::new();
        for pattern in &self.patterns {
            let full = self.dir.join(pattern);
            let full = full.to_string_lossy();
            info!("Searching for files matching pattern: {}", full);
            paths.extend(glob(&full)?.filter_map(std::result::Result::ok).filter(|p| p.is_file()));
        }
        Ok(paths.into_iter().collect())
    }
}

impl DeliverySource for DirectoryReports {
    fn reports(&self) -> Result<ReportBatch> {
        let paths = self.find()?;
        if paths.is_empty() {
            return Err(PipelineError::NoDeliveryFiles {
                dir: self.dir.clone(),
                patterns: self.patterns.join(", "),
            });
        }
        info!("Found {} delivery reports in {}", paths.len(), self.dir.display());

        let mut batch = ReportBatch {
            found: paths.len(),
            ..ReportBatch::default()
        };
        for path in paths {
            let name = display_name(&path);
            match with_retry(self.io.read_attempts, self.io.retry_delay(), &name, || read_text(&path)) {
                Ok(content) => batch.reports.push(RawReport::new(name, content)),
                Err(e) => {
                    warn!("Could not read {}: {}", path.display(), e);
                    batch.unreadable.push(SkippedFile {
                        name,
                        reason: FileRejection::Unreadable { reason: e.to_string() },
                    });
                }
            }
        }
        Ok(batch)
    }
}

/// A metadata report on disk. A directory means "the newest report in it".
pub struct MetadataFile {
    path: PathBuf,
    config: MetadataConfig,
    io: IoConfig,
}

impl MetadataFile {
    pub fn new(path: impl Into<PathBuf>, config: &MetadataConfig, io: &IoConfig) -> Self {
        Self {
            path: path.into(),
            config: config.clone(),
            io: io.clone(),
        }
    }

    pub fn resolve(&self) -> Result<PathBuf> {
        if self.path.is_dir() {
            let latest = find_latest_report(&self.path, &self.config)?;
            info!("Found latest metadata report: {}", latest.display());
            Ok(latest)
        } else {
            Ok(self.path.clone())
        }
    }
}

impl MetadataSource for MetadataFile {
    fn load(&self) -> Result<Vec<CreativeMetadataRecord>> {
        let path = self.resolve()?;
        let name = display_name(&path);
        let text = with_retry(self.io.read_attempts, self.io.retry_delay(), &name, || read_text(&path))?;
        read_metadata(text.as_bytes(), &name, &self.config)
    }
}

/// Reports already in memory.
impl DeliverySource for Vec<RawReport> {
    fn reports(&self) -> Result<ReportBatch> {
        Ok(ReportBatch {
            found: self.len(),
            reports: self.clone(),
            unreadable: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;

    #[test]
    fn reads_plain_and_gzip_reports_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.csv"), "\u{feff}plain").unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(b"zipped").unwrap();
        fs::write(dir.path().join("a.csv.gz"), gz.finish().unwrap()).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let io = IoConfig { retry_delay_ms: 0, ..IoConfig::default() };
        let source = DirectoryReports::new(dir.path(), &crate::config::DeliveryConfig::default().file_patterns, &io);
        let batch = source.reports().unwrap();
        assert_eq!(batch.found, 2);
        let names: Vec<&str> = batch.reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a.csv.gz", "b.csv"]);
        assert_eq!(batch.reports[0].content, "zipped");
        assert_eq!(batch.reports[1].content, "plain");
    }

    #[test]
    fn empty_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectoryReports::new(dir.path(), &["*.csv".to_string()], &IoConfig::default());
        assert!(matches!(source.reports(), Err(PipelineError::NoDeliveryFiles { .. })));
    }
}
