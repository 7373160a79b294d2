use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Reason a whole delivery report was set aside. The run continues with the
/// remaining files.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileRejection {
    #[error("'{marker}' marker not found")]
    NoMarker { marker: String },
    #[error("required columns not found in header window: {}", missing.join(", "))]
    MissingColumns { missing: Vec<String> },
    #[error("unreadable: {reason}")]
    Unreadable { reason: String },
}

/// Why a single data row did not become a delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowDrop {
    Empty,
    GrandTotal,
    MissingCell,
    BadDate,
    BadImpressions,
    BadCount,
}

impl RowDrop {
    pub fn is_malformed(self) -> bool {
        !matches!(self, RowDrop::Empty | RowDrop::GrandTotal)
    }
}

impl fmt::Display for RowDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RowDrop::Empty => "empty",
            RowDrop::GrandTotal => "grand total",
            RowDrop::MissingCell => "missing required cell",
            RowDrop::BadDate => "unparseable date",
            RowDrop::BadImpressions => "non-numeric impressions",
            RowDrop::BadCount => "non-numeric clicks/video completions",
        };
        f.write_str(label)
    }
}

/// Conditions that stop a command. Everything else is logged and skipped.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no delivery reports found in {dir} matching {patterns}")]
    NoDeliveryFiles { dir: PathBuf, patterns: String },
    #[error("none of the {found} delivery reports could be used")]
    NoUsableReports { found: usize },
    #[error("no metadata report named '{prefix}<timestamp>.csv' in {dir}")]
    NoMetadataReport { dir: PathBuf, prefix: String },
    #[error("metadata report {source_name} has none of the search columns: {}", columns.join(", "))]
    NoSearchColumns {
        source_name: String,
        columns: Vec<String>,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("writer thread failed: {0}")]
    Writer(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Glob(#[from] glob::PatternError),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
