use std::fs::File;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::parse::QUOTE;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub delivery: DeliveryConfig,
    pub metadata: MetadataConfig,
    pub output: OutputConfig,
    pub io: IoConfig,
}

/// Layout of the fixed-column delivery reports.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    pub marker: String,
    pub header_window: usize,
    pub delimiter: char,
    pub date_column: String,
    pub placement_id_column: String,
    pub impressions_column: String,
    pub clicks_column: String,
    pub video_completions_column: String,
    pub grand_total_prefix: String,
    pub date_format: String,
    pub file_patterns: Vec<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            marker: "Report Fields".to_string(),
            header_window: 6,
            delimiter: ',',
            date_column: "date".to_string(),
            placement_id_column: "placement id".to_string(),
            impressions_column: "impressions".to_string(),
            clicks_column: "clicks".to_string(),
            video_completions_column: "video completions".to_string(),
            grand_total_prefix: "Grand Total:".to_string(),
            date_format: "%Y-%m-%d".to_string(),
            file_patterns: vec!["*.csv".to_string(), "*.csv.gz".to_string()],
        }
    }
}

impl DeliveryConfig {
    pub fn required_columns(&self) -> [&str; 3] {
        [
            self.date_column.as_str(),
            self.placement_id_column.as_str(),
            self.impressions_column.as_str(),
        ]
    }

    pub fn optional_columns(&self) -> [&str; 2] {
        [
            self.clicks_column.as_str(),
            self.video_completions_column.as_str(),
        ]
    }
}

/// Layout of the flat creative metadata report.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MetadataConfig {
    pub creative_name_column: String,
    pub campaign_id_column: String,
    pub search_columns: Vec<String>,
    pub report_prefix: String,
    pub report_timestamp_format: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            creative_name_column: "creative_creative_name".to_string(),
            campaign_id_column: "campaign_campaign_id".to_string(),
            search_columns: vec![
                "creative_pixels".to_string(),
                "creative_scripts".to_string(),
                "creative_creative_content_munge".to_string(),
            ],
            report_prefix: "beeswax_filtered_report_".to_string(),
            report_timestamp_format: "%m%d%Y%H%M%S".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub merged_file_name: String,
    pub reconciled_file_prefix: String,
    pub reconciled_timestamp_format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            merged_file_name: "merged_dcm_report.csv".to_string(),
            reconciled_file_prefix: "Third_Party_Data_".to_string(),
            reconciled_timestamp_format: "%Y%m%d_%H%M%S".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct IoConfig {
    pub read_attempts: u32,
    pub retry_delay_ms: u64,
    /// 0 picks the number of logical CPUs.
    pub threads: usize,
    pub batch_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            read_attempts: 3,
            retry_delay_ms: 2000,
            threads: 0,
            batch_size: 10_000,
        }
    }
}

impl IoConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {}", path.display());
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));
        if self.delivery.marker.is_empty() {
            return invalid("delivery.marker must not be empty");
        }
        if self.delivery.header_window == 0 {
            return invalid("delivery.header_window must be at least 1");
        }
        if self.delivery.delimiter == QUOTE {
            return invalid("delivery.delimiter cannot be the quote character");
        }
        if self.delivery.file_patterns.is_empty() {
            return invalid("delivery.file_patterns must list at least one pattern");
        }
        if self.metadata.search_columns.is_empty() {
            return invalid("metadata.search_columns must list at least one column");
        }
        if self.io.read_attempts == 0 {
            return invalid("io.read_attempts must be at least 1");
        }
        if self.io.batch_size == 0 {
            return invalid("io.batch_size must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delivery.header_window, 6);
        assert_eq!(config.delivery.marker, "Report Fields");
        assert_eq!(
            config.delivery.required_columns(),
            ["date", "placement id", "impressions"]
        );
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() {
        let yaml = "delivery:\n  header_window: 10\n  delimiter: ';'\nio:\n  threads: 2\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.delivery.header_window, 10);
        assert_eq!(config.delivery.delimiter, ';');
        assert_eq!(config.delivery.marker, "Report Fields");
        assert_eq!(config.io.threads, 2);
        assert_eq!(config.io.batch_size, 10_000);
        assert_eq!(config.metadata, MetadataConfig::default());
    }

    #[test]
    fn rejects_quote_delimiter_and_empty_window() {
        let mut config = Config::default();
        config.delivery.delimiter = '"';
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));

        let mut config = Config::default();
        config.delivery.header_window = 0;
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));

        let mut config = Config::default();
        config.metadata.search_columns.clear();
        assert!(config.validate().is_err());
    }
}
