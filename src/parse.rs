//! Line-level parsing for delivery reports whose header row drifts.
//!
//! Delivery exports carry a free-form preamble before the tabular part. A
//! marker line announces the metadata block and the real header row sits
//! somewhere in the few lines after it, with columns in no fixed order.

use std::collections::HashMap;

use crate::config::DeliveryConfig;
use crate::error::FileRejection;

pub const QUOTE: char = '"';

/// Splits one line into trimmed fields.
///
/// Each quote character toggles quoted mode and is dropped; a delimiter seen
/// while quoted is kept as text. An unterminated quote simply leaves the rest
/// of the line in the current field.
pub fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for ch in line.chars() {
        if ch == QUOTE {
            quoted = !quoted;
        } else if ch == delimiter && !quoted {
            fields.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// Column name (lowercase) to field index, resolved once per file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMap {
    columns: HashMap<String, Option<usize>>,
    data_start: usize,
}

impl HeaderMap {
    /// Field index of `column`, or `None` when it never appeared in the window.
    pub fn index(&self, column: &str) -> Option<usize> {
        self.columns
            .get(&column.to_lowercase())
            .copied()
            .flatten()
    }

    /// Line number of the first data row.
    pub fn data_start(&self) -> usize {
        self.data_start
    }

    pub fn missing<'a>(&self, columns: &[&'a str]) -> Vec<&'a str> {
        columns
            .iter()
            .copied()
            .filter(|c| self.index(c).is_none())
            .collect()
    }
}

/// Finds the marker line and resolves every target column inside the window
/// that follows it. First window row containing a column wins. No line of the
/// window is ever treated as data.
pub fn locate_header(lines: &[&str], config: &DeliveryConfig) -> Result<HeaderMap, FileRejection> {
    let marker_line = lines
        .iter()
        .position(|line| line.contains(config.marker.as_str()))
        .ok_or_else(|| FileRejection::NoMarker {
            marker: config.marker.clone(),
        })?;

    let window_start = marker_line + 1;
    let window_end = (window_start + config.header_window).min(lines.len());
    let window: Vec<Vec<String>> = lines[window_start..window_end]
        .iter()
        .map(|line| {
            split_fields(line, config.delimiter)
                .into_iter()
                .map(|field| field.to_lowercase())
                .collect()
        })
        .collect();

    let mut columns = HashMap::new();
    let targets = config
        .required_columns()
        .into_iter()
        .chain(config.optional_columns());
    for target in targets {
        let target = target.to_lowercase();
        let index = window
            .iter()
            .find_map(|row| row.iter().position(|field| *field == target));
        columns.insert(target, index);
    }

    Ok(HeaderMap {
        columns,
        data_start: window_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_delimiter_stays_in_field() {
        assert_eq!(split_fields("a,\"b,c\",d", ','), vec!["a", "b,c", "d"]);
    }

    #[test]
    fn plain_line_is_split_and_trimmed() {
        assert_eq!(split_fields(" x , y,z ", ','), vec!["x", "y", "z"]);
        assert_eq!(split_fields("", ','), vec![""]);
        assert_eq!(split_fields("a|b", '|'), vec!["a", "b"]);
    }

    #[test]
    fn unterminated_quote_is_best_effort() {
        assert_eq!(split_fields("a,\"b,c,d", ','), vec!["a", "b,c,d"]);
        assert_eq!(split_fields("\"", ','), vec![""]);
    }

    fn lines(text: &str) -> Vec<&str> {
        text.lines().collect()
    }

    #[test]
    fn missing_marker_rejects_file() {
        let text = "Date,Placement ID,Impressions\n2024-03-01,1,2\n";
        let err = locate_header(&lines(text), &DeliveryConfig::default()).unwrap_err();
        assert!(matches!(err, FileRejection::NoMarker { .. }));
    }

    #[test]
    fn columns_resolve_case_insensitively_in_any_order() {
        let text = "Campaign Report\nReport Fields\nIMPRESSIONS,Clicks,placement ID,DATE\n10,1,555,2024-03-01\n";
        let header = locate_header(&lines(text), &DeliveryConfig::default()).unwrap();
        assert_eq!(header.index("impressions"), Some(0));
        assert_eq!(header.index("clicks"), Some(1));
        assert_eq!(header.index("placement id"), Some(2));
        assert_eq!(header.index("date"), Some(3));
        assert_eq!(header.index("video completions"), None);
        assert_eq!(header.data_start(), 4);
    }

    #[test]
    fn first_window_row_wins() {
        let text = "Report Fields\nFilter,Date\nDate,Placement ID,Impressions\nrow";
        let header = locate_header(&lines(text), &DeliveryConfig::default()).unwrap();
        assert_eq!(header.index("date"), Some(1));
        assert_eq!(header.index("placement id"), Some(1));
        assert_eq!(header.data_start(), 4);
    }

    #[test]
    fn data_starts_after_the_whole_window() {
        let text = "Preamble\nReport Fields\nDate,Placement ID,Impressions\n2024-03-01,1,1\n2024-03-01,2,1\n\
2024-03-01,3,1\n2024-03-01,4,1\n2024-03-01,5,1\n2024-03-01,6,1\n";
        let header = locate_header(&lines(text), &DeliveryConfig::default()).unwrap();
        assert_eq!(header.index("impressions"), Some(2));
        assert_eq!(header.data_start(), 8);
        assert_eq!(lines(text)[header.data_start()], "2024-03-01,6,1");
    }

    #[test]
    fn columns_outside_window_are_absent() {
        let text = "Report Fields\n\n\n\n\n\n\nDate,Placement ID,Impressions\n";
        let config = DeliveryConfig::default();
        let header = locate_header(&lines(text), &config).unwrap();
        assert_eq!(
            header.missing(&config.required_columns()),
            vec!["date", "placement id", "impressions"]
        );
    }
}
