//! Flattens the raw campaign / line item / creative dumps into the single
//! metadata report the reconciler reads.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use csv::{ReaderBuilder, Writer};
use log::info;

use crate::error::Result;
use crate::output::{DigestWriter, OutputFile, ReportSink};
use crate::source::read_text;

pub type Row = HashMap<String, String>;

pub const CAMPAIGNS_FILE: &str = "campaigns.csv";
pub const LINE_ITEMS_FILE: &str = "line_items.csv";
pub const CREATIVE_LINKS_FILE: &str = "creative_line_items.csv";
pub const CREATIVES_FILE: &str = "creatives.csv";

const CAMPAIGN_COLUMNS: [&str; 2] = ["campaign_id", "campaign_name"];
const LINE_ITEM_COLUMNS: [&str; 2] = ["line_item_id", "line_item_name"];
const CREATIVE_COLUMNS: [&str; 5] = [
    "creative_id",
    "creative_name",
    "pixels",
    "scripts",
    "creative_content_munge",
];

#[derive(Debug, Clone, Default)]
pub struct RawTables {
    pub campaigns: Vec<Row>,
    pub line_items: Vec<Row>,
    pub creative_links: Vec<Row>,
    pub creatives: Vec<Row>,
}

/// Reads a dump keyed by header name. Short rows simply lack the trailing
/// columns.
pub fn read_table<R: Read>(reader: R) -> Result<Vec<Row>> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        rows.push(
            headers
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect(),
        );
    }
    Ok(rows)
}

impl RawTables {
    pub fn load(dir: &Path) -> Result<Self> {
        let table = |name: &str| -> Result<Vec<Row>> {
            let path = dir.join(name);
            let rows = read_table(read_text(&path)?.as_bytes())?;
            info!("Read {} rows from {}", rows.len(), path.display());
            Ok(rows)
        };
        Ok(Self {
            campaigns: table(CAMPAIGNS_FILE)?,
            line_items: table(LINE_ITEMS_FILE)?,
            creative_links: table(CREATIVE_LINKS_FILE)?,
            creatives: table(CREATIVES_FILE)?,
        })
    }
}

pub fn header() -> Vec<String> {
    let prefixed = |prefix: &str, cols: &[&str]| -> Vec<String> {
        cols.iter().map(|c| format!("{}_{}", prefix, c)).collect()
    };
    let mut header = prefixed("campaign", &CAMPAIGN_COLUMNS);
    header.extend(prefixed("line_item", &LINE_ITEM_COLUMNS));
    header.extend(prefixed("creative", &CREATIVE_COLUMNS));
    header
}

fn project(row: &Row, columns: &[&str], out: &mut Vec<String>) {
    out.extend(columns.iter().map(|c| row.get(*c).cloned().unwrap_or_default()));
}

fn group_by<'a>(rows: &'a [Row], key: &str) -> HashMap<&'a str, Vec<&'a Row>> {
    let mut groups: HashMap<&str, Vec<&Row>> = HashMap::new();
    for row in rows {
        if let Some(value) = row.get(key) {
            groups.entry(value.as_str()).or_default().push(row);
        }
    }
    groups
}

/// campaign → line items → creative links → first matching creative, one
/// row per resolved creative, in input order.
pub fn consolidate(tables: &RawTables) -> Vec<Vec<String>> {
    let line_items = group_by(&tables.line_items, "campaign_id");
    let links = group_by(&tables.creative_links, "line_item_id");
    let mut creatives: HashMap<&str, &Row> = HashMap::new();
    for creative in &tables.creatives {
        if let Some(id) = creative.get("creative_id") {
            creatives.entry(id.as_str()).or_insert(creative);
        }
    }

    let mut out = Vec::new();
    for campaign in &tables.campaigns {
        let Some(campaign_id) = campaign.get("campaign_id") else {
            continue;
        };
        for line_item in line_items.get(campaign_id.as_str()).into_iter().flatten() {
            let Some(line_item_id) = line_item.get("line_item_id") else {
                continue;
            };
            for link in links.get(line_item_id.as_str()).into_iter().flatten() {
                let creative = link
                    .get("creative_id")
                    .and_then(|id| creatives.get(id.as_str()));
                if let Some(creative) = creative {
                    let mut row = Vec::with_capacity(9);
                    project(campaign, &CAMPAIGN_COLUMNS, &mut row);
                    project(line_item, &LINE_ITEM_COLUMNS, &mut row);
                    project(creative, &CREATIVE_COLUMNS, &mut row);
                    out.push(row);
                }
            }
        }
    }
    out
}

pub fn write_consolidated<W: Write>(rows: &[Vec<String>], inner: W) -> Result<W> {
    let mut writer = Writer::from_writer(inner);
    writer.write_record(header())?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| std::io::Error::new(e.error().kind(), e.error().to_string()).into())
}

pub fn persist_consolidated(rows: &[Vec<String>], sink: &dyn ReportSink, name: &str) -> Result<OutputFile> {
    let digest_writer = write_consolidated(rows, DigestWriter::new(sink.open(name)?))?;
    let (_, sha256) = digest_writer.finish()?;
    Ok(OutputFile {
        name: name.to_string(),
        rows: rows.len(),
        sha256,
    })
}
