use chrono::NaiveDate;
use rayon::prelude::*;

use crate::classify::composite_label;
use crate::merge::DeliveryRecord;
use crate::metadata::CreativeMetadataRecord;

pub const NOT_FOUND_LABEL: &str = "Placement ID not found in Beeswax";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconciledRecord {
    pub placement_id: String,
    pub bees_name: String,
    pub date: NaiveDate,
    pub impressions: u64,
    pub clicks: Option<u64>,
    pub video_completions: Option<u64>,
}

impl ReconciledRecord {
    fn from_delivery(record: &DeliveryRecord, bees_name: String) -> Self {
        Self {
            placement_id: record.placement_id.clone(),
            bees_name,
            date: record.date,
            impressions: record.impressions,
            clicks: record.clicks,
            video_completions: record.video_completions,
        }
    }

    pub fn is_unmatched(&self) -> bool {
        self.bees_name == NOT_FOUND_LABEL
    }
}

/// Read-only view of the metadata set with each record's label computed once.
pub struct CreativeIndex<'a> {
    entries: Vec<(&'a CreativeMetadataRecord, String)>,
}

impl<'a> CreativeIndex<'a> {
    pub fn new(metadata: &'a [CreativeMetadataRecord]) -> Self {
        let entries = metadata
            .iter()
            .map(|m| (m, composite_label(&m.campaign_id, &m.creative_name)))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One record per metadata entry mentioning the placement id, or a
    /// single sentinel record when none does.
    pub fn reconcile_one(&self, record: &DeliveryRecord) -> Vec<ReconciledRecord> {
        let matches: Vec<ReconciledRecord> = self
            .entries
            .iter()
            .filter(|(meta, _)| meta.mentions(&record.placement_id))
            .map(|(_, label)| ReconciledRecord::from_delivery(record, label.clone()))
            .collect();
        if matches.is_empty() {
            vec![ReconciledRecord::from_delivery(record, NOT_FOUND_LABEL.to_string())]
        } else {
            matches
        }
    }

    /// Joins a batch in parallel; output keeps the input order.
    pub fn reconcile(&self, records: &[DeliveryRecord]) -> Vec<ReconciledRecord> {
        records
            .par_iter()
            .flat_map_iter(|record| self.reconcile_one(record))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(placement_id: &str) -> DeliveryRecord {
        DeliveryRecord {
            placement_id: placement_id.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            impressions: 100,
            clicks: Some(10),
            video_completions: Some(5),
        }
    }

    fn reconcile(records: &[DeliveryRecord], metadata: &[CreativeMetadataRecord]) -> Vec<ReconciledRecord> {
        CreativeIndex::new(metadata).reconcile(records)
    }

    fn meta(campaign: &str, name: &str, text: &str) -> CreativeMetadataRecord {
        CreativeMetadataRecord::new(name, campaign, &[text])
    }

    #[test]
    fn match_anywhere_in_search_text() {
        let metadata = vec![meta("CAMP1", "MO_BA_test", "https://x/?plc=123&cb=1")];
        let out = reconcile(&[delivery("123")], &metadata);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bees_name, "CAMP1_Mobile_Banner");
        assert!(!out[0].is_unmatched());
    }

    #[test]
    fn no_match_yields_single_sentinel() {
        let metadata = vec![meta("CAMP1", "MO_BA_test", "plc=999"), meta("CAMP2", "DE_VI_x", "")];
        let out = reconcile(&[delivery("123")], &metadata);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bees_name, NOT_FOUND_LABEL);
        assert_eq!(out[0].impressions, 100);
        assert_eq!(out[0].clicks, Some(10));
    }

    #[test]
    fn fans_out_one_row_per_match() {
        let metadata = vec![
            meta("CAMP1", "MO_BA_a", "pid 555"),
            meta("CAMP2", "CTV_VI_b", "other"),
            meta("CAMP3", "DE_VI_c", "x5550"),
        ];
        let out = reconcile(&[delivery("555"), delivery("1")], &metadata);
        let names: Vec<&str> = out.iter().map(|r| r.bees_name.as_str()).collect();
        assert_eq!(names, vec!["CAMP1_Mobile_Banner", "CAMP3_Desktop_Video", NOT_FOUND_LABEL]);
        assert_eq!(out[0].placement_id, "555");
        assert_eq!(out[2].placement_id, "1");
    }

    #[test]
    fn containment_is_case_sensitive() {
        let metadata = vec![meta("C", "MO_BA", "id=abc")];
        assert!(reconcile(&[delivery("ABC")], &metadata)[0].is_unmatched());
    }
}
