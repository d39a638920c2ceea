use std::collections::HashMap;
use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::NoGroupingKeyError;
use crate::join::JoinedDataset;
use crate::types::{as_text, CountByRegion};

/// Restaurant counts per district, busiest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregation {
    pub column: String,
    pub counts: Vec<CountByRegion>,
    /// Records whose key was null, blank, or that fell outside every district.
    pub unmatched: usize,
}

impl Aggregation {
    pub fn matched(&self) -> usize {
        self.counts.iter().map(|c| c.count).sum()
    }

    pub fn total(&self) -> usize {
        self.matched() + self.unmatched
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for row in &self.counts {
            wtr.serialize(row).context("Failed to write count row")?;
        }
        wtr.flush().context("Failed to flush count table")?;
        Ok(())
    }
}

/// First candidate present in the joined schema.
pub fn resolve_column(dataset: &JoinedDataset, candidates: &[String]) -> Option<String> {
    candidates.iter().find(|c| dataset.has_column(c)).cloned()
}

pub fn count_by_region(dataset: &JoinedDataset, candidates: &[String]) -> Result<Aggregation, NoGroupingKeyError> {
    let Some(column) = resolve_column(dataset, candidates) else {
        warn!("None of the grouping columns {:?} exist in the joined data", candidates);
        return Err(NoGroupingKeyError { checked: candidates.to_vec() });
    };
    debug!("Grouping restaurants by '{}'", column);
    Ok(count_by_column(dataset, &column))
}

pub fn count_by_column(dataset: &JoinedDataset, column: &str) -> Aggregation {
    let mut counts: Vec<CountByRegion> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unmatched = 0;

    for record in &dataset.records {
        match dataset.value(record, column).and_then(as_text) {
            Some(key) => match positions.get(&key) {
                Some(&i) => counts[i].count += 1,
                None => {
                    positions.insert(key.clone(), counts.len());
                    counts.push(CountByRegion { region: key, count: 1 });
                }
            },
            None => unmatched += 1,
        }
    }

    // stable: equal counts keep first-seen order
    counts.sort_by(|a, b| b.count.cmp(&a.count));

    Aggregation { column: column.to_string(), counts, unmatched }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaConfig;
    use crate::testing::{dataset, restaurant, riyadh, scenario, square};
    use serde_json::json;

    fn candidates() -> Vec<String> {
        SchemaConfig::default().group_candidates
    }

    #[test]
    fn scenario_counts_one_matched_one_unmatched() {
        let agg = count_by_region(&scenario(), &candidates()).unwrap();
        assert_eq!(agg.column, "NEIGHBORHENAME");
        assert_eq!(agg.counts, vec![CountByRegion { region: "R1".to_string(), count: 1 }]);
        assert_eq!(agg.unmatched, 1);
    }

    #[test]
    fn counts_sum_to_records_with_a_key() {
        let data = riyadh();
        let agg = count_by_region(&data, &candidates()).unwrap();

        let ranked: Vec<(&str, usize)> = agg.counts.iter().map(|c| (c.region.as_str(), c.count)).collect();
        assert_eq!(ranked, vec![("Al Olaya", 4), ("Al Malaz", 2), ("Al Nakheel", 1)]);
        assert_eq!(agg.unmatched, 1);
        assert_eq!(agg.matched(), 7);
        assert_eq!(agg.total(), data.len());
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let data = dataset(
            vec![square("B", 1.0, 0.0, 2.0, 1.0), square("A", 0.0, 0.0, 1.0, 1.0), square("C", 2.0, 0.0, 3.0, 1.0)],
            vec![
                restaurant(2.5, 0.5, json!({})),
                restaurant(0.5, 0.5, json!({})),
                restaurant(1.5, 0.5, json!({})),
                restaurant(0.6, 0.5, json!({})),
                restaurant(2.6, 0.5, json!({})),
            ],
        );
        let agg = count_by_region(&data, &candidates()).unwrap();
        let order: Vec<&str> = agg.counts.iter().map(|c| c.region.as_str()).collect();
        assert_eq!(order, vec!["C", "A", "B"]);
    }

    #[test]
    fn falls_back_through_candidate_spellings() {
        let mut region = square("ignored", 0.0, 0.0, 1.0, 1.0);
        region.properties.clear();
        region.properties.insert("ADM1_EN".to_string(), json!("Riyadh Region"));
        let data = dataset(vec![region], vec![restaurant(0.5, 0.5, json!({}))]);

        let agg = count_by_region(&data, &candidates()).unwrap();
        assert_eq!(agg.column, "ADM1_EN");
        assert_eq!(agg.counts[0].region, "Riyadh Region");
    }

    #[test]
    fn no_candidate_column_is_an_explicit_error() {
        let data = riyadh();
        let err = count_by_region(&data, &["district".to_string(), "NAME_2".to_string()]).unwrap_err();
        assert_eq!(err.checked, vec!["district".to_string(), "NAME_2".to_string()]);
        assert!(err.to_string().contains("Checked: district, NAME_2"));
    }

    #[test]
    fn blank_district_names_land_in_unmatched() {
        let mut blank = square("", 0.0, 0.0, 1.0, 1.0);
        blank.properties.insert("NEIGHBORHENAME".to_string(), json!("  "));
        let data = dataset(
            vec![blank, square("Named", 1.0, 0.0, 2.0, 1.0)],
            vec![restaurant(0.5, 0.5, json!({})), restaurant(1.5, 0.5, json!({}))],
        );
        let agg = count_by_region(&data, &candidates()).unwrap();
        assert_eq!(agg.matched(), 1);
        assert_eq!(agg.unmatched, 1);
    }

    #[test]
    fn csv_export_uses_dashboard_headers() {
        let agg = count_by_region(&riyadh(), &candidates()).unwrap();
        let mut buf = Vec::new();
        agg.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("region,restaurant_count\nAl Olaya,4\n"));
    }
}
