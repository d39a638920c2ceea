use std::collections::BTreeSet;
use std::path::PathBuf;

use geo::{MultiPolygon, Point};
use serde::Serialize;
use serde_json::Value;

use crate::crs::Crs;

/// Feature attributes, keyed by column name.
pub type Properties = serde_json::Map<String, Value>;

#[derive(Debug, Clone)]
pub struct Region {
    // None when the feature carried no usable polygon
    pub geometry: Option<MultiPolygon<f64>>,
    pub properties: Properties,
}

#[derive(Debug, Clone)]
pub struct PointOfInterest {
    pub geometry: Option<Point<f64>>,
    pub properties: Properties,
}

/// One layer read from disk, with the reference system its coordinates are in.
#[derive(Debug, Clone)]
pub struct Layer<T> {
    pub path: PathBuf,
    pub crs: Crs,
    pub features: Vec<T>,
    pub columns: BTreeSet<String>,
}

/// A restaurant and the index of the district containing it, if any.
#[derive(Debug, Clone)]
pub struct JoinedRecord {
    pub poi: PointOfInterest,
    pub region: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountByRegion {
    pub region: String,
    #[serde(rename = "restaurant_count")]
    pub count: usize,
}

/// Collects the union of attribute names over a set of features.
pub fn schema_of<'a>(properties: impl Iterator<Item = &'a Properties>) -> BTreeSet<String> {
    properties.flat_map(|p| p.keys().cloned()).collect()
}

/// Attribute value as a grouping/filter key. Null and blank values have no key.
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        other => Some(other.to_string()),
    }
}

/// Lenient numeric coercion: numbers and numeric strings, finite values only.
pub fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_coercion_never_fails() {
        assert_eq!(as_number(&json!(4.2)), Some(4.2));
        assert_eq!(as_number(&json!(" 3.5 ")), Some(3.5));
        assert_eq!(as_number(&json!("bad")), None);
        assert_eq!(as_number(&json!("NaN")), None);
        assert_eq!(as_number(&json!(null)), None);
        assert_eq!(as_number(&json!([1])), None);
    }

    #[test]
    fn blank_text_has_no_key() {
        assert_eq!(as_text(&json!("  ")), None);
        assert_eq!(as_text(&json!(null)), None);
        assert_eq!(as_text(&json!(" Olaya ")), Some("Olaya".to_string()));
        assert_eq!(as_text(&json!(12)), Some("12".to_string()));
    }
}
