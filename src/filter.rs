use std::collections::BTreeSet;
use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{MissingRatingPolicy, SchemaConfig};
use crate::join::JoinedDataset;
use crate::types::{as_number, as_text, JoinedRecord, Properties};

/// Sentinel meaning "no constraint" for category and price.
pub const ALL: &str = "All";

pub const EMPTY_FILTER_MESSAGE: &str = "No restaurants found with the selected filters.";
pub const NO_COORDINATES_MESSAGE: &str = "No restaurants with valid latitude/longitude to plot.";

/// Slider range used when no rating in the data parses.
const FALLBACK_RATING_RANGE: (f64, f64) = (0.0, 10.0);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Choice {
    #[default]
    All,
    Only(String),
}

impl Choice {
    /// Maps user input onto a choice. Absent input and the `All` sentinel both mean no filter.
    pub fn from_input(input: Option<&str>) -> Self {
        match input.map(str::trim) {
            None | Some(ALL) => Choice::All,
            Some(value) => Choice::Only(value.to_string()),
        }
    }

    fn admits(&self, value: Option<&Value>) -> bool {
        match self {
            Choice::All => true,
            Choice::Only(wanted) => value.and_then(as_text).is_some_and(|v| &v == wanted),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Criteria {
    pub region: String,
    pub category: Choice,
    pub price: Choice,
    /// `None` leaves ratings unconstrained.
    pub min_rating: Option<f64>,
}

impl Criteria {
    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            category: Choice::All,
            price: Choice::All,
            min_rating: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatingBounds {
    pub min: f64,
    pub max: f64,
    /// False when no rating parsed and the fallback range is in use.
    pub observed: bool,
}

/// What the sidebar controls can offer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterOptions {
    pub regions: Vec<String>,
    pub categories: Vec<String>,
    pub prices: Vec<String>,
    pub rating: RatingBounds,
}

#[derive(Debug)]
pub struct FilterOutcome<'a> {
    pub records: Vec<&'a JoinedRecord>,
    pub threshold: Option<f64>,
    /// Records that passed every other predicate but had no usable rating.
    pub excluded_missing_rating: usize,
}

impl FilterOutcome<'_> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn message(&self) -> Option<&'static str> {
        self.is_empty().then_some(EMPTY_FILTER_MESSAGE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MapPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinateTable {
    pub rows: Vec<MapPoint>,
    pub dropped: usize,
}

impl CoordinateTable {
    pub fn message(&self) -> Option<&'static str> {
        self.rows.is_empty().then_some(NO_COORDINATES_MESSAGE)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for row in &self.rows {
            wtr.serialize(row).context("Failed to write coordinate row")?;
        }
        wtr.flush().context("Failed to flush coordinate table")?;
        Ok(())
    }
}

/// Rating as a number. Absent, null and unparseable values are missing.
pub fn parse_rating(value: Option<&Value>) -> Option<f64> {
    value.and_then(as_number)
}

pub fn rating_bounds(dataset: &JoinedDataset, rating_column: &str) -> RatingBounds {
    let ratings = dataset
        .records
        .iter()
        .filter_map(|r| parse_rating(dataset.value(r, rating_column)));

    let range = ratings.fold(None, |acc: Option<(f64, f64)>, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    });

    match range {
        Some((min, max)) => RatingBounds { min, max, observed: true },
        None => RatingBounds {
            min: FALLBACK_RATING_RANGE.0,
            max: FALLBACK_RATING_RANGE.1,
            observed: false,
        },
    }
}

pub fn options(dataset: &JoinedDataset, region_column: &str, schema: &SchemaConfig) -> FilterOptions {
    let regions = if dataset.region_columns.contains(region_column) {
        distinct(dataset.regions.iter().map(|r| r.properties.get(region_column)))
    } else {
        distinct(dataset.records.iter().map(|r| dataset.value(r, region_column)))
    };

    FilterOptions {
        regions,
        categories: distinct(dataset.records.iter().map(|r| dataset.value(r, &schema.category_column))),
        prices: distinct(dataset.records.iter().map(|r| dataset.value(r, &schema.price_column))),
        rating: rating_bounds(dataset, &schema.rating_column),
    }
}

fn distinct<'a>(values: impl Iterator<Item = Option<&'a Value>>) -> Vec<String> {
    values
        .flatten()
        .filter_map(as_text)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Records matching every active criterion.
pub fn apply<'a>(
    dataset: &'a JoinedDataset,
    region_column: &str,
    schema: &SchemaConfig,
    criteria: &Criteria,
) -> FilterOutcome<'a> {
    let floor = match schema.missing_rating {
        MissingRatingPolicy::Exclude => None,
        MissingRatingPolicy::IncludeAtMinimum => Some(rating_bounds(dataset, &schema.rating_column).min),
    };
    let region = Choice::Only(criteria.region.trim().to_string());

    let mut excluded_missing_rating = 0;
    let records: Vec<&JoinedRecord> = dataset
        .records
        .iter()
        .filter(|r| region.admits(dataset.value(r, region_column)))
        .filter(|r| criteria.category.admits(dataset.value(r, &schema.category_column)))
        .filter(|r| criteria.price.admits(dataset.value(r, &schema.price_column)))
        .filter(|r| {
            let Some(threshold) = criteria.min_rating else {
                return true;
            };
            match parse_rating(dataset.value(r, &schema.rating_column)) {
                Some(rating) => rating >= threshold,
                None if floor.is_some_and(|min| threshold <= min) => true,
                None => {
                    excluded_missing_rating += 1;
                    false
                }
            }
        })
        .collect();

    debug!(
        "Filter {:?} kept {} of {} restaurants",
        criteria,
        records.len(),
        dataset.len()
    );
    if excluded_missing_rating > 0 {
        warn!("{} restaurants excluded for missing rating", excluded_missing_rating);
    }

    FilterOutcome {
        records,
        threshold: criteria.min_rating,
        excluded_missing_rating,
    }
}

/// Latitude/longitude rows for the point map. Records whose coordinates don't
/// parse or are out of range are dropped and counted.
pub fn coordinates<'a>(
    records: impl IntoIterator<Item = &'a JoinedRecord>,
    schema: &SchemaConfig,
) -> CoordinateTable {
    let mut table = CoordinateTable::default();

    for record in records {
        let props = &record.poi.properties;
        let longitude = aliased(props, &schema.longitude_aliases).and_then(as_number);
        let latitude = aliased(props, &schema.latitude_aliases).and_then(as_number);

        match (latitude, longitude) {
            (Some(lat), Some(lon)) if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) => {
                table.rows.push(MapPoint { latitude: lat, longitude: lon });
            }
            _ => table.dropped += 1,
        }
    }

    if table.dropped > 0 {
        warn!("{} restaurants dropped from the map for invalid coordinates", table.dropped);
    }
    table
}

/// First alias carrying a non-null value.
fn aliased<'a>(props: &'a Properties, aliases: &[String]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|alias| props.get(alias))
        .find(|v| !v.is_null())
}
