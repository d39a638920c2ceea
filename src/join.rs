use std::collections::BTreeSet;

use geo::bounding_rect::BoundingRect;
use geo::{CoordsIter, Intersects, MultiPolygon, Point};
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crs::Crs;
use crate::data::Layers;
use crate::error::GeometryError;
use crate::types::{JoinedRecord, PointOfInterest, Region};

// Wrapper for RTree indexing
struct RegionEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for RegionEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// R-tree over district bounding boxes. Only valid districts are indexed.
pub struct RegionIndex {
    tree: RTree<RegionEnvelope>,
}

impl RegionIndex {
    pub fn build(regions: &[Region]) -> (Self, Vec<GeometryError>) {
        let mut invalid = Vec::new();
        let mut items = Vec::with_capacity(regions.len());

        for (index, region) in regions.iter().enumerate() {
            let rect = match validate_region(index, region.geometry.as_ref()) {
                Ok(mp) => mp.bounding_rect(),
                Err(e) => {
                    invalid.push(e);
                    continue;
                }
            };
            if let Some(rect) = rect {
                items.push(RegionEnvelope {
                    index,
                    aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                });
            }
        }

        (RegionIndex { tree: RTree::bulk_load(items) }, invalid)
    }

    /// Lowest-indexed district whose polygon contains `point`, boundary included.
    pub fn containing(&self, regions: &[Region], point: &Point<f64>) -> Option<usize> {
        let envelope = AABB::from_point([point.x(), point.y()]);

        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter(|candidate| {
                regions
                    .get(candidate.index)
                    .and_then(|r| r.geometry.as_ref())
                    .is_some_and(|g| g.intersects(point))
            })
            .map(|candidate| candidate.index)
            .min()
    }
}

/// Geometry problems found while joining. Nothing in here stops the pipeline.
#[derive(Debug, Clone, Default)]
pub struct JoinReport {
    pub invalid_regions: Vec<GeometryError>,
    pub invalid_points: Vec<GeometryError>,
    pub unmatched: usize,
}

/// Restaurants left-joined to districts, plus what is needed to read attributes back out.
#[derive(Debug, Clone)]
pub struct JoinedDataset {
    pub crs: Crs,
    pub regions: Vec<Region>,
    pub records: Vec<JoinedRecord>,
    pub region_columns: BTreeSet<String>,
    pub point_columns: BTreeSet<String>,
    pub report: JoinReport,
}

impl JoinedDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.region_columns.contains(column) || self.point_columns.contains(column)
    }

    pub fn columns(&self) -> BTreeSet<&str> {
        self.region_columns
            .iter()
            .chain(self.point_columns.iter())
            .map(String::as_str)
            .collect()
    }

    pub fn region_of(&self, record: &JoinedRecord) -> Option<&Region> {
        record.region.and_then(|i| self.regions.get(i))
    }

    /// Attribute of a joined record. District columns shadow restaurant columns of
    /// the same name; an unmatched record has no value for any district column.
    pub fn value<'a>(&'a self, record: &'a JoinedRecord, column: &str) -> Option<&'a Value> {
        if self.region_columns.contains(column) {
            self.region_of(record).and_then(|r| r.properties.get(column))
        } else {
            record.poi.properties.get(column)
        }
    }
}

/// Left-joins every valid point to the first district containing it.
pub fn join_points(points: Vec<PointOfInterest>, regions: &[Region]) -> (Vec<JoinedRecord>, JoinReport) {
    let (index, invalid_regions) = RegionIndex::build(regions);

    let results: Vec<Result<JoinedRecord, GeometryError>> = points
        .into_par_iter()
        .enumerate()
        .map(|(i, poi)| {
            let point = validate_point(i, poi.geometry)?;
            let region = index.containing(regions, &point);
            Ok(JoinedRecord { poi, region })
        })
        .collect();

    let mut records = Vec::with_capacity(results.len());
    let mut invalid_points = Vec::new();
    for result in results {
        match result {
            Ok(record) => records.push(record),
            Err(e) => invalid_points.push(e),
        }
    }
    let unmatched = records.iter().filter(|r| r.region.is_none()).count();

    (records, JoinReport { invalid_regions, invalid_points, unmatched })
}

pub fn spatial_join(layers: Layers) -> JoinedDataset {
    let Layers { districts, restaurants } = layers;
    info!("Joining {} restaurants to {} districts...", restaurants.features.len(), districts.features.len());

    let (records, report) = join_points(restaurants.features, &districts.features);

    if !report.invalid_regions.is_empty() {
        warn!("{} districts have invalid geometry and were left out of the join", report.invalid_regions.len());
    }
    if !report.invalid_points.is_empty() {
        warn!("{} restaurants have invalid geometry and were left out of the join", report.invalid_points.len());
        let indices: Vec<usize> = report.invalid_points.iter().map(GeometryError::feature_index).collect();
        debug!("Invalid restaurant features: {:?}", indices);
    }
    info!("Joined {} restaurants, {} outside every district", records.len(), report.unmatched);

    let dataset = JoinedDataset {
        crs: districts.crs,
        regions: districts.features,
        records,
        region_columns: districts.columns,
        point_columns: restaurants.columns,
        report,
    };
    debug!("Joined columns: {:?}", dataset.columns());
    dataset
}

fn validate_region(index: usize, geometry: Option<&MultiPolygon<f64>>) -> Result<&MultiPolygon<f64>, GeometryError> {
    let mp = geometry.ok_or(GeometryError::Missing { index })?;
    if mp.0.is_empty() || mp.0.iter().all(|p| p.exterior().0.is_empty()) {
        return Err(GeometryError::Empty { index });
    }
    if !mp.coords_iter().all(|c| c.x.is_finite() && c.y.is_finite()) {
        return Err(GeometryError::NonFinite { index });
    }
    for polygon in &mp.0 {
        let positions = polygon.exterior().0.len();
        if positions < 4 {
            return Err(GeometryError::DegenerateRing { index, positions });
        }
    }
    Ok(mp)
}

fn validate_point(index: usize, geometry: Option<Point<f64>>) -> Result<Point<f64>, GeometryError> {
    let point = geometry.ok_or(GeometryError::Missing { index })?;
    if !(point.x().is_finite() && point.y().is_finite()) {
        return Err(GeometryError::NonFinite { index });
    }
    Ok(point)
}
