//! Fixtures shared by the unit tests.

use geo::{polygon, MultiPolygon, Point, Polygon};
use serde_json::{json, Value};

use crate::crs::Crs;
use crate::join::{join_points, JoinedDataset};
use crate::types::{schema_of, PointOfInterest, Region};

/// Axis-aligned district named `name` under `NEIGHBORHENAME`.
pub fn square(name: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> Region {
    let poly: Polygon<f64> = polygon![
        (x: x0, y: y0),
        (x: x1, y: y0),
        (x: x1, y: y1),
        (x: x0, y: y1),
    ];
    let mut properties = serde_json::Map::new();
    properties.insert("NEIGHBORHENAME".to_string(), json!(name));
    Region { geometry: Some(MultiPolygon::new(vec![poly])), properties }
}

/// Restaurant at (x, y) with the attributes of a JSON object literal.
pub fn restaurant(x: f64, y: f64, attributes: Value) -> PointOfInterest {
    let properties = match attributes {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    PointOfInterest { geometry: Some(Point::new(x, y)), properties }
}

pub fn dataset(regions: Vec<Region>, points: Vec<PointOfInterest>) -> JoinedDataset {
    let region_columns = schema_of(regions.iter().map(|r| &r.properties));
    let point_columns = schema_of(points.iter().map(|p| &p.properties));
    let (records, report) = join_points(points, &regions);
    JoinedDataset { crs: Crs::Wgs84, regions, records, region_columns, point_columns, report }
}

/// One unit-square district R1, one restaurant inside it and one far outside.
pub fn scenario() -> JoinedDataset {
    dataset(
        vec![square("R1", 0.0, 0.0, 1.0, 1.0)],
        vec![
            restaurant(0.5, 0.5, json!({"id": "p1", "lat": 0.5, "lon": 0.5, "rating": "4.2"})),
            restaurant(5.0, 5.0, json!({"id": "p2", "lat": 5, "lon": 5, "rating": "bad"})),
        ],
    )
}

/// Three districts and a spread of restaurants with messy attributes.
pub fn riyadh() -> JoinedDataset {
    dataset(
        vec![
            square("Al Olaya", 0.0, 0.0, 1.0, 1.0),
            square("Al Malaz", 1.0, 0.0, 2.0, 1.0),
            square("Al Nakheel", 0.0, 1.0, 1.0, 2.0),
        ],
        vec![
            restaurant(0.2, 0.2, json!({"id": "a", "categories": "Burgers", "price": "$$", "rating": "4.5", "lng": 46.68, "lat": 24.69})),
            restaurant(0.4, 0.4, json!({"id": "b", "categories": "Cafe", "price": "$", "rating": 3.9, "longitude": "46.67", "latitude": "24.70"})),
            restaurant(0.6, 0.6, json!({"id": "c", "categories": "Burgers", "price": "$", "rating": "", "lon": 46.66, "lat": 24.71})),
            restaurant(0.8, 0.8, json!({"id": "d", "categories": null, "price": "$$$", "rating": "2.1", "lng": "n/a", "lat": 24.72})),
            restaurant(1.5, 0.5, json!({"id": "e", "categories": "Cafe", "price": "$$", "rating": "4.8", "lng": 46.73, "lat": 24.68})),
            restaurant(1.6, 0.5, json!({"id": "f", "categories": "Shawarma", "price": "$", "rating": "3.0", "lng": 46.74, "lat": 24.68})),
            restaurant(0.5, 1.5, json!({"id": "g", "categories": "Cafe", "price": "", "rating": "5", "lng": 46.62, "lat": 24.77})),
            restaurant(9.0, 9.0, json!({"id": "h", "categories": "Burgers", "price": "$$", "rating": "4.0", "lng": 47.0, "lat": 25.0})),
        ],
    )
}

pub fn ids<'a>(records: impl IntoIterator<Item = &'a crate::types::JoinedRecord>) -> Vec<String> {
    records
        .into_iter()
        .filter_map(|r| r.poi.properties.get("id").and_then(Value::as_str).map(str::to_string))
        .collect()
}
