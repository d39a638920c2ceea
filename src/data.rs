use crate::config::InputConfig;
use crate::crs::{self, Crs};
use crate::error::DataLoadError;
use crate::types::{schema_of, Layer, PointOfInterest, Properties, Region};
use geo::{Geometry, MultiPolygon, Point};
use serde_json::Value;
use shapefile::dbase::FieldValue;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Both layers, with the restaurants already expressed in the districts' CRS.
#[derive(Debug, Clone)]
pub struct Layers {
    pub districts: Layer<Region>,
    pub restaurants: Layer<PointOfInterest>,
}

struct RawFeature {
    geometry: Option<Geometry<f64>>,
    properties: Properties,
}

struct RawLayer {
    crs: Option<Crs>,
    features: Vec<RawFeature>,
}

pub fn load_layers(input: &InputConfig) -> Result<Layers, DataLoadError> {
    let limit = Duration::from_secs(input.load_timeout_secs);

    let districts = {
        let path = input.districts.clone();
        let declared = input.districts_crs.clone();
        read_with_timeout(&input.districts, limit, move || {
            load_regions(&path, declared.as_deref())
        })?
    };
    info!("Loaded {} districts from {:?} ({})", districts.features.len(), districts.path, districts.crs);

    let mut restaurants = {
        let path = input.restaurants.clone();
        let declared = input.restaurants_crs.clone();
        read_with_timeout(&input.restaurants, limit, move || {
            load_points(&path, declared.as_deref())
        })?
    };
    info!("Loaded {} restaurants from {:?} ({})", restaurants.features.len(), restaurants.path, restaurants.crs);

    if restaurants.crs != districts.crs {
        info!("Reprojecting restaurants from {} to {}", restaurants.crs, districts.crs);
        crs::reproject_points(&mut restaurants.features, &restaurants.crs, &districts.crs)?;
        restaurants.crs = districts.crs.clone();
    }

    Ok(Layers { districts, restaurants })
}

/// Reads a polygon layer. Features without a polygon keep `geometry: None`.
pub fn load_regions(path: &Path, declared_crs: Option<&str>) -> Result<Layer<Region>, DataLoadError> {
    let raw = read_layer(path)?;
    let crs = resolve_crs(path, raw.crs, declared_crs)?;

    let features: Vec<Region> = raw
        .features
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            let geometry = match f.geometry {
                Some(Geometry::MultiPolygon(mp)) => Some(mp),
                Some(Geometry::Polygon(p)) => Some(MultiPolygon::new(vec![p])),
                Some(_) => {
                    debug!("District feature {} is not a polygon", i);
                    None
                }
                None => None,
            };
            Region { geometry, properties: f.properties }
        })
        .collect();

    let columns = schema_of(features.iter().map(|f| &f.properties));
    Ok(Layer { path: path.to_path_buf(), crs, features, columns })
}

/// Reads a point layer. Features without a point keep `geometry: None`.
pub fn load_points(path: &Path, declared_crs: Option<&str>) -> Result<Layer<PointOfInterest>, DataLoadError> {
    let raw = read_layer(path)?;
    let crs = resolve_crs(path, raw.crs, declared_crs)?;

    let features: Vec<PointOfInterest> = raw
        .features
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            let geometry = match f.geometry {
                Some(Geometry::Point(p)) => Some(p),
                Some(Geometry::MultiPoint(mp)) if mp.0.len() == 1 => Some(mp.0[0]),
                Some(_) => {
                    debug!("Restaurant feature {} is not a point", i);
                    None
                }
                None => None,
            };
            PointOfInterest { geometry, properties: f.properties }
        })
        .collect();

    let columns = schema_of(features.iter().map(|f| &f.properties));
    Ok(Layer { path: path.to_path_buf(), crs, features, columns })
}

fn resolve_crs(path: &Path, from_file: Option<Crs>, declared: Option<&str>) -> Result<Crs, DataLoadError> {
    match (declared, from_file) {
        (Some(name), _) => Ok(Crs::parse(name)),
        (None, Some(crs)) => Ok(crs),
        (None, None) => Err(DataLoadError::MissingCrs(path.to_path_buf())),
    }
}

/// Runs a layer read on its own thread and gives up once `limit` has passed.
fn read_with_timeout<T, F>(path: &Path, limit: Duration, read: F) -> Result<T, DataLoadError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DataLoadError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read());
    });
    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(DataLoadError::Timeout {
            path: path.to_path_buf(),
            limit,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(DataLoadError::Malformed {
            path: path.to_path_buf(),
            reason: "reader thread panicked".to_string(),
        }),
    }
}

fn read_layer(path: &Path) -> Result<RawLayer, DataLoadError> {
    if !path.exists() {
        return Err(DataLoadError::Missing(path.to_path_buf()));
    }

    let extension = path.extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| DataLoadError::UnsupportedFormat(path.to_path_buf()))?;

    let layer = match extension.as_str() {
        "shp" => read_shapefile(path)?,
        "json" | "geojson" => read_geojson(path)?,
        _ => return Err(DataLoadError::UnsupportedFormat(path.to_path_buf())),
    };

    if !layer.features.is_empty() && layer.features.iter().all(|f| f.geometry.is_none()) {
        return Err(DataLoadError::NoGeometry(path.to_path_buf()));
    }
    Ok(layer)
}

fn read_geojson(path: &Path) -> Result<RawLayer, DataLoadError> {
    use geojson::GeoJson;

    let file = File::open(path).map_err(|source| DataLoadError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    // Parse the GeoJSON. warning: this loads the whole file into memory.
    let geojson = GeoJson::from_reader(reader).map_err(|e| malformed(path, e))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(malformed(path, "GeoJSON must be a FeatureCollection")),
    };

    // RFC 7946 drops the `crs` member and fixes WGS 84; older files still carry it.
    let crs = match collection.foreign_members.as_ref().and_then(|m| m.get("crs")) {
        Some(member) => {
            let name = member
                .get("properties")
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .ok_or_else(|| DataLoadError::UnknownCrs(member.to_string()))?;
            Crs::parse(name)
        }
        None => Crs::Wgs84,
    };

    let features = collection
        .features
        .into_iter()
        .enumerate()
        .map(|(i, feature)| {
            let geometry = feature.geometry.and_then(|geom| {
                match Geometry::<f64>::try_from(geom.value) {
                    Ok(g) => Some(g),
                    Err(e) => {
                        warn!("Feature {} in {:?} has an unreadable geometry: {:?}", i, path, e);
                        None
                    }
                }
            });
            RawFeature {
                geometry,
                properties: feature.properties.unwrap_or_default(),
            }
        })
        .collect();

    Ok(RawLayer { crs: Some(crs), features })
}

fn read_shapefile(path: &Path) -> Result<RawLayer, DataLoadError> {
    let mut reader = shapefile::Reader::from_path(path).map_err(|e| malformed(path, e))?;

    let prj: PathBuf = path.with_extension("prj");
    let crs = if prj.exists() {
        let wkt = fs::read_to_string(&prj).map_err(|source| DataLoadError::Unreadable {
            path: prj.clone(),
            source,
        })?;
        Some(Crs::from_wkt(wkt.trim()))
    } else {
        None
    };

    let mut features = Vec::new();

    for (i, result) in reader.iter_shapes_and_records().enumerate() {
        let (shape, record) = result.map_err(|e| malformed(path, e))?;

        let geometry: Option<Geometry<f64>> = match shape {
            shapefile::Shape::Point(p) => Some(Point::new(p.x, p.y).into()),
            shapefile::Shape::PointM(p) => Some(Point::new(p.x, p.y).into()),
            shapefile::Shape::PointZ(p) => Some(Point::new(p.x, p.y).into()),
            shapefile::Shape::Polygon(polygon) => polygon_to_geo(i, polygon.try_into()),
            shapefile::Shape::PolygonM(polygon) => polygon_to_geo(i, polygon.try_into()),
            shapefile::Shape::PolygonZ(polygon) => polygon_to_geo(i, polygon.try_into()),
            shapefile::Shape::NullShape => None,
            _ => {
                debug!("Skipping unsupported shape type for record {}", i);
                None
            }
        };

        let properties: Properties = record
            .into_iter()
            .map(|(name, value)| (name, field_to_json(value)))
            .collect();

        features.push(RawFeature { geometry, properties });
    }

    Ok(RawLayer { crs, features })
}

fn polygon_to_geo<E: std::fmt::Debug>(
    index: usize,
    converted: Result<MultiPolygon<f64>, E>,
) -> Option<Geometry<f64>> {
    match converted {
        Ok(mp) => Some(Geometry::MultiPolygon(mp)),
        Err(e) => {
            warn!("Failed to convert polygon for record {}: {:?}", index, e);
            None
        }
    }
}

fn field_to_json(value: FieldValue) -> Value {
    match value {
        FieldValue::Character(Some(s)) => Value::String(s.trim().to_string()),
        FieldValue::Character(None) => Value::Null,
        FieldValue::Memo(s) => Value::String(s),
        FieldValue::Numeric(n) => n.map(Value::from).unwrap_or(Value::Null),
        FieldValue::Float(n) => n.map(|f| Value::from(f as f64)).unwrap_or(Value::Null),
        FieldValue::Double(n) | FieldValue::Currency(n) => Value::from(n),
        FieldValue::Integer(n) => Value::from(n),
        FieldValue::Logical(b) => b.map(Value::Bool).unwrap_or(Value::Null),
        other => Value::String(format!("{:?}", other)),
    }
}

fn malformed(path: &Path, reason: impl std::fmt::Display) -> DataLoadError {
    DataLoadError::Malformed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
