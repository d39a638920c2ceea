use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};
use std::fmt;

use geo::Point;
use rayon::prelude::*;

use crate::error::DataLoadError;
use crate::types::PointOfInterest;

const WGS84_A: f64 = 6_378_137.0;
const MERCATOR_MAX_LAT_DEG: f64 = 85.051_128_78;

/// Coordinate reference systems the loader can reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Crs {
    /// EPSG:4326 / OGC CRS84, longitude-latitude degrees.
    Wgs84,
    /// EPSG:3857 spherical Web Mercator, metres.
    WebMercator,
    Other(String),
}

impl Crs {
    /// Parses an authority name such as `EPSG:3857`, `urn:ogc:def:crs:EPSG::4326`,
    /// `urn:ogc:def:crs:EPSG:6.6:4326` or `urn:ogc:def:crs:OGC:1.3:CRS84`.
    pub fn parse(name: &str) -> Crs {
        let upper = name.trim().to_ascii_uppercase();
        if upper.ends_with("CRS84") || upper == "WGS84" {
            return Crs::Wgs84;
        }
        let Some(pos) = upper.find("EPSG") else {
            return Crs::Other(name.trim().to_string());
        };
        let code = authority_code(&upper[pos + 4..]);
        match code.as_str() {
            "4326" => Crs::Wgs84,
            "3857" | "900913" | "3785" | "102100" | "102113" => Crs::WebMercator,
            "" => Crs::Other(name.trim().to_string()),
            other => Crs::Other(format!("EPSG:{other}")),
        }
    }

    /// Best-effort reading of an ESRI `.prj` WKT string.
    pub fn from_wkt(wkt: &str) -> Crs {
        let upper = wkt.to_ascii_uppercase();
        if upper.starts_with("PROJCS") {
            if upper.contains("MERCATOR_AUXILIARY_SPHERE")
                || upper.contains("WEB_MERCATOR")
                || upper.contains("PSEUDO-MERCATOR")
                || upper.contains("POPULAR_VISUALISATION")
            {
                return Crs::WebMercator;
            }
        } else if upper.starts_with("GEOGCS")
            && (upper.contains("WGS_1984") || upper.contains("WGS 84") || upper.contains("WGS84"))
        {
            return Crs::Wgs84;
        }
        Crs::Other(wkt_name(wkt).unwrap_or_else(|| wkt.trim().to_string()))
    }

    /// Maps one point from `self` into `target`.
    pub fn transform(&self, target: &Crs, point: Point<f64>) -> Result<Point<f64>, DataLoadError> {
        match (self, target) {
            (a, b) if a == b => Ok(point),
            (Crs::Wgs84, Crs::WebMercator) => {
                Ok(Point::new(mercator_x(point.x()), mercator_y(point.y())))
            }
            (Crs::WebMercator, Crs::Wgs84) => Ok(Point::new(
                inverse_mercator_lon(point.x()),
                inverse_mercator_lat(point.y()),
            )),
            (from, to) => Err(DataLoadError::UnsupportedReprojection {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::Wgs84 => write!(f, "EPSG:4326"),
            Crs::WebMercator => write!(f, "EPSG:3857"),
            Crs::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Reprojects every point geometry of a layer in place.
pub fn reproject_points(points: &mut [PointOfInterest], from: &Crs, to: &Crs) -> Result<(), DataLoadError> {
    if from == to {
        return Ok(());
    }
    // fail before touching anything if the pair is unsupported
    from.transform(to, Point::new(0.0, 0.0))?;

    points.par_iter_mut().try_for_each(|poi| {
        if let Some(pt) = poi.geometry {
            poi.geometry = Some(from.transform(to, pt)?);
        }
        Ok(())
    })
}

/// The code is the last `:` or `/` separated segment, so a URN version such as
/// `6.6` is never mistaken for it. Plain forms like `EPSG 4326` fall back to the
/// first run of digits.
fn authority_code(rest: &str) -> String {
    if let Some(last) = rest.rsplit([':', '/']).map(str::trim).find(|s| !s.is_empty()) {
        if rest.contains([':', '/']) && last.chars().all(|c| c.is_ascii_digit()) {
            return last.to_string();
        }
    }
    rest.chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect()
}

fn wkt_name(wkt: &str) -> Option<String> {
    let start = wkt.find('"')? + 1;
    let len = wkt[start..].find('"')?;
    Some(wkt[start..start + len].to_string())
}

fn mercator_x(lon_deg: f64) -> f64 {
    WGS84_A * lon_deg.to_radians()
}

fn mercator_y(lat_deg: f64) -> f64 {
    let lat = lat_deg.clamp(-MERCATOR_MAX_LAT_DEG, MERCATOR_MAX_LAT_DEG).to_radians();
    WGS84_A * (FRAC_PI_4 + lat / 2.0).tan().ln()
}

fn inverse_mercator_lon(x_m: f64) -> f64 {
    (x_m / WGS84_A).to_degrees()
}

fn inverse_mercator_lat(y_m: f64) -> f64 {
    (2.0 * (y_m / WGS84_A).exp().atan() - FRAC_PI_2).to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_authority_names() {
        assert_eq!(Crs::parse("EPSG:4326"), Crs::Wgs84);
        assert_eq!(Crs::parse("urn:ogc:def:crs:OGC:1.3:CRS84"), Crs::Wgs84);
        assert_eq!(Crs::parse("urn:ogc:def:crs:EPSG::3857"), Crs::WebMercator);
        assert_eq!(Crs::parse("epsg:900913"), Crs::WebMercator);
        assert_eq!(Crs::parse("EPSG:32638"), Crs::Other("EPSG:32638".to_string()));
        // versioned URNs carry the EPSG database version before the code
        assert_eq!(Crs::parse("urn:ogc:def:crs:EPSG:6.6:4326"), Crs::Wgs84);
        assert_eq!(Crs::parse("urn:ogc:def:crs:EPSG:9.8.15:3857"), Crs::WebMercator);
        assert_eq!(Crs::parse("http://www.opengis.net/def/crs/EPSG/0/4326"), Crs::Wgs84);
        assert_eq!(Crs::parse("EPSG 3857"), Crs::WebMercator);
    }

    #[test]
    fn reads_prj_wkt() {
        let geographic = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;
        assert_eq!(Crs::from_wkt(geographic), Crs::Wgs84);

        let mercator = r#"PROJCS["WGS_1984_Web_Mercator_Auxiliary_Sphere",GEOGCS["GCS_WGS_1984"],PROJECTION["Mercator_Auxiliary_Sphere"]]"#;
        assert_eq!(Crs::from_wkt(mercator), Crs::WebMercator);

        let utm = r#"PROJCS["WGS_1984_UTM_Zone_38N",GEOGCS["GCS_WGS_1984"],PROJECTION["Transverse_Mercator"]]"#;
        assert_eq!(Crs::from_wkt(utm), Crs::Other("WGS_1984_UTM_Zone_38N".to_string()));
    }

    #[test]
    fn mercator_round_trip_near_riyadh() {
        let riyadh = Point::new(46.6753, 24.7136);
        let projected = Crs::Wgs84.transform(&Crs::WebMercator, riyadh).unwrap();
        assert!((projected.x() - 5_195_870.6).abs() < 10.0);
        assert!((projected.y() - 2_840_607.6).abs() < 10.0);

        let back = Crs::WebMercator.transform(&Crs::Wgs84, projected).unwrap();
        assert!((back.x() - riyadh.x()).abs() < 1e-9);
        assert!((back.y() - riyadh.y()).abs() < 1e-9);
    }

    #[test]
    fn unknown_pairs_are_rejected() {
        let utm = Crs::Other("EPSG:32638".to_string());
        let err = Crs::Wgs84.transform(&utm, Point::new(0.0, 0.0)).unwrap_err();
        assert!(matches!(err, DataLoadError::UnsupportedReprojection { .. }));
    }
}
