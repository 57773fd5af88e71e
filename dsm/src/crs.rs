//! Coordinate reference system transforms.
//!
//! Datasets declare their native CRS as an EPSG code. Points and polygons are
//! moved between CRSs through a WGS84 lon/lat pivot: Web Mercator and WGS84
//! legs use inline math, everything else goes through `proj4rs`.

use std::f64::consts::PI;

use geo::{Coord, LineString, MultiPolygon, Polygon};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::error::{DsmError, Result};

/// WGS84 geographic lon/lat.
pub const EPSG_WGS84: u32 = 4326;

/// Spherical Web Mercator.
pub const EPSG_WEB_MERCATOR: u32 = 3857;

/// Legacy alias of Web Mercator still found in older point-cloud metadata.
const EPSG_GOOGLE_MERCATOR: u32 = 900913;

/// Web Mercator sphere radius in metres.
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Returns the proj4 definition for a supported EPSG code.
pub fn proj_string(epsg: u32) -> Option<String> {
    match epsg {
        EPSG_WGS84 => Some("+proj=longlat +datum=WGS84 +no_defs".to_string()),
        4269 => Some("+proj=longlat +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +no_defs".to_string()),
        EPSG_WEB_MERCATOR | EPSG_GOOGLE_MERCATOR => Some(
            "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
                .to_string(),
        ),
        32601..=32660 => Some(format!(
            "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
            epsg - 32600
        )),
        32701..=32760 => Some(format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            epsg - 32700
        )),
        26901..=26923 => Some(format!(
            "+proj=utm +zone={} +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs",
            epsg - 26900
        )),
        _ => None,
    }
}

/// Whether the EPSG code is geographic (degrees rather than metres).
pub fn is_geographic(epsg: u32) -> bool {
    matches!(epsg, EPSG_WGS84 | 4269)
}

/// Web Mercator metres from WGS84 degrees.
pub fn lon_lat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let x = lon.to_radians() * EARTH_RADIUS;
    let y = (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() * EARTH_RADIUS;
    (x, y)
}

/// WGS84 degrees from Web Mercator metres.
pub fn mercator_to_lon_lat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    (lon, lat)
}

enum Leg {
    Wgs84,
    WebMercator,
    Proj { proj: Box<Proj>, geographic: bool },
}

impl Leg {
    fn new(epsg: u32) -> Result<Self> {
        match epsg {
            EPSG_WGS84 => Ok(Leg::Wgs84),
            EPSG_WEB_MERCATOR | EPSG_GOOGLE_MERCATOR => Ok(Leg::WebMercator),
            _ => {
                let definition = proj_string(epsg).ok_or(DsmError::UnsupportedCrs { epsg })?;
                let proj =
                    Proj::from_proj_string(&definition).map_err(|e| DsmError::Projection {
                        source_epsg: epsg,
                        target_epsg: epsg,
                        reason: format!("{:?}", e),
                    })?;
                Ok(Leg::Proj {
                    proj: Box::new(proj),
                    geographic: is_geographic(epsg),
                })
            }
        }
    }
}

/// Reusable transform between two EPSG codes.
///
/// ```ignore
/// use dsm::crs::CrsTransformer;
///
/// let to_utm = CrsTransformer::new(4326, 32610)?;
/// let (easting, northing) = to_utm.transform(-122.4, 37.8)?;
/// ```
pub struct CrsTransformer {
    source_epsg: u32,
    target_epsg: u32,
    source: Leg,
    target: Leg,
    pivot: Option<Proj>,
}

impl std::fmt::Debug for CrsTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrsTransformer")
            .field("source_epsg", &self.source_epsg)
            .field("target_epsg", &self.target_epsg)
            .finish_non_exhaustive()
    }
}

impl CrsTransformer {
    /// Create a transformer from `source_epsg` to `target_epsg`.
    ///
    /// # Errors
    ///
    /// Returns [`DsmError::UnsupportedCrs`] if either code has no known
    /// definition.
    pub fn new(source_epsg: u32, target_epsg: u32) -> Result<Self> {
        let source = Leg::new(source_epsg)?;
        let target = Leg::new(target_epsg)?;

        let needs_pivot = matches!(source, Leg::Proj { .. }) || matches!(target, Leg::Proj { .. });
        let pivot = if needs_pivot && source_epsg != target_epsg {
            let definition =
                proj_string(EPSG_WGS84).ok_or(DsmError::UnsupportedCrs { epsg: EPSG_WGS84 })?;
            Some(
                Proj::from_proj_string(&definition).map_err(|e| DsmError::Projection {
                    source_epsg,
                    target_epsg,
                    reason: format!("{:?}", e),
                })?,
            )
        } else {
            None
        };

        Ok(Self {
            source_epsg,
            target_epsg,
            source,
            target,
            pivot,
        })
    }

    /// Source EPSG code.
    pub fn source_epsg(&self) -> u32 {
        self.source_epsg
    }

    /// Target EPSG code.
    pub fn target_epsg(&self) -> u32 {
        self.target_epsg
    }

    /// Transform a single `(x, y)` pair. Geographic CRSs use `(lon, lat)` order.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        if self.source_epsg == self.target_epsg {
            return Ok((x, y));
        }
        let (lon, lat) = self.to_wgs84(x, y)?;
        self.from_wgs84(lon, lat)
    }

    /// Transform every vertex of a polygon.
    pub fn transform_polygon(&self, polygon: &Polygon<f64>) -> Result<Polygon<f64>> {
        let exterior = self.transform_ring(polygon.exterior())?;
        let interiors = polygon
            .interiors()
            .iter()
            .map(|ring| self.transform_ring(ring))
            .collect::<Result<Vec<_>>>()?;
        Ok(Polygon::new(exterior, interiors))
    }

    /// Transform every polygon of a multipolygon.
    pub fn transform_multi_polygon(&self, shape: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
        let polygons = shape
            .iter()
            .map(|p| self.transform_polygon(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(MultiPolygon::new(polygons))
    }

    fn transform_ring(&self, ring: &LineString<f64>) -> Result<LineString<f64>> {
        ring.coords()
            .map(|c| self.transform(c.x, c.y).map(|(x, y)| Coord { x, y }))
            .collect::<Result<Vec<_>>>()
            .map(LineString::new)
    }

    fn to_wgs84(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        match &self.source {
            Leg::Wgs84 => Ok((x, y)),
            Leg::WebMercator => Ok(mercator_to_lon_lat(x, y)),
            Leg::Proj { proj, geographic } => {
                let (in_x, in_y) = if *geographic {
                    (x.to_radians(), y.to_radians())
                } else {
                    (x, y)
                };
                let mut point = (in_x, in_y, 0.0);
                let pivot = self.pivot_proj()?;
                transform(proj, pivot, &mut point).map_err(|e| self.projection_error(e))?;
                Ok((point.0.to_degrees(), point.1.to_degrees()))
            }
        }
    }

    fn from_wgs84(&self, lon: f64, lat: f64) -> Result<(f64, f64)> {
        match &self.target {
            Leg::Wgs84 => Ok((lon, lat)),
            Leg::WebMercator => Ok(lon_lat_to_mercator(lon, lat)),
            Leg::Proj { proj, geographic } => {
                let mut point = (lon.to_radians(), lat.to_radians(), 0.0);
                let pivot = self.pivot_proj()?;
                transform(pivot, proj, &mut point).map_err(|e| self.projection_error(e))?;
                if *geographic {
                    Ok((point.0.to_degrees(), point.1.to_degrees()))
                } else {
                    Ok((point.0, point.1))
                }
            }
        }
    }

    fn pivot_proj(&self) -> Result<&Proj> {
        self.pivot.as_ref().ok_or_else(|| DsmError::Projection {
            source_epsg: self.source_epsg,
            target_epsg: self.target_epsg,
            reason: "missing WGS84 pivot".to_string(),
        })
    }

    fn projection_error(&self, e: impl std::fmt::Debug) -> DsmError {
        DsmError::Projection {
            source_epsg: self.source_epsg,
            target_epsg: self.target_epsg,
            reason: format!("{:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let t = CrsTransformer::new(3857, 3857).unwrap();
        assert_eq!(t.transform(1234.5, -678.9).unwrap(), (1234.5, -678.9));
    }

    #[test]
    fn test_web_mercator_roundtrip() {
        let to_merc = CrsTransformer::new(EPSG_WGS84, EPSG_WEB_MERCATOR).unwrap();
        let to_geo = CrsTransformer::new(EPSG_WEB_MERCATOR, EPSG_WGS84).unwrap();

        let (x, y) = to_merc.transform(-122.149, 37.485).unwrap();
        assert!((x - (-13_597_564.48)).abs() < 0.01, "x = {}", x);

        let (lon, lat) = to_geo.transform(x, y).unwrap();
        assert!((lon - (-122.149)).abs() < 1e-9);
        assert!((lat - 37.485).abs() < 1e-9);
    }

    #[test]
    fn test_origin_maps_to_origin() {
        let (x, y) = lon_lat_to_mercator(0.0, 0.0);
        assert!(x.abs() < 1e-9);
        assert!(y.abs() < 1e-9);
    }

    #[test]
    fn test_utm_zone_10() {
        let to_utm = CrsTransformer::new(EPSG_WGS84, 32610).unwrap();
        // Central meridian of zone 10 is -123; easting there is 500 km
        let (easting, northing) = to_utm.transform(-123.0, 37.0).unwrap();
        assert!((easting - 500_000.0).abs() < 1.0, "easting = {}", easting);
        assert!(northing > 4_000_000.0 && northing < 4_200_000.0);

        let back = CrsTransformer::new(32610, EPSG_WGS84).unwrap();
        let (lon, lat) = back.transform(easting, northing).unwrap();
        assert!((lon - (-123.0)).abs() < 1e-6);
        assert!((lat - 37.0).abs() < 1e-6);
    }

    #[test]
    fn test_unsupported_crs() {
        let err = CrsTransformer::new(EPSG_WGS84, 2154).unwrap_err();
        assert!(matches!(err, DsmError::UnsupportedCrs { epsg: 2154 }));
    }

    #[test]
    fn test_google_alias_is_web_mercator() {
        let a = CrsTransformer::new(EPSG_WGS84, 900913).unwrap();
        let b = CrsTransformer::new(EPSG_WGS84, EPSG_WEB_MERCATOR).unwrap();
        assert_eq!(a.transform(10.0, 45.0).unwrap(), b.transform(10.0, 45.0).unwrap());
    }
}
