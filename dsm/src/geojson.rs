//! GeoJSON input and output.
//!
//! Parses areas of interest and dataset catalogs from GeoJSON, and adds
//! DSM elevations to GeoJSON geometries. Enable the `geojson` feature to use
//! this module.
//!
//! # Example
//!
//! ```ignore
//! use dsm::geojson::parse_area;
//! use dsm::InMemoryCatalog;
//!
//! let catalog = InMemoryCatalog::from_geojson(&std::fs::read_to_string("datasets.geojson")?)?;
//! let aoi = parse_area(r#"{"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}"#)?;
//! ```

use chrono::NaiveDate;
use geo::{Coord, LineString, MultiPolygon, Polygon};
use geojson::{Feature, GeoJson, Geometry, JsonValue, Value as GeoJsonValue};

use crate::catalog::{Catalog, InMemoryCatalog};
use crate::crs::EPSG_WGS84;
use crate::dataset::{validate_boundary, PointCloudDataset};
use crate::engine::DsmEngine;
use crate::error::{DsmError, Result};
use crate::profile::SurfaceProfile;

fn invalid(reason: impl Into<String>) -> DsmError {
    DsmError::InvalidGeometry {
        reason: reason.into(),
    }
}

/// Parse a GeoJSON document into a WGS84 multipolygon.
///
/// Accepts a bare geometry, a feature or a feature collection. Polygons and
/// multipolygons from every feature are combined; other geometry types are
/// rejected.
pub fn parse_area(text: &str) -> Result<MultiPolygon<f64>> {
    let geojson: GeoJson = text
        .parse()
        .map_err(|e: geojson::Error| invalid(format!("Invalid GeoJSON: {}", e)))?;

    let geometries: Vec<Geometry> = match geojson {
        GeoJson::Geometry(g) => vec![g],
        GeoJson::Feature(f) => f.geometry.into_iter().collect(),
        GeoJson::FeatureCollection(fc) => fc.features.into_iter().filter_map(|f| f.geometry).collect(),
    };

    let mut polygons = Vec::new();
    for geometry in &geometries {
        polygons.extend(geometry_to_multi_polygon(geometry)?.0);
    }
    let area = MultiPolygon::new(polygons);
    validate_boundary(&area)?;
    Ok(area)
}

/// Convert a Polygon, MultiPolygon or GeometryCollection of them.
pub fn geometry_to_multi_polygon(geometry: &Geometry) -> Result<MultiPolygon<f64>> {
    match &geometry.value {
        GeoJsonValue::Polygon(rings) => Ok(MultiPolygon::new(vec![to_polygon(rings)?])),
        GeoJsonValue::MultiPolygon(polygons) => {
            let polygons: Result<Vec<_>> = polygons.iter().map(|p| to_polygon(p)).collect();
            Ok(MultiPolygon::new(polygons?))
        }
        GeoJsonValue::GeometryCollection(geometries) => {
            let mut polygons = Vec::new();
            for g in geometries {
                polygons.extend(geometry_to_multi_polygon(g)?.0);
            }
            Ok(MultiPolygon::new(polygons))
        }
        _ => Err(invalid("Expected Polygon or MultiPolygon geometry")),
    }
}

fn to_polygon(rings: &[Vec<Vec<f64>>]) -> Result<Polygon<f64>> {
    let mut rings = rings.iter().map(|ring| to_line_string(ring));
    let exterior = rings.next().ok_or_else(|| invalid("Polygon has no rings"))??;
    let interiors: Result<Vec<_>> = rings.collect();
    Ok(Polygon::new(exterior, interiors?))
}

fn to_line_string(ring: &[Vec<f64>]) -> Result<LineString<f64>> {
    ring.iter()
        .map(|position| match position.as_slice() {
            [x, y, ..] => Ok(Coord { x: *x, y: *y }),
            _ => Err(invalid("Position must have at least 2 elements (lon, lat)")),
        })
        .collect::<Result<Vec<_>>>()
        .map(LineString::new)
}

/// Build a dataset from a catalog feature.
///
/// # Properties
///
/// | Property | Type | Default |
/// |----------|------|---------|
/// | `id` | integer | feature id |
/// | `name` | string | Required |
/// | `srs` | integer EPSG code | 4326 |
/// | `count` | integer | 0 |
/// | `url` | string | empty |
/// | `collect_start`, `collect_end` | `YYYY-MM-DD` | none |
/// | `noisy` | bool | false |
/// | `valid` | bool | true |
///
/// The feature geometry becomes the dataset boundary.
pub fn dataset_from_feature(feature: &Feature) -> Result<PointCloudDataset> {
    let id = feature
        .property("id")
        .and_then(JsonValue::as_u64)
        .or_else(|| match &feature.id {
            Some(geojson::feature::Id::Number(n)) => n.as_u64(),
            Some(geojson::feature::Id::String(s)) => s.parse().ok(),
            None => None,
        })
        .ok_or_else(|| invalid("Dataset feature has no integer id"))?;
    let name = feature
        .property("name")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid(format!("Dataset {} has no name", id)))?;
    let srs = feature
        .property("srs")
        .and_then(JsonValue::as_u64)
        .map_or(Ok(EPSG_WGS84), |s| {
            u32::try_from(s).map_err(|_| invalid(format!("Dataset {} has invalid srs {}", id, s)))
        })?;

    let date = |key: &str| -> Result<Option<NaiveDate>> {
        match feature.property(key).and_then(JsonValue::as_str) {
            None => Ok(None),
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(Some)
                .map_err(|e| invalid(format!("Dataset {} has invalid {} {:?}: {}", id, key, raw, e))),
        }
    };
    let flag = |key: &str, default: bool| feature.property(key).and_then(JsonValue::as_bool).unwrap_or(default);

    let mut dataset = PointCloudDataset::new(id, name, srs)
        .with_collection_dates(date("collect_start")?, date("collect_end")?)
        .with_count(feature.property("count").and_then(JsonValue::as_u64).unwrap_or(0))
        .with_noisy(flag("noisy", false))
        .with_valid(flag("valid", true));
    if let Some(url) = feature.property("url").and_then(JsonValue::as_str) {
        dataset = dataset.with_url(url);
    }
    if let Some(geometry) = &feature.geometry {
        dataset = dataset.with_boundary(geometry_to_multi_polygon(geometry)?);
    }
    Ok(dataset)
}

impl InMemoryCatalog {
    /// Load a catalog from a GeoJSON feature collection, one dataset per
    /// feature (see [`dataset_from_feature`]).
    pub fn from_geojson(text: &str) -> Result<Self> {
        let geojson: GeoJson = text
            .parse()
            .map_err(|e: geojson::Error| invalid(format!("Invalid GeoJSON: {}", e)))?;
        let features = match geojson {
            GeoJson::FeatureCollection(fc) => fc.features,
            GeoJson::Feature(f) => vec![f],
            GeoJson::Geometry(_) => return Err(invalid("Catalog must be a Feature or FeatureCollection")),
        };

        let catalog = Self::new();
        for feature in &features {
            catalog.mark_dataset_added(dataset_from_feature(feature)?)?;
        }
        tracing::info!(datasets = catalog.len(), "Catalog loaded from GeoJSON");
        Ok(catalog)
    }
}

/// Profile as a 3D LineString `[lon, lat, elevation]`.
///
/// Samples without data get elevation 0.
pub fn profile_to_geometry(profile: &SurfaceProfile) -> Geometry {
    let coords = profile
        .points
        .iter()
        .map(|p| vec![p.lon, p.lat, p.elevation.unwrap_or(0.0) as f64])
        .collect();
    Geometry::new(GeoJsonValue::LineString(coords))
}

/// Add DSM elevations to all coordinates in a GeoJSON geometry.
///
/// Coordinates are `[lon, lat]` or `[lon, lat, alt]`; the result replaces
/// any third element with the DSM elevation (0 where there is no data).
/// Each ring or line is sampled in one batch.
///
/// ```ignore
/// let line: Geometry = r#"{
///     "type": "LineString",
///     "coordinates": [[-122.40, 37.78], [-122.39, 37.78]]
/// }"#.parse().unwrap();
///
/// let enriched = add_elevations_to_geometry(&engine, line)?;
/// // [[-122.40, 37.78, 12.5], [-122.39, 37.78, 31.0]]
/// ```
pub fn add_elevations_to_geometry(engine: &DsmEngine, geometry: Geometry) -> Result<Geometry> {
    let new_value = match geometry.value {
        GeoJsonValue::Point(coord) => {
            let mut elevated = add_elevation_to_coords(engine, &[coord])?;
            GeoJsonValue::Point(elevated.remove(0))
        }
        GeoJsonValue::MultiPoint(coords) => GeoJsonValue::MultiPoint(add_elevation_to_coords(engine, &coords)?),
        GeoJsonValue::LineString(coords) => GeoJsonValue::LineString(add_elevation_to_coords(engine, &coords)?),
        GeoJsonValue::MultiLineString(lines) => {
            let elevated: Result<Vec<_>> = lines
                .iter()
                .map(|line| add_elevation_to_coords(engine, line))
                .collect();
            GeoJsonValue::MultiLineString(elevated?)
        }
        GeoJsonValue::Polygon(rings) => {
            let elevated: Result<Vec<_>> = rings
                .iter()
                .map(|ring| add_elevation_to_coords(engine, ring))
                .collect();
            GeoJsonValue::Polygon(elevated?)
        }
        GeoJsonValue::MultiPolygon(polygons) => {
            let elevated: Result<Vec<_>> = polygons
                .iter()
                .map(|polygon| {
                    polygon
                        .iter()
                        .map(|ring| add_elevation_to_coords(engine, ring))
                        .collect::<Result<Vec<_>>>()
                })
                .collect();
            GeoJsonValue::MultiPolygon(elevated?)
        }
        GeoJsonValue::GeometryCollection(geometries) => {
            let elevated: Result<Vec<_>> = geometries
                .into_iter()
                .map(|g| add_elevations_to_geometry(engine, g))
                .collect();
            GeoJsonValue::GeometryCollection(elevated?)
        }
    };

    Ok(Geometry::new(new_value))
}

/// Add elevations to a list of GeoJSON positions.
pub fn add_elevation_to_coords(engine: &DsmEngine, coords: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    let points: Vec<(f64, f64)> = coords
        .iter()
        .map(|c| match c.as_slice() {
            [lon, lat, ..] => Ok((*lat, *lon)),
            _ => Err(invalid("Coordinate must have at least 2 elements (lon, lat)")),
        })
        .collect::<Result<_>>()?;

    let samples = engine.sample_elevations(&points)?;
    Ok(points
        .iter()
        .zip(samples)
        .map(|(&(lat, lon), sample)| vec![lon, lat, sample.legacy_value() as f64])
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Area;
    use crate::profile::sample_positions;
    use geo::Point;

    const CATALOG: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": {
                    "id": 1, "name": "CA_SanFranCoast_2010", "srs": 26910,
                    "count": 1200000, "url": "https://ept.example.com/sf2010",
                    "collect_start": "2010-04-01", "collect_end": "2010-07-31"
                },
                "geometry": {"type": "Polygon", "coordinates": [[[-122.5,37.7],[-122.3,37.7],[-122.3,37.9],[-122.5,37.9],[-122.5,37.7]]]}
            },
            {
                "type": "Feature",
                "id": 2,
                "properties": {"name": "CA_SF_2021", "collect_end": "2021-03-15", "noisy": true},
                "geometry": {"type": "Polygon", "coordinates": [[[-122.45,37.75],[-122.4,37.75],[-122.4,37.8],[-122.45,37.8],[-122.45,37.75]]]}
            }
        ]
    }"#;

    #[test]
    fn test_parse_area_polygon() {
        let area = parse_area(
            r#"{"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}"#,
        )
        .unwrap();
        assert_eq!(area.0.len(), 1);
        assert_eq!(area.0[0].exterior().0.len(), 4);
    }

    #[test]
    fn test_parse_area_feature_collection_combines() {
        let area = parse_area(CATALOG).unwrap();
        assert_eq!(area.0.len(), 2);
    }

    #[test]
    fn test_parse_area_rejects_points_and_garbage() {
        assert!(parse_area(r#"{"type": "Point", "coordinates": [0, 0]}"#).is_err());
        assert!(parse_area("not json").is_err());
        // Unclosed ring
        assert!(parse_area(r#"{"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1]]]}"#).is_err());
    }

    #[test]
    fn test_catalog_from_geojson() {
        let catalog = InMemoryCatalog::from_geojson(CATALOG).unwrap();
        assert_eq!(catalog.len(), 2);

        let sf = catalog.get(1).unwrap();
        assert_eq!(sf.srs, 26910);
        assert_eq!(sf.count, 1_200_000);
        assert_eq!(sf.collection_end, NaiveDate::from_ymd_opt(2010, 7, 31));

        let newer = catalog.get(2).unwrap();
        assert_eq!(newer.srs, EPSG_WGS84);
        assert!(newer.noisy);
        assert!(newer.valid);

        // Most recent first where both cover
        let hits = catalog.datasets_intersecting(&Area::Point(Point::new(-122.42, 37.77)));
        let ids: Vec<_> = hits.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_dataset_feature_requires_name_and_id() {
        let feature: Feature = r#"{"type": "Feature", "properties": {"id": 3}, "geometry": null}"#
            .parse()
            .unwrap();
        assert!(dataset_from_feature(&feature).is_err());

        let feature: Feature = r#"{"type": "Feature", "properties": {"name": "x"}, "geometry": null}"#
            .parse()
            .unwrap();
        assert!(dataset_from_feature(&feature).is_err());

        let feature: Feature =
            r#"{"type": "Feature", "properties": {"id": 3, "name": "x", "collect_end": "2021-13-01"}, "geometry": null}"#
                .parse()
                .unwrap();
        assert!(dataset_from_feature(&feature).is_err());
    }

    #[test]
    fn test_profile_to_geometry() {
        let positions = sample_positions(Point::new(0.0, 0.0), Point::new(0.001, 0.0), 3);
        let profile = SurfaceProfile::from_samples(&positions, &[Some(5.0), None, Some(7.0)]);
        let geometry = profile_to_geometry(&profile);
        if let GeoJsonValue::LineString(coords) = geometry.value {
            assert_eq!(coords.len(), 3);
            assert_eq!(coords[0], vec![0.0, 0.0, 5.0]);
            assert_eq!(coords[1][2], 0.0);
        } else {
            panic!("Expected LineString geometry");
        }
    }

    #[test]
    fn test_add_elevations_without_coverage() {
        let engine = DsmEngine::builder().build().unwrap();
        let geometry = Geometry::new(GeoJsonValue::LineString(vec![vec![0.5, 0.5], vec![0.6, 0.6, 99.0]]));
        let result = add_elevations_to_geometry(&engine, geometry).unwrap();
        if let GeoJsonValue::LineString(coords) = result.value {
            assert_eq!(coords, vec![vec![0.5, 0.5, 0.0], vec![0.6, 0.6, 0.0]]);
        } else {
            panic!("Expected LineString geometry");
        }

        let bad = Geometry::new(GeoJsonValue::Point(vec![0.5]));
        assert!(add_elevations_to_geometry(&engine, bad).is_err());
    }
}
