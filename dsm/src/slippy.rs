//! Slippy-map tile math.
//!
//! Converts between WGS84 coordinates and Web-Mercator tile indices
//! (`https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames`).
//!
//! # Tile Scheme
//!
//! At zoom `z` the world is split into `2^z × 2^z` tiles. `x` grows eastward
//! from the antimeridian and `y` grows southward from the northern Mercator
//! limit (≈85.0511°).

use std::f64::consts::PI;

use geo::{BoundingRect, ConvexHull, Coord, MultiPoint, Point, Polygon, Rect};
use serde::{Deserialize, Serialize};

use crate::crs::{CrsTransformer, EPSG_WGS84};
use crate::error::{DsmError, Result};

/// Default zoom for export and sampling tiles.
pub const DEFAULT_OUTPUT_ZOOM: u8 = 17;

/// Default buffer added around tile bounds: 1/6 arc-second in degrees.
pub const BUFFER_TILE: f64 = 1.0 / 3600.0 / 6.0;

/// Latitude limit of the Web-Mercator projection.
pub const MAX_LAT: f64 = 85.051_128_779_806_59;

/// Highest zoom accepted by the tile math.
pub const MAX_ZOOM: u8 = 24;

/// A slippy tile index `(x, y)` at a zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub zoom: u8,
}

impl TileCoord {
    pub fn new(x: u32, y: u32, zoom: u8) -> Self {
        Self { x, y, zoom }
    }

    /// WGS84 rectangle covered by this tile.
    pub fn bounds(&self) -> Rect<f64> {
        tile_to_bounds(self.x, self.y, self.zoom)
    }

    /// Center of the tile as a `(lon, lat)` point.
    pub fn center(&self) -> Point<f64> {
        self.bounds().center().into()
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

fn tiles_per_axis(zoom: u8) -> f64 {
    2.0_f64.powi(zoom as i32)
}

/// Tile containing a WGS84 coordinate.
///
/// Latitudes beyond the Mercator limit (including the poles) are clamped to
/// the first/last tile row instead of producing NaN, and longitudes are
/// clamped into `[-180, 180]` with `180` folded into the last column.
///
/// # Examples
///
/// ```
/// use dsm::slippy::point_to_tile;
///
/// let tile = point_to_tile(40.7128, -74.0060, 16);
/// assert_eq!((tile.x, tile.y), (19295, 24640));
/// ```
pub fn point_to_tile(lat: f64, lon: f64, zoom: u8) -> TileCoord {
    let n = tiles_per_axis(zoom);
    let max_index = (n as u64).saturating_sub(1) as f64;

    let lat = lat.clamp(-MAX_LAT, MAX_LAT);
    let lon = lon.clamp(-180.0, 180.0);

    let x = ((lon + 180.0) / 360.0 * n).floor();
    let lat_rad = lat.to_radians();
    let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n).floor();

    TileCoord {
        x: x.clamp(0.0, max_index) as u32,
        y: y.clamp(0.0, max_index) as u32,
        zoom,
    }
}

/// North-west corner of tile `(x, y)` as `(lat, lon)`.
fn tile_corner(x: f64, y: f64, zoom: u8) -> (f64, f64) {
    let n = tiles_per_axis(zoom);
    let lon = x / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    (lat, lon)
}

/// WGS84 rectangle of a tile; `x` is longitude and `y` is latitude.
pub fn tile_to_bounds(x: u32, y: u32, zoom: u8) -> Rect<f64> {
    let (lat_max, lon_min) = tile_corner(x as f64, y as f64, zoom);
    let (lat_min, lon_max) = tile_corner(x as f64 + 1.0, y as f64 + 1.0, zoom);
    Rect::new(
        Coord {
            x: lon_min,
            y: lat_min,
        },
        Coord {
            x: lon_max,
            y: lat_max,
        },
    )
}

/// Polygon form of [`tile_to_bounds`].
pub fn tile_to_polygon(x: u32, y: u32, zoom: u8) -> Polygon<f64> {
    tile_to_bounds(x, y, zoom).to_polygon()
}

/// All tiles in the rectangle spanned by the geometry's bounding box.
///
/// This over-covers non-rectangular shapes; callers that need exact coverage
/// filter the result by intersection. Returns tiles in column-major order
/// (`x` outer, `y` inner). Empty geometries cover no tiles.
pub fn tiles_covering<G>(geometry: &G, zoom: u8) -> Vec<TileCoord>
where
    G: BoundingRect<f64>,
    G::Output: Into<Option<Rect<f64>>>,
{
    let rect: Option<Rect<f64>> = geometry.bounding_rect().into();
    let Some(rect) = rect else {
        return Vec::new();
    };
    tiles_in_rect(&rect, zoom)
}

/// All tiles touching a WGS84 rectangle.
pub fn tiles_in_rect(rect: &Rect<f64>, zoom: u8) -> Vec<TileCoord> {
    let north_west = point_to_tile(rect.max().y, rect.min().x, zoom);
    let south_east = point_to_tile(rect.min().y, rect.max().x, zoom);

    let mut tiles = Vec::new();
    for x in north_west.x..=south_east.x {
        for y in north_west.y..=south_east.y {
            tiles.push(TileCoord { x, y, zoom });
        }
    }
    tiles
}

/// Grow a polygon by `margin_degrees`.
///
/// The buffer is computed in WGS84: polygons in another CRS are reprojected
/// there, grown, then reprojected back. The result is the convex hull of the
/// polygon's vertices each expanded to a square of half-width `margin_degrees`,
/// which is exact for rectangles such as tile bounds.
///
/// # Errors
///
/// Returns an error if `crs` cannot be transformed to WGS84 or the polygon is
/// empty.
pub fn buffer_polygon(polygon: &Polygon<f64>, margin_degrees: f64, crs: u32) -> Result<Polygon<f64>> {
    if polygon.exterior().0.is_empty() {
        return Err(DsmError::InvalidGeometry {
            reason: "cannot buffer an empty polygon".to_string(),
        });
    }

    let geographic = if crs == EPSG_WGS84 {
        polygon.clone()
    } else {
        CrsTransformer::new(crs, EPSG_WGS84)?.transform_polygon(polygon)?
    };

    let expanded: Vec<Point<f64>> = geographic
        .exterior()
        .coords()
        .flat_map(|c| {
            [
                (-margin_degrees, -margin_degrees),
                (margin_degrees, -margin_degrees),
                (margin_degrees, margin_degrees),
                (-margin_degrees, margin_degrees),
            ]
            .into_iter()
            .map(move |(dx, dy)| Point::new(c.x + dx, c.y + dy))
        })
        .collect();
    let buffered = MultiPoint::new(expanded).convex_hull();

    if crs == EPSG_WGS84 {
        Ok(buffered)
    } else {
        CrsTransformer::new(EPSG_WGS84, crs)?.transform_polygon(&buffered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Contains};
    use proptest::prelude::*;

    #[test]
    fn test_new_york_city_at_zoom_16() {
        let tile = point_to_tile(40.7128, -74.0060, 16);
        assert_eq!(tile, TileCoord::new(19295, 24640, 16));
    }

    #[test]
    fn test_poles_clamp_instead_of_nan() {
        let north = point_to_tile(90.0, 0.0, 10);
        assert_eq!(north.y, 0);

        let south = point_to_tile(-90.0, 0.0, 10);
        assert_eq!(south.y, 1023);

        let east = point_to_tile(0.0, 180.0, 10);
        assert_eq!(east.x, 1023);
    }

    #[test]
    fn test_zoom_zero_is_single_tile() {
        assert_eq!(point_to_tile(45.0, 45.0, 0), TileCoord::new(0, 0, 0));
        assert_eq!(point_to_tile(-45.0, -45.0, 0), TileCoord::new(0, 0, 0));
    }

    #[test]
    fn test_tile_bounds_at_equator() {
        let bounds = tile_to_bounds(512, 512, 10);
        assert!(bounds.min().x.abs() < 1e-9);
        assert!(bounds.max().y.abs() < 1e-9);
        assert!(bounds.max().x > 0.0);
        assert!(bounds.min().y < 0.0);
    }

    #[test]
    fn test_corners_are_exact_inverse() {
        let (x, y, z) = (21023, 50669, 17);
        let bounds = tile_to_bounds(x, y, z);
        // North-west corner maps back within one tile of float tolerance
        let tile = point_to_tile(bounds.max().y, bounds.min().x, z);
        assert!((tile.x as i64 - x as i64).abs() <= 1);
        assert!((tile.y as i64 - y as i64).abs() <= 1);
        // Neighbours share edges exactly
        let east = tile_to_bounds(x + 1, y, z);
        assert_eq!(east.min().x, bounds.max().x);
        let south = tile_to_bounds(x, y + 1, z);
        assert_eq!(south.max().y, bounds.min().y);
    }

    #[test]
    fn test_polygon_inside_one_tile_covers_one_tile() {
        let bounds = tile_to_bounds(10, 20, 17);
        let c = bounds.center();
        let w = bounds.width() / 4.0;
        let h = bounds.height() / 4.0;
        let poly = polygon![
            (x: c.x - w, y: c.y - h),
            (x: c.x + w, y: c.y - h),
            (x: c.x + w, y: c.y + h),
            (x: c.x - w, y: c.y + h),
            (x: c.x - w, y: c.y - h),
        ];
        assert_eq!(tiles_covering(&poly, 17), vec![TileCoord::new(10, 20, 17)]);
    }

    #[test]
    fn test_polygon_spanning_two_by_two_tiles() {
        let nw = tile_to_bounds(10, 20, 17);
        let se = tile_to_bounds(11, 21, 17);
        let inset_x = nw.width() / 10.0;
        let inset_y = nw.height() / 10.0;
        let poly = polygon![
            (x: nw.min().x + inset_x, y: se.min().y + inset_y),
            (x: se.max().x - inset_x, y: se.min().y + inset_y),
            (x: se.max().x - inset_x, y: nw.max().y - inset_y),
            (x: nw.min().x + inset_x, y: nw.max().y - inset_y),
            (x: nw.min().x + inset_x, y: se.min().y + inset_y),
        ];
        let tiles = tiles_covering(&poly, 17);
        assert_eq!(
            tiles,
            vec![
                TileCoord::new(10, 20, 17),
                TileCoord::new(10, 21, 17),
                TileCoord::new(11, 20, 17),
                TileCoord::new(11, 21, 17),
            ]
        );
    }

    #[test]
    fn test_buffer_contains_original() {
        let tile = tile_to_polygon(21023, 50669, 17);
        let buffered = buffer_polygon(&tile, BUFFER_TILE, EPSG_WGS84).unwrap();
        assert!(buffered.contains(&tile));

        let rect = buffered.bounding_rect().unwrap();
        let original = tile.bounding_rect().unwrap();
        assert!((original.min().x - rect.min().x - BUFFER_TILE).abs() < 1e-12);
        assert!((rect.max().y - original.max().y - BUFFER_TILE).abs() < 1e-12);
    }

    #[test]
    fn test_buffer_in_projected_crs() {
        let to_merc = CrsTransformer::new(EPSG_WGS84, 3857).unwrap();
        let tile = tile_to_polygon(21023, 50669, 17);
        let projected = to_merc.transform_polygon(&tile).unwrap();
        let buffered = buffer_polygon(&projected, BUFFER_TILE, 3857).unwrap();
        assert!(buffered.contains(&projected));
    }

    #[test]
    fn test_buffer_empty_polygon_fails() {
        let empty = Polygon::new(geo::LineString::new(vec![]), vec![]);
        assert!(buffer_polygon(&empty, BUFFER_TILE, EPSG_WGS84).is_err());
    }

    proptest! {
        #[test]
        fn prop_center_roundtrips_to_same_tile(zoom in 0u8..=20, fx in 0.0f64..1.0, fy in 0.0f64..1.0) {
            let n = 1u64 << zoom;
            let x = ((fx * n as f64) as u64).min(n - 1) as u32;
            let y = ((fy * n as f64) as u64).min(n - 1) as u32;
            let center = tile_to_bounds(x, y, zoom).center();
            let tile = point_to_tile(center.y, center.x, zoom);
            prop_assert_eq!((tile.x, tile.y), (x, y));
        }
    }
}
