//! Point-cloud dataset metadata.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use geo::{Intersects, MultiPolygon, Point, Polygon, Rect};

use crate::error::{DsmError, Result};

/// Catalog identifier of a point-cloud dataset.
pub type DatasetId = u64;

/// An area used to query the catalog.
///
/// Coordinates are WGS84 `(lon, lat)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Area {
    Point(Point<f64>),
    Rect(Rect<f64>),
    Polygon(Polygon<f64>),
    MultiPolygon(MultiPolygon<f64>),
}

impl From<Point<f64>> for Area {
    fn from(p: Point<f64>) -> Self {
        Area::Point(p)
    }
}

impl From<Rect<f64>> for Area {
    fn from(r: Rect<f64>) -> Self {
        Area::Rect(r)
    }
}

impl From<Polygon<f64>> for Area {
    fn from(p: Polygon<f64>) -> Self {
        Area::Polygon(p)
    }
}

impl From<MultiPolygon<f64>> for Area {
    fn from(p: MultiPolygon<f64>) -> Self {
        Area::MultiPolygon(p)
    }
}

/// Metadata about one aerial point-cloud collection.
///
/// Boundaries are stored in WGS84. `srs` is the dataset's native CRS, which
/// is also the CRS of the DSM tiles generated from it.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloudDataset {
    pub id: DatasetId,
    pub name: String,
    /// Number of points in the dataset.
    pub count: u64,
    /// Location of the point cloud (e.g. an EPT endpoint).
    pub url: String,
    /// Low-resolution boundary; may miss small areas.
    pub boundary: Option<MultiPolygon<f64>>,
    /// Expensive high-resolution boundary, attached after ingestion.
    pub high_resolution_boundary: Option<MultiPolygon<f64>>,
    /// Native EPSG code.
    pub srs: u32,
    pub collection_start: Option<NaiveDate>,
    pub collection_end: Option<NaiveDate>,
    /// Requires outlier filtering before use. Not consulted by source selection.
    pub noisy: bool,
    /// Invalidated datasets are hidden from intersection queries.
    pub valid: bool,
    pub created: DateTime<Utc>,
}

impl PointCloudDataset {
    /// Create a valid dataset with no boundary and no collection dates.
    pub fn new(id: DatasetId, name: impl Into<String>, srs: u32) -> Self {
        Self {
            id,
            name: name.into(),
            count: 0,
            url: String::new(),
            boundary: None,
            high_resolution_boundary: None,
            srs,
            collection_start: None,
            collection_end: None,
            noisy: false,
            valid: true,
            created: Utc::now(),
        }
    }

    pub fn with_boundary(mut self, boundary: impl Into<MultiPolygon<f64>>) -> Self {
        self.boundary = Some(boundary.into());
        self
    }

    pub fn with_collection_dates(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.collection_start = start;
        self.collection_end = end;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn with_noisy(mut self, noisy: bool) -> Self {
        self.noisy = noisy;
        self
    }

    pub fn with_valid(mut self, valid: bool) -> Self {
        self.valid = valid;
        self
    }

    /// The boundary used for intersection: high-resolution when present.
    pub fn effective_boundary(&self) -> Option<&MultiPolygon<f64>> {
        self.high_resolution_boundary
            .as_ref()
            .or(self.boundary.as_ref())
    }

    /// Whether the dataset's effective boundary intersects `area`.
    ///
    /// Datasets without a boundary never intersect anything.
    pub fn intersects(&self, area: &Area) -> bool {
        let Some(boundary) = self.effective_boundary() else {
            return false;
        };
        match area {
            Area::Point(p) => boundary.intersects(p),
            Area::Rect(r) => boundary.intersects(r),
            Area::Polygon(p) => boundary.intersects(p),
            Area::MultiPolygon(m) => boundary.intersects(m),
        }
    }

    /// Check both boundaries are well-formed WGS84 shapes.
    pub fn validate(&self) -> Result<()> {
        for shape in [&self.boundary, &self.high_resolution_boundary]
            .into_iter()
            .flatten()
        {
            validate_boundary(shape)?;
        }
        Ok(())
    }
}

/// Recency order: newest collection end first, then newest start, then id.
///
/// A missing date sorts as the oldest possible date. The order is total, so
/// sorting with it is deterministic.
pub fn recency_order(a: &PointCloudDataset, b: &PointCloudDataset) -> Ordering {
    let end = |d: &PointCloudDataset| d.collection_end.unwrap_or(NaiveDate::MIN);
    let start = |d: &PointCloudDataset| d.collection_start.unwrap_or(NaiveDate::MIN);
    end(b)
        .cmp(&end(a))
        .then_with(|| start(b).cmp(&start(a)))
        .then_with(|| a.id.cmp(&b.id))
}

/// Reject empty, unclosed, non-finite or out-of-range boundary rings.
pub fn validate_boundary(shape: &MultiPolygon<f64>) -> Result<()> {
    if shape.0.is_empty() {
        return Err(DsmError::InvalidGeometry {
            reason: "boundary has no polygons".to_string(),
        });
    }
    for polygon in shape.iter() {
        for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
            if ring.0.len() < 4 {
                return Err(DsmError::InvalidGeometry {
                    reason: format!("ring has {} coordinates, need at least 4", ring.0.len()),
                });
            }
            if !ring.is_closed() {
                return Err(DsmError::InvalidGeometry {
                    reason: "ring is not closed".to_string(),
                });
            }
            for c in ring.coords() {
                if !c.x.is_finite()
                    || !c.y.is_finite()
                    || !(-180.0..=180.0).contains(&c.x)
                    || !(-90.0..=90.0).contains(&c.y)
                {
                    return Err(DsmError::InvalidGeometry {
                        reason: format!("coordinate ({}, {}) outside WGS84 range", c.x, c.y),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, LineString};

    fn square(min_x: f64, min_y: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: min_x, y: min_y),
            (x: min_x + size, y: min_y),
            (x: min_x + size, y: min_y + size),
            (x: min_x, y: min_y + size),
            (x: min_x, y: min_y),
        ]
    }

    fn date(y: i32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, 6, 1)
    }

    #[test]
    fn test_high_resolution_boundary_wins() {
        let mut ds = PointCloudDataset::new(1, "CA_SanFranCoast_2010", 3857)
            .with_boundary(square(0.0, 0.0, 10.0));
        let far = Area::Point(Point::new(5.0, 5.0));
        assert!(ds.intersects(&far));

        ds.high_resolution_boundary = Some(square(0.0, 0.0, 1.0).into());
        assert!(!ds.intersects(&far));
        assert!(ds.intersects(&Area::Point(Point::new(0.5, 0.5))));
    }

    #[test]
    fn test_no_boundary_never_intersects() {
        let ds = PointCloudDataset::new(1, "empty", 3857);
        assert!(!ds.intersects(&Area::Polygon(square(-180.0, -90.0, 180.0))));
    }

    #[test]
    fn test_recency_order() {
        let old = PointCloudDataset::new(1, "old", 3857).with_collection_dates(date(2009), date(2010));
        let new = PointCloudDataset::new(2, "new", 3857).with_collection_dates(date(2020), date(2021));
        let undated = PointCloudDataset::new(3, "undated", 3857);
        let same_end_later_start =
            PointCloudDataset::new(4, "late", 3857).with_collection_dates(date(2010), date(2010));

        let mut all = vec![undated.clone(), old.clone(), new.clone(), same_end_later_start.clone()];
        all.sort_by(recency_order);
        let ids: Vec<_> = all.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_recency_ties_break_on_id() {
        let a = PointCloudDataset::new(9, "a", 3857).with_collection_dates(date(2015), date(2016));
        let b = PointCloudDataset::new(3, "b", 3857).with_collection_dates(date(2015), date(2016));
        assert_eq!(recency_order(&a, &b), Ordering::Greater);
        assert_eq!(recency_order(&b, &a), Ordering::Less);
    }

    #[test]
    fn test_validate_boundary() {
        assert!(validate_boundary(&square(0.0, 0.0, 1.0).into()).is_ok());
        assert!(validate_boundary(&MultiPolygon::new(vec![])).is_err());

        let degenerate = Polygon::new(LineString::from(vec![(0.0, 0.0), (1.0, 0.0)]), vec![]);
        assert!(validate_boundary(&degenerate.into()).is_err());

        let not_finite = square(f64::NAN, 0.0, 1.0);
        assert!(validate_boundary(&not_finite.into()).is_err());

        let out_of_range = square(179.5, 0.0, 1.0);
        assert!(validate_boundary(&out_of_range.into()).is_err());
    }
}
