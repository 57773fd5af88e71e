//! Surface profiles between two points and line-of-sight checks.

use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

/// Default number of samples along a link.
pub const DEFAULT_PROFILE_SAMPLES: usize = 256;

/// One sample along a profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoint {
    pub lat: f64,
    pub lon: f64,
    /// Great-circle distance from the first point, metres.
    pub distance_m: f64,
    /// DSM elevation, `None` where no dataset has data.
    pub elevation: Option<f32>,
}

/// Evenly spaced DSM samples from a transmitter to a receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceProfile {
    pub points: Vec<ProfilePoint>,
}

/// Outcome of [`SurfaceProfile::line_of_sight`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineOfSight {
    pub clear: bool,
    /// Distance of the first sample that rises above the sight line.
    pub first_obstruction_m: Option<f64>,
    /// Largest height of the surface above the sight line (≤ 0 when clear).
    pub max_intrusion_m: f64,
}

/// `samples` points from `from` to `to` inclusive, as `(lon, lat)` points.
///
/// Positions are interpolated linearly in lon/lat, which is adequate for
/// links of a few kilometres.
pub fn sample_positions(from: Point<f64>, to: Point<f64>, samples: usize) -> Vec<Point<f64>> {
    match samples {
        0 => Vec::new(),
        1 => vec![from],
        n => (0..n)
            .map(|i| {
                let t = i as f64 / (n - 1) as f64;
                Point::new(
                    from.x() + (to.x() - from.x()) * t,
                    from.y() + (to.y() - from.y()) * t,
                )
            })
            .collect(),
    }
}

impl SurfaceProfile {
    /// Build a profile from positions and their sampled elevations.
    pub fn from_samples(positions: &[Point<f64>], elevations: &[Option<f32>]) -> Self {
        let origin = positions.first().copied();
        let points = positions
            .iter()
            .zip(elevations)
            .map(|(p, e)| ProfilePoint {
                lat: p.y(),
                lon: p.x(),
                distance_m: origin.map_or(0.0, |o| o.haversine_distance(p)),
                elevation: *e,
            })
            .collect();
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Link length in metres.
    pub fn total_distance_m(&self) -> f64 {
        self.points.last().map_or(0.0, |p| p.distance_m)
    }

    /// Fraction of samples with an elevation.
    pub fn coverage(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        let covered = self.points.iter().filter(|p| p.elevation.is_some()).count();
        covered as f64 / self.points.len() as f64
    }

    /// Whether the straight line between two antennas clears the surface.
    ///
    /// Antenna heights are metres above the surface at each endpoint; an
    /// endpoint without data counts as ground level 0. Intermediate samples
    /// without data are ignored. Earth curvature is not modelled.
    pub fn line_of_sight(&self, tx_height: f64, rx_height: f64) -> LineOfSight {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return LineOfSight {
                clear: true,
                first_obstruction_m: None,
                max_intrusion_m: f64::NEG_INFINITY,
            };
        };

        let tx = first.elevation.unwrap_or(0.0) as f64 + tx_height;
        let rx = last.elevation.unwrap_or(0.0) as f64 + rx_height;
        let length = last.distance_m;

        let mut first_obstruction_m = None;
        let mut max_intrusion_m = f64::NEG_INFINITY;
        let inner = self.points.len().saturating_sub(1);
        for point in self.points.iter().take(inner).skip(1) {
            let Some(surface) = point.elevation else {
                continue;
            };
            let t = if length > 0.0 { point.distance_m / length } else { 0.0 };
            let sight = tx + (rx - tx) * t;
            let intrusion = surface as f64 - sight;
            max_intrusion_m = max_intrusion_m.max(intrusion);
            if intrusion > 0.0 && first_obstruction_m.is_none() {
                first_obstruction_m = Some(point.distance_m);
            }
        }

        LineOfSight {
            clear: first_obstruction_m.is_none(),
            first_obstruction_m,
            max_intrusion_m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(elevations: &[Option<f32>]) -> SurfaceProfile {
        let positions = sample_positions(
            Point::new(-122.40, 37.78),
            Point::new(-122.39, 37.78),
            elevations.len(),
        );
        SurfaceProfile::from_samples(&positions, elevations)
    }

    #[test]
    fn test_sample_positions_inclusive() {
        let pts = sample_positions(Point::new(0.0, 0.0), Point::new(1.0, 2.0), 5);
        assert_eq!(pts.len(), 5);
        assert_eq!(pts[0], Point::new(0.0, 0.0));
        assert_eq!(pts[4], Point::new(1.0, 2.0));
        assert_eq!(pts[2], Point::new(0.5, 1.0));
        assert!(sample_positions(Point::new(0.0, 0.0), Point::new(1.0, 1.0), 0).is_empty());
    }

    #[test]
    fn test_distances() {
        let p = profile(&[Some(0.0); 11]);
        // 0.01° of longitude at 37.78°N ≈ 879 m
        assert!((p.total_distance_m() - 879.0).abs() < 5.0, "{}", p.total_distance_m());
        assert_eq!(p.points[0].distance_m, 0.0);
    }

    #[test]
    fn test_flat_ground_is_clear() {
        let p = profile(&[Some(10.0); 11]);
        let los = p.line_of_sight(5.0, 5.0);
        assert!(los.clear);
        assert!((los.max_intrusion_m - (-5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_building_blocks_link() {
        let mut elevations = vec![Some(10.0); 11];
        elevations[5] = Some(40.0);
        let p = profile(&elevations);
        let los = p.line_of_sight(5.0, 5.0);
        assert!(!los.clear);
        assert!((los.max_intrusion_m - 25.0).abs() < 1e-6);
        let at = los.first_obstruction_m.unwrap();
        assert!((at - p.points[5].distance_m).abs() < 1e-9);
    }

    #[test]
    fn test_gaps_are_ignored() {
        let mut elevations = vec![None; 11];
        elevations[0] = Some(10.0);
        elevations[10] = Some(10.0);
        let p = profile(&elevations);
        assert!(p.line_of_sight(1.0, 1.0).clear);
        assert!((p.coverage() - 2.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_serde_roundtrip_for_cache() {
        let p = profile(&[Some(1.5), None, Some(2.5)]);
        let json = serde_json::to_string(&p).unwrap();
        let back: SurfaceProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
