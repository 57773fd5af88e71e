//! Priority mosaic of DSM tiles.
//!
//! Merges rasters from different datasets (possibly in different CRSs) into
//! one Web-Mercator grid. Sources are applied in priority order and a pixel,
//! once written, is never overwritten: the first source with a value wins.

use geo::{Coord, Rect};

use crate::crs::{lon_lat_to_mercator, CrsTransformer, EPSG_WEB_MERCATOR};
use crate::error::{DsmError, Result};
use crate::raster::{DsmRaster, GeoTransform};
use crate::slippy::MAX_LAT;

/// Output grid of an export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MosaicGrid {
    pub transform: GeoTransform,
    pub width: u32,
    pub height: u32,
}

impl MosaicGrid {
    /// Web-Mercator grid covering a WGS84 rectangle at `resolution` metres.
    ///
    /// # Errors
    ///
    /// Returns [`DsmError::InvalidArea`] for a non-positive resolution or a
    /// grid too large to address.
    pub fn covering(bounds: Rect<f64>, resolution: f64) -> Result<Self> {
        if !(resolution > 0.0) {
            return Err(DsmError::InvalidArea {
                reason: format!("Resolution must be positive, got {}", resolution),
            });
        }
        let clamp = |lat: f64| lat.clamp(-MAX_LAT, MAX_LAT);
        let (min_x, min_y) = lon_lat_to_mercator(bounds.min().x, clamp(bounds.min().y));
        let (max_x, max_y) = lon_lat_to_mercator(bounds.max().x, clamp(bounds.max().y));

        let width = ((max_x - min_x) / resolution).ceil().max(1.0);
        let height = ((max_y - min_y) / resolution).ceil().max(1.0);
        if width > u32::MAX as f64 || height > u32::MAX as f64 {
            return Err(DsmError::InvalidArea {
                reason: format!("Output grid {}x{} is too large", width, height),
            });
        }

        Ok(Self {
            transform: GeoTransform {
                origin_x: min_x,
                origin_y: max_y,
                pixel_width: resolution,
                pixel_height: resolution,
            },
            width: width as u32,
            height: height as u32,
        })
    }

    /// Empty output raster for this grid.
    pub fn raster(&self) -> DsmRaster {
        DsmRaster::new(self.width, self.height, self.transform, EPSG_WEB_MERCATOR)
    }
}

/// Summary of a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Number of sources considered.
    pub sources: usize,
    pub pixels_written: usize,
}

/// One input of a merge.
///
/// A source with a footprint owns the output pixels whose centers fall inside
/// it. Pixels outside the footprint (a generation buffer, say) are only used
/// to fill what no source owns.
#[derive(Debug, Clone, Copy)]
pub struct MosaicSource<'a> {
    pub raster: &'a DsmRaster,
    /// WGS84 rectangle, usually a slippy tile's bounds.
    pub footprint: Option<Rect<f64>>,
}

impl<'a> MosaicSource<'a> {
    pub fn new(raster: &'a DsmRaster) -> Self {
        Self { raster, footprint: None }
    }

    pub fn clipped_to(mut self, footprint: Rect<f64>) -> Self {
        self.footprint = Some(footprint);
        self
    }
}

/// Merge `sources` into `grid`, first source wins.
///
/// `sources` must already be in priority order. No-data pixels of a source
/// never claim an output pixel.
pub fn merge(grid: &MosaicGrid, sources: &[&DsmRaster]) -> Result<(DsmRaster, MergeStats)> {
    let sources: Vec<MosaicSource<'_>> = sources.iter().map(|raster| MosaicSource::new(raster)).collect();
    merge_sources(grid, &sources)
}

/// Merge footprint-clipped `sources` into `grid`.
///
/// Two passes, each in priority order: first every source writes inside its
/// own footprint, then the remaining holes are filled from the parts of the
/// sources outside their footprints.
pub fn merge_sources(grid: &MosaicGrid, sources: &[MosaicSource<'_>]) -> Result<(DsmRaster, MergeStats)> {
    let mut output = grid.raster();
    let mut filled = vec![false; grid.width as usize * grid.height as usize];
    let mut stats = MergeStats {
        sources: sources.len(),
        pixels_written: 0,
    };

    for pass in [Pass::Owned, Pass::Buffer] {
        for source in sources {
            let footprint = match (pass, source.footprint) {
                (Pass::Owned, None) => None,
                (Pass::Owned, Some(rect)) => Some(mercator_rect(rect)),
                (Pass::Buffer, None) => continue,
                (Pass::Buffer, Some(_)) => None,
            };
            stats.pixels_written += paint(&mut output, &mut filled, source.raster, footprint)?;
        }
    }

    Ok((output, stats))
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    Owned,
    Buffer,
}

/// Write `source` into the unfilled pixels of `output`, restricted to pixel
/// centers inside `within` (Web Mercator, half-open) when given.
fn paint(
    output: &mut DsmRaster,
    filled: &mut [bool],
    source: &DsmRaster,
    within: Option<Rect<f64>>,
) -> Result<usize> {
    let to_source = CrsTransformer::new(EPSG_WEB_MERCATOR, source.crs())?;
    let Some((rows, cols)) = source_window(output, source)? else {
        return Ok(0);
    };

    let width = output.width() as usize;
    let mut written = 0;
    for row in rows.0..rows.1 {
        for col in cols.0..cols.1 {
            let idx = row as usize * width + col as usize;
            if filled[idx] {
                continue;
            }
            let (x, y) = output.pixel_center(row, col);
            if let Some(r) = within {
                if x < r.min().x || x >= r.max().x || y < r.min().y || y >= r.max().y {
                    continue;
                }
            }
            let (sx, sy) = to_source.transform(x, y)?;
            if let Some(value) = source.sample_at(sx, sy) {
                output.set(row, col, value);
                filled[idx] = true;
                written += 1;
            }
        }
    }
    Ok(written)
}

fn mercator_rect(rect: Rect<f64>) -> Rect<f64> {
    let clamp = |lat: f64| lat.clamp(-MAX_LAT, MAX_LAT);
    let (min_x, min_y) = lon_lat_to_mercator(rect.min().x, clamp(rect.min().y));
    let (max_x, max_y) = lon_lat_to_mercator(rect.max().x, clamp(rect.max().y));
    Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y })
}

/// Output pixel window `((row_start, row_end), (col_start, col_end))` that a
/// source can touch, or `None` if it lies outside the output.
fn source_window(output: &DsmRaster, source: &DsmRaster) -> Result<Option<((u32, u32), (u32, u32))>> {
    let to_output = CrsTransformer::new(source.crs(), EPSG_WEB_MERCATOR)?;
    let b = source.bounds();
    let corners = [
        (b.min().x, b.min().y),
        (b.min().x, b.max().y),
        (b.max().x, b.min().y),
        (b.max().x, b.max().y),
    ];
    let mut min = Coord { x: f64::MAX, y: f64::MAX };
    let mut max = Coord { x: f64::MIN, y: f64::MIN };
    for (x, y) in corners {
        let (ox, oy) = to_output.transform(x, y)?;
        min.x = min.x.min(ox);
        min.y = min.y.min(oy);
        max.x = max.x.max(ox);
        max.y = max.y.max(oy);
    }

    let t = output.transform();
    // One pixel of slack for curved edges after reprojection
    let col_start = ((min.x - t.origin_x) / t.pixel_width).floor() - 1.0;
    let col_end = ((max.x - t.origin_x) / t.pixel_width).ceil() + 1.0;
    let row_start = ((t.origin_y - max.y) / t.pixel_height).floor() - 1.0;
    let row_end = ((t.origin_y - min.y) / t.pixel_height).ceil() + 1.0;

    let clamp_cols = |v: f64| v.clamp(0.0, output.width() as f64) as u32;
    let clamp_rows = |v: f64| v.clamp(0.0, output.height() as f64) as u32;
    let cols = (clamp_cols(col_start), clamp_cols(col_end));
    let rows = (clamp_rows(row_start), clamp_rows(row_end));

    if cols.0 >= cols.1 || rows.0 >= rows.1 {
        Ok(None)
    } else {
        Ok(Some((rows, cols)))
    }
}
