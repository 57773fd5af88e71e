//! Single-band DSM rasters and their GeoTIFF encoding.
//!
//! This module provides [`DsmRaster`], the in-memory form of both a generated
//! tile and a merged export, and the GeoTIFF codec used to store it.
//!
//! # Layout
//!
//! - Samples are `f32` elevations in metres, row-major, row 0 at the north edge
//! - The grid is north-up: `origin` is the top-left corner, pixel sizes are positive
//! - Coordinates are in the raster's CRS (an EPSG code)
//! - Pixels equal to the raster's no-data value carry no elevation

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;

use geo::{Coord, Rect};
use memmap2::Mmap;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::crs::{is_geographic, EPSG_WEB_MERCATOR};
use crate::error::{DsmError, Result};

/// Default no-data value for generated tiles and exports.
pub const NO_DATA: f32 = -9999.0;

const GEO_KEY_MODEL_TYPE: u16 = 1024;
const GEO_KEY_RASTER_TYPE: u16 = 1025;
const GEO_KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const GEO_KEY_PROJECTED_CS_TYPE: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Affine placement of a north-up grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    /// X of the top-left corner.
    pub origin_x: f64,
    /// Y of the top-left corner.
    pub origin_y: f64,
    /// Pixel width in CRS units (positive).
    pub pixel_width: f64,
    /// Pixel height in CRS units (positive; rows grow southward).
    pub pixel_height: f64,
}

/// A single-band elevation grid with georeferencing.
#[derive(Debug, Clone, PartialEq)]
pub struct DsmRaster {
    width: u32,
    height: u32,
    transform: GeoTransform,
    crs: u32,
    no_data: f32,
    data: Vec<f32>,
}

impl DsmRaster {
    /// Create a raster filled with [`NO_DATA`].
    pub fn new(width: u32, height: u32, transform: GeoTransform, crs: u32) -> Self {
        Self {
            width,
            height,
            transform,
            crs,
            no_data: NO_DATA,
            data: vec![NO_DATA; width as usize * height as usize],
        }
    }

    /// Create a raster from existing samples.
    ///
    /// # Errors
    ///
    /// Returns [`DsmError::InvalidRaster`] if `data` does not hold exactly
    /// `width × height` samples or the pixel size is not positive.
    pub fn from_data(
        width: u32,
        height: u32,
        transform: GeoTransform,
        crs: u32,
        no_data: f32,
        data: Vec<f32>,
    ) -> Result<Self> {
        if data.len() != width as usize * height as usize {
            return Err(DsmError::InvalidRaster {
                reason: format!(
                    "expected {}x{}={} samples, got {}",
                    width,
                    height,
                    width as usize * height as usize,
                    data.len()
                ),
            });
        }
        if !(transform.pixel_width > 0.0 && transform.pixel_height > 0.0) {
            return Err(DsmError::InvalidRaster {
                reason: format!(
                    "pixel size must be positive, got {}x{}",
                    transform.pixel_width, transform.pixel_height
                ),
            });
        }
        Ok(Self {
            width,
            height,
            transform,
            crs,
            no_data,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn transform(&self) -> GeoTransform {
        self.transform
    }

    /// EPSG code of the raster's coordinates.
    pub fn crs(&self) -> u32 {
        self.crs
    }

    pub fn no_data(&self) -> f32 {
        self.no_data
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Extent of the grid in its CRS.
    pub fn bounds(&self) -> Rect<f64> {
        let t = self.transform;
        Rect::new(
            Coord {
                x: t.origin_x,
                y: t.origin_y - self.height as f64 * t.pixel_height,
            },
            Coord {
                x: t.origin_x + self.width as f64 * t.pixel_width,
                y: t.origin_y,
            },
        )
    }

    /// Value at `(row, col)`, or `None` outside the grid or on no-data.
    pub fn get(&self, row: u32, col: u32) -> Option<f32> {
        if row >= self.height || col >= self.width {
            return None;
        }
        let value = self.data[row as usize * self.width as usize + col as usize];
        if value == self.no_data || value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    /// Overwrite the value at `(row, col)`. Out-of-grid writes are ignored.
    pub fn set(&mut self, row: u32, col: u32, value: f32) {
        if row < self.height && col < self.width {
            self.data[row as usize * self.width as usize + col as usize] = value;
        }
    }

    /// Pixel `(row, col)` containing CRS coordinate `(x, y)`, if inside the grid.
    pub fn index(&self, x: f64, y: f64) -> Option<(u32, u32)> {
        let t = self.transform;
        let col = ((x - t.origin_x) / t.pixel_width).floor();
        let row = ((t.origin_y - y) / t.pixel_height).floor();
        if col < 0.0 || row < 0.0 || col >= self.width as f64 || row >= self.height as f64 {
            return None;
        }
        Some((row as u32, col as u32))
    }

    /// CRS coordinate of the center of pixel `(row, col)`.
    pub fn pixel_center(&self, row: u32, col: u32) -> (f64, f64) {
        let t = self.transform;
        (
            t.origin_x + (col as f64 + 0.5) * t.pixel_width,
            t.origin_y - (row as f64 + 0.5) * t.pixel_height,
        )
    }

    /// Nearest-pixel elevation at CRS coordinate `(x, y)`.
    ///
    /// Returns `None` outside the grid or on no-data.
    pub fn sample_at(&self, x: f64, y: f64) -> Option<f32> {
        let (row, col) = self.index(x, y)?;
        self.get(row, col)
    }

    /// Number of pixels holding an elevation.
    pub fn valid_pixel_count(&self) -> usize {
        self.data
            .iter()
            .filter(|v| **v != self.no_data && !v.is_nan())
            .count()
    }

    /// Encode as a single-band `f32` GeoTIFF.
    pub fn to_geotiff(&self) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut buffer)?;
            let mut image = encoder.new_image::<colortype::Gray32Float>(self.width, self.height)?;

            let t = self.transform;
            let scale = [t.pixel_width, t.pixel_height, 0.0];
            let tiepoint = [0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0];
            let geo_keys = geo_key_directory(self.crs)?;
            let no_data = format!("{}", self.no_data);

            image
                .encoder()
                .write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
            image
                .encoder()
                .write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
            image
                .encoder()
                .write_tag(Tag::GeoKeyDirectoryTag, &geo_keys[..])?;
            image
                .encoder()
                .write_tag(Tag::GdalNodata, no_data.as_str())?;

            image.write_data(&self.data)?;
        }
        Ok(buffer.into_inner())
    }

    /// Decode a GeoTIFF produced by [`Self::to_geotiff`] or any north-up
    /// single-band GeoTIFF with pixel-scale and tiepoint tags.
    ///
    /// # Errors
    ///
    /// Returns [`DsmError::InvalidRaster`] for empty input, missing
    /// georeferencing or unsupported sample types.
    pub fn from_geotiff(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(DsmError::InvalidRaster {
                reason: "empty blob".to_string(),
            });
        }

        let mut decoder = Decoder::new(Cursor::new(bytes))?;
        let (width, height) = decoder.dimensions()?;

        let scale = decoder
            .get_tag_f64_vec(Tag::ModelPixelScaleTag)
            .map_err(|_| DsmError::InvalidRaster {
                reason: "missing ModelPixelScale tag".to_string(),
            })?;
        let tiepoint = decoder
            .get_tag_f64_vec(Tag::ModelTiepointTag)
            .map_err(|_| DsmError::InvalidRaster {
                reason: "missing ModelTiepoint tag".to_string(),
            })?;
        if scale.len() < 2 || tiepoint.len() < 6 {
            return Err(DsmError::InvalidRaster {
                reason: "malformed georeferencing tags".to_string(),
            });
        }

        // Tiepoint is [i, j, k, x, y, z]; shift to the top-left pixel corner
        let transform = GeoTransform {
            origin_x: tiepoint[3] - tiepoint[0] * scale[0],
            origin_y: tiepoint[4] + tiepoint[1] * scale[1],
            pixel_width: scale[0],
            pixel_height: scale[1],
        };

        let crs = decoder
            .get_tag_u16_vec(Tag::GeoKeyDirectoryTag)
            .ok()
            .and_then(|keys| crs_from_geo_keys(&keys))
            .unwrap_or(EPSG_WEB_MERCATOR);

        let no_data = decoder
            .get_tag_ascii_string(Tag::GdalNodata)
            .ok()
            .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f32>().ok())
            .unwrap_or(NO_DATA);

        let data: Vec<f32> = match decoder.read_image()? {
            DecodingResult::F32(v) => v,
            DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
            DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
            DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
            _ => {
                return Err(DsmError::InvalidRaster {
                    reason: "unsupported sample type".to_string(),
                })
            }
        };

        Self::from_data(width, height, transform, crs, no_data, data)
    }

    /// Load a GeoTIFF from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;

        // SAFETY: the file is opened read-only and the mapping does not
        // outlive this call.
        let mmap = unsafe { Mmap::map(&file)? };

        Self::from_geotiff(&mmap)
    }

    /// Write the raster as a GeoTIFF file.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.to_geotiff()?;
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

fn geo_key_directory(crs: u32) -> Result<Vec<u16>> {
    // 900913 is the pre-registration alias of 3857 and does not fit a u16 key
    let epsg = if crs == 900913 { EPSG_WEB_MERCATOR } else { crs };
    let code = u16::try_from(epsg).map_err(|_| DsmError::InvalidRaster {
        reason: format!("EPSG:{} cannot be stored as a GeoKey", epsg),
    })?;

    let (model_type, crs_key) = if is_geographic(epsg) {
        (MODEL_TYPE_GEOGRAPHIC, GEO_KEY_GEOGRAPHIC_TYPE)
    } else {
        (MODEL_TYPE_PROJECTED, GEO_KEY_PROJECTED_CS_TYPE)
    };

    Ok(vec![
        1, 1, 0, 3, // header: version, revision, minor, key count
        GEO_KEY_MODEL_TYPE, 0, 1, model_type,
        GEO_KEY_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA,
        crs_key, 0, 1, code,
    ])
}

fn crs_from_geo_keys(keys: &[u16]) -> Option<u32> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    keys[4..]
        .chunks_exact(4)
        .take(count)
        .find(|entry| {
            (entry[0] == GEO_KEY_PROJECTED_CS_TYPE || entry[0] == GEO_KEY_GEOGRAPHIC_TYPE)
                && entry[1] == 0
        })
        .map(|entry| entry[3] as u32)
}
