//! GeoTIFF ground models in, float rasters out.
//!
//! Georeferencing uses only ModelPixelScaleTag (33550) and ModelTiepointTag
//! (33922): pixel (0, 0) is the north-west corner, rows run south.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use glam::{DVec2, DVec3};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tracing::{info, warn};

use crate::error::{RayError, Result};
use crate::grid::{Grid, NO_DATA};

/// A single-band raster in world coordinates, row-major from the north.
#[derive(Debug, Clone)]
pub struct GeoRaster {
    pub ncol: usize,
    pub nrow: usize,
    pub res_x: f64,
    pub res_y: f64,
    /// West edge.
    pub xmin: f64,
    /// North edge.
    pub ymax: f64,
    pub data: Vec<f64>,
}

impl GeoRaster {
    /// Value at a world position, None outside the raster or on NaN.
    pub fn sample(&self, pos: DVec2) -> Option<f64> {
        let col = ((pos.x - self.xmin) / self.res_x).floor();
        let row = ((self.ymax - pos.y) / self.res_y).floor();
        if col < 0.0 || row < 0.0 || col >= self.ncol as f64 || row >= self.nrow as f64 {
            return None;
        }
        let v = self.data[row as usize * self.ncol + col as usize];
        (!v.is_nan()).then_some(v)
    }

    /// Resample onto a voxel grid at cell centres. Holes take `fallback`.
    pub fn to_grid(&self, min_bound: DVec3, dims: (usize, usize), voxel_width: f64, fallback: f64) -> Grid<f64> {
        let mut grid = Grid::new(dims.0, dims.1, fallback);
        let mut holes = 0usize;
        for x in 0..dims.0 {
            for y in 0..dims.1 {
                let pos = min_bound.truncate() + crate::grid::cell_centre(x, y, voxel_width);
                match self.sample(pos) {
                    Some(v) => grid[(x, y)] = v,
                    None => holes += 1,
                }
            }
        }
        if holes > 0 {
            warn!("{} ground cells outside the DTM, using {:.2}", holes, fallback);
        }
        grid
    }
}

/// Resolution and origin from the GeoTIFF tags, as
/// (res_x, res_y, origin_x, origin_y).
fn geotiff_extent_from_decoder<R: Read + Seek>(decoder: &mut Decoder<R>) -> (f64, f64, f64, f64) {
    let mut scale = None;
    let mut tiepoint = None;

    if let Ok(Some(value)) = decoder.find_tag(Tag::ModelPixelScaleTag) {
        if let Ok(v) = value.into_f64_vec() {
            if v.len() >= 2 {
                scale = Some((v[0], v[1]));
            }
        }
    }
    if let Ok(Some(value)) = decoder.find_tag(Tag::ModelTiepointTag) {
        if let Ok(v) = value.into_f64_vec() {
            if v.len() >= 6 {
                tiepoint = Some((v[3], v[4]));
            }
        }
    }

    let (res_x, res_y) = scale.unwrap_or_else(|| {
        warn!("ModelPixelScale tag (33550) missing, assuming 1 m pixels");
        (1.0, 1.0)
    });
    let (origin_x, origin_y) = tiepoint.unwrap_or_else(|| {
        warn!("ModelTiepoint tag (33922) missing, assuming origin (0, 0)");
        (0.0, 0.0)
    });
    (res_x, res_y, origin_x, origin_y)
}

/// Decode the first band of a GeoTIFF.
pub fn decode_geotiff<R: Read + Seek>(reader: R) -> Result<GeoRaster> {
    let mut decoder = Decoder::new(reader)?;
    let (width, height) = decoder.dimensions()?;
    let (ncol, nrow) = (width as usize, height as usize);
    let (res_x, res_y, xmin, ymax) = geotiff_extent_from_decoder(&mut decoder);

    let raw: Vec<f64> = match decoder.read_image()? {
        DecodingResult::F64(v) => v,
        DecodingResult::F32(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::U16(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::U8(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::I16(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::I32(v) => v.iter().map(|x| *x as f64).collect(),
        _ => return Err(RayError::UnsupportedPixelType),
    };

    let pixels = ncol * nrow;
    let bands = if pixels == 0 { 1 } else { (raw.len() / pixels).max(1) };
    let data = if bands > 1 {
        (0..pixels).map(|px| raw[px * bands]).collect()
    } else {
        raw
    };

    Ok(GeoRaster {
        ncol,
        nrow,
        res_x,
        res_y,
        xmin,
        ymax,
        data,
    })
}

pub fn load_geotiff(path: &Path) -> Result<GeoRaster> {
    let file = File::open(path).map_err(|e| RayError::open(path, e))?;
    let raster = decode_geotiff(BufReader::new(file))?;
    info!(
        "loaded {}: {} x {} pixels, res=({}, {}), origin=({:.2}, {:.2})",
        path.display(),
        raster.ncol,
        raster.nrow,
        raster.res_x,
        raster.res_y,
        raster.xmin,
        raster.ymax
    );
    Ok(raster)
}

/// Encode a field as a north-up 32-bit float GeoTIFF. `NO_DATA` becomes NaN.
pub fn encode_field<W: Write + Seek>(out: W, grid: &Grid<f64>, min_bound: DVec3, voxel_width: f64) -> Result<()> {
    let (nx, ny) = grid.dims();
    let mut pixels = Vec::with_capacity(nx * ny);
    for row in 0..ny {
        let y = ny - 1 - row;
        for x in 0..nx {
            let v = grid[(x, y)];
            pixels.push(if v <= NO_DATA { f32::NAN } else { v as f32 });
        }
    }

    let mut encoder = TiffEncoder::new(out)?;
    let mut image = encoder.new_image::<colortype::Gray32Float>(nx as u32, ny as u32)?;
    let ymax = min_bound.y + ny as f64 * voxel_width;
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &[voxel_width, voxel_width, 0.0][..])?;
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &[0.0, 0.0, 0.0, min_bound.x, ymax, 0.0][..])?;
    image.write_data(&pixels)?;
    Ok(())
}

pub fn write_field_tiff(path: &Path, grid: &Grid<f64>, min_bound: DVec3, voxel_width: f64) -> Result<()> {
    let file = File::create(path).map_err(|e| RayError::open(path, e))?;
    encode_field(BufWriter::new(file), grid, min_bound, voxel_width)?;
    info!("wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_field_round_trip_keeps_orientation() {
        let mut grid = Grid::new(3, 2, 1.0);
        grid[(2, 1)] = 7.0; // north-east cell
        grid[(0, 0)] = NO_DATA;
        let min_bound = DVec3::new(100.0, 200.0, 0.0);

        let mut buf = Cursor::new(Vec::new());
        encode_field(&mut buf, &grid, min_bound, 0.5).unwrap();
        buf.set_position(0);
        let raster = decode_geotiff(buf).unwrap();

        assert_eq!((raster.ncol, raster.nrow), (3, 2));
        assert_eq!(raster.ymax, 201.0);
        assert_eq!(raster.sample(DVec2::new(101.25, 200.75)), Some(7.0));
        assert_eq!(raster.sample(DVec2::new(100.25, 200.25)), None);
        assert_eq!(raster.sample(DVec2::new(99.0, 200.25)), None);

        let back = raster.to_grid(min_bound.with_z(0.0), (3, 2), 0.5, -5.0);
        assert_eq!(back[(2, 1)], 7.0);
        assert_eq!(back[(0, 0)], -5.0);
        assert_eq!(back[(1, 0)], 1.0);
    }
}
