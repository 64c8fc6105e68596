//! Height, ground and density fields of a ray cloud on a regular xy grid.

use std::path::{Path, PathBuf};

use glam::DVec3;
use tracing::info;

use crate::cloud::{Cloud, CloudInfo};
use crate::error::{RayError, Result};
use crate::geotiff::GeoRaster;
use crate::grid::{Grid, NO_DATA};
use crate::mesh::Mesh;
use crate::occupancy::Occupancy2D;
use crate::ply::{read_ply_chunked, DEFAULT_CHUNK_SIZE};

#[derive(Debug, Clone)]
pub struct FieldParams {
    /// Cell size in metres
    pub voxel_width: f64,
    /// Trunk band above ground used for the density field, metres
    pub band_low: f64,
    pub band_high: f64,
    /// Rays per chunk when streaming the cloud
    pub chunk_size: usize,
}

impl Default for FieldParams {
    fn default() -> Self {
        Self {
            voxel_width: 1.0,
            band_low: 1.0,
            band_high: 1.5,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Where the ground height of each cell comes from.
#[derive(Debug, Clone, Default)]
pub enum GroundSource {
    /// The lowest bounded end of the cloud.
    #[default]
    Flat,
    Mesh(Mesh),
    Raster(GeoRaster),
}

/// All fields the forest extraction needs, sharing one grid.
#[derive(Debug, Clone)]
pub struct ForestFields {
    /// Highest bounded end per cell, or `NO_DATA`
    pub high: Grid<f64>,
    /// Ground height per cell
    pub low: Grid<f64>,
    /// Trunk-band density per cell
    pub space: Grid<f64>,
    pub voxel_width: f64,
    pub min_bound: DVec3,
    pub max_bound: DVec3,
}

impl ForestFields {
    pub fn dims(&self) -> (usize, usize) {
        self.high.dims()
    }

    /// Check the three fields share dims.
    pub fn validate(&self) -> Result<()> {
        for (what, grid) in [("ground field", &self.low), ("density field", &self.space)] {
            if grid.dims() != self.high.dims() {
                return Err(RayError::GridMismatch {
                    what: what.into(),
                    expected: self.high.dims(),
                    found: grid.dims(),
                });
            }
        }
        Ok(())
    }
}

/// Grid dims covering `[min_bound, max_bound]`, at least one cell per axis.
pub fn grid_dims(min_bound: DVec3, max_bound: DVec3, voxel_width: f64) -> (usize, usize) {
    let extent = (max_bound - min_bound) / voxel_width;
    (
        (extent.x.ceil() as usize).max(1),
        (extent.y.ceil() as usize).max(1),
    )
}

/// `<stub>_occupied.dat` next to the cloud.
pub fn cache_path(cloud_path: &Path) -> PathBuf {
    let mut name = cloud_path.with_extension("").into_os_string();
    name.push("_occupied.dat");
    PathBuf::from(name)
}

/// Raise each cell of `high` to the highest bounded end falling in it.
pub fn fill_height_chunk(high: &mut Grid<f64>, chunk: &Cloud, min_bound: DVec3, voxel_width: f64) {
    for ray in chunk.rays() {
        if !ray.colour.is_bounded() {
            continue;
        }
        let cell = high.cell_of((ray.end - min_bound).truncate(), voxel_width);
        let h = &mut high[cell];
        if ray.end.z > *h {
            *h = ray.end.z;
        }
    }
}

/// Ground field on the grid of `min_bound`/`dims`.
pub fn ground_field(ground: &GroundSource, min_bound: DVec3, dims: (usize, usize), voxel_width: f64) -> Grid<f64> {
    match ground {
        GroundSource::Flat => Grid::new(dims.0, dims.1, min_bound.z),
        GroundSource::Mesh(mesh) => mesh.to_height_field(min_bound, dims, voxel_width),
        GroundSource::Raster(dtm) => dtm.to_grid(min_bound, dims, voxel_width, min_bound.z),
    }
}

/// Build the height, ground and density fields of a ray cloud file.
///
/// The density field is cached next to the cloud and reused on later runs.
pub fn build_fields(cloud_path: &Path, ground: &GroundSource, params: &FieldParams) -> Result<ForestFields> {
    let info = CloudInfo::scan(cloud_path, params.chunk_size)?;
    let min_bound = info.ends_bound.min;
    let max_bound = info.ends_bound.max;
    let voxel_width = params.voxel_width;
    info!("voxel width: {} m", voxel_width);

    let dims = grid_dims(min_bound, max_bound, voxel_width);
    info!("dims for heightfield: {} x {}", dims.0, dims.1);

    let mut high = Grid::new(dims.0, dims.1, NO_DATA);
    read_ply_chunked(cloud_path, true, params.chunk_size, |chunk| {
        fill_height_chunk(&mut high, chunk, min_bound, voxel_width);
        Ok(())
    })?;

    let low = ground_field(ground, min_bound, dims, voxel_width);

    let band = (params.band_low, params.band_high);
    let cache = cache_path(cloud_path);
    let occupancy = match Occupancy2D::load(&cache, min_bound, dims, voxel_width, band)? {
        Some(occupancy) => occupancy,
        None => {
            let mut occupancy = Occupancy2D::init(min_bound, dims, voxel_width, band);
            occupancy.fill_densities(cloud_path, &low, params.chunk_size)?;
            occupancy.save(&cache)?;
            occupancy
        }
    };

    let fields = ForestFields {
        high,
        low,
        space: occupancy.to_space_grid(),
        voxel_width,
        min_bound,
        max_bound,
    };
    fields.validate()?;
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Ray, Rgba};
    use crate::ply::write_ply;
    use std::fs;

    #[test]
    fn test_dims_at_least_one() {
        assert_eq!(grid_dims(DVec3::ZERO, DVec3::new(3.2, 0.0, 5.0), 1.0), (4, 1));
        assert_eq!(grid_dims(DVec3::ZERO, DVec3::new(4.0, 2.0, 0.0), 0.5), (8, 4));
    }

    #[test]
    fn test_height_chunk_keeps_max_of_bounded() {
        let mut high = Grid::new(2, 2, NO_DATA);
        let ray = |x: f64, z: f64, alpha: u8| Ray {
            start: DVec3::new(x, 0.5, 30.0),
            end: DVec3::new(x, 0.5, z),
            time: 0.0,
            colour: Rgba::new(0, 0, 0, alpha),
        };
        let chunk = Cloud::from_rays(&[ray(0.5, 3.0, 255), ray(0.7, 5.0, 255), ray(0.2, 9.0, 0), ray(2.0, 1.0, 255)]);
        fill_height_chunk(&mut high, &chunk, DVec3::ZERO, 1.0);
        assert_eq!(high[(0, 0)], 5.0);
        // x == 2.0 is the max edge and clamps into the last cell
        assert_eq!(high[(1, 0)], 1.0);
        assert_eq!(high[(0, 1)], NO_DATA);
    }

    #[test]
    fn test_cache_path() {
        assert_eq!(cache_path(Path::new("d/forest.ply")), PathBuf::from("d/forest_occupied.dat"));
    }

    /// Vertical rays over a 3 x 3 m plot at (10, 20, 100). Cell (1, 1) gets
    /// a 105 m and a 108 m return in different chunks, and an unbounded
    /// 150 m ray between them.
    fn write_plot(path: &Path) {
        let ray = |x: f64, y: f64, z: f64, time: f64, alpha: u8| Ray {
            start: DVec3::new(x, y, 160.0),
            end: DVec3::new(x, y, z),
            time,
            colour: Rgba::new(0, 0, 0, alpha),
        };
        let rays = [
            ray(10.0, 20.0, 100.0, 0.0, 255),
            ray(11.25, 21.25, 105.0, 1.0, 255),
            ray(11.5, 21.5, 150.0, 2.0, 0),
            ray(11.5, 21.5, 108.0, 3.0, 255),
            ray(13.0, 23.0, 100.0, 4.0, 255),
        ];
        write_ply(path, &Cloud::from_rays(&rays)).unwrap();
    }

    #[test]
    fn test_build_fields_and_reuse_cache() {
        let dir = std::env::temp_dir().join("raytrees_fields");
        fs::create_dir_all(&dir).unwrap();
        let cloud_path = dir.join("plot.ply");
        let cache = cache_path(&cloud_path);
        let _ = fs::remove_file(&cache);
        write_plot(&cloud_path);

        let params = FieldParams {
            chunk_size: 2,
            ..Default::default()
        };
        let fields = build_fields(&cloud_path, &GroundSource::Flat, &params).unwrap();
        assert_eq!(fields.min_bound, DVec3::new(10.0, 20.0, 100.0));
        assert_eq!(fields.dims(), (3, 3));
        assert_eq!(fields.high[(1, 1)], 108.0);
        assert_eq!(fields.high[(0, 0)], 100.0);
        assert_eq!(fields.high[(2, 2)], 100.0);
        assert_eq!(fields.high[(0, 1)], NO_DATA);
        assert!(fields.low.data.iter().all(|&l| l == 100.0));
        assert!(cache.exists(), "density cache written next to the cloud");

        let again = build_fields(&cloud_path, &GroundSource::Flat, &params).unwrap();
        assert_eq!(again.space, fields.space);
        assert_eq!(again.high, fields.high);

        // a doctored cache is read back instead of recomputed
        let mut occupancy = Occupancy2D::init(fields.min_bound, (3, 3), 1.0, (params.band_low, params.band_high));
        occupancy.cells[(0, 2)].hits = 9.0;
        occupancy.save(&cache).unwrap();
        let cached = build_fields(&cloud_path, &GroundSource::Flat, &params).unwrap();
        assert_eq!(cached.space[(0, 2)], 0.95);
        assert_eq!(cached.space[(2, 0)], 0.5);
    }
}
