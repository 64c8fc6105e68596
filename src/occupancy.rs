//! 2D occupancy of a height band above the ground.
//!
//! Every ray is walked through the xy grid. In each cell it crosses, the part
//! of the ray inside that cell either ends in the band (a hit) or passes
//! through it (a pass). Cells where most rays stop are likely trunks; cells
//! rays fly through are open space.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use glam::{DVec2, DVec3};
use tracing::info;

use crate::error::{RayError, Result};
use crate::grid::Grid;
use crate::ply::read_ply_chunked;

const CACHE_MAGIC: &[u8; 4] = b"RYOC";
/// Magic, dims, voxel width, band.
const CACHE_HEADER_SIZE: usize = 36;

/// Hit and pass counts for one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cell {
    pub hits: f32,
    pub passes: f32,
}

impl Cell {
    /// Fraction of observations that stopped here, 0.5 when unobserved.
    #[inline]
    pub fn density(&self) -> f64 {
        (self.hits as f64 + 0.5) / (self.hits as f64 + self.passes as f64 + 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Occupancy2D {
    pub min_bound: DVec3,
    pub voxel_width: f64,
    pub cells: Grid<Cell>,
    /// Band above ground, metres.
    pub band: (f64, f64),
}

impl Occupancy2D {
    pub fn init(min_bound: DVec3, dims: (usize, usize), voxel_width: f64, band: (f64, f64)) -> Self {
        Self {
            min_bound,
            voxel_width,
            cells: Grid::new(dims.0, dims.1, Cell::default()),
            band,
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        self.cells.dims()
    }

    pub fn density(&self, x: usize, y: usize) -> f64 {
        self.cells[(x, y)].density()
    }

    pub fn to_space_grid(&self) -> Grid<f64> {
        self.cells.map(|c| c.density())
    }

    /// Walk one ray through the grid. `ground` must have the grid's dims.
    pub fn add_ray(&mut self, start: DVec3, end: DVec3, bounded: bool, ground: &Grid<f64>) {
        let (nx, ny) = self.dims();
        if nx == 0 || ny == 0 {
            return;
        }
        let p = (start - self.min_bound).truncate() / self.voxel_width;
        let q = (end - self.min_bound).truncate() / self.voxel_width;
        let d = q - p;

        let Some((t0, t1)) = clip_to_box(p, d, DVec2::new(nx as f64, ny as f64)) else {
            return;
        };

        let entry = p + d * t0;
        let mut cx = (entry.x.floor().max(0.0) as usize).min(nx - 1) as isize;
        let mut cy = (entry.y.floor().max(0.0) as usize).min(ny - 1) as isize;
        let step_x: isize = if d.x > 0.0 { 1 } else { -1 };
        let step_y: isize = if d.y > 0.0 { 1 } else { -1 };
        let next_boundary = |c: isize, step: isize| (c + if step > 0 { 1 } else { 0 }) as f64;
        let mut t_max_x = if d.x != 0.0 {
            (next_boundary(cx, step_x) - p.x) / d.x
        } else {
            f64::INFINITY
        };
        let mut t_max_y = if d.y != 0.0 {
            (next_boundary(cy, step_y) - p.y) / d.y
        } else {
            f64::INFINITY
        };
        let t_delta_x = if d.x != 0.0 { 1.0 / d.x.abs() } else { f64::INFINITY };
        let t_delta_y = if d.y != 0.0 { 1.0 / d.y.abs() } else { f64::INFINITY };

        let (lo, hi) = self.band;
        let mut t_in = t0;
        for _ in 0..(nx + ny + 2) {
            let t_out = t_max_x.min(t_max_y).min(t1);
            let (x, y) = (cx as usize, cy as usize);
            let g = ground[(x, y)];
            let (band_lo, band_hi) = (g + lo, g + hi);

            let za = start.z + (end.z - start.z) * t_in;
            let zb = start.z + (end.z - start.z) * t_out;
            let ends_here = t_out >= 1.0;
            let cell = &mut self.cells[(x, y)];
            if ends_here && bounded && end.z >= band_lo && end.z <= band_hi {
                cell.hits += 1.0;
            } else if za.max(zb) >= band_lo && za.min(zb) <= band_hi {
                cell.passes += 1.0;
            }

            if t_out >= t1 {
                break;
            }
            if t_max_x < t_max_y {
                cx += step_x;
                t_max_x += t_delta_x;
            } else {
                cy += step_y;
                t_max_y += t_delta_y;
            }
            if cx < 0 || cy < 0 || cx >= nx as isize || cy >= ny as isize {
                break;
            }
            t_in = t_out;
        }
    }

    /// Walk every ray of a ray cloud file, one chunk at a time.
    pub fn fill_densities(&mut self, cloud_path: &Path, ground: &Grid<f64>, chunk_size: usize) -> Result<()> {
        if ground.dims() != self.dims() {
            return Err(RayError::GridMismatch {
                what: "ground field".into(),
                expected: self.dims(),
                found: ground.dims(),
            });
        }
        read_ply_chunked(cloud_path, true, chunk_size, |chunk| {
            for i in 0..chunk.len() {
                self.add_ray(chunk.starts[i], chunk.ends[i], chunk.colours[i].is_bounded(), ground);
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let (nx, ny) = self.dims();
        let mut buf = Vec::with_capacity(CACHE_HEADER_SIZE + 8 * nx * ny);
        buf.extend_from_slice(CACHE_MAGIC);
        buf.extend_from_slice(&(nx as u32).to_le_bytes());
        buf.extend_from_slice(&(ny as u32).to_le_bytes());
        buf.extend_from_slice(&self.voxel_width.to_le_bytes());
        buf.extend_from_slice(&self.band.0.to_le_bytes());
        buf.extend_from_slice(&self.band.1.to_le_bytes());
        for cell in &self.cells.data {
            buf.extend_from_slice(&cell.hits.to_le_bytes());
            buf.extend_from_slice(&cell.passes.to_le_bytes());
        }
        out.write_all(&buf)?;
        out.flush()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| RayError::open(path, e))?;
        self.write_to(&mut BufWriter::new(file))?;
        info!("saved occupancy to {}", path.display());
        Ok(())
    }

    /// Decode a cache written by [`Occupancy2D::write_to`]. The cache must
    /// match `dims`, `voxel_width` and `band`; `path` only labels errors.
    pub fn read_from<R: Read>(
        input: &mut R,
        path: &Path,
        min_bound: DVec3,
        dims: (usize, usize),
        voxel_width: f64,
        band: (f64, f64),
    ) -> Result<Self> {
        let malformed = |reason: &str| RayError::Cache {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        if bytes.len() < CACHE_HEADER_SIZE || &bytes[0..4] != CACHE_MAGIC {
            return Err(malformed("bad magic"));
        }
        let u32_at = |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]) as usize;
        let f32_at = |o: usize| f32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        let found = (u32_at(4), u32_at(8));
        if found != dims {
            return Err(RayError::GridMismatch {
                what: path.display().to_string(),
                expected: dims,
                found,
            });
        }
        let f64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[o..o + 8]);
            f64::from_le_bytes(b)
        };
        let found_width = f64_at(12);
        if found_width != voxel_width {
            return Err(malformed(&format!(
                "built with voxel width {}, expected {}",
                found_width, voxel_width
            )));
        }
        let found_band = (f64_at(20), f64_at(28));
        if found_band != band {
            return Err(malformed(&format!(
                "built for band {:?}, expected {:?}",
                found_band, band
            )));
        }

        let n = dims.0 * dims.1;
        if bytes.len() != CACHE_HEADER_SIZE + 8 * n {
            return Err(malformed("body size does not match dims"));
        }
        let data = (0..n)
            .map(|i| Cell {
                hits: f32_at(CACHE_HEADER_SIZE + 8 * i),
                passes: f32_at(CACHE_HEADER_SIZE + 4 + 8 * i),
            })
            .collect();

        Ok(Self {
            min_bound,
            voxel_width,
            cells: Grid::from_vec(dims.0, dims.1, data),
            band,
        })
    }

    /// Load a cache if one exists.
    pub fn load(
        path: &Path,
        min_bound: DVec3,
        dims: (usize, usize),
        voxel_width: f64,
        band: (f64, f64),
    ) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path).map_err(|e| RayError::open(path, e))?;
        let grid = Self::read_from(&mut BufReader::new(file), path, min_bound, dims, voxel_width, band)?;
        info!("reusing occupancy cache {}", path.display());
        Ok(Some(grid))
    }
}

/// Parameter range of the segment `p + t d`, `t` in [0, 1], inside
/// [0, size.x] × [0, size.y].
fn clip_to_box(p: DVec2, d: DVec2, size: DVec2) -> Option<(f64, f64)> {
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for axis in 0..2 {
        let (o, dir, max) = (p[axis], d[axis], size[axis]);
        if dir == 0.0 {
            if o < 0.0 || o > max {
                return None;
            }
            continue;
        }
        let a = (0.0 - o) / dir;
        let b = (max - o) / dir;
        t0 = t0.max(a.min(b));
        t1 = t1.min(a.max(b));
    }
    (t0 <= t1).then_some((t0, t1))
}
