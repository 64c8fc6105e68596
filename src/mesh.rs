//! Triangle meshes, used as ground surfaces.

use glam::{DVec2, DVec3};

use crate::grid::{cell_centre, Grid};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<DVec3>,
    pub index_list: Vec<[usize; 3]>,
}

impl Mesh {
    /// Rasterise the mesh into a height grid sampled at cell centres.
    ///
    /// Cells covered by several triangles keep the highest surface; cells no
    /// triangle covers are set to `min_bound.z`.
    pub fn to_height_field(&self, min_bound: DVec3, dims: (usize, usize), voxel_width: f64) -> Grid<f64> {
        let (nx, ny) = dims;
        let mut field = Grid::new(nx, ny, f64::NEG_INFINITY);

        for tri in &self.index_list {
            let [a, b, c] = tri.map(|i| self.vertices[i] - min_bound);

            let lo = a.min(b).min(c);
            let hi = a.max(b).max(c);
            let x0 = ((lo.x / voxel_width - 0.5).ceil().max(0.0)) as usize;
            let y0 = ((lo.y / voxel_width - 0.5).ceil().max(0.0)) as usize;
            let x1 = (hi.x / voxel_width - 0.5).floor();
            let y1 = (hi.y / voxel_width - 0.5).floor();
            if x1 < 0.0 || y1 < 0.0 {
                continue;
            }
            let x1 = (x1 as usize).min(nx.saturating_sub(1));
            let y1 = (y1 as usize).min(ny.saturating_sub(1));

            for x in x0..=x1 {
                for y in y0..=y1 {
                    let p = cell_centre(x, y, voxel_width);
                    if let Some(z) = interpolate(a, b, c, p) {
                        let cell = &mut field[(x, y)];
                        if z > *cell {
                            *cell = z;
                        }
                    }
                }
            }
        }

        field.map(|z| if z.is_finite() { z + min_bound.z } else { min_bound.z })
    }
}

/// Height of triangle `abc` above `p`, or None when `p` lies outside it.
fn interpolate(a: DVec3, b: DVec3, c: DVec3, p: DVec2) -> Option<f64> {
    let v0 = b.truncate() - a.truncate();
    let v1 = c.truncate() - a.truncate();
    let v2 = p - a.truncate();
    let den = v0.perp_dot(v1);
    if den.abs() < 1e-12 {
        return None;
    }
    let u = v2.perp_dot(v1) / den;
    let v = v0.perp_dot(v2) / den;
    const EPS: f64 = 1e-9;
    if u < -EPS || v < -EPS || u + v > 1.0 + EPS {
        return None;
    }
    Some(a.z + u * (b.z - a.z) + v * (c.z - a.z))
}
