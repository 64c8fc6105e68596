//! Robust paraboloid fit of each candidate's canopy surface.
//!
//! The surface is `z = a r² + b dx + c dy + d`, with `(dx, dy)` the offset
//! from the node's peak and `r² = dx² + dy²`. It is solved by normal
//! equations, then re-solved nine times with each sample weighted by the
//! inverse of its last residual. That pulls the fit towards a median surface
//! and away from isolated outliers. The iteration count is fixed; nothing
//! checks for convergence.

use std::f64::consts::PI;

use glam::{DVec2, DVec3, IVec2};
use nalgebra::{Matrix4, Vector4};
use tracing::debug;

use crate::grid::{cell_centre, Grid};
use crate::watershed::{TreeNode, WatershedForest};

/// Solves in one fit: the first unweighted, then one per reweighting pass.
pub const FIT_ITERATIONS: usize = 10;

/// Residual floor for the reweighting, metres.
const MIN_RESIDUAL: f64 = 1e-2;

/// `z = a (dx² + dy²) + b dx + c dy + d` around `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Paraboloid {
    pub abcd: [f64; 4],
    pub origin: DVec2,
    /// Samples used in the fit.
    pub count: usize,
}

impl Paraboloid {
    pub fn height_at(&self, pos: DVec2) -> f64 {
        let [a, b, c, d] = self.abcd;
        let o = pos - self.origin;
        a * o.length_squared() + b * o.x + c * o.y + d
    }

    /// Positive for a downward-opening crown.
    pub fn curvature(&self) -> f64 {
        -self.abcd[0]
    }

    /// Radius of curvature at the apex.
    pub fn crown_radius(&self) -> f64 {
        1.0 / (2.0 * self.curvature())
    }

    /// Apex position in the frame of `origin`.
    pub fn apex(&self) -> DVec2 {
        let [a, b, c, _] = self.abcd;
        self.origin + DVec2::new(-b / (2.0 * a), -c / (2.0 * a))
    }

    pub fn apex_height(&self) -> f64 {
        let [a, b, c, d] = self.abcd;
        d - (b * b + c * c) / (4.0 * a)
    }
}

// ---------------------------------------------------------------------------
// Fitting
// ---------------------------------------------------------------------------

struct NormalEquations {
    mat: Matrix4<f64>,
    vec: Vector4<f64>,
}

impl NormalEquations {
    fn new() -> Self {
        Self {
            mat: Matrix4::zeros(),
            vec: Vector4::zeros(),
        }
    }

    fn clear(&mut self) {
        self.mat.fill(0.0);
        self.vec.fill(0.0);
    }

    fn add(&mut self, offset: DVec2, z: f64, weight: f64) {
        let row = Vector4::new(offset.length_squared(), offset.x, offset.y, 1.0);
        self.mat += row * row.transpose() * weight;
        self.vec += row * (z * weight);
    }

    fn solve(&self) -> Option<[f64; 4]> {
        let solution = self.mat.cholesky()?.solve(&self.vec);
        Some([solution[0], solution[1], solution[2], solution[3]])
    }
}

/// Fit a paraboloid to `points` (xy in metres, z height) around `origin`.
///
/// A singular system, for instance from fewer than four distinct samples,
/// leaves the surface flat.
pub fn fit_paraboloid(points: &[DVec3], origin: DVec2) -> Paraboloid {
    let mut fit = Paraboloid {
        abcd: [0.0; 4],
        origin,
        count: points.len(),
    };
    let mut eq = NormalEquations::new();
    for p in points {
        eq.add(p.truncate() - origin, p.z, 1.0);
    }
    let Some(mut abcd) = eq.solve() else {
        return fit;
    };

    for _ in 1..FIT_ITERATIONS {
        fit.abcd = abcd;
        eq.clear();
        for p in points {
            let residual = fit.height_at(p.truncate()) - p.z;
            eq.add(p.truncate() - origin, p.z, 1.0 / residual.abs().max(MIN_RESIDUAL));
        }
        match eq.solve() {
            Some(next) => abcd = next,
            None => break,
        }
    }
    fit.abcd = abcd;
    fit
}

impl TreeNode {
    /// Whether the fitted crown is a plausible single tree.
    pub fn valid_paraboloid(&self, max_tree_canopy_width_to_height_ratio: f64, voxel_width: f64) -> bool {
        let p = &self.paraboloid;
        let tree_height = self.peak.z - self.ground_height;
        if !(p.curvature() > 0.0) || !(tree_height > 0.0) {
            return false;
        }
        let radius = p.crown_radius();
        if radius < 0.5 * voxel_width
            || 2.0 * radius > max_tree_canopy_width_to_height_ratio * tree_height.sqrt()
        {
            return false;
        }
        let apex = p.apex() / voxel_width;
        if !apex.is_finite() {
            return false;
        }
        let pixel = IVec2::new(apex.x.floor() as i32, apex.y.floor() as i32);
        pixel.cmpge(self.min_bound - IVec2::ONE).all() && pixel.cmple(self.max_bound + IVec2::ONE).all()
    }
}

/// Fit every node of the forest to the cells it owns, directly or through
/// its descendants, and set its area radius and ground height.
pub fn calculate_tree_paraboloids(forest: &mut WatershedForest, high: &Grid<f64>, low: &Grid<f64>, voxel_width: f64) {
    let mut point_lists: Vec<Vec<DVec3>> = vec![Vec::new(); forest.trees.len()];
    let (nx, ny) = forest.index.dims();
    for x in 0..nx {
        for y in 0..ny {
            let mut owner = forest.index[(x, y)];
            let point = cell_centre(x, y, voxel_width).extend(high[(x, y)]);
            while let Some(node) = owner {
                point_lists[node].push(point);
                owner = forest.trees[node].attaches_to;
            }
        }
    }

    for (tree, points) in forest.trees.iter_mut().zip(&point_lists) {
        tree.approx_radius = voxel_width * (points.len() as f64 / PI).sqrt();
        tree.ground_height = low[tree.peak_cell(voxel_width, low.dims())];
        tree.paraboloid = fit_paraboloid(points, tree.peak.truncate());
    }
    debug!("fitted {} paraboloids", forest.trees.len());
}
