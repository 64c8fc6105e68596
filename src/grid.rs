//! Dense 2D grid used for height, ground, density and ownership fields.

use std::ops::{Index, IndexMut};

use glam::DVec2;

/// Height value for cells that received no bounded return.
pub const NO_DATA: f64 = -1e10;

/// A 2D grid stored x-major: cell (x, y) lives at `x * ny + y`.
///
/// Cell (x, y) covers the square
///   [x * voxel_width, (x + 1) * voxel_width) × [y * voxel_width, (y + 1) * voxel_width)
/// of the scan's local frame (origin at the minimum bound).
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    pub nx: usize,
    pub ny: usize,
    pub data: Vec<T>,
}

impl<T: Copy> Grid<T> {
    /// Create a new grid filled with a constant value.
    pub fn new(nx: usize, ny: usize, fill: T) -> Self {
        Self {
            nx,
            ny,
            data: vec![fill; nx * ny],
        }
    }

    /// Create a grid from an existing x-major Vec.
    pub fn from_vec(nx: usize, ny: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), nx * ny);
        Self { nx, ny, data }
    }

    #[inline]
    pub fn dims(&self) -> (usize, usize) {
        (self.nx, self.ny)
    }

    #[inline]
    pub fn contains(&self, x: isize, y: isize) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.nx && (y as usize) < self.ny
    }

    /// Value at (x, y), or None outside the grid.
    #[inline]
    pub fn get(&self, x: isize, y: isize) -> Option<T> {
        if self.contains(x, y) {
            Some(self.data[x as usize * self.ny + y as usize])
        } else {
            None
        }
    }

    /// Cell containing a local-frame position, clamped into the grid.
    pub fn cell_of(&self, pos: DVec2, voxel_width: f64) -> (usize, usize) {
        let x = (pos.x / voxel_width).floor().max(0.0) as usize;
        let y = (pos.y / voxel_width).floor().max(0.0) as usize;
        (
            x.min(self.nx.saturating_sub(1)),
            y.min(self.ny.saturating_sub(1)),
        )
    }

    pub fn len(&self) -> usize {
        self.nx * self.ny
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn map<U: Copy, F: Fn(T) -> U>(&self, f: F) -> Grid<U> {
        Grid {
            nx: self.nx,
            ny: self.ny,
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }
}

/// Centre of cell (x, y) in the local frame.
#[inline]
pub fn cell_centre(x: usize, y: usize, voxel_width: f64) -> DVec2 {
    DVec2::new(
        voxel_width * (x as f64 + 0.5),
        voxel_width * (y as f64 + 0.5),
    )
}

impl<T> Index<(usize, usize)> for Grid<T> {
    type Output = T;
    fn index(&self, (x, y): (usize, usize)) -> &T {
        &self.data[x * self.ny + y]
    }
}

impl<T> IndexMut<(usize, usize)> for Grid<T> {
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut T {
        &mut self.data[x * self.ny + y]
    }
}
