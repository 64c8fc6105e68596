//! Hierarchical watershed over a canopy height field.
//!
//! Basins grow from strict local maxima in decreasing height order. When two
//! basins touch and their union is still narrow enough to be one tree, a merge
//! is queued at a flood level below the boundary height. Executing a merge
//! creates a parent node, so the result is a forest of binary merge trees
//! whose leaves are the original peaks.
//!
//! Nodes live in one arena. `attaches_to` links point from a child to the
//! parent that absorbed it; the root of any node is found by following them.
//! Links are never compressed because the paraboloid fit walks every
//! ancestor of each cell's owner.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

use glam::{DVec3, IVec2};
use tracing::{debug, info};

use crate::grid::{cell_centre, Grid, NO_DATA};
use crate::paraboloid::Paraboloid;

// ---------------------------------------------------------------------------
// Merge forest
// ---------------------------------------------------------------------------

/// A node of the merge forest.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    /// Highest cell of the basin: cell centre in metres (local frame), height in metres.
    pub peak: DVec3,
    /// Inclusive pixel bounds of every cell owned by the basin or its descendants.
    pub min_bound: IVec2,
    pub max_bound: IVec2,
    /// `[None, None]` for a leaf.
    pub children: [Option<usize>; 2],
    /// Parent node, None for a head.
    pub attaches_to: Option<usize>,
    /// Radius of a disk with the basin's area.
    pub approx_radius: f64,
    /// Ground height under the peak.
    pub ground_height: f64,
    pub paraboloid: Paraboloid,
}

impl TreeNode {
    fn leaf(x: usize, y: usize, height: f64, voxel_width: f64) -> Self {
        let pixel = IVec2::new(x as i32, y as i32);
        Self {
            peak: cell_centre(x, y, voxel_width).extend(height),
            min_bound: pixel,
            max_bound: pixel,
            children: [None, None],
            attaches_to: None,
            approx_radius: 0.0,
            ground_height: 0.0,
            paraboloid: Paraboloid::default(),
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children[0].is_none()
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        self.attaches_to.is_none()
    }

    fn grow(&mut self, pixel: IVec2) {
        self.min_bound = self.min_bound.min(pixel);
        self.max_bound = self.max_bound.max(pixel);
    }

    /// Cell containing the peak, clamped into a grid of `dims`.
    pub fn peak_cell(&self, voxel_width: f64, dims: (usize, usize)) -> (usize, usize) {
        let x = (self.peak.x / voxel_width).floor().max(0.0) as usize;
        let y = (self.peak.y / voxel_width).floor().max(0.0) as usize;
        (x.min(dims.0.saturating_sub(1)), y.min(dims.1.saturating_sub(1)))
    }
}

/// Output of the segmentation.
#[derive(Debug, Clone)]
pub struct WatershedForest {
    pub trees: Vec<TreeNode>,
    /// Roots of the merge trees.
    pub heads: BTreeSet<usize>,
    /// Node that claimed each cell, at the time it was claimed.
    pub index: Grid<Option<usize>>,
}

// ---------------------------------------------------------------------------
// Event queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Basin {
    /// Expand from cell (x, y), owned by `head` or one of its ancestors.
    Cell { x: usize, y: usize, head: usize },
    /// Merge the trees of `a` and `b`, which touch at cell (x, y).
    Merge { a: usize, b: usize, x: usize, y: usize },
}

/// Queue entry. Higher priority pops first; equal priorities pop in push order.
#[derive(Debug, Clone, Copy)]
struct BasinEvent {
    priority: f64,
    sequence: u64,
    basin: Basin,
}

impl PartialEq for BasinEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for BasinEvent {}

impl PartialOrd for BasinEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BasinEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

// ---------------------------------------------------------------------------
// Segmenter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct WatershedParams {
    /// Largest crown width per sqrt of tree height, metres per sqrt(metre).
    pub max_tree_canopy_width_to_height_ratio: f64,
    /// 1 merges at the boundary height, larger values defer merges further.
    pub flood_merge_scale: f64,
}

impl Default for WatershedParams {
    fn default() -> Self {
        Self {
            max_tree_canopy_width_to_height_ratio: 4.0,
            flood_merge_scale: 2.0,
        }
    }
}

/// State of one segmentation run.
pub struct Watershed<'a> {
    high: &'a Grid<f64>,
    low: &'a Grid<f64>,
    voxel_width: f64,
    params: WatershedParams,
    trees: Vec<TreeNode>,
    heads: BTreeSet<usize>,
    index: Grid<Option<usize>>,
    basins: BinaryHeap<BasinEvent>,
    sequence: u64,
}

impl<'a> Watershed<'a> {
    /// `high` and `low` must share dims.
    pub fn new(high: &'a Grid<f64>, low: &'a Grid<f64>, voxel_width: f64, params: WatershedParams) -> Self {
        Self {
            high,
            low,
            voxel_width,
            params,
            trees: Vec::new(),
            heads: BTreeSet::new(),
            index: Grid::new(high.nx, high.ny, None),
            basins: BinaryHeap::new(),
            sequence: 0,
        }
    }

    pub fn trees(&self) -> &[TreeNode] {
        &self.trees
    }

    pub fn heads(&self) -> &BTreeSet<usize> {
        &self.heads
    }

    fn push(&mut self, priority: f64, basin: Basin) {
        self.basins.push(BasinEvent {
            priority,
            sequence: self.sequence,
            basin,
        });
        self.sequence += 1;
    }

    /// Seed a leaf at every strict local maximum of the Moore neighbourhood.
    pub fn seed(&mut self) {
        let (nx, ny) = self.high.dims();
        for x in 0..nx {
            for y in 0..ny {
                let height = self.high[(x, y)];
                if height <= NO_DATA {
                    continue;
                }
                let mut max_neighbour = NO_DATA;
                for i in x.saturating_sub(1)..=(x + 1).min(nx - 1) {
                    for j in y.saturating_sub(1)..=(y + 1).min(ny - 1) {
                        if (i, j) != (x, y) {
                            max_neighbour = max_neighbour.max(self.high[(i, j)]);
                        }
                    }
                }
                if height > max_neighbour {
                    let id = self.trees.len();
                    self.trees.push(TreeNode::leaf(x, y, height, self.voxel_width));
                    self.heads.insert(id);
                    self.index[(x, y)] = Some(id);
                    self.push(height, Basin::Cell { x, y, head: id });
                }
            }
        }
        info!("initial number of peaks: {}", self.trees.len());
    }

    /// Current root of `node`.
    pub fn root(&self, mut node: usize) -> usize {
        while let Some(parent) = self.trees[node].attaches_to {
            node = parent;
        }
        node
    }

    /// Whether the union of heads `a` and `b`, touching at cell (x, y), is
    /// narrow enough for the height of its higher peak.
    pub fn merge_allowed(&self, a: usize, b: usize, x: usize, y: usize) -> bool {
        let (p, q) = (&self.trees[a], &self.trees[b]);
        let extent = p.max_bound.max(q.max_bound) - p.min_bound.min(q.min_bound);
        let peak_z = p.peak.z.max(q.peak.z);
        let tree_height = (peak_z - self.low[(x, y)]).max(0.0);
        let max_pixel_width =
            self.params.max_tree_canopy_width_to_height_ratio / self.voxel_width * tree_height.sqrt();
        extent.max_element() as f64 <= max_pixel_width
    }

    /// Queue a merge of heads `a` and `b` found while flooding from a cell
    /// of height `cell_height` into their boundary cell (x, y).
    pub fn queue_merge(&mut self, a: usize, b: usize, x: usize, y: usize, cell_height: f64) {
        let (p, q) = (self.trees[a].peak, self.trees[b].peak);
        let mid = cell_centre(x, y, self.voxel_width);
        let pq = q.truncate() - p.truncate();
        let blend = if pq.length_squared() > 0.0 {
            (mid - p.truncate()).dot(pq) / pq.length_squared()
        } else {
            0.5
        };
        let flood_base = p.z + (q.z - p.z) * blend;
        let priority = flood_base - (flood_base - cell_height) * self.params.flood_merge_scale;
        self.push(priority, Basin::Merge { a, b, x, y });
    }

    /// Merge the trees of `a` and `b`. Returns false when they already share a
    /// root or the union has grown too wide since the merge was queued.
    pub fn execute_merge(&mut self, a: usize, b: usize, x: usize, y: usize) -> bool {
        let (pa, pb) = (self.root(a), self.root(b));
        if pa == pb || !self.merge_allowed(pa, pb, x, y) {
            return false;
        }
        let (p, q) = (&self.trees[pa], &self.trees[pb]);
        let parent = TreeNode {
            peak: if p.peak.z > q.peak.z { p.peak } else { q.peak },
            min_bound: p.min_bound.min(q.min_bound),
            max_bound: p.max_bound.max(q.max_bound),
            children: [Some(pa), Some(pb)],
            attaches_to: None,
            approx_radius: 0.0,
            ground_height: 0.0,
            paraboloid: Paraboloid::default(),
        };
        let id = self.trees.len();
        self.trees.push(parent);
        self.trees[pa].attaches_to = Some(id);
        self.trees[pb].attaches_to = Some(id);
        self.heads.remove(&pa);
        self.heads.remove(&pb);
        self.heads.insert(id);
        debug!("merged {} and {} into {}", pa, pb, id);
        true
    }

    fn expand(&mut self, x: usize, y: usize, head: usize, cell_height: f64) {
        let root = self.root(head);
        let (x, y) = (x as isize, y as isize);
        for (xx, yy) in [(x - 1, y), (x, y + 1), (x, y - 1), (x + 1, y)] {
            let Some(owner) = self.index.get(xx, yy) else {
                continue;
            };
            let (xx, yy) = (xx as usize, yy as usize);
            match owner {
                Some(other) => {
                    let other = self.root(other);
                    if other != root && self.merge_allowed(root, other, xx, yy) {
                        self.queue_merge(root, other, xx, yy, cell_height);
                    }
                }
                None => {
                    let height = self.high[(xx, yy)];
                    if height > NO_DATA {
                        self.index[(xx, yy)] = Some(root);
                        self.trees[root].grow(IVec2::new(xx as i32, yy as i32));
                        self.push(height, Basin::Cell { x: xx, y: yy, head: root });
                    }
                }
            }
        }
    }

    /// Drain the queue.
    pub fn run(&mut self) {
        while let Some(event) = self.basins.pop() {
            match event.basin {
                Basin::Cell { x, y, head } => self.expand(x, y, head, event.priority),
                Basin::Merge { a, b, x, y } => {
                    self.execute_merge(a, b, x, y);
                }
            }
        }
        info!(
            "number of raw candidates: {}, number of heads: {}",
            self.trees.len(),
            self.heads.len()
        );
    }

    pub fn into_forest(self) -> WatershedForest {
        WatershedForest {
            trees: self.trees,
            heads: self.heads,
            index: self.index,
        }
    }
}

/// Clear cells lower than `undercroft` above the ground. Returns how many.
pub fn remove_undercroft(high: &mut Grid<f64>, low: &Grid<f64>, undercroft: f64) -> usize {
    let mut count = 0;
    for (h, l) in high.data.iter_mut().zip(&low.data) {
        if *h > NO_DATA && *h < l + undercroft {
            *h = NO_DATA;
            count += 1;
        }
    }
    info!("undercroft removed = {} out of {}", count, high.len());
    count
}

/// Segment a height field into a forest of merge trees.
pub fn hierarchical_watershed(
    high: &Grid<f64>,
    low: &Grid<f64>,
    voxel_width: f64,
    params: WatershedParams,
) -> WatershedForest {
    let mut watershed = Watershed::new(high, low, voxel_width, params);
    watershed.seed();
    watershed.run();
    watershed.into_forest()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Two ridges along x: a 20 m peak at x = 1 and a 19 m peak at x = 5,
    /// separated by a 15 m saddle at x = 3. The middle row is highest.
    fn two_peaks() -> Grid<f64> {
        let profile = [18.0, 20.0, 17.0, 15.0, 17.0, 19.0, 18.0];
        let mut high = Grid::new(7, 3, 0.0);
        for x in 0..7 {
            for y in 0..3 {
                high[(x, y)] = profile[x] - if y == 1 { 0.0 } else { 1.0 };
            }
        }
        high
    }

    #[test]
    fn test_seeds_are_strict_maxima() {
        let high = two_peaks();
        let low = Grid::new(7, 3, 0.0);
        let mut ws = Watershed::new(&high, &low, 1.0, WatershedParams::default());
        ws.seed();
        assert_eq!(ws.trees().len(), 2);
        assert_eq!(ws.trees()[0].peak, DVec3::new(1.5, 1.5, 20.0));
        assert_eq!(ws.trees()[1].peak, DVec3::new(5.5, 1.5, 19.0));
        assert_eq!(ws.heads().len(), 2);
    }

    #[test]
    fn test_close_peaks_merge() {
        let high = two_peaks();
        let low = Grid::new(7, 3, 0.0);
        let forest = hierarchical_watershed(&high, &low, 1.0, WatershedParams::default());

        assert_eq!(forest.trees.len(), 3, "one parent over two leaves");
        assert_eq!(forest.heads.iter().copied().collect::<Vec<_>>(), vec![2]);
        let parent = &forest.trees[2];
        assert_eq!(parent.children, [Some(0), Some(1)]);
        assert_eq!(parent.peak.z, 20.0);
        assert_eq!(parent.min_bound, IVec2::new(0, 0));
        assert_eq!(parent.max_bound, IVec2::new(6, 2));
        assert_eq!(forest.trees[0].attaches_to, Some(2));
        assert_eq!(forest.trees[1].attaches_to, Some(2));
        // every cell is claimed by one of the leaves
        assert!(forest.index.data.iter().all(|o| matches!(o, Some(0) | Some(1))));
    }

    #[test]
    fn test_narrow_ratio_keeps_peaks_apart() {
        let high = two_peaks();
        let low = Grid::new(7, 3, 0.0);
        let params = WatershedParams {
            max_tree_canopy_width_to_height_ratio: 0.5,
            ..Default::default()
        };
        let forest = hierarchical_watershed(&high, &low, 1.0, params);
        assert_eq!(forest.trees.len(), 2);
        assert_eq!(forest.heads.len(), 2);
        assert!(forest.trees.iter().all(|t| t.is_leaf() && t.is_head()));
    }

    #[test]
    fn test_repeated_merge_is_noop() {
        let high = two_peaks();
        let low = Grid::new(7, 3, 0.0);
        let mut ws = Watershed::new(&high, &low, 1.0, WatershedParams::default());
        ws.seed();
        ws.run();
        assert_eq!(ws.trees().len(), 3);

        assert!(!ws.execute_merge(0, 1, 3, 1));
        assert!(!ws.execute_merge(1, 2, 3, 1));
        assert_eq!(ws.trees().len(), 3);
        assert_eq!(ws.heads().len(), 1);
    }

    #[test]
    fn test_merge_priority_is_below_boundary() {
        let high = two_peaks();
        let low = Grid::new(7, 3, 0.0);
        let mut ws = Watershed::new(&high, &low, 1.0, WatershedParams::default());
        ws.seed();
        ws.queue_merge(0, 1, 3, 1, 15.0);
        let event = ws.basins.iter().find(|e| matches!(e.basin, Basin::Merge { .. })).copied();
        // boundary midway between peaks: base 19.5, 4.5 above the cell, doubled
        assert_eq!(event.map(|e| e.priority), Some(19.5 - 4.5 * 2.0));
    }

    #[test]
    fn test_merge_base_extrapolates_past_peak() {
        let high = two_peaks();
        let low = Grid::new(7, 3, 0.0);
        let mut ws = Watershed::new(&high, &low, 1.0, WatershedParams::default());
        ws.seed();
        // boundary cell beyond the 19 m peak: blend 1.25, base 18.75
        ws.queue_merge(0, 1, 6, 1, 18.0);
        let event = ws.basins.iter().find(|e| matches!(e.basin, Basin::Merge { .. })).copied();
        assert_eq!(event.map(|e| e.priority), Some(18.75 - 0.75 * 2.0));
    }

    #[test]
    fn test_undercroft_removal() {
        let mut high = Grid::from_vec(2, 1, vec![1.0, 5.0]);
        let low = Grid::new(2, 1, 0.0);
        assert_eq!(remove_undercroft(&mut high, &low, 1.5), 1);
        assert_eq!(high.data, vec![NO_DATA, 5.0]);
    }
}
