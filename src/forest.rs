//! Tree extraction: from fields to a list of trees.
//!
//! Pipeline: undercroft removal → hierarchical watershed → paraboloid fit →
//! best-cut search over each merge tree → one cluster per selected node →
//! trunk attachment → free-space search for the base of each tree.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use glam::{DVec2, DVec3};
use tracing::{info, warn};

use crate::error::{RayError, Result};
use crate::grid::{cell_centre, Grid, NO_DATA};
use crate::heightfield::{build_fields, FieldParams, ForestFields, GroundSource};
use crate::paraboloid::calculate_tree_paraboloids;
use crate::watershed::{hierarchical_watershed, remove_undercroft, TreeNode, WatershedForest, WatershedParams};

/// Error returned for a subtree with no valid candidate.
const NO_CANDIDATE_ERROR: f64 = 1e20;

// ---------------------------------------------------------------------------
// Parameters and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ForestParams {
    /// Height above ground below which cells are not canopy (m).
    pub undercroft_height: f64,
    /// Largest crown width per sqrt(tree height).
    pub max_tree_canopy_width_to_height_ratio: f64,
    /// Merge deferral factor of the watershed.
    pub flood_merge_scale: f64,
    /// Crown radius over crown length; 1 for a sphere, 0.5 for a tall ellipsoid.
    pub tree_roundness: f64,
    /// Tree height over trunk radius, for trees without a known trunk.
    pub height_per_radius: f64,
    /// Free-space search radius per metre of canopy height.
    pub search_down_gradient: f64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            undercroft_height: 1.5,
            max_tree_canopy_width_to_height_ratio: 4.0,
            flood_merge_scale: 2.0,
            tree_roundness: 0.5,
            height_per_radius: 50.0,
            search_down_gradient: 0.2,
        }
    }
}

impl ForestParams {
    pub fn watershed(&self) -> WatershedParams {
        WatershedParams {
            max_tree_canopy_width_to_height_ratio: self.max_tree_canopy_width_to_height_ratio,
            flood_merge_scale: self.flood_merge_scale,
        }
    }
}

/// One extracted tree, in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeSummary {
    /// Trunk base on the ground.
    pub base: DVec3,
    pub height: f64,
    /// Trunk radius.
    pub radius: f64,
    /// True when the base comes from a known trunk.
    pub trunk_identified: bool,
}

/// A known trunk in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trunk {
    pub pos: DVec3,
    pub radius: f64,
}

/// Canopy points of one candidate tree, in the local frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Indices into the shared canopy point list.
    pub ids: Vec<usize>,
    pub min_bound: DVec3,
    pub max_bound: DVec3,
    pub trunk_id: Option<usize>,
}

/// Counts gathered during one extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionReport {
    pub undercroft_removed: usize,
    pub peaks: usize,
    pub raw_candidates: usize,
    pub heads: usize,
    pub selected: usize,
    pub trunks_attached: usize,
    /// Candidates dropped because no base location was found.
    pub no_space: usize,
}

// ---------------------------------------------------------------------------
// Best-cut search
// ---------------------------------------------------------------------------

/// Choose the best cut of the merge tree under `ind`, appending the chosen
/// node indices to `indices`. Returns the error of the cut.
///
/// A node's error is the geometric mean of how far two base estimates land
/// from the ground: one from the crown radius, one from the basin area.
pub fn search_trees(
    trees: &[TreeNode],
    ind: usize,
    length_per_radius: f64,
    max_tree_canopy_width_to_height_ratio: f64,
    voxel_width: f64,
    indices: &mut Vec<usize>,
) -> f64 {
    let node = &trees[ind];
    let height = node.paraboloid.apex_height();
    let base_a = height - length_per_radius * node.paraboloid.crown_radius();
    let base_b = height - length_per_radius * node.approx_radius;
    let error = ((base_a - node.ground_height).abs() * (base_b - node.ground_height).abs()).sqrt();
    let valid = node.valid_paraboloid(max_tree_canopy_width_to_height_ratio, voxel_width);

    let [Some(first), second] = node.children else {
        if valid {
            indices.push(ind);
            return error;
        }
        return NO_CANDIDATE_ERROR;
    };

    let mut child_indices = Vec::new();
    let mut child_error = search_trees(
        trees,
        first,
        length_per_radius,
        max_tree_canopy_width_to_height_ratio,
        voxel_width,
        &mut child_indices,
    );
    if let Some(second) = second {
        let second_error = search_trees(
            trees,
            second,
            length_per_radius,
            max_tree_canopy_width_to_height_ratio,
            voxel_width,
            &mut child_indices,
        );
        child_error = (child_error + second_error) / 2.0;
    }

    if error < child_error && valid {
        indices.push(ind);
        return error;
    }
    indices.extend(child_indices);
    child_error
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

/// Canopy points `(x, y, height above ground)` of every owned cell, and one
/// cluster per selected node holding the points beneath it.
pub fn clusters_from_selection(
    forest: &WatershedForest,
    selected: &[usize],
    high: &Grid<f64>,
    low: &Grid<f64>,
    voxel_width: f64,
) -> (Vec<DVec3>, Vec<Cluster>) {
    let slot: HashMap<usize, usize> = selected.iter().enumerate().map(|(i, &n)| (n, i)).collect();
    let mut clusters: Vec<Cluster> = selected
        .iter()
        .map(|&n| {
            let node = &forest.trees[n];
            Cluster {
                ids: Vec::new(),
                min_bound: (node.min_bound.as_dvec2() * voxel_width).extend(0.0),
                max_bound: ((node.max_bound.as_dvec2() + DVec2::ONE) * voxel_width)
                    .extend(node.peak.z - node.ground_height),
                trunk_id: None,
            }
        })
        .collect();

    let mut points = Vec::new();
    let (nx, ny) = high.dims();
    for x in 0..nx {
        for y in 0..ny {
            let (h, l) = (high[(x, y)], low[(x, y)]);
            if h <= NO_DATA || h < l {
                continue;
            }
            let mut owner = forest.index[(x, y)];
            while let Some(node) = owner {
                if let Some(&c) = slot.get(&node) {
                    clusters[c].ids.push(points.len());
                    points.push(cell_centre(x, y, voxel_width).extend(h - l));
                    break;
                }
                owner = forest.trees[node].attaches_to;
            }
        }
    }
    (points, clusters)
}

/// Attach each trunk to the first free cluster whose footprint contains it.
/// Returns how many were attached.
pub fn attach_trunks(clusters: &mut [Cluster], trunks: &[Trunk], min_bound: DVec3) -> usize {
    let mut attached = 0;
    for (t, trunk) in trunks.iter().enumerate() {
        let local = (trunk.pos - min_bound).truncate();
        let found = clusters.iter_mut().find(|c| {
            c.trunk_id.is_none()
                && local.cmpge(c.min_bound.truncate()).all()
                && local.cmple(c.max_bound.truncate()).all()
        });
        if let Some(cluster) = found {
            cluster.trunk_id = Some(t);
            attached += 1;
        }
    }
    attached
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Runs extraction over one set of fields.
pub struct Forest<'a> {
    fields: &'a ForestFields,
    params: ForestParams,
    trunks: Vec<Trunk>,
}

impl<'a> Forest<'a> {
    pub fn new(fields: &'a ForestFields, params: ForestParams, trunks: Vec<Trunk>) -> Self {
        Self {
            fields,
            params,
            trunks,
        }
    }

    /// Top of the trunk of `cluster` in the local frame: x, y of the base and
    /// z of the canopy top. None when the candidate has nowhere to stand.
    pub fn find_space(&self, cluster: &Cluster, points: &[DVec3]) -> Option<DVec3> {
        let top = cluster.max_bound.z;
        let centre = (cluster.min_bound + cluster.max_bound) / 2.0;
        if cluster.ids.is_empty() {
            return Some(centre.truncate().extend(top));
        }
        if let Some(t) = cluster.trunk_id {
            let local = self.trunks[t].pos - self.fields.min_bound;
            return Some(local.truncate().extend(top));
        }

        let (weighted_sum, weight) = cluster
            .ids
            .iter()
            .map(|&i| points[i])
            .fold((DVec3::ZERO, 0.0), |(sum, w), p| (sum + p * p.z, w + p.z));
        if !(weight > 0.0) {
            return Some(centre.truncate().extend(top));
        }
        let vw = self.fields.voxel_width;
        let tip = weighted_sum / weight / vw;
        let radius = (tip.z * self.params.search_down_gradient).max(1.0);

        let space = &self.fields.space;
        let (nx, ny) = space.dims();
        let lo_x = (tip.x - radius).floor().max(0.0) as usize;
        let lo_y = (tip.y - radius).floor().max(0.0) as usize;
        let hi_x = (tip.x + radius).floor().min(nx as f64 - 1.0);
        let hi_y = (tip.y + radius).floor().min(ny as f64 - 1.0);
        if hi_x < lo_x as f64 || hi_y < lo_y as f64 {
            return None;
        }

        let mut best: Option<((usize, usize), f64)> = None;
        for x in lo_x..=hi_x as usize {
            for y in lo_y..=hi_y as usize {
                let offset = (DVec2::new(x as f64 + 0.5, y as f64 + 0.5) - tip.truncate()) / radius;
                // slight preference for cells near the centroid
                let score = space[(x, y)] - 0.25 * offset.length_squared();
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some(((x, y), score));
                }
            }
        }
        best.map(|((x, y), _)| cell_centre(x, y, vw).extend(top))
    }

    pub fn extract(&self) -> (Vec<TreeSummary>, ExtractionReport) {
        let fields = self.fields;
        let params = &self.params;
        let vw = fields.voxel_width;
        let mut report = ExtractionReport::default();

        let mut high = fields.high.clone();
        report.undercroft_removed = remove_undercroft(&mut high, &fields.low, params.undercroft_height);

        let mut forest = hierarchical_watershed(&high, &fields.low, vw, params.watershed());
        report.peaks = forest.trees.iter().filter(|t| t.is_leaf()).count();
        report.raw_candidates = forest.trees.len();
        report.heads = forest.heads.len();
        calculate_tree_paraboloids(&mut forest, &high, &fields.low, vw);

        let mut selected = Vec::new();
        for &head in &forest.heads {
            search_trees(
                &forest.trees,
                head,
                1.0 / params.tree_roundness,
                params.max_tree_canopy_width_to_height_ratio,
                vw,
                &mut selected,
            );
        }
        report.selected = selected.len();
        info!("{} candidates selected from {} heads", selected.len(), forest.heads.len());

        let (points, mut clusters) = clusters_from_selection(&forest, &selected, &high, &fields.low, vw);
        report.trunks_attached = attach_trunks(&mut clusters, &self.trunks, fields.min_bound);

        let mut results = Vec::with_capacity(clusters.len());
        for cluster in &clusters {
            let Some(tip) = self.find_space(cluster, &points) else {
                report.no_space += 1;
                continue;
            };
            let cell = fields.low.cell_of(tip.truncate(), vw);
            let mut base = fields.min_bound + tip;
            base.z = fields.low[cell];
            let height = tip.z;
            let (radius, trunk_identified) = match cluster.trunk_id {
                Some(t) => (self.trunks[t].radius, true),
                None => (height / params.height_per_radius, false),
            };
            results.push(TreeSummary {
                base,
                height,
                radius,
                trunk_identified,
            });
        }
        results.sort_by(|a, b| b.height.total_cmp(&a.height));

        if report.no_space > 0 {
            warn!("{} candidates have no free space for a trunk, removing them", report.no_space);
        }
        info!("extracted {} trees", results.len());
        (results, report)
    }
}

/// Extract trees from prepared fields.
pub fn extract(fields: &ForestFields, trunks: &[Trunk], params: &ForestParams) -> (Vec<TreeSummary>, ExtractionReport) {
    Forest::new(fields, params.clone(), trunks.to_vec()).extract()
}

/// Build the fields of a ray cloud file and extract its trees.
pub fn extract_from_cloud(
    cloud_path: &Path,
    ground: &GroundSource,
    field_params: &FieldParams,
    params: &ForestParams,
    trunks: &[Trunk],
) -> Result<(ForestFields, Vec<TreeSummary>, ExtractionReport)> {
    let fields = build_fields(cloud_path, ground, field_params)?;
    let (trees, report) = extract(&fields, trunks, params);
    Ok((fields, trees, report))
}

// ---------------------------------------------------------------------------
// Trunk lists
// ---------------------------------------------------------------------------

/// Parse `x y z radius` rows, comma or whitespace separated, `#` comments.
pub fn parse_trunks(text: &str, path: &Path) -> Result<Vec<Trunk>> {
    let delimiter = if text.contains(',') { b',' } else { b' ' };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut trunks = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |p| p.line() as usize);
        let values = record
            .iter()
            .filter(|f| !f.is_empty())
            .map(|f| {
                f.parse::<f64>().map_err(|_| RayError::TrunkList {
                    path: path.to_path_buf(),
                    line,
                    reason: format!("cannot parse '{}'", f),
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        if values.is_empty() {
            continue;
        }
        if values.len() < 4 {
            return Err(RayError::TrunkList {
                path: path.to_path_buf(),
                line,
                reason: format!("expected 'x y z radius', found {} values", values.len()),
            });
        }
        trunks.push(Trunk {
            pos: DVec3::new(values[0], values[1], values[2]),
            radius: values[3],
        });
    }
    Ok(trunks)
}

pub fn load_trunks(path: &Path) -> Result<Vec<Trunk>> {
    let text = fs::read_to_string(path).map_err(|e| RayError::open(path, e))?;
    let trunks = parse_trunks(&text, path)?;
    info!("loaded {} trunks from {}", trunks.len(), path.display());
    Ok(trunks)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paraboloid::Paraboloid;
    use glam::IVec2;

    fn node(peak: DVec3, ground: f64, crown_radius: f64, approx_radius: f64) -> TreeNode {
        TreeNode {
            peak,
            min_bound: IVec2::new(0, 0),
            max_bound: IVec2::new(10, 10),
            children: [None, None],
            attaches_to: None,
            approx_radius,
            ground_height: ground,
            paraboloid: Paraboloid {
                abcd: [-1.0 / (2.0 * crown_radius), 0.0, 0.0, peak.z],
                origin: peak.truncate(),
                count: 50,
            },
        }
    }

    /// Parent over two leaves. Children have error `child_error`-ish
    /// depending on `child_approx`; the parent's error is sqrt(2 * 4).
    fn two_level(child_crown: f64, child_approx: f64) -> Vec<TreeNode> {
        let mut a = node(DVec3::new(3.5, 5.5, 18.0), 10.0, child_crown, child_approx);
        let mut b = node(DVec3::new(7.5, 5.5, 18.0), 10.0, child_crown, child_approx);
        a.attaches_to = Some(2);
        b.attaches_to = Some(2);
        let mut parent = node(DVec3::new(5.5, 5.5, 20.0), 10.0, 4.0, 3.0);
        parent.children = [Some(0), Some(1)];
        vec![a, b, parent]
    }

    #[test]
    fn test_best_cut_prefers_parent_with_lower_error() {
        // children: bases at 14 and 14, error 4; parent: bases 12 and 14, error sqrt(8)
        let trees = two_level(2.0, 2.0);
        let mut indices = Vec::new();
        let error = search_trees(&trees, 2, 2.0, 4.0, 1.0, &mut indices);
        assert_eq!(indices, vec![2]);
        assert!((error - 8f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_best_cut_prefers_children_with_lower_error() {
        // children: both bases at 11, error 1
        let trees = two_level(3.5, 3.5);
        let mut indices = Vec::new();
        let error = search_trees(&trees, 2, 2.0, 4.0, 1.0, &mut indices);
        assert_eq!(indices, vec![0, 1]);
        assert!((error - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_best_cut_skips_invalid_parent() {
        let mut trees = two_level(2.0, 2.0);
        trees[2].paraboloid.abcd[0] = 0.1;
        let mut indices = Vec::new();
        search_trees(&trees, 2, 2.0, 4.0, 1.0, &mut indices);
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_invalid_leaf_yields_nothing() {
        let mut trees = vec![node(DVec3::new(5.5, 5.5, 18.0), 10.0, 2.0, 2.0)];
        trees[0].paraboloid.abcd[0] = 0.5;
        let mut indices = Vec::new();
        assert_eq!(search_trees(&trees, 0, 2.0, 4.0, 1.0, &mut indices), NO_CANDIDATE_ERROR);
        assert!(indices.is_empty());
    }

    /// A 21 x 21 m paraboloid crown, 20 m tall, centred on cell (10, 10),
    /// standing on flat ground at z = 50. Density is 0.5 except at `dense`.
    fn crown_fields(dense: (usize, usize)) -> ForestFields {
        let min_bound = DVec3::new(100.0, 200.0, 50.0);
        let mut high = Grid::new(21, 21, NO_DATA);
        for x in 0..21 {
            for y in 0..21 {
                let r2 = (x as f64 - 10.0).powi(2) + (y as f64 - 10.0).powi(2);
                high[(x, y)] = 50.0 + 20.0 - 0.1 * r2;
            }
        }
        let mut space = Grid::new(21, 21, 0.5);
        space[dense] = 0.95;
        ForestFields {
            high,
            low: Grid::new(21, 21, 50.0),
            space,
            voxel_width: 1.0,
            min_bound,
            max_bound: min_bound + DVec3::new(21.0, 21.0, 20.0),
        }
    }

    #[test]
    fn test_extract_places_base_on_dense_cell() {
        let fields = crown_fields((12, 10));
        let (trees, report) = extract(&fields, &[], &ForestParams::default());

        assert_eq!(report.peaks, 1);
        assert_eq!(report.selected, 1);
        assert_eq!(report.no_space, 0);
        assert_eq!(trees.len(), 1);
        let tree = trees[0];
        assert!((tree.height - 20.0).abs() < 1e-9);
        assert_eq!(tree.base, DVec3::new(112.5, 210.5, 50.0));
        assert!((tree.radius - 0.4).abs() < 1e-9);
        assert!(!tree.trunk_identified);
    }

    #[test]
    fn test_extract_uses_known_trunk() {
        let fields = crown_fields((12, 10));
        let trunks = [Trunk {
            pos: DVec3::new(109.5, 210.5, 50.0),
            radius: 0.3,
        }];
        let (trees, report) = extract(&fields, &trunks, &ForestParams::default());
        assert_eq!(report.trunks_attached, 1);
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].base, DVec3::new(109.5, 210.5, 50.0));
        assert_eq!(trees[0].radius, 0.3);
        assert!(trees[0].trunk_identified);
    }

    #[test]
    fn test_find_space_fallbacks() {
        let fields = crown_fields((0, 0));
        let forest = Forest::new(&fields, ForestParams::default(), Vec::new());

        // no points: centre of the bounds
        let empty = Cluster {
            ids: Vec::new(),
            min_bound: DVec3::new(2.0, 4.0, 0.0),
            max_bound: DVec3::new(6.0, 8.0, 12.0),
            trunk_id: None,
        };
        assert_eq!(forest.find_space(&empty, &[]), Some(DVec3::new(4.0, 6.0, 12.0)));

        // centroid far outside the grid: nowhere to stand
        let points = [DVec3::new(80.0, 80.0, 10.0)];
        let outside = Cluster {
            ids: vec![0],
            ..empty.clone()
        };
        assert_eq!(forest.find_space(&outside, &points), None);

        // uniform density: the cell under the centroid wins
        let points = [DVec3::new(15.5, 5.5, 10.0), DVec3::new(15.5, 5.5, 4.0)];
        let inside = Cluster {
            ids: vec![0, 1],
            ..empty
        };
        assert_eq!(forest.find_space(&inside, &points), Some(DVec3::new(15.5, 5.5, 12.0)));
    }

    #[test]
    fn test_trunks_attach_once() {
        let cluster = |x0: f64| Cluster {
            ids: Vec::new(),
            min_bound: DVec3::new(x0, 0.0, 0.0),
            max_bound: DVec3::new(x0 + 4.0, 4.0, 10.0),
            trunk_id: None,
        };
        let mut clusters = vec![cluster(0.0), cluster(4.0)];
        let trunk = |x: f64| Trunk {
            pos: DVec3::new(x, 2.0, 0.0),
            radius: 0.2,
        };
        let attached = attach_trunks(&mut clusters, &[trunk(1.0), trunk(2.0), trunk(20.0), trunk(5.0)], DVec3::ZERO);
        assert_eq!(attached, 2);
        assert_eq!(clusters[0].trunk_id, Some(0));
        assert_eq!(clusters[1].trunk_id, Some(3));
    }

    #[test]
    fn test_parse_trunks_formats() {
        let path = Path::new("trunks.txt");
        let spaced = "# x y z radius\n1 2 3 0.25\n\n4  5 6 0.5\n";
        let trunks = parse_trunks(spaced, path).unwrap();
        assert_eq!(trunks.len(), 2);
        assert_eq!(trunks[1].pos, DVec3::new(4.0, 5.0, 6.0));

        let commas = "1.5, 2.5, 3.5, 0.1\n";
        let trunks = parse_trunks(commas, path).unwrap();
        assert_eq!(trunks[0].radius, 0.1);

        assert!(matches!(
            parse_trunks("1 2 3\n", path),
            Err(RayError::TrunkList { .. })
        ));
    }
}
