//! Ray cloud import, inspection and tree extraction.
//!
//! Usage:
//!   raytrees import scan.laz trajectory.txt
//!   raytrees info scan.ply
//!   raytrees trees scan.ply --mesh ground.ply --output trees.csv
//!
//! `trees` writes one row per tree: x, y, z, height, radius, trunk_identified

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use csv::Writer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raytrees::cloud::CloudInfo;
use raytrees::forest::{extract, load_trunks, ForestParams, TreeSummary};
use raytrees::geotiff::{load_geotiff, write_field_tiff};
use raytrees::heightfield::{build_fields, FieldParams, ForestFields, GroundSource};
use raytrees::import::import_cloud;
use raytrees::ply::{read_ply_mesh, PlyHeader, RayReader, DEFAULT_CHUNK_SIZE};

// ==========================================================================
// CLI (clap)
// ==========================================================================

#[derive(Parser, Debug)]
#[command(name = "raytrees", about = "Ray cloud tools and tree extraction", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a point cloud (ply, las, laz) and its trajectory into a ray cloud
    Import {
        #[arg(value_name = "CLOUD")]
        cloud: PathBuf,
        /// `time x y z` text file, or a ply whose points are the trajectory
        #[arg(value_name = "TRAJECTORY")]
        trajectory: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Print bounds, counts and data-quality warnings of a ray cloud
    Info {
        #[arg(value_name = "CLOUD.ply")]
        cloud: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Extract trees from a ray cloud
    Trees(TreesArgs),
}

#[derive(Args, Debug)]
struct TreesArgs {
    #[arg(value_name = "CLOUD.ply")]
    cloud: PathBuf,

    /// Ground mesh (ply)
    #[arg(long, value_name = "GROUND.ply", conflicts_with = "dtm")]
    mesh: Option<PathBuf>,

    /// Ground raster (GeoTIFF)
    #[arg(long, value_name = "DTM.tif")]
    dtm: Option<PathBuf>,

    /// Known trunks, `x y z radius` per line
    #[arg(long, value_name = "TRUNKS.txt")]
    trunks: Option<PathBuf>,

    /// Output CSV, default `<cloud>_trees.csv`
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Also write the high, low and space fields as float TIFFs
    #[arg(long)]
    diagnostics: bool,

    /// Cell size (m)
    #[arg(long, default_value_t = 1.0)]
    voxel_width: f64,

    /// Bottom of the trunk band above ground (m)
    #[arg(long, default_value_t = 1.0)]
    band_low: f64,

    /// Top of the trunk band above ground (m)
    #[arg(long, default_value_t = 1.5)]
    band_high: f64,

    /// Canopy below this height above ground is ignored (m)
    #[arg(long, default_value_t = 1.5)]
    undercroft_height: f64,

    /// Largest crown width per sqrt(tree height)
    #[arg(long, default_value_t = 4.0)]
    max_canopy_ratio: f64,

    /// Merge deferral of the watershed
    #[arg(long, default_value_t = 2.0)]
    flood_merge_scale: f64,

    /// Crown radius over crown length
    #[arg(long, default_value_t = 0.5)]
    tree_roundness: f64,

    /// Tree height over trunk radius
    #[arg(long, default_value_t = 50.0)]
    height_per_radius: f64,

    /// Base search radius per metre of canopy height
    #[arg(long, default_value_t = 0.2)]
    search_down_gradient: f64,

    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

impl TreesArgs {
    fn field_params(&self) -> FieldParams {
        FieldParams {
            voxel_width: self.voxel_width,
            band_low: self.band_low,
            band_high: self.band_high,
            chunk_size: self.chunk_size,
        }
    }

    fn forest_params(&self) -> ForestParams {
        ForestParams {
            undercroft_height: self.undercroft_height,
            max_tree_canopy_width_to_height_ratio: self.max_canopy_ratio,
            flood_merge_scale: self.flood_merge_scale,
            tree_roundness: self.tree_roundness,
            height_per_radius: self.height_per_radius,
            search_down_gradient: self.search_down_gradient,
        }
    }

    fn ground(&self) -> Result<GroundSource> {
        if let Some(path) = &self.mesh {
            let mesh = read_ply_mesh(path).with_context(|| format!("loading ground mesh {}", path.display()))?;
            return Ok(GroundSource::Mesh(mesh));
        }
        if let Some(path) = &self.dtm {
            let dtm = load_geotiff(path).with_context(|| format!("loading DTM {}", path.display()))?;
            return Ok(GroundSource::Raster(dtm));
        }
        Ok(GroundSource::Flat)
    }
}

/// `<stub><suffix>` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.with_extension("").into_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

// ==========================================================================
// Export CSV
// ==========================================================================

fn export_csv(trees: &[TreeSummary], path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut wtr = Writer::from_writer(BufWriter::new(file));

    wtr.write_record(["x", "y", "z", "height", "radius", "trunk_identified"])?;
    for t in trees {
        wtr.write_record([
            format!("{:.3}", t.base.x),
            format!("{:.3}", t.base.y),
            format!("{:.3}", t.base.z),
            format!("{:.3}", t.height),
            format!("{:.3}", t.radius),
            u8::from(t.trunk_identified).to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_diagnostics(fields: &ForestFields, cloud: &Path) -> Result<()> {
    for (suffix, grid) in [("_high.tif", &fields.high), ("_low.tif", &fields.low), ("_space.tif", &fields.space)] {
        let path = sibling(cloud, suffix);
        write_field_tiff(&path, grid, fields.min_bound, fields.voxel_width)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("wrote {}", path.display());
    }
    Ok(())
}

// ==========================================================================
// Subcommands
// ==========================================================================

fn run_import(cloud: &Path, trajectory: &Path, chunk_size: usize) -> Result<()> {
    let t0 = Instant::now();
    let out = import_cloud(cloud, trajectory, chunk_size)
        .with_context(|| format!("importing {} with {}", cloud.display(), trajectory.display()))?;
    println!("wrote {} in {:.2}s", out.display(), t0.elapsed().as_secs_f64());
    Ok(())
}

/// Optional PLY properties present in `header`.
fn optional_columns(header: &PlyHeader) -> String {
    let columns: Vec<&str> = [
        ("time", header.has_time()),
        ("colour", header.has_colour()),
        ("intensity", header.has_intensity()),
        ("normals", header.has_normals()),
    ]
    .into_iter()
    .filter_map(|(name, present)| present.then_some(name))
    .collect();
    columns.join(", ")
}

/// `info` streams without sorting, so it can only report the order.
fn time_order_note(times_monotonic: bool) -> Option<&'static str> {
    (!times_monotonic).then_some("times are out of order (not sorted by info)")
}

fn run_info(cloud: &Path, chunk_size: usize) -> Result<()> {
    let reader = RayReader::open(cloud).with_context(|| format!("opening {}", cloud.display()))?;
    let columns = optional_columns(reader.header());
    let mut summary = CloudInfo {
        min_time: f64::INFINITY,
        max_time: f64::NEG_INFINITY,
        ..Default::default()
    };
    let report = reader.read_chunks(true, chunk_size, |chunk| {
        summary.add(chunk);
        Ok(())
    })?;

    let (lo, hi) = (summary.ends_bound.min, summary.ends_bound.max);
    println!("{}", cloud.display());
    println!("   rays        : {} ({} bounded, {} unbounded)", summary.num_rays(), summary.num_bounded, summary.num_unbounded);
    println!("   ends min    : {:.3}, {:.3}, {:.3}", lo.x, lo.y, lo.z);
    println!("   ends max    : {:.3}, {:.3}, {:.3}", hi.x, hi.y, hi.z);
    let extent = summary.ends_bound.extent();
    println!("   extent      : {:.1} x {:.1} x {:.1} m", extent.x, extent.y, extent.z);
    println!("   properties  : {}", columns);
    println!("   time range  : {:.3} to {:.3} s", summary.min_time, summary.max_time);
    println!(
        "   dropped     : {} invalid ends, {} invalid starts",
        report.dropped_invalid_end, report.dropped_invalid_start
    );
    if let Some(note) = time_order_note(report.times_monotonic) {
        println!("   {}", note);
    }
    for (_, message) in &report.warnings {
        println!("   warning     : {}", message);
    }
    Ok(())
}

fn run_trees(args: &TreesArgs) -> Result<()> {
    if !(args.tree_roundness > 0.0) {
        bail!("--tree-roundness must be positive");
    }
    let ground = args.ground()?;
    let trunks = match &args.trunks {
        Some(path) => load_trunks(path).with_context(|| format!("loading trunks {}", path.display()))?,
        None => Vec::new(),
    };

    let t0 = Instant::now();
    let fields = build_fields(&args.cloud, &ground, &args.field_params())
        .with_context(|| format!("building fields of {}", args.cloud.display()))?;
    if args.diagnostics {
        write_diagnostics(&fields, &args.cloud)?;
    }
    let (trees, report) = extract(&fields, &trunks, &args.forest_params());
    println!(
        "   {} trees from {} peaks in {:.2}s ({} with known trunks, {} without space)",
        trees.len(),
        report.peaks,
        t0.elapsed().as_secs_f64(),
        report.trunks_attached,
        report.no_space
    );

    if !trees.is_empty() {
        println!("\n   Top 10 tallest trees:");
        println!(
            "   {:>12}  {:>12}  {:>8}  {:>6}  {:>6}  {:>5}",
            "X", "Y", "Z", "H (m)", "R (m)", "trunk"
        );
        println!("   {}", "─".repeat(60));
        for t in trees.iter().take(10) {
            println!(
                "   {:>12.2}  {:>12.2}  {:>8.2}  {:>6.1}  {:>6.2}  {:>5}",
                t.base.x,
                t.base.y,
                t.base.z,
                t.height,
                t.radius,
                if t.trunk_identified { "yes" } else { "no" }
            );
        }
    }

    let output = args.output.clone().unwrap_or_else(|| sibling(&args.cloud, "_trees.csv"));
    export_csv(&trees, &output)?;
    println!("\n   {} rows written to {}", trees.len(), output.display());
    Ok(())
}

// ==========================================================================
// Main
// ==========================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Import {
            cloud,
            trajectory,
            chunk_size,
        } => run_import(cloud, trajectory, *chunk_size),
        Command::Info { cloud, chunk_size } => run_info(cloud, *chunk_size),
        Command::Trees(args) => run_trees(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_optional_columns() {
        let text = "ply\nformat binary_little_endian 1.0\nelement vertex 0\n\
                    property float x\nproperty float y\nproperty float z\n\
                    property double time\nproperty uchar red\nproperty uchar green\nproperty uchar blue\n\
                    end_header\n";
        let header = PlyHeader::parse(&mut Cursor::new(text.as_bytes()), "points.ply").unwrap();
        assert_eq!(optional_columns(&header), "time, colour");
    }

    #[test]
    fn test_time_order_note() {
        assert_eq!(time_order_note(true), None);
        assert!(time_order_note(false).is_some_and(|n| n.contains("not sorted")));
    }
}
