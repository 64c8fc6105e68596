//! Convert a raw point cloud plus sensor trajectory into a ray cloud.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::cloud::Cloud;
use crate::error::{RayError, Result};
use crate::las_input::read_las_chunked;
use crate::ply::{read_ply, read_ply_chunked, ChunkWriter};
use crate::trajectory::Trajectory;

/// Where the ray cloud for `cloud_path` is written.
pub fn output_path(cloud_path: &Path) -> PathBuf {
    let stub = cloud_path.with_extension("");
    let is_ply = extension(cloud_path).as_deref() == Some("ply");
    let mut name = stub.into_os_string();
    if is_ply {
        name.push("_raycloud");
    }
    name.push(".ply");
    PathBuf::from(name)
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// Load a trajectory from text or from the points of a PLY file.
pub fn load_trajectory(path: &Path) -> Result<Trajectory> {
    match extension(path).as_deref() {
        Some("ply") => Ok(Trajectory::from_cloud(&read_ply(path, false)?)),
        _ => Trajectory::load(path),
    }
}

/// Stream `cloud_path`, reconstruct each point's start from the trajectory
/// and write the ray cloud. Returns the output path.
pub fn import_cloud(cloud_path: &Path, trajectory_path: &Path, chunk_size: usize) -> Result<PathBuf> {
    let kind = extension(cloud_path);
    if !matches!(kind.as_deref(), Some("ply" | "las" | "laz")) {
        return Err(RayError::UnsupportedInput {
            path: cloud_path.to_path_buf(),
        });
    }
    let trajectory = load_trajectory(trajectory_path)?;
    if trajectory.nodes.is_empty() {
        return Err(RayError::EmptyTrajectory);
    }

    let out_path = output_path(cloud_path);
    let mut writer = ChunkWriter::create(&out_path)?;

    let mut add_starts = |chunk: &mut Cloud| -> Result<()> {
        chunk.starts = trajectory.calculate_start_points(&chunk.times)?;
        writer.append_chunk(chunk)?;
        Ok(())
    };

    if kind.as_deref() == Some("ply") {
        read_ply_chunked(cloud_path, false, chunk_size, &mut add_starts)?;
    } else {
        read_las_chunked(cloud_path, chunk_size, &mut add_starts)?;
    }

    let count = writer.count();
    writer.finish()?;
    info!("imported {} rays into {}", count, out_path.display());
    Ok(out_path)
}
