//! Sensor trajectories and start point reconstruction.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use glam::DVec3;
use tracing::info;

use crate::cloud::Cloud;
use crate::error::{RayError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryNode {
    pub time: f64,
    pub pos: DVec3,
}

/// Time-ordered sensor positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub nodes: Vec<TrajectoryNode>,
}

impl Trajectory {
    /// Load a `time x y z` text trajectory. The first line is a header.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| RayError::open(path, e))?;
        let trajectory = Self::parse(BufReader::new(file), path)?;
        info!("loaded {} trajectory nodes from {}", trajectory.nodes.len(), path.display());
        Ok(trajectory)
    }

    /// Parse trajectory text; `path` is only used for error messages.
    pub fn parse<R: BufRead>(input: R, path: &Path) -> Result<Self> {
        let mut nodes = Vec::new();
        for (i, line) in input.lines().enumerate().skip(1) {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let bad = |reason: String| RayError::Trajectory {
                path: path.to_path_buf(),
                line: i + 1,
                reason,
            };
            let values = line
                .split_whitespace()
                .take(4)
                .map(|t| t.parse::<f64>().map_err(|_| bad(format!("cannot parse '{}'", t))))
                .collect::<Result<Vec<f64>>>()?;
            if values.len() < 4 {
                return Err(bad(format!("expected 'time x y z', found {} values", values.len())));
            }
            nodes.push(TrajectoryNode {
                time: values[0],
                pos: DVec3::new(values[1], values[2], values[3]),
            });
        }
        Ok(Self { nodes })
    }

    /// Trajectory stored as a point cloud: one node per point, ordered by time.
    pub fn from_cloud(cloud: &Cloud) -> Self {
        let mut nodes: Vec<TrajectoryNode> = cloud
            .ends
            .iter()
            .zip(&cloud.times)
            .map(|(&pos, &time)| TrajectoryNode { time, pos })
            .collect();
        nodes.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self { nodes }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| RayError::open(path, e))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "%time x y z userfields")?;
        for node in &self.nodes {
            writeln!(
                out,
                "{} {} {} {}",
                significant(node.time),
                significant(node.pos.x),
                significant(node.pos.y),
                significant(node.pos.z)
            )?;
        }
        out.flush()?;
        Ok(())
    }

    /// Sensor position at each of `times`, linearly interpolated.
    ///
    /// Times outside the trajectory extrapolate nothing: they take the first
    /// or last node's position. `times` need not be sorted.
    pub fn calculate_start_points(&self, times: &[f64]) -> Result<Vec<DVec3>> {
        let nodes = &self.nodes;
        match nodes.len() {
            0 => return Err(RayError::EmptyTrajectory),
            1 => return Ok(vec![nodes[0].pos; times.len()]),
            _ => {}
        }
        let last_segment = nodes.len() - 2;
        Ok(times
            .iter()
            .map(|&t| {
                // first node strictly after t, minus one, is the segment start
                let i = nodes.partition_point(|n| n.time <= t);
                let seg = i.saturating_sub(1).min(last_segment);
                let (n0, n1) = (&nodes[seg], &nodes[seg + 1]);
                let span = n1.time - n0.time;
                let blend = if span > 0.0 {
                    ((t - n0.time) / span).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                n0.pos.lerp(n1.pos, blend)
            })
            .collect())
    }
}

/// Format with 15 significant digits, trailing zeros removed.
fn significant(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return format!("{}", v);
    }
    let magnitude = v.abs().log10().floor() as i32;
    let decimals = (14 - magnitude).max(0) as usize;
    let s = format!("{:.*}", decimals, v);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn line() -> Trajectory {
        Trajectory {
            nodes: vec![
                TrajectoryNode { time: 0.0, pos: DVec3::new(0.0, 0.0, 10.0) },
                TrajectoryNode { time: 10.0, pos: DVec3::new(10.0, 0.0, 10.0) },
                TrajectoryNode { time: 20.0, pos: DVec3::new(10.0, 20.0, 10.0) },
            ],
        }
    }

    #[test]
    fn test_interpolates_between_nodes() {
        let starts = line().calculate_start_points(&[15.0, 5.0, 10.0]).unwrap();
        assert_eq!(starts[0], DVec3::new(10.0, 10.0, 10.0));
        assert_eq!(starts[1], DVec3::new(5.0, 0.0, 10.0));
        assert_eq!(starts[2], DVec3::new(10.0, 0.0, 10.0));
    }

    #[test]
    fn test_clamps_outside_range() {
        let starts = line().calculate_start_points(&[-5.0, 25.0]).unwrap();
        assert_eq!(starts[0], DVec3::new(0.0, 0.0, 10.0));
        assert_eq!(starts[1], DVec3::new(10.0, 20.0, 10.0));
    }

    #[test]
    fn test_degenerate_trajectories() {
        assert!(matches!(
            Trajectory::default().calculate_start_points(&[1.0]),
            Err(RayError::EmptyTrajectory)
        ));
        let single = Trajectory {
            nodes: vec![TrajectoryNode { time: 3.0, pos: DVec3::ONE }],
        };
        assert_eq!(single.calculate_start_points(&[0.0, 9.0]).unwrap(), vec![DVec3::ONE; 2]);
    }

    #[test]
    fn test_parse_skips_header_and_reports_line() {
        let text = "%time x y z\n1 2 3 4 extra\n\n2 5 6 7\n";
        let t = Trajectory::parse(Cursor::new(text), Path::new("t.txt")).unwrap();
        assert_eq!(t.nodes.len(), 2);
        assert_eq!(t.nodes[1].pos, DVec3::new(5.0, 6.0, 7.0));

        let bad = "%time x y z\n1 2 3 4\n2 5 six 7\n";
        match Trajectory::parse(Cursor::new(bad), Path::new("t.txt")) {
            Err(RayError::Trajectory { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected trajectory error, got {:?}", other),
        }
    }

    #[test]
    fn test_significant_digits() {
        assert_eq!(significant(1.5), "1.5");
        assert_eq!(significant(1234567.123456789), "1234567.12345679");
        assert_eq!(significant(-0.25), "-0.25");
    }
}
