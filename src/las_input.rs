//! LAS / LAZ point input.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use glam::DVec3;
use las::Reader;
use tracing::{debug, info, warn};

use crate::cloud::{colour_by_time, is_sane, time_range, Cloud, Ray, Rgba};
use crate::error::{RayError, Result};
use crate::ply::intensity_to_alpha;

/// Open a LAS or LAZ file.
pub fn open_las(path: &Path) -> Result<Reader> {
    let file = File::open(path).map_err(|e| RayError::open(path, e))?;
    let buf_reader = BufReader::new(file);
    Ok(Reader::new(buf_reader)?)
}

/// Stream the points of a LAS/LAZ file through `f` as zero-length rays
/// (start == end). Returns the number of points delivered.
pub fn read_las_chunked<F>(path: &Path, chunk_size: usize, f: F) -> Result<usize>
where
    F: FnMut(&mut Cloud) -> Result<()>,
{
    let reader = open_las(path)?;
    read_las_points(reader, &path.display().to_string(), chunk_size, f)
}

/// Points without a GPS time take their index in the file. Points without
/// colour are coloured by time over their chunk. Intensity goes into alpha
/// as for PLY input, so a zero intensity marks the ray unbounded.
pub fn read_las_points<F>(mut reader: Reader, name: &str, chunk_size: usize, mut f: F) -> Result<usize>
where
    F: FnMut(&mut Cloud) -> Result<()>,
{
    let total = reader.header().number_of_points();
    info!("reading {} points from {}", total, name);

    let chunk_size = chunk_size.max(1);
    let mut chunk = Cloud::with_capacity(chunk_size.min(total as usize));
    let mut has_colour = Vec::with_capacity(chunk.ends.capacity());
    let mut decoded = 0usize;
    let mut dropped = 0usize;

    let mut flush = |chunk: &mut Cloud, has_colour: &mut Vec<bool>| -> Result<()> {
        if has_colour.iter().any(|c| !c) {
            let (lo, hi) = time_range(&chunk.times);
            let ramp = colour_by_time(&chunk.times, lo, hi);
            for (i, colour) in chunk.colours.iter_mut().enumerate() {
                if !has_colour[i] {
                    let alpha = colour.alpha;
                    *colour = Rgba { alpha, ..ramp[i] };
                }
            }
        }
        debug!("{}: chunk of {} points", name, chunk.len());
        f(chunk)?;
        chunk.clear();
        has_colour.clear();
        Ok(())
    };

    for (index, point) in reader.points().enumerate() {
        let point = point?;
        let end = DVec3::new(point.x, point.y, point.z);
        if !is_sane(end) {
            if dropped == 0 {
                warn!(
                    "{}: invalid point {} ({}, {}, {}), removing all NaN or out of range points",
                    name,
                    index,
                    end.x,
                    end.y,
                    end.z
                );
            }
            dropped += 1;
            continue;
        }

        let alpha = intensity_to_alpha(point.intensity as f64);
        let colour = match point.color {
            Some(c) => {
                has_colour.push(true);
                Rgba::new((c.red >> 8) as u8, (c.green >> 8) as u8, (c.blue >> 8) as u8, alpha)
            }
            None => {
                has_colour.push(false);
                Rgba::new(255, 255, 255, alpha)
            }
        };
        chunk.push(Ray {
            start: end,
            end,
            time: point.gps_time.unwrap_or(index as f64),
            colour,
        });
        decoded += 1;

        if chunk.len() >= chunk_size {
            flush(&mut chunk, &mut has_colour)?;
        }
    }
    if !chunk.is_empty() {
        flush(&mut chunk, &mut has_colour)?;
    }

    if dropped > 0 {
        info!("{}: dropped {} invalid points", name, dropped);
    }
    if decoded == 0 {
        return Err(RayError::NoRays { name: name.to_string() });
    }
    Ok(decoded)
}
