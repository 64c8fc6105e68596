//! Ray cloud data model.
//!
//! A ray cloud stores, for every return, the sensor position at capture time
//! (`start`) as well as the measured point (`end`). Rays are kept as four
//! parallel vectors so that chunked I/O and re-sorting can move each column
//! independently.

use std::path::Path;

use glam::DVec3;

use crate::error::Result;
use crate::ply;

/// Largest coordinate magnitude accepted for a ray end or start delta.
pub const MAX_COORDINATE: f64 = 100_000.0;

/// Colour of a ray. `alpha == 0` marks an unbounded ray (no real return).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgba {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Rgba {
    pub const fn new(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    #[inline]
    pub fn is_bounded(&self) -> bool {
        self.alpha > 0
    }
}

/// A single ray, as seen through [`Cloud::ray`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub start: DVec3,
    pub end: DVec3,
    pub time: f64,
    pub colour: Rgba,
}

/// True when a position is finite and within [`MAX_COORDINATE`] on every axis.
#[inline]
pub fn is_sane(v: DVec3) -> bool {
    v.is_finite() && v.abs().max_element() <= MAX_COORDINATE
}

/// An ordered ray cloud, time-monotonic once loaded through [`ply::read_ply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cloud {
    pub starts: Vec<DVec3>,
    pub ends: Vec<DVec3>,
    pub times: Vec<f64>,
    pub colours: Vec<Rgba>,
}

impl Cloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            starts: Vec::with_capacity(n),
            ends: Vec::with_capacity(n),
            times: Vec::with_capacity(n),
            colours: Vec::with_capacity(n),
        }
    }

    pub fn from_rays(rays: &[Ray]) -> Self {
        let mut cloud = Self::with_capacity(rays.len());
        for ray in rays {
            cloud.push(*ray);
        }
        cloud
    }

    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    pub fn push(&mut self, ray: Ray) {
        self.starts.push(ray.start);
        self.ends.push(ray.end);
        self.times.push(ray.time);
        self.colours.push(ray.colour);
    }

    pub fn ray(&self, i: usize) -> Ray {
        Ray {
            start: self.starts[i],
            end: self.ends[i],
            time: self.times[i],
            colour: self.colours[i],
        }
    }

    pub fn rays(&self) -> impl Iterator<Item = Ray> + '_ {
        (0..self.len()).map(move |i| self.ray(i))
    }

    pub fn clear(&mut self) {
        self.starts.clear();
        self.ends.clear();
        self.times.clear();
        self.colours.clear();
    }

    /// Move all rays of `other` onto the end of this cloud.
    pub fn append(&mut self, other: &mut Cloud) {
        self.starts.append(&mut other.starts);
        self.ends.append(&mut other.ends);
        self.times.append(&mut other.times);
        self.colours.append(&mut other.colours);
    }

    /// Reorder all four columns by ascending time with one permutation.
    ///
    /// The permutation comes from a stable sort, so equal times keep their
    /// original relative order.
    pub fn sort_by_time(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| self.times[a].total_cmp(&self.times[b]));

        self.starts = order.iter().map(|&i| self.starts[i]).collect();
        self.ends = order.iter().map(|&i| self.ends[i]).collect();
        self.times = order.iter().map(|&i| self.times[i]).collect();
        if self.colours.len() == order.len() {
            self.colours = order.iter().map(|&i| self.colours[i]).collect();
        }
    }
}

/// Axis-aligned bounds, initialised empty (inverted infinities).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: DVec3,
    pub max: DVec3,
}

impl Default for Bounds {
    fn default() -> Self {
        Self::new()
    }
}

impl Bounds {
    pub fn new() -> Self {
        Self {
            min: DVec3::splat(f64::INFINITY),
            max: DVec3::splat(f64::NEG_INFINITY),
        }
    }

    pub fn update(&mut self, p: DVec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    pub fn extent(&self) -> DVec3 {
        self.max - self.min
    }
}

/// Summary of a ray cloud file gathered in one streaming pass.
#[derive(Debug, Clone, Default)]
pub struct CloudInfo {
    /// Bounds of the ends of bounded rays.
    pub ends_bound: Bounds,
    pub starts_bound: Bounds,
    pub num_bounded: usize,
    pub num_unbounded: usize,
    pub min_time: f64,
    pub max_time: f64,
}

impl CloudInfo {
    /// Stream a ray cloud file and collect its bounds and counts.
    pub fn scan(path: &Path, chunk_size: usize) -> Result<Self> {
        let mut info = CloudInfo {
            min_time: f64::INFINITY,
            max_time: f64::NEG_INFINITY,
            ..Default::default()
        };
        ply::read_ply_chunked(path, true, chunk_size, |chunk| {
            info.add(chunk);
            Ok(())
        })?;
        Ok(info)
    }

    pub fn add(&mut self, chunk: &Cloud) {
        for ray in chunk.rays() {
            self.starts_bound.update(ray.start);
            if ray.colour.is_bounded() {
                self.ends_bound.update(ray.end);
                self.num_bounded += 1;
            } else {
                self.num_unbounded += 1;
            }
            self.min_time = self.min_time.min(ray.time);
            self.max_time = self.max_time.max(ray.time);
        }
    }

    pub fn num_rays(&self) -> usize {
        self.num_bounded + self.num_unbounded
    }
}

/// Colour rays red → green → blue according to where each time lies in
/// `[min_time, max_time]`. All rays are marked bounded.
pub fn colour_by_time(times: &[f64], min_time: f64, max_time: f64) -> Vec<Rgba> {
    times
        .iter()
        .map(|&t| time_colour(t, min_time, max_time))
        .collect()
}

/// Gradient colour of a single time within `[min_time, max_time]`.
pub fn time_colour(time: f64, min_time: f64, max_time: f64) -> Rgba {
    let span = max_time - min_time;
    let s = if span > 0.0 {
        ((time - min_time) / span).clamp(0.0, 1.0)
    } else {
        0.0
    };
    red_green_blue_gradient(s)
}

/// Time range of a slice, or `(0, 0)` when empty.
pub fn time_range(times: &[f64]) -> (f64, f64) {
    if times.is_empty() {
        return (0.0, 0.0);
    }
    times
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &t| {
            (lo.min(t), hi.max(t))
        })
}

fn red_green_blue_gradient(s: f64) -> Rgba {
    let channel = |v: f64| (255.0 * v.clamp(0.0, 1.0)).round() as u8;
    if s < 0.5 {
        let u = s * 2.0;
        Rgba::new(channel(1.0 - u), channel(u), 0, 255)
    } else {
        let u = (s - 0.5) * 2.0;
        Rgba::new(0, channel(1.0 - u), channel(u), 255)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ray(t: f64, x: f64) -> Ray {
        Ray {
            start: DVec3::new(x, 0.0, 10.0),
            end: DVec3::new(x, 0.0, 0.0),
            time: t,
            colour: Rgba::new(x as u8, 0, 0, 255),
        }
    }

    #[test]
    fn test_sort_by_time_moves_columns_together() {
        let mut cloud = Cloud::from_rays(&[ray(3.0, 30.0), ray(1.0, 10.0), ray(2.0, 20.0)]);
        cloud.sort_by_time();
        assert_eq!(cloud.times, vec![1.0, 2.0, 3.0]);
        assert_eq!(cloud.ends[0].x, 10.0);
        assert_eq!(cloud.starts[2].x, 30.0);
        assert_eq!(cloud.colours[1].red, 20);
    }

    #[test]
    fn test_sort_keeps_ties_in_file_order() {
        let mut cloud = Cloud::from_rays(&[ray(2.0, 1.0), ray(1.0, 2.0), ray(2.0, 3.0)]);
        cloud.sort_by_time();
        assert_eq!(cloud.ends[1].x, 1.0);
        assert_eq!(cloud.ends[2].x, 3.0);
    }

    #[test]
    fn test_colour_by_time_endpoints() {
        let c = colour_by_time(&[0.0, 5.0, 10.0], 0.0, 10.0);
        assert_eq!(c[0], Rgba::new(255, 0, 0, 255));
        assert_eq!(c[1], Rgba::new(0, 255, 0, 255));
        assert_eq!(c[2], Rgba::new(0, 0, 255, 255));
    }

    #[test]
    fn test_is_sane() {
        assert!(is_sane(DVec3::new(1.0, -2.0, 3.0)));
        assert!(!is_sane(DVec3::new(f64::NAN, 0.0, 0.0)));
        assert!(!is_sane(DVec3::new(2e6, 0.0, 0.0)));
        assert!(!is_sane(DVec3::new(0.0, 0.0, -2e5)));
    }
}
