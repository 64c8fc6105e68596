//! Binary PLY codec for ray clouds and triangle meshes.
//!
//! Ray cloud record layout (little-endian, 36 bytes, no padding):
//!
//! ```text
//!   00 : f32 x, y, z        ray end
//!   0C : f64 time
//!   14 : f32 nx, ny, nz     start - end
//!   20 : u8  red, green, blue, alpha
//! ```
//!
//! Readers accept any property order, float or double positions, normals,
//! times and intensities, and extra properties they don't know about. The
//! body is streamed in chunks so files larger than memory can be processed.
//!
//! The streaming writer doesn't know the ray count up front: it reserves the
//! `element vertex` count as a fixed 16-character field and patches it in
//! place when the stream is finished.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use glam::DVec3;
use tracing::{debug, error, info, warn};

use crate::cloud::{is_sane, time_colour, time_range, Cloud, Ray, Rgba};
use crate::error::{RayError, Result};
use crate::mesh::Mesh;

/// Default number of rays handed to a chunk callback.
pub const DEFAULT_CHUNK_SIZE: usize = 1_000_000;

/// Width of the reserved vertex count field written by [`ChunkWriter`].
pub const COUNT_FIELD_WIDTH: usize = 16;

/// Size of one ray record as written by this module.
pub const RAY_RECORD_SIZE: usize = 36;

/// Intensity mapped to full alpha when importing raw scans.
const MAXIMUM_INTENSITY: f64 = 100.0;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Scalar {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "char" | "int8" => Scalar::I8,
            "uchar" | "uint8" => Scalar::U8,
            "short" | "int16" => Scalar::I16,
            "ushort" | "uint16" => Scalar::U16,
            "int" | "int32" => Scalar::I32,
            "uint" | "uint32" => Scalar::U32,
            "float" | "float32" => Scalar::F32,
            "double" | "float64" => Scalar::F64,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::F64 => 8,
        }
    }

    fn read(self, b: &[u8]) -> f64 {
        match self {
            Scalar::I8 => b[0] as i8 as f64,
            Scalar::U8 => b[0] as f64,
            Scalar::I16 => i16::from_le_bytes([b[0], b[1]]) as f64,
            Scalar::U16 => u16::from_le_bytes([b[0], b[1]]) as f64,
            Scalar::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Scalar::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Scalar::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Scalar::F64 => {
                f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
        }
    }
}

/// Byte offset and type of one vertex property within a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    offset: usize,
    kind: Scalar,
}

impl Field {
    #[inline]
    fn read(&self, row: &[u8]) -> f64 {
        self.kind.read(&row[self.offset..])
    }

    #[inline]
    fn read_u8(&self, row: &[u8]) -> u8 {
        self.read(row).clamp(0.0, 255.0) as u8
    }
}

/// The parts of a vertex PLY header the ray reader cares about.
#[derive(Debug, Clone, Default)]
pub struct PlyHeader {
    /// Count declared on the `element vertex` line. Not trusted for reading.
    pub vertex_count: Option<u64>,
    /// Bytes per vertex record.
    pub row_size: usize,
    /// Bytes up to and including the `end_header` line.
    pub length: u64,
    x: Option<Field>,
    y: Option<Field>,
    z: Option<Field>,
    nx: Option<Field>,
    ny: Option<Field>,
    nz: Option<Field>,
    time: Option<Field>,
    intensity: Option<Field>,
    red: Option<Field>,
    green: Option<Field>,
    blue: Option<Field>,
    alpha: Option<Field>,
}

impl PlyHeader {
    /// Parse the ASCII header, leaving `input` at the first body byte.
    pub fn parse<R: BufRead>(input: &mut R, name: &str) -> Result<Self> {
        let malformed = |reason: String| RayError::MalformedHeader {
            name: name.to_string(),
            reason,
        };

        let mut header = PlyHeader::default();
        let mut raw = Vec::new();
        let mut first = true;
        let mut element = String::new();

        loop {
            raw.clear();
            let n = input.read_until(b'\n', &mut raw)?;
            if n == 0 {
                return Err(malformed("end of file before end_header".into()));
            }
            header.length += n as u64;
            let line = String::from_utf8_lossy(&raw).trim().to_ascii_lowercase();

            if first {
                if line != "ply" {
                    return Err(malformed(format!("expected 'ply', found '{}'", line)));
                }
                first = false;
                continue;
            }
            if line == "end_header" {
                break;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                ["format", format, ..] => {
                    if *format != "binary_little_endian" {
                        return Err(malformed(format!("unsupported format '{}'", format)));
                    }
                }
                ["element", kind, rest @ ..] => {
                    element = kind.to_string();
                    if element == "vertex" {
                        header.vertex_count = rest.first().and_then(|c| c.parse().ok());
                    }
                }
                ["property", "list", ..] => {
                    if element == "vertex" {
                        return Err(malformed("list properties in vertex element".into()));
                    }
                }
                ["property", kind, prop] => {
                    if element != "vertex" {
                        continue;
                    }
                    let kind = Scalar::parse(kind)
                        .ok_or_else(|| malformed(format!("unknown property type '{}'", kind)))?;
                    header.add_property(prop, kind);
                }
                _ => {}
            }
        }

        if header.row_size == 0 {
            return Err(malformed("no vertex properties".into()));
        }
        Ok(header)
    }

    fn add_property(&mut self, prop: &str, kind: Scalar) {
        let field = Some(Field {
            offset: self.row_size,
            kind,
        });
        let slot = match prop {
            "x" => &mut self.x,
            "y" => &mut self.y,
            "z" => &mut self.z,
            "nx" => &mut self.nx,
            "ny" => &mut self.ny,
            "nz" => &mut self.nz,
            "red" => &mut self.red,
            "green" => &mut self.green,
            "blue" => &mut self.blue,
            "alpha" => &mut self.alpha,
            p if p.contains("time") => &mut self.time,
            p if p.contains("intensity") => &mut self.intensity,
            _ => {
                self.row_size += kind.size();
                return;
            }
        };
        if slot.is_none() {
            *slot = field;
        }
        self.row_size += kind.size();
    }

    pub fn has_time(&self) -> bool {
        self.time.is_some()
    }

    pub fn has_colour(&self) -> bool {
        self.red.is_some() && self.green.is_some() && self.blue.is_some()
    }

    pub fn has_intensity(&self) -> bool {
        self.intensity.is_some()
    }

    pub fn has_normals(&self) -> bool {
        self.nx.is_some() && self.ny.is_some() && self.nz.is_some()
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Data-quality issues, each logged at most once per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadWarning {
    /// NaN or out-of-range end; the rows were dropped.
    InvalidRows,
    /// NaN or out-of-range start delta in a ray cloud.
    InvalidStarts,
    MissingTime,
    MissingColour,
    IntensityInAlpha,
    UnsortedTimes,
    TrailingBytes,
}

/// What happened while decoding one file.
#[derive(Debug, Clone)]
pub struct ReadReport {
    pub name: String,
    /// Complete records in the body.
    pub rows: u64,
    /// Rays handed to the caller.
    pub decoded: usize,
    pub num_bounded: usize,
    pub num_unbounded: usize,
    pub dropped_invalid_end: usize,
    pub dropped_invalid_start: usize,
    /// False when a time was lower than its predecessor. Chunked reads leave
    /// such files unsorted.
    pub times_monotonic: bool,
    pub warnings: Vec<(ReadWarning, String)>,
}

impl ReadReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rows: 0,
            decoded: 0,
            num_bounded: 0,
            num_unbounded: 0,
            dropped_invalid_end: 0,
            dropped_invalid_start: 0,
            times_monotonic: true,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, kind: ReadWarning, message: String) {
        if self.has_warning(kind) {
            return;
        }
        warn!("{}", message);
        self.warnings.push((kind, message));
    }

    pub fn has_warning(&self, kind: ReadWarning) -> bool {
        self.warnings.iter().any(|(k, _)| *k == kind)
    }

    pub fn warning_count(&self, kind: ReadWarning) -> usize {
        self.warnings.iter().filter(|(k, _)| *k == kind).count()
    }
}

/// Streaming decoder over a seekable byte source.
pub struct RayReader<R> {
    input: BufReader<R>,
    header: PlyHeader,
    name: String,
}

impl RayReader<File> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| RayError::open(path, e))?;
        Self::new(file, path.display().to_string())
    }
}

impl<R: Read + Seek> RayReader<R> {
    /// Parse the header of `reader`. `name` labels log lines and errors.
    pub fn new(reader: R, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut input = BufReader::new(reader);
        let header = PlyHeader::parse(&mut input, &name)?;
        Ok(Self {
            input,
            header,
            name,
        })
    }

    pub fn header(&self) -> &PlyHeader {
        &self.header
    }

    fn required(&self, field: Option<Field>, property: &'static str) -> Result<Field> {
        field.ok_or_else(|| RayError::MissingProperty {
            name: self.name.clone(),
            property,
        })
    }

    /// Count complete rows in the body and rewind to its start.
    fn count_rows(&mut self, report: &mut ReadReport) -> Result<u64> {
        let end = self.input.seek(SeekFrom::End(0))?;
        self.input.seek(SeekFrom::Start(self.header.length))?;
        let body = end.saturating_sub(self.header.length);
        let row_size = self.header.row_size as u64;
        if body % row_size != 0 {
            report.warn(
                ReadWarning::TrailingBytes,
                format!(
                    "{}: {} trailing bytes after the last complete record, ignoring them",
                    self.name,
                    body % row_size
                ),
            );
        }
        Ok(body / row_size)
    }

    /// Time range of the rows that will decode, for colouring files that
    /// carry no colour. Rewinds to the body start afterwards.
    fn scan_time_range(&mut self, rows: u64, time: Field, ends: [Field; 3]) -> Result<(f64, f64)> {
        let mut row = vec![0u8; self.header.row_size];
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for _ in 0..rows {
            self.input.read_exact(&mut row)?;
            let end = DVec3::new(ends[0].read(&row), ends[1].read(&row), ends[2].read(&row));
            let t = time.read(&row);
            if is_sane(end) && t.is_finite() {
                lo = lo.min(t);
                hi = hi.max(t);
            }
        }
        self.input.seek(SeekFrom::Start(self.header.length))?;
        Ok(if lo <= hi { (lo, hi) } else { (0.0, 0.0) })
    }

    /// Decode the body, handing `f` up to `chunk_size` rays at a time.
    ///
    /// Rays are delivered in file order; non-monotonic times are reported but
    /// not repaired.
    pub fn read_chunks<F>(mut self, is_ray_cloud: bool, chunk_size: usize, mut f: F) -> Result<ReadReport>
    where
        F: FnMut(&mut Cloud) -> Result<()>,
    {
        let h = self.header.clone();
        let ends = [
            self.required(h.x, "x")?,
            self.required(h.y, "y")?,
            self.required(h.z, "z")?,
        ];
        let normals = if is_ray_cloud {
            Some([
                self.required(h.nx, "nx")?,
                self.required(h.ny, "ny")?,
                self.required(h.nz, "nz")?,
            ])
        } else {
            None
        };
        let colour = match (h.red, h.green, h.blue) {
            (Some(r), Some(g), Some(b)) => Some([r, g, b]),
            _ => None,
        };
        let intensity = if is_ray_cloud { None } else { h.intensity };

        info!("reading: {}", self.name);
        let mut report = ReadReport::new(&self.name);
        let rows = self.count_rows(&mut report)?;
        report.rows = rows;
        if rows == 0 {
            return Err(RayError::NoRays {
                name: self.name.clone(),
            });
        }

        if h.time.is_none() {
            report.warn(
                ReadWarning::MissingTime,
                format!(
                    "no time information found in {}, setting times at 1 second intervals per ray",
                    self.name
                ),
            );
        }
        let colour_range = if colour.is_some() {
            None
        } else {
            report.warn(
                ReadWarning::MissingColour,
                format!(
                    "no colour information found in {}, setting colours red->green->blue based on time",
                    self.name
                ),
            );
            Some(match h.time {
                Some(time) => self.scan_time_range(rows, time, ends)?,
                None => (0.0, (rows - 1) as f64),
            })
        };
        if intensity.is_some() {
            if colour.is_some() {
                report.warn(
                    ReadWarning::IntensityInAlpha,
                    format!(
                        "intensity and colour information found in {}, replacing alpha with intensity",
                        self.name
                    ),
                );
            } else {
                info!("intensity found in {}, storing it in the alpha channel", self.name);
            }
        }

        let chunk_size = chunk_size.max(1);
        let mut chunk = Cloud::with_capacity(chunk_size.min(rows as usize));
        let mut row = vec![0u8; h.row_size];
        let mut last_time = f64::NEG_INFINITY;

        for i in 0..rows {
            self.input.read_exact(&mut row)?;

            let end = DVec3::new(ends[0].read(&row), ends[1].read(&row), ends[2].read(&row));
            if !is_sane(end) {
                report.dropped_invalid_end += 1;
                report.warn(
                    ReadWarning::InvalidRows,
                    format!(
                        "{}: invalid point {} ({}, {}, {}), removing all NaN or out of range rows",
                        self.name, i, end.x, end.y, end.z
                    ),
                );
                continue;
            }

            let delta = match normals {
                Some(n) => {
                    let delta = DVec3::new(n[0].read(&row), n[1].read(&row), n[2].read(&row));
                    if !is_sane(delta) {
                        report.dropped_invalid_start += 1;
                        report.warn(
                            ReadWarning::InvalidStarts,
                            format!(
                                "{}: invalid ray start stored in normal {}, removing all such rays",
                                self.name, i
                            ),
                        );
                        continue;
                    }
                    delta
                }
                None => DVec3::ZERO,
            };

            let time = match h.time {
                Some(t) => t.read(&row),
                None => report.decoded as f64,
            };
            if time < last_time {
                report.times_monotonic = false;
            }
            last_time = time;

            let mut rgba = match (colour, colour_range) {
                (Some(c), _) => Rgba::new(
                    c[0].read_u8(&row),
                    c[1].read_u8(&row),
                    c[2].read_u8(&row),
                    h.alpha.map_or(255, |a| a.read_u8(&row)),
                ),
                (None, Some((lo, hi))) => time_colour(time, lo, hi),
                (None, None) => Rgba::new(255, 255, 255, 255),
            };
            if rgba.is_bounded() {
                report.num_bounded += 1;
            } else {
                report.num_unbounded += 1;
            }
            if let Some(field) = intensity {
                rgba.alpha = intensity_to_alpha(field.read(&row));
            }

            chunk.push(Ray {
                start: end + delta,
                end,
                time,
                colour: rgba,
            });
            report.decoded += 1;

            if chunk.len() >= chunk_size {
                debug!("{}: chunk of {} rays", self.name, chunk.len());
                f(&mut chunk)?;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            debug!("{}: final chunk of {} rays", self.name, chunk.len());
            f(&mut chunk)?;
        }

        if !report.times_monotonic {
            report.warn(
                ReadWarning::UnsortedTimes,
                format!("{}: ray times are not in order", self.name),
            );
        }
        info!(
            "reading from {}, {} rays, of which {} bounded and {} unbounded",
            self.name, report.decoded, report.num_bounded, report.num_unbounded
        );
        if report.decoded == 0 {
            return Err(RayError::NoRays {
                name: self.name.clone(),
            });
        }
        if report.num_bounded == 0 {
            return Err(RayError::AllUnbounded {
                name: self.name.clone(),
            });
        }
        Ok(report)
    }

    /// Decode the whole body, re-sorting by time if needed.
    pub fn read_all(self, is_ray_cloud: bool) -> Result<(Cloud, ReadReport)> {
        let name = self.name.clone();
        let mut cloud = Cloud::new();
        let report = self.read_chunks(is_ray_cloud, DEFAULT_CHUNK_SIZE, |chunk| {
            cloud.append(chunk);
            Ok(())
        })?;
        if !report.times_monotonic {
            info!("{}: sorting {} rays by time", name, cloud.len());
            cloud.sort_by_time();
        }
        Ok((cloud, report))
    }
}

/// Map a raw scan intensity into the alpha channel.
pub fn intensity_to_alpha(intensity: f64) -> u8 {
    (255.0 * (intensity / MAXIMUM_INTENSITY).clamp(0.0, 1.0)) as u8
}

/// Read a whole PLY file into memory, sorted by time.
pub fn read_ply(path: &Path, is_ray_cloud: bool) -> Result<Cloud> {
    let (cloud, _) = RayReader::open(path)?.read_all(is_ray_cloud)?;
    Ok(cloud)
}

/// Stream a PLY file through `f`, `chunk_size` rays at a time.
pub fn read_ply_chunked<F>(path: &Path, is_ray_cloud: bool, chunk_size: usize, f: F) -> Result<ReadReport>
where
    F: FnMut(&mut Cloud) -> Result<()>,
{
    RayReader::open(path)?.read_chunks(is_ray_cloud, chunk_size, f)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

const RAY_PROPERTIES: &str = "property float x\n\
property float y\n\
property float z\n\
property double time\n\
property float nx\n\
property float ny\n\
property float nz\n\
property uchar red\n\
property uchar green\n\
property uchar blue\n\
property uchar alpha\n\
end_header\n";

/// Write the ray cloud header. Returns the byte offset of the count field
/// relative to the start of the header.
fn write_ray_header<W: Write>(out: &mut W, count: Option<u64>) -> io::Result<u64> {
    let prefix = "ply\n\
format binary_little_endian 1.0\n\
comment generated by raytrees\n\
element vertex ";
    let count = match count {
        Some(n) => n.to_string(),
        None => format!("{:<width$}", 0, width = COUNT_FIELD_WIDTH),
    };
    out.write_all(prefix.as_bytes())?;
    out.write_all(count.as_bytes())?;
    out.write_all(b"\n")?;
    out.write_all(RAY_PROPERTIES.as_bytes())?;
    Ok(prefix.len() as u64)
}

fn ray_is_writable(start: DVec3, end: DVec3) -> bool {
    is_sane(end) && is_sane(start - end)
}

fn encode_ray(buf: &mut Vec<u8>, start: DVec3, end: DVec3, time: f64, colour: Rgba) {
    let n = start - end;
    for v in [end.x, end.y, end.z] {
        buf.extend_from_slice(&(v as f32).to_le_bytes());
    }
    buf.extend_from_slice(&time.to_le_bytes());
    for v in [n.x, n.y, n.z] {
        buf.extend_from_slice(&(v as f32).to_le_bytes());
    }
    buf.extend_from_slice(&[colour.red, colour.green, colour.blue, colour.alpha]);
}

/// Encode the writable rays of `cloud`, synthesising colours if it has none.
/// Returns the number of rays encoded.
fn encode_cloud(buf: &mut Vec<u8>, cloud: &Cloud, name: &str, warned: &mut bool) -> usize {
    let synthetic;
    let colours = if cloud.colours.len() == cloud.len() {
        &cloud.colours
    } else {
        let (lo, hi) = time_range(&cloud.times);
        synthetic = crate::cloud::colour_by_time(&cloud.times, lo, hi);
        &synthetic
    };

    let mut written = 0;
    for i in 0..cloud.len() {
        let (start, end) = (cloud.starts[i], cloud.ends[i]);
        if !ray_is_writable(start, end) {
            if !*warned {
                warn!(
                    "{}: invalid ray {} (end {:?}, start {:?}), not writing such rays",
                    name, i, end, start
                );
                *warned = true;
            }
            continue;
        }
        encode_ray(buf, start, end, cloud.times[i], colours[i]);
        written += 1;
    }
    written
}

/// Streaming ray cloud writer: `start` / `append_chunk` / `finish`.
pub struct ChunkWriter<W: Write + Seek> {
    out: W,
    name: String,
    count_offset: u64,
    count: u64,
    buffer: Vec<u8>,
    warned: bool,
}

impl ChunkWriter<BufWriter<File>> {
    /// Create `path` and write a header with a reserved vertex count.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| RayError::open(path, e))?;
        Self::start(BufWriter::new(file), path.display().to_string())
    }
}

impl<W: Write + Seek> ChunkWriter<W> {
    pub fn start(mut out: W, name: impl Into<String>) -> Result<Self> {
        let base = out.stream_position()?;
        let offset = write_ray_header(&mut out, None)?;
        Ok(Self {
            out,
            name: name.into(),
            count_offset: base + offset,
            count: 0,
            buffer: Vec::new(),
            warned: false,
        })
    }

    /// Byte offset of the reserved vertex count field.
    pub fn count_offset(&self) -> u64 {
        self.count_offset
    }

    /// Rays written so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn append_chunk(&mut self, cloud: &Cloud) -> Result<usize> {
        self.buffer.clear();
        let written = encode_cloud(&mut self.buffer, cloud, &self.name, &mut self.warned);
        self.out.write_all(&self.buffer)?;
        self.count += written as u64;
        Ok(written)
    }

    /// Patch the vertex count into the header and flush.
    pub fn finish(mut self) -> Result<W> {
        if self.count == 0 {
            error!("{}: saved a ray cloud with zero rays", self.name);
        }
        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(self.count_offset))?;
        let count = format!("{:<width$}", self.count, width = COUNT_FIELD_WIDTH);
        self.out.write_all(count.as_bytes())?;
        self.out.seek(SeekFrom::Start(end))?;
        self.out.flush()?;
        info!("saved {} rays to {}", self.count, self.name);
        Ok(self.out)
    }
}

/// Serialise a whole cloud to `out` with an exact vertex count.
pub fn write_cloud<W: Write>(out: &mut W, cloud: &Cloud, name: &str) -> Result<usize> {
    let mut buffer = Vec::with_capacity(cloud.len() * RAY_RECORD_SIZE);
    let mut warned = false;
    let written = encode_cloud(&mut buffer, cloud, name, &mut warned);
    if written == 0 {
        error!("{}: saving a ray cloud with zero rays", name);
    }
    write_ray_header(out, Some(written as u64))?;
    out.write_all(&buffer)?;
    out.flush()?;
    Ok(written)
}

pub fn write_ply(path: &Path, cloud: &Cloud) -> Result<()> {
    info!("saving to {}, {} rays", path.display(), cloud.len());
    let file = File::create(path).map_err(|e| RayError::open(path, e))?;
    let mut out = BufWriter::new(file);
    write_cloud(&mut out, cloud, &path.display().to_string())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Mesh PLY
// ---------------------------------------------------------------------------

/// Write a triangle mesh: `(x, y, z, 1.0)` as f32×4 per vertex, then
/// `(3, i, j, k)` as i32×4 per face.
pub fn write_mesh<W: Write>(out: &mut W, mesh: &Mesh, flip_normals: bool) -> Result<()> {
    let header = format!(
        "ply\n\
format binary_little_endian 1.0\n\
comment generated by raytrees\n\
element vertex {}\n\
property float x\n\
property float y\n\
property float z\n\
property uchar red\n\
property uchar green\n\
property uchar blue\n\
property uchar alpha\n\
element face {}\n\
property list int int vertex_indices\n\
end_header\n",
        mesh.vertices.len(),
        mesh.index_list.len()
    );
    out.write_all(header.as_bytes())?;

    let mut buf = Vec::with_capacity(16 * (mesh.vertices.len() + mesh.index_list.len()));
    for v in &mesh.vertices {
        for c in [v.x as f32, v.y as f32, v.z as f32, 1.0f32] {
            buf.extend_from_slice(&c.to_le_bytes());
        }
    }
    for tri in &mesh.index_list {
        let [i, j, k] = if flip_normals {
            [tri[2], tri[1], tri[0]]
        } else {
            *tri
        };
        for c in [3i32, i as i32, j as i32, k as i32] {
            buf.extend_from_slice(&c.to_le_bytes());
        }
    }
    out.write_all(&buf)?;
    out.flush()?;
    Ok(())
}

pub fn write_ply_mesh(path: &Path, mesh: &Mesh, flip_normals: bool) -> Result<()> {
    info!("saving to {}, {} vertices", path.display(), mesh.vertices.len());
    let file = File::create(path).map_err(|e| RayError::open(path, e))?;
    write_mesh(&mut BufWriter::new(file), mesh, flip_normals)
}

/// Read a mesh written by [`write_mesh`].
pub fn read_mesh<R: BufRead>(input: &mut R, name: &str) -> Result<Mesh> {
    let mesh_error = |reason: String| RayError::Mesh {
        name: name.to_string(),
        reason,
    };
    let count_of = |line: &str| -> Result<usize> {
        line.split_whitespace()
            .nth(2)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| mesh_error(format!("bad element line '{}'", line)))
    };

    let mut num_vertices = 0;
    let mut num_faces = 0;
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Err(mesh_error("end of file before end_header".into()));
        }
        let trimmed = line.trim();
        if trimmed == "end_header" {
            break;
        }
        if trimmed.starts_with("element vertex") {
            num_vertices = count_of(trimmed)?;
        } else if trimmed.starts_with("element face") {
            num_faces = count_of(trimmed)?;
        }
    }

    let truncated = |e: io::Error| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            mesh_error("body is shorter than the declared counts".into())
        } else {
            RayError::Io(e)
        }
    };
    let mut record = [0u8; 16];
    let word = |r: &[u8; 16], i: usize| [r[4 * i], r[4 * i + 1], r[4 * i + 2], r[4 * i + 3]];

    let mut mesh = Mesh::default();
    mesh.vertices.reserve(num_vertices);
    for _ in 0..num_vertices {
        input.read_exact(&mut record).map_err(truncated)?;
        mesh.vertices.push(DVec3::new(
            f32::from_le_bytes(word(&record, 0)) as f64,
            f32::from_le_bytes(word(&record, 1)) as f64,
            f32::from_le_bytes(word(&record, 2)) as f64,
        ));
    }
    mesh.index_list.reserve(num_faces);
    for f in 0..num_faces {
        input.read_exact(&mut record).map_err(truncated)?;
        let sides = i32::from_le_bytes(word(&record, 0));
        if sides != 3 {
            return Err(mesh_error(format!("face {} has {} vertices, expected 3", f, sides)));
        }
        let mut tri = [0usize; 3];
        for (k, slot) in tri.iter_mut().enumerate() {
            let index = i32::from_le_bytes(word(&record, k + 1));
            if index < 0 || index as usize >= num_vertices {
                return Err(mesh_error(format!("face {} references vertex {}", f, index)));
            }
            *slot = index as usize;
        }
        mesh.index_list.push(tri);
    }
    info!("reading from {}, {} triangles", name, mesh.index_list.len());
    Ok(mesh)
}

pub fn read_ply_mesh(path: &Path) -> Result<Mesh> {
    let file = File::open(path).map_err(|e| RayError::open(path, e))?;
    read_mesh(&mut BufReader::new(file), &path.display().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ray(t: f64, end: DVec3) -> Ray {
        Ray {
            start: end + DVec3::new(0.5, -1.0, 20.0),
            end,
            time: t,
            colour: Rgba::new(10, 20, 30, 255),
        }
    }

    fn sample_cloud(n: usize) -> Cloud {
        let rays: Vec<Ray> = (0..n)
            .map(|i| {
                let f = i as f64;
                let mut r = ray(1000.0 + f * 0.25, DVec3::new(f * 0.5, 10.0 - f, 2.0 + 0.1 * f));
                r.colour = Rgba::new(i as u8, (2 * i) as u8, 7, if i % 5 == 0 { 0 } else { 255 });
                r
            })
            .collect();
        Cloud::from_rays(&rays)
    }

    fn encode(cloud: &Cloud) -> Vec<u8> {
        let mut out = Vec::new();
        write_cloud(&mut out, cloud, "test").unwrap();
        out
    }

    fn decode_chunked(bytes: &[u8], chunk_size: usize) -> (Cloud, ReadReport) {
        let reader = RayReader::new(Cursor::new(bytes.to_vec()), "test").unwrap();
        let mut all = Cloud::new();
        let report = reader
            .read_chunks(true, chunk_size, |chunk| {
                all.append(chunk);
                Ok(())
            })
            .unwrap();
        (all, report)
    }

    /// Body bytes of raw rows under a hand-written header.
    fn with_header(header: &str, body: &[u8]) -> Vec<u8> {
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn test_round_trip_preserves_rays() {
        let cloud = sample_cloud(20);
        let bytes = encode(&cloud);
        let reader = RayReader::new(Cursor::new(bytes), "test").unwrap();
        let (decoded, report) = reader.read_all(true).unwrap();

        assert_eq!(decoded.len(), cloud.len());
        assert!(report.times_monotonic);
        for (a, b) in cloud.rays().zip(decoded.rays()) {
            assert!((a.end - b.end).abs().max_element() < 1e-5);
            assert!((a.start - b.start).abs().max_element() < 1e-4);
            assert_eq!(a.time, b.time);
            assert_eq!(a.colour, b.colour);
        }
    }

    #[test]
    fn test_record_layout_is_36_bytes() {
        let cloud = sample_cloud(3);
        let bytes = encode(&cloud);
        let text = String::from_utf8_lossy(&bytes);
        let header_len = text.find("end_header\n").unwrap() + "end_header\n".len();
        assert_eq!(bytes.len() - header_len, 3 * RAY_RECORD_SIZE);
        assert!(text.starts_with("ply\nformat binary_little_endian 1.0\n"));
        assert!(text.contains("element vertex 3\n"));
    }

    #[test]
    fn test_chunk_size_invariance() {
        let bytes = encode(&sample_cloud(23));
        let (whole, _) = decode_chunked(&bytes, usize::MAX);
        for chunk_size in [1, 7] {
            let (chunked, _) = decode_chunked(&bytes, chunk_size);
            assert_eq!(chunked, whole, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_chunk_sizes_reported_to_callback() {
        let bytes = encode(&sample_cloud(23));
        let reader = RayReader::new(Cursor::new(bytes), "test").unwrap();
        let mut sizes = Vec::new();
        reader
            .read_chunks(true, 7, |chunk| {
                sizes.push(chunk.len());
                Ok(())
            })
            .unwrap();
        assert_eq!(sizes, vec![7, 7, 7, 2]);
    }

    #[test]
    fn test_unsorted_times_are_repaired_without_chunking() {
        let cloud = Cloud::from_rays(&[
            Ray {
                colour: Rgba::new(3, 0, 0, 255),
                ..ray(3.0, DVec3::new(3.0, 0.0, 0.0))
            },
            Ray {
                colour: Rgba::new(1, 0, 0, 255),
                ..ray(1.0, DVec3::new(1.0, 0.0, 0.0))
            },
            Ray {
                colour: Rgba::new(2, 0, 0, 255),
                ..ray(2.0, DVec3::new(2.0, 0.0, 0.0))
            },
        ]);
        let bytes = encode(&cloud);

        let reader = RayReader::new(Cursor::new(bytes.clone()), "test").unwrap();
        let (sorted, report) = reader.read_all(true).unwrap();
        assert!(!report.times_monotonic);
        assert_eq!(sorted.times, vec![1.0, 2.0, 3.0]);
        for i in 0..3 {
            assert_eq!(sorted.ends[i].x, sorted.times[i]);
            assert_eq!(sorted.colours[i].red as f64, sorted.times[i]);
        }

        // chunked reading leaves file order alone
        let (chunked, report) = decode_chunked(&bytes, 2);
        assert!(report.has_warning(ReadWarning::UnsortedTimes));
        assert_eq!(chunked.times, vec![3.0, 1.0, 2.0]);
    }

    #[test]
    fn test_nan_and_outliers_dropped_with_one_warning() {
        let header = "ply\nformat binary_little_endian 1.0\nelement vertex 4\n\
property float x\nproperty float y\nproperty float z\nend_header\n";
        let mut body = Vec::new();
        for p in [[1.0f32, 2.0, 3.0], [f32::NAN, 0.0, 0.0], [2e6, 0.0, 0.0], [4.0, 5.0, 6.0]] {
            for c in p {
                body.extend_from_slice(&c.to_le_bytes());
            }
        }
        let bytes = with_header(header, &body);
        let reader = RayReader::new(Cursor::new(bytes), "raw").unwrap();
        let (cloud, report) = reader.read_all(false).unwrap();

        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.ends[1], DVec3::new(4.0, 5.0, 6.0));
        assert_eq!(report.dropped_invalid_end, 2);
        assert_eq!(report.warning_count(ReadWarning::InvalidRows), 1);
        // no time column: consecutive indices of the decoded rays
        assert_eq!(cloud.times, vec![0.0, 1.0]);
        assert!(report.has_warning(ReadWarning::MissingTime));
        assert!(report.has_warning(ReadWarning::MissingColour));
    }

    #[test]
    fn test_synthesised_times_continue_across_chunks() {
        let header = "ply\nformat binary_little_endian 1.0\nelement vertex 5\n\
property float x\nproperty float y\nproperty float z\nend_header\n";
        let mut body = Vec::new();
        for i in 0..5 {
            for c in [i as f32, 0.0, 1.0] {
                body.extend_from_slice(&c.to_le_bytes());
            }
        }
        let reader = RayReader::new(Cursor::new(with_header(header, &body)), "raw").unwrap();
        let mut times = Vec::new();
        reader
            .read_chunks(false, 2, |chunk| {
                times.extend_from_slice(&chunk.times);
                Ok(())
            })
            .unwrap();
        assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_missing_normals_named_in_error() {
        let header = "ply\nformat binary_little_endian 1.0\nelement vertex 1\n\
property float x\nproperty float y\nproperty float z\nend_header\n";
        let bytes = with_header(header, &[0u8; 12]);
        let reader = RayReader::new(Cursor::new(bytes), "raw").unwrap();
        match reader.read_all(true) {
            Err(RayError::MissingProperty { property, .. }) => assert_eq!(property, "nx"),
            other => panic!("expected missing nx, got {:?}", other.map(|(c, _)| c.len())),
        }
    }

    #[test]
    fn test_missing_position_named_in_error() {
        let header = "ply\nformat binary_little_endian 1.0\nelement vertex 1\n\
property float x\nproperty float z\nend_header\n";
        let reader = RayReader::new(Cursor::new(with_header(header, &[0u8; 8])), "raw").unwrap();
        let err = reader.read_all(false).unwrap_err();
        assert!(matches!(err, RayError::MissingProperty { property: "y", .. }));
    }

    #[test]
    fn test_double_positions_and_mixed_case_header() {
        let header = "PLY\r\nFormat Binary_Little_Endian 1.0\r\nElement Vertex 1\r\n\
Property UCHAR red\r\nproperty uchar green\r\nproperty uchar blue\r\n\
property double gps_time\r\nproperty double x\r\nproperty double y\r\nproperty double z\r\n\
End_Header\r\n";
        let mut body = vec![9u8, 8, 7];
        body.extend_from_slice(&42.5f64.to_le_bytes());
        for c in [1.25f64, -3.5, 100.125] {
            body.extend_from_slice(&c.to_le_bytes());
        }
        let reader = RayReader::new(Cursor::new(with_header(header, &body)), "raw").unwrap();
        assert_eq!(reader.header().row_size, 3 + 8 * 4);
        let (cloud, _) = reader.read_all(false).unwrap();
        assert_eq!(cloud.ends[0], DVec3::new(1.25, -3.5, 100.125));
        assert_eq!(cloud.starts[0], cloud.ends[0]);
        assert_eq!(cloud.times[0], 42.5);
        assert_eq!(cloud.colours[0], Rgba::new(9, 8, 7, 255));
    }

    #[test]
    fn test_intensity_overrides_alpha() {
        let header = "ply\nformat binary_little_endian 1.0\nelement vertex 2\n\
property float x\nproperty float y\nproperty float z\nproperty float intensity\n\
property uchar red\nproperty uchar green\nproperty uchar blue\nproperty uchar alpha\nend_header\n";
        let mut body = Vec::new();
        for (i, intensity) in [(0.0f32, 50.0f32), (1.0, 250.0)] {
            for c in [i, 0.0, 0.0, intensity] {
                body.extend_from_slice(&c.to_le_bytes());
            }
            body.extend_from_slice(&[1, 2, 3, 4]);
        }
        let reader = RayReader::new(Cursor::new(with_header(header, &body)), "raw").unwrap();
        let (cloud, report) = reader.read_all(false).unwrap();
        assert_eq!(cloud.colours[0].alpha, 127);
        assert_eq!(cloud.colours[1].alpha, 255);
        assert_eq!(cloud.colours[0].red, 1);
        assert!(report.has_warning(ReadWarning::IntensityInAlpha));
    }

    #[test]
    fn test_all_unbounded_is_fatal() {
        let mut cloud = sample_cloud(4);
        for c in cloud.colours.iter_mut() {
            c.alpha = 0;
        }
        let reader = RayReader::new(Cursor::new(encode(&cloud)), "test").unwrap();
        assert!(matches!(
            reader.read_all(true),
            Err(RayError::AllUnbounded { .. })
        ));
    }

    #[test]
    fn test_empty_body_is_fatal() {
        let bytes = encode(&Cloud::new());
        let reader = RayReader::new(Cursor::new(bytes), "test").unwrap();
        assert!(matches!(reader.read_all(true), Err(RayError::NoRays { .. })));
    }

    #[test]
    fn test_ascii_format_rejected() {
        let header = "ply\nformat ascii 1.0\nelement vertex 0\nproperty float x\nend_header\n";
        let err = RayReader::new(Cursor::new(header.as_bytes().to_vec()), "ascii").err();
        assert!(matches!(err, Some(RayError::MalformedHeader { .. })));
    }

    #[test]
    fn test_writer_skips_invalid_rays() {
        let mut cloud = sample_cloud(3);
        cloud.ends[1] = DVec3::new(f64::NAN, 0.0, 0.0);
        let mut out = Vec::new();
        assert_eq!(write_cloud(&mut out, &cloud, "test").unwrap(), 2);
    }

    #[test]
    fn test_header_backpatch_after_finish() {
        let mut writer = ChunkWriter::start(Cursor::new(Vec::new()), "stream").unwrap();
        let offset = writer.count_offset() as usize;
        let mut total = 0;
        for n in [5, 1, 12] {
            total += writer.append_chunk(&sample_cloud(n)).unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();

        let field = std::str::from_utf8(&bytes[offset..offset + COUNT_FIELD_WIDTH]).unwrap();
        assert_eq!(field.trim().parse::<usize>().unwrap(), total);
        assert_eq!(total, 18);

        let reader = RayReader::new(Cursor::new(bytes), "stream").unwrap();
        assert_eq!(reader.header().vertex_count, Some(18));
        let (cloud, _) = reader.read_all(true).unwrap();
        assert_eq!(cloud.len(), 18);
    }

    #[test]
    fn test_mesh_round_trip() {
        let mesh = Mesh {
            vertices: vec![
                DVec3::new(0.0, 0.0, 1.0),
                DVec3::new(4.0, 0.0, 2.0),
                DVec3::new(0.0, 4.0, 3.0),
            ],
            index_list: vec![[0, 1, 2]],
        };
        let mut bytes = Vec::new();
        write_mesh(&mut bytes, &mesh, true).unwrap();
        let decoded = read_mesh(&mut Cursor::new(bytes), "mesh").unwrap();
        assert_eq!(decoded.vertices, mesh.vertices);
        assert_eq!(decoded.index_list, vec![[2, 1, 0]]);
    }
}
