//! Error type shared by the codec, field builder and forest extraction.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything that can abort a read, write or extraction run.
///
/// Data-quality problems (NaN rows, unsorted times, missing optional
/// columns) are not errors; they are logged once per file and reported in
/// [`crate::ply::ReadReport`].
#[derive(Debug, Error)]
pub enum RayError {
    #[error("couldn't open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{name}: could not find required property '{property}'")]
    MissingProperty { name: String, property: &'static str },

    #[error("{name}: malformed header: {reason}")]
    MalformedHeader { name: String, reason: String },

    #[error("{name}: no entries found")]
    NoRays { name: String },

    #[error("{name}: no bounded rays, most operations cannot run on this cloud")]
    AllUnbounded { name: String },

    #[error("{}:{line}: {reason}", path.display())]
    Trajectory {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{}:{line}: {reason}", path.display())]
    TrunkList {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("start points need a trajectory, but it has no nodes")]
    EmptyTrajectory,

    #[error("{name}: malformed mesh: {reason}")]
    Mesh { name: String, reason: String },

    #[error("{}: malformed density cache: {reason}", path.display())]
    Cache { path: PathBuf, reason: String },

    #[error("{what}: grid is {found:?} cells, expected {expected:?}")]
    GridMismatch {
        what: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("unsupported input type: {}", path.display())]
    UnsupportedInput { path: PathBuf },

    #[error("unsupported GeoTIFF pixel type")]
    UnsupportedPixelType,

    #[error(transparent)]
    Las(#[from] las::Error),

    #[error(transparent)]
    Tiff(#[from] tiff::TiffError),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, RayError>;

impl RayError {
    pub(crate) fn open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RayError::Open {
            path: path.into(),
            source,
        }
    }
}
