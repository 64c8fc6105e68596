//! # raytrees: ray cloud I/O and forest extraction
//!
//! A ray cloud is a point cloud in which every return also records the
//! sensor position it was seen from. This crate provides:
//! - **Codec**: streaming binary PLY ray clouds and meshes (`ply`), LAS/LAZ
//!   ingest with trajectory interpolation (`las_input`, `trajectory`, `import`)
//! - **Fields**: height, ground and trunk-band density rasters of a cloud
//!   (`heightfield`, `occupancy`, `mesh`, `geotiff`)
//! - **Forest extraction**: hierarchical watershed over the canopy height
//!   field, paraboloid crown fits and a best-cut search for tree
//!   candidates (`watershed`, `paraboloid`, `forest`)

pub mod cloud;
pub mod error;
pub mod forest;
pub mod geotiff;
pub mod grid;
pub mod heightfield;
pub mod import;
pub mod las_input;
pub mod mesh;
pub mod occupancy;
pub mod paraboloid;
pub mod ply;
pub mod trajectory;
pub mod watershed;

pub use cloud::{Cloud, Ray, Rgba};
pub use error::{RayError, Result};
pub use forest::{extract, ExtractionReport, ForestParams, TreeSummary, Trunk};
pub use grid::Grid;
pub use heightfield::{FieldParams, ForestFields, GroundSource};
