//! Common types and utilities shared across all conflux crates.

pub mod bbox;
pub mod crs;
pub mod dataset;
pub mod error;
pub mod geobox;
pub mod geometry;
pub mod raster;
pub mod record;

pub use bbox::BoundingBox;
pub use crs::{CrsCode, Resolution};
pub use dataset::Dataset;
pub use error::{ConfluxError, ConfluxResult, FailureClass};
pub use geobox::GeoBox;
pub use geometry::{Geometry, Polygon, Ring};
pub use raster::{ClippedStack, RasterStack, Resampling};
pub use record::{
    EdgeFlags, Measurements, OutputBatch, PolygonFailure, SceneId, SummaryRecord,
};
