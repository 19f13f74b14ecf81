//! Common test fixtures for conflux tests.
//!
//! Coordinates are in metres of a projected CRS such as EPSG:6933, with
//! scenes laid out on a 10 m grid so pixel counts are easy to reason about.

use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;

/// Common extents as `(min_x, min_y, max_x, max_y)`.
pub mod extents {
    /// A 100 m x 100 m scene at the origin (10x10 pixels at 10 m).
    pub const SCENE_A: (f64, f64, f64, f64) = (0.0, 0.0, 100.0, 100.0);

    /// A scene far from every polygon fixture.
    pub const SCENE_FAR: (f64, f64, f64, f64) = (10_000.0, 10_000.0, 10_100.0, 10_100.0);

    /// Neighbouring scene sharing SCENE_A's eastern edge.
    pub const SCENE_EAST: (f64, f64, f64, f64) = (100.0, 0.0, 200.0, 100.0);
}

/// Counter-clockwise ring for an axis-aligned rectangle.
pub fn rect_ring(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Vec<[f64; 2]> {
    vec![
        [min_x, min_y],
        [max_x, min_y],
        [max_x, max_y],
        [min_x, max_y],
        [min_x, min_y],
    ]
}

/// Ring for a `size` x `size` square with lower-left corner `(x, y)`.
pub fn square_ring(x: f64, y: f64, size: f64) -> Vec<[f64; 2]> {
    rect_ring(x, y, x + size, y + size)
}

/// GeoJSON Polygon geometry object for a ring.
pub fn polygon_geometry(ring: Vec<[f64; 2]>) -> Value {
    json!({ "type": "Polygon", "coordinates": [ring] })
}

/// GeoJSON Feature with a single property naming its id.
pub fn feature(id_field: &str, id: &str, ring: Vec<[f64; 2]>) -> Value {
    json!({
        "type": "Feature",
        "properties": { id_field: id },
        "geometry": polygon_geometry(ring),
    })
}

/// GeoJSON FeatureCollection with a named CRS member.
pub fn feature_collection(crs: &str, features: Vec<Value>) -> Value {
    json!({
        "type": "FeatureCollection",
        "crs": { "type": "name", "properties": { "name": crs } },
        "features": features,
    })
}

/// Write `contents` to a new temporary file with the given suffix.
///
/// The file lives as long as the returned handle.
pub fn write_temp_file(suffix: &str, contents: &str) -> (tempfile::NamedTempFile, PathBuf) {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write temp file");
    let path = file.path().to_path_buf();
    (file, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_ring_closed() {
        let ring = square_ring(0.0, 0.0, 10.0);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.first(), ring.last());
    }

    #[test]
    fn test_feature_collection_shape() {
        let fc = feature_collection(
            "EPSG:6933",
            vec![feature("UID", "a", square_ring(0.0, 0.0, 1.0))],
        );
        assert_eq!(fc["features"][0]["properties"]["UID"], "a");
        assert_eq!(fc["crs"]["properties"]["name"], "EPSG:6933");
    }
}
