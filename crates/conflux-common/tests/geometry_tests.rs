//! Clipping and footprint tests over GeoJSON-shaped inputs.

use chrono::{TimeZone, Utc};
use conflux_common::{
    BoundingBox, CrsCode, EdgeFlags, GeoBox, Geometry, Polygon, RasterStack, Resolution,
};
use test_utils::fixtures::{polygon_geometry, rect_ring, square_ring};
use test_utils::generators::create_split_water_grid;
use test_utils::{assert_approx_eq, WET};

fn geometry(value: serde_json::Value) -> Geometry {
    serde_json::from_value(value).unwrap()
}

fn stack_over(bbox: &BoundingBox, water: Vec<f32>) -> RasterStack {
    let geobox = GeoBox::covering(bbox, CrsCode::Epsg6933, Resolution::new(-10.0, 10.0));
    RasterStack::new(
        geobox,
        Utc.with_ymd_and_hms(2019, 6, 1, 0, 0, 0).unwrap(),
        Geometry::from(Polygon::rect(bbox)),
    )
    .with_band("water", water)
    .unwrap()
}

#[test]
fn test_polygon_with_hole_clips_ring_of_pixels() {
    let donut = geometry(serde_json::json!({
        "type": "Polygon",
        "coordinates": [square_ring(0.0, 0.0, 50.0), square_ring(10.0, 10.0, 30.0)],
    }));
    assert_approx_eq!(donut.area(), 2500.0 - 900.0);

    let bbox = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
    let clip = stack_over(&bbox, vec![1.0; 100]).clip(&donut);
    // 5x5 block minus the 3x3 hole
    assert_eq!(clip.pixel_count, 16);
    assert_eq!(clip.band("water").unwrap().len(), 16);
}

#[test]
fn test_multipolygon_clip_reads_both_parts() {
    let parts = geometry(serde_json::json!({
        "type": "MultiPolygon",
        "coordinates": [
            [rect_ring(0.0, 0.0, 20.0, 20.0)],
            [rect_ring(80.0, 80.0, 100.0, 100.0)],
        ],
    }));
    let bbox = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
    // Left five columns wet
    let clip = stack_over(&bbox, create_split_water_grid(10, 10, 5)).clip(&parts);

    assert_eq!(clip.pixel_count, 8);
    let wet = clip.band("water").unwrap().iter().filter(|&&v| v == WET).count();
    assert_eq!(wet, 4);
}

#[test]
fn test_polygon_outside_stack_clips_nothing() {
    let far = geometry(polygon_geometry(square_ring(500.0, 500.0, 10.0)));
    let bbox = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
    let clip = stack_over(&bbox, vec![0.0; 100]).clip(&far);
    assert_eq!(clip.pixel_count, 0);
    assert!(clip.band("water").unwrap().is_empty());
    assert!(clip.band("pq").is_err());
}

#[test]
fn test_overlap_with_rotated_footprint() {
    // Diamond footprint: a square rotated 45 degrees, centred on (50, 50).
    let footprint = Geometry::from(Polygon::new(
        vec![[50.0, 0.0], [100.0, 50.0], [50.0, 100.0], [0.0, 50.0]],
        Vec::new(),
    ));
    assert_approx_eq!(footprint.area(), 5000.0);

    let centre = Geometry::from(Polygon::rect(&BoundingBox::new(40.0, 40.0, 60.0, 60.0)));
    assert_approx_eq!(centre.intersection_area(&footprint), 400.0);

    // Only the top-right corner of this square touches the diamond.
    let corner = Geometry::from(Polygon::rect(&BoundingBox::new(0.0, 0.0, 25.0, 25.0)));
    assert_approx_eq!(corner.intersection_area(&footprint), 0.0);
}

#[test]
fn test_edge_flags_for_straddling_polygon() {
    let footprint = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
    let north_west = BoundingBox::new(-10.0, 90.0, 10.0, 110.0);
    let flags = EdgeFlags::from_extents(&north_west, &footprint, false);
    assert!(flags.north && flags.west);
    assert!(!flags.south && !flags.east);

    let inside = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
    assert!(!EdgeFlags::from_extents(&inside, &footprint, true).any());
}
