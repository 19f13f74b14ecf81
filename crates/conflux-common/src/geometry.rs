//! Vector geometry for polygon drills.
//!
//! Geometries use GeoJSON coordinate layout. Rings are stored without the
//! repeated closing vertex; it is stripped on construction and added back on
//! serialization.

use serde::{Deserialize, Serialize};

use crate::BoundingBox;

/// A closed ring of `[x, y]` vertices.
pub type Ring = Vec<[f64; 2]>;

/// A polygon with an exterior ring and zero or more holes.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Ring,
    pub holes: Vec<Ring>,
}

impl Polygon {
    pub fn new(exterior: Ring, holes: Vec<Ring>) -> Self {
        Self {
            exterior: open_ring(exterior),
            holes: holes.into_iter().map(open_ring).collect(),
        }
    }

    /// Axis-aligned rectangle, counter-clockwise.
    pub fn rect(bbox: &BoundingBox) -> Self {
        Polygon::new(
            vec![
                [bbox.min_x, bbox.min_y],
                [bbox.max_x, bbox.min_y],
                [bbox.max_x, bbox.max_y],
                [bbox.min_x, bbox.max_y],
            ],
            Vec::new(),
        )
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.exterior.iter())
    }

    /// Planar area, holes subtracted.
    pub fn area(&self) -> f64 {
        let outer = signed_area(&self.exterior).abs();
        let holes: f64 = self.holes.iter().map(|h| signed_area(h).abs()).sum();
        (outer - holes).max(0.0)
    }

    /// Even-odd containment test against the exterior and every hole.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        ring_contains(&self.exterior, x, y) && !self.holes.iter().any(|h| ring_contains(h, x, y))
    }

    /// Exterior first, then holes, each with the sign it contributes to the area.
    fn signed_rings(&self) -> impl Iterator<Item = (f64, &[[f64; 2]])> {
        std::iter::once((1.0, self.exterior.as_slice()))
            .chain(self.holes.iter().map(|h| (-1.0, h.as_slice())))
    }

    /// Area of the overlap with another polygon. Neither needs to be convex.
    pub fn intersection_area(&self, other: &Polygon) -> f64 {
        let mut total = 0.0;
        for (sa, a) in self.signed_rings() {
            for (sb, b) in other.signed_rings() {
                total += sa * sb * ring_intersection_area(a, b);
            }
        }
        total.max(0.0)
    }
}

/// A polygonal geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GeoJsonGeometry", into = "GeoJsonGeometry")]
pub enum Geometry {
    Polygon(Polygon),
    MultiPolygon(Vec<Polygon>),
}

impl Geometry {
    pub fn polygons(&self) -> &[Polygon] {
        match self {
            Geometry::Polygon(p) => std::slice::from_ref(p),
            Geometry::MultiPolygon(ps) => ps,
        }
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.polygons().iter().flat_map(|p| p.exterior.iter()))
    }

    pub fn area(&self) -> f64 {
        self.polygons().iter().map(Polygon::area).sum()
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        self.polygons().iter().any(|p| p.contains_point(x, y))
    }

    /// Area of the overlap with `other`. Parts of a MultiPolygon are assumed
    /// not to overlap each other.
    pub fn intersection_area(&self, other: &Geometry) -> f64 {
        self.polygons()
            .iter()
            .flat_map(|a| other.polygons().iter().map(move |b| a.intersection_area(b)))
            .sum()
    }
}

impl From<Polygon> for Geometry {
    fn from(p: Polygon) -> Self {
        Geometry::Polygon(p)
    }
}

/// Wire representation following the GeoJSON geometry object layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GeoJsonGeometry {
    Polygon { coordinates: Vec<Ring> },
    MultiPolygon { coordinates: Vec<Vec<Ring>> },
}

#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    #[error("Polygon has no exterior ring")]
    MissingExterior,

    #[error("Ring has fewer than 3 distinct vertices")]
    DegenerateRing,
}

fn polygon_from_rings(mut rings: Vec<Ring>) -> Result<Polygon, GeometryError> {
    if rings.is_empty() {
        return Err(GeometryError::MissingExterior);
    }
    let exterior = rings.remove(0);
    let polygon = Polygon::new(exterior, rings);
    if polygon.exterior.len() < 3 {
        return Err(GeometryError::DegenerateRing);
    }
    Ok(polygon)
}

fn polygon_to_rings(p: Polygon) -> Vec<Ring> {
    std::iter::once(p.exterior)
        .chain(p.holes)
        .map(close_ring)
        .collect()
}

impl TryFrom<GeoJsonGeometry> for Geometry {
    type Error = GeometryError;

    fn try_from(g: GeoJsonGeometry) -> Result<Self, Self::Error> {
        match g {
            GeoJsonGeometry::Polygon { coordinates } => {
                Ok(Geometry::Polygon(polygon_from_rings(coordinates)?))
            }
            GeoJsonGeometry::MultiPolygon { coordinates } => Ok(Geometry::MultiPolygon(
                coordinates
                    .into_iter()
                    .map(polygon_from_rings)
                    .collect::<Result<_, _>>()?,
            )),
        }
    }
}

impl From<Geometry> for GeoJsonGeometry {
    fn from(g: Geometry) -> Self {
        match g {
            Geometry::Polygon(p) => GeoJsonGeometry::Polygon {
                coordinates: polygon_to_rings(p),
            },
            Geometry::MultiPolygon(ps) => GeoJsonGeometry::MultiPolygon {
                coordinates: ps.into_iter().map(polygon_to_rings).collect(),
            },
        }
    }
}

fn open_ring(mut ring: Ring) -> Ring {
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    ring
}

fn close_ring(mut ring: Ring) -> Ring {
    if let Some(first) = ring.first().copied() {
        ring.push(first);
    }
    ring
}

/// Shoelace area; positive for counter-clockwise rings.
pub fn signed_area(ring: &[[f64; 2]]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        sum += a[0] * b[1] - b[0] * a[1];
    }
    sum / 2.0
}

fn ring_contains(ring: &[[f64; 2]], x: f64, y: f64) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i][0], ring[i][1]);
        let (xj, yj) = (ring[j][0], ring[j][1]);
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Which side of the directed line a->b the point lies on (positive = left).
fn side(a: [f64; 2], b: [f64; 2], p: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

/// Sutherland-Hodgman clip of any ring against a convex counter-clockwise ring.
pub fn clip_ring(subject: &[[f64; 2]], clip: &[[f64; 2]]) -> Ring {
    if clip.len() < 3 {
        return Vec::new();
    }
    let mut output: Ring = subject.to_vec();
    for i in 0..clip.len() {
        if output.is_empty() {
            break;
        }
        let a = clip[i];
        let b = clip[(i + 1) % clip.len()];
        let input = std::mem::take(&mut output);
        for j in 0..input.len() {
            let cur = input[j];
            let prev = input[(j + input.len() - 1) % input.len()];
            let s_cur = side(a, b, cur);
            let s_prev = side(a, b, prev);
            if s_cur >= 0.0 {
                if s_prev < 0.0 {
                    output.push(crossing(prev, cur, s_prev, s_cur));
                }
                output.push(cur);
            } else if s_prev >= 0.0 {
                output.push(crossing(prev, cur, s_prev, s_cur));
            }
        }
    }
    output
}

fn crossing(p: [f64; 2], q: [f64; 2], sp: f64, sq: f64) -> [f64; 2] {
    let t = sp / (sp - sq);
    [p[0] + t * (q[0] - p[0]), p[1] + t * (q[1] - p[1])]
}

/// Area of the overlap of two simple rings of either orientation.
///
/// `clip` is fanned into triangles from its first vertex; each triangle is
/// convex, so the subject can be clipped against it directly, and the
/// triangle's orientation gives the sign of its contribution.
pub fn ring_intersection_area(subject: &[[f64; 2]], clip: &[[f64; 2]]) -> f64 {
    if subject.len() < 3 || clip.len() < 3 {
        return 0.0;
    }
    let orientation = signed_area(clip).signum();
    let origin = clip[0];
    let mut total = 0.0;
    for pair in clip[1..].windows(2) {
        let (b, c) = (pair[0], pair[1]);
        let turn = side(origin, b, c);
        if turn == 0.0 {
            continue;
        }
        let triangle = if turn > 0.0 { [origin, b, c] } else { [origin, c, b] };
        let overlap = signed_area(&clip_ring(subject, &triangle)).abs();
        total += turn.signum() * overlap;
    }
    (total * orientation).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, size: f64) -> Polygon {
        Polygon::rect(&BoundingBox::new(x0, y0, x0 + size, y0 + size))
    }

    #[test]
    fn test_area_with_hole() {
        let p = Polygon::new(
            vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]],
            vec![vec![[2.0, 2.0], [4.0, 2.0], [4.0, 4.0], [2.0, 4.0]]],
        );
        assert_eq!(p.exterior.len(), 4);
        assert_eq!(p.area(), 96.0);
        assert!(p.contains_point(1.0, 1.0));
        assert!(!p.contains_point(3.0, 3.0));
        assert!(!p.contains_point(11.0, 1.0));
    }

    #[test]
    fn test_clip_partial_overlap() {
        let clip = square(0.0, 0.0, 10.0);
        let p = square(5.0, 5.0, 10.0);
        assert!((p.intersection_area(&clip) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_clip_touching_edge_is_zero() {
        let clip = square(0.0, 0.0, 10.0);
        let p = square(10.0, 0.0, 10.0);
        assert!(p.intersection_area(&clip).abs() < 1e-9);
    }

    #[test]
    fn test_clip_concave_subject() {
        // An L shape clipped by a square covering its lower-left 2x2 cell.
        let l = Polygon::new(
            vec![[0.0, 0.0], [4.0, 0.0], [4.0, 2.0], [2.0, 2.0], [2.0, 4.0], [0.0, 4.0]],
            Vec::new(),
        );
        assert_eq!(l.area(), 12.0);
        let clip = square(0.0, 0.0, 3.0);
        assert!((l.intersection_area(&clip) - 8.0).abs() < 1e-9);
        assert!((clip.intersection_area(&l) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_concave_clip_excludes_notch() {
        let l = Polygon::new(
            vec![[0.0, 0.0], [100.0, 0.0], [100.0, 50.0], [50.0, 50.0], [50.0, 100.0], [0.0, 100.0]],
            Vec::new(),
        );
        assert_eq!(square(70.0, 70.0, 10.0).intersection_area(&l), 0.0);
        assert!((square(40.0, 40.0, 20.0).intersection_area(&l) - 300.0).abs() < 1e-9);

        // Clockwise rings give the same answer.
        let mut cw = l.exterior.clone();
        cw.reverse();
        let l_cw = Polygon::new(cw, Vec::new());
        assert!((square(40.0, 40.0, 20.0).intersection_area(&l_cw) - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_intersection_with_holes_on_both_sides() {
        let donut = Polygon::new(
            square(0.0, 0.0, 10.0).exterior,
            vec![square(2.0, 2.0, 6.0).exterior],
        );
        // Fully inside the hole.
        assert_eq!(square(3.0, 3.0, 2.0).intersection_area(&donut), 0.0);
        // Half in the ring, half in the hole: x 0..4, y 0..4 minus 2..4 x 2..4.
        assert!((square(0.0, 0.0, 4.0).intersection_area(&donut) - 12.0).abs() < 1e-9);
        assert!((donut.intersection_area(&donut) - 64.0).abs() < 1e-9);
    }

    #[test]
    fn test_geojson_roundtrip_closes_rings() {
        let json = r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]}"#;
        let g: Geometry = serde_json::from_str(json).unwrap();
        assert_eq!(g.polygons()[0].exterior.len(), 3);
        let back = serde_json::to_value(&g).unwrap();
        assert_eq!(back["coordinates"][0].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        let json = r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[0,0]]]}"#;
        assert!(serde_json::from_str::<Geometry>(json).is_err());
    }
}
