//! Pixel grid definitions for loaded rasters.

use serde::{Deserialize, Serialize};

use crate::{BoundingBox, CrsCode, Resolution};

/// A north-up pixel grid: size, origin corner, pixel size and CRS.
///
/// The origin is the outer corner of pixel `(0, 0)`. With the usual negative
/// y resolution that is the top-left corner of the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoBox {
    pub crs: CrsCode,
    pub width: usize,
    pub height: usize,
    pub origin_x: f64,
    pub origin_y: f64,
    pub resolution: Resolution,
}

impl GeoBox {
    pub fn new(
        crs: CrsCode,
        width: usize,
        height: usize,
        origin_x: f64,
        origin_y: f64,
        resolution: Resolution,
    ) -> Self {
        Self {
            crs,
            width,
            height,
            origin_x,
            origin_y,
            resolution,
        }
    }

    /// Grid covering `bbox`, with edges snapped outward to multiples of the
    /// resolution so that scenes drilled at the same resolution share pixel
    /// boundaries.
    pub fn covering(bbox: &BoundingBox, crs: CrsCode, resolution: Resolution) -> Self {
        let rx = resolution.x.abs();
        let ry = resolution.y.abs();

        let min_x = (bbox.min_x / rx).floor() * rx;
        let max_x = (bbox.max_x / rx).ceil() * rx;
        let min_y = (bbox.min_y / ry).floor() * ry;
        let max_y = (bbox.max_y / ry).ceil() * ry;

        let width = ((max_x - min_x) / rx).round().max(0.0) as usize;
        let height = ((max_y - min_y) / ry).round().max(0.0) as usize;

        let origin_x = if resolution.x > 0.0 { min_x } else { max_x };
        let origin_y = if resolution.y < 0.0 { max_y } else { min_y };

        Self::new(crs, width, height, origin_x, origin_y, resolution)
    }

    /// Total number of pixels.
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Row-major index of a pixel.
    pub fn index(&self, col: usize, row: usize) -> usize {
        row * self.width + col
    }

    /// Coordinates of a pixel centre.
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.resolution.x,
            self.origin_y + (row as f64 + 0.5) * self.resolution.y,
        )
    }

    /// Continuous pixel coordinates of a world point; pixel centres sit at `n + 0.5`.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.resolution.x,
            (y - self.origin_y) / self.resolution.y,
        )
    }

    pub fn bbox(&self) -> BoundingBox {
        let far_x = self.origin_x + self.width as f64 * self.resolution.x;
        let far_y = self.origin_y + self.height as f64 * self.resolution.y;
        BoundingBox::new(
            self.origin_x.min(far_x),
            self.origin_y.min(far_y),
            self.origin_x.max(far_x),
            self.origin_y.max(far_y),
        )
    }

    /// Half-open `(col_start, row_start, col_end, row_end)` range of pixels
    /// touching `bbox`, or `None` if it misses the grid.
    pub fn window(&self, bbox: &BoundingBox) -> Option<(usize, usize, usize, usize)> {
        let (c0, r0) = self.world_to_pixel(bbox.min_x, bbox.min_y);
        let (c1, r1) = self.world_to_pixel(bbox.max_x, bbox.max_y);

        let clamp = |v: f64, max: usize| v.max(0.0).min(max as f64);
        let col_start = clamp(c0.min(c1).floor(), self.width) as usize;
        let col_end = clamp(c0.max(c1).ceil(), self.width) as usize;
        let row_start = clamp(r0.min(r1).floor(), self.height) as usize;
        let row_end = clamp(r0.max(r1).ceil(), self.height) as usize;

        if col_start >= col_end || row_start >= row_end {
            return None;
        }
        Some((col_start, row_start, col_end, row_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covering_snaps_to_resolution() {
        let bbox = BoundingBox::new(5.0, 2.0, 95.0, 58.0);
        let gb = GeoBox::covering(&bbox, CrsCode::Epsg6933, Resolution::new(-10.0, 10.0));
        assert_eq!(gb.width, 10);
        assert_eq!(gb.height, 6);
        assert_eq!(gb.origin_x, 0.0);
        assert_eq!(gb.origin_y, 60.0);
        assert_eq!(gb.bbox(), BoundingBox::new(0.0, 0.0, 100.0, 60.0));
    }

    #[test]
    fn test_pixel_center_and_inverse() {
        let gb = GeoBox::new(CrsCode::Epsg6933, 4, 4, 0.0, 40.0, Resolution::new(-10.0, 10.0));
        assert_eq!(gb.pixel_center(0, 0), (5.0, 35.0));
        assert_eq!(gb.pixel_center(3, 3), (35.0, 5.0));
        assert_eq!(gb.world_to_pixel(5.0, 35.0), (0.5, 0.5));
    }

    #[test]
    fn test_window_clamps() {
        let gb = GeoBox::new(CrsCode::Epsg6933, 4, 4, 0.0, 40.0, Resolution::new(-10.0, 10.0));
        assert_eq!(
            gb.window(&BoundingBox::new(12.0, 12.0, 28.0, 28.0)),
            Some((1, 1, 3, 3))
        );
        assert_eq!(
            gb.window(&BoundingBox::new(-50.0, -50.0, 500.0, 500.0)),
            Some((0, 0, 4, 4))
        );
        assert_eq!(gb.window(&BoundingBox::new(50.0, 50.0, 60.0, 60.0)), None);
    }
}
