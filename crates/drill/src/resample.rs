//! Resampling a band from a dataset's native grid onto the plugin's output grid.
//!
//! Both grids must share a CRS; reprojection is not done here.

use conflux_common::{BoundingBox, GeoBox, Resampling};

/// Resample `src` (laid out on `src_box`) onto `dst_box`. Output pixels that
/// fall outside the source grid are NaN.
pub fn resample(src: &[f32], src_box: &GeoBox, dst_box: &GeoBox, method: Resampling) -> Vec<f32> {
    if src_box == dst_box {
        return src.to_vec();
    }

    let mut out = vec![f32::NAN; dst_box.len()];
    for row in 0..dst_box.height {
        for col in 0..dst_box.width {
            let (x, y) = dst_box.pixel_center(col, row);
            let (px, py) = src_box.world_to_pixel(x, y);
            out[dst_box.index(col, row)] = match method {
                Resampling::Nearest => nearest(src, src_box, px, py),
                Resampling::Bilinear => bilinear(src, src_box, px, py),
                Resampling::Average => average(src, src_box, &pixel_bbox(dst_box, x, y))
                    .unwrap_or_else(|| nearest(src, src_box, px, py)),
            };
        }
    }
    out
}

fn in_grid(grid: &GeoBox, px: f64, py: f64) -> bool {
    px >= 0.0 && py >= 0.0 && px < grid.width as f64 && py < grid.height as f64
}

/// Value of the source pixel containing the point.
fn nearest(src: &[f32], grid: &GeoBox, px: f64, py: f64) -> f32 {
    if !in_grid(grid, px, py) {
        return f32::NAN;
    }
    src[grid.index(px.floor() as usize, py.floor() as usize)]
}

/// Bilinear interpolation between the four surrounding pixel centres.
///
/// Any NaN corner makes the result NaN.
fn bilinear(src: &[f32], grid: &GeoBox, px: f64, py: f64) -> f32 {
    if !in_grid(grid, px, py) {
        return f32::NAN;
    }

    // Shift so pixel centres sit on integers, clamped at the outer half-pixel.
    let x = (px - 0.5).max(0.0);
    let y = (py - 0.5).max(0.0);

    let x0 = (x.floor() as usize).min(grid.width - 1);
    let y0 = (y.floor() as usize).min(grid.height - 1);
    let x1 = (x0 + 1).min(grid.width - 1);
    let y1 = (y0 + 1).min(grid.height - 1);

    let xf = (x - x0 as f64).clamp(0.0, 1.0) as f32;
    let yf = (y - y0 as f64).clamp(0.0, 1.0) as f32;

    let v00 = src[grid.index(x0, y0)];
    let v10 = src[grid.index(x1, y0)];
    let v01 = src[grid.index(x0, y1)];
    let v11 = src[grid.index(x1, y1)];

    if v00.is_nan() || v10.is_nan() || v01.is_nan() || v11.is_nan() {
        return f32::NAN;
    }

    let top = v00 * (1.0 - xf) + v10 * xf;
    let bottom = v01 * (1.0 - xf) + v11 * xf;
    top * (1.0 - yf) + bottom * yf
}

/// Mean of the non-NaN source pixels whose centres fall in `bbox`.
///
/// `None` when no source centre falls inside, as when upsampling. All-NaN
/// input gives NaN.
fn average(src: &[f32], grid: &GeoBox, bbox: &BoundingBox) -> Option<f32> {
    let (c0, r0, c1, r1) = grid.window(bbox)?;
    let mut sum = 0.0f64;
    let mut count = 0usize;
    let mut seen = false;

    for row in r0..r1 {
        for col in c0..c1 {
            let (x, y) = grid.pixel_center(col, row);
            if x < bbox.min_x || x >= bbox.max_x || y < bbox.min_y || y >= bbox.max_y {
                continue;
            }
            seen = true;
            let v = src[grid.index(col, row)];
            if !v.is_nan() {
                sum += v as f64;
                count += 1;
            }
        }
    }

    match (seen, count) {
        (false, _) => None,
        (true, 0) => Some(f32::NAN),
        (true, n) => Some((sum / n as f64) as f32),
    }
}

fn pixel_bbox(grid: &GeoBox, x: f64, y: f64) -> BoundingBox {
    let hx = grid.resolution.x.abs() / 2.0;
    let hy = grid.resolution.y.abs() / 2.0;
    BoundingBox::new(x - hx, y - hy, x + hx, y + hy)
}
