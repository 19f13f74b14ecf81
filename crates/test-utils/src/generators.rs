//! Test data generators for synthetic water-observation rasters.
//!
//! Values follow the WOfS feature layer convention: `0` is clear and dry,
//! `128` is clear and wet, anything else is an unusable observation.

/// Clear and dry.
pub const DRY: f32 = 0.0;
/// Clear and wet.
pub const WET: f32 = 128.0;
/// Cloud flag set.
pub const CLOUD: f32 = 64.0;

/// Creates a test grid with predictable values.
///
/// Each cell value is calculated as: `col * 1000 + row`
///
/// # Example
///
/// ```
/// use test_utils::create_test_grid;
///
/// let grid = create_test_grid(10, 5);
/// assert_eq!(grid.len(), 50);
/// assert_eq!(grid[1], 1000.0);
/// assert_eq!(grid[10], 1.0);
/// ```
pub fn create_test_grid(width: usize, height: usize) -> Vec<f32> {
    let mut data = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            data.push((col * 1000 + row) as f32);
        }
    }
    data
}

/// A grid filled with one value.
pub fn create_constant_grid(width: usize, height: usize, value: f32) -> Vec<f32> {
    vec![value; width * height]
}

/// Water grid whose left `wet_cols` columns are wet and the rest dry.
///
/// ```
/// use test_utils::{create_split_water_grid, WET, DRY};
///
/// let grid = create_split_water_grid(4, 2, 1);
/// assert_eq!(grid, vec![WET, DRY, DRY, DRY, WET, DRY, DRY, DRY]);
/// ```
pub fn create_split_water_grid(width: usize, height: usize, wet_cols: usize) -> Vec<f32> {
    let mut data = Vec::with_capacity(width * height);
    for _ in 0..height {
        for col in 0..width {
            data.push(if col < wet_cols { WET } else { DRY });
        }
    }
    data
}

/// Water grid cycling wet, dry, cloud along each row.
pub fn create_mixed_water_grid(width: usize, height: usize) -> Vec<f32> {
    let pattern = [WET, DRY, CLOUD];
    (0..width * height).map(|i| pattern[(i % width) % 3]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_grid() {
        let grid = create_test_grid(3, 2);
        assert_eq!(grid, vec![0.0, 1000.0, 2000.0, 1.0, 1001.0, 2001.0]);
    }

    #[test]
    fn test_mixed_water_grid() {
        let grid = create_mixed_water_grid(3, 2);
        assert_eq!(grid, vec![WET, DRY, CLOUD, WET, DRY, CLOUD]);
    }
}
