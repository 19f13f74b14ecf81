//! In-memory raster stacks and per-polygon clips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{ConfluxError, ConfluxResult, GeoBox, Geometry, Resolution};

/// Resampling method used when a dataset is loaded onto the output grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    #[default]
    Nearest,
    Bilinear,
    Average,
}

impl FromStr for Resampling {
    type Err = ConfluxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nearest" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            "average" => Ok(Resampling::Average),
            other => Err(ConfluxError::InvalidPlugin(format!(
                "unknown resampling method '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Resampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resampling::Nearest => "nearest",
            Resampling::Bilinear => "bilinear",
            Resampling::Average => "average",
        };
        f.write_str(name)
    }
}

/// Multi-band raster for exactly one scene.
///
/// Bands are row-major `f32` arrays sized to the geobox; missing data is NaN.
#[derive(Debug, Clone)]
pub struct RasterStack {
    pub geobox: GeoBox,
    pub date: DateTime<Utc>,
    /// Valid-data extent of the scene in the geobox CRS.
    pub footprint: Geometry,
    bands: BTreeMap<String, Vec<f32>>,
}

impl RasterStack {
    pub fn new(geobox: GeoBox, date: DateTime<Utc>, footprint: Geometry) -> Self {
        Self {
            geobox,
            date,
            footprint,
            bands: BTreeMap::new(),
        }
    }

    /// Builder form of [`RasterStack::insert_band`].
    pub fn with_band(mut self, name: impl Into<String>, data: Vec<f32>) -> ConfluxResult<Self> {
        self.insert_band(name, data)?;
        Ok(self)
    }

    /// Add or replace a band. The array must match the geobox size.
    pub fn insert_band(&mut self, name: impl Into<String>, data: Vec<f32>) -> ConfluxResult<()> {
        let name = name.into();
        if data.len() != self.geobox.len() {
            return Err(ConfluxError::InvalidRaster(format!(
                "band '{}' has {} pixels, grid has {}",
                name,
                data.len(),
                self.geobox.len()
            )));
        }
        self.bands.insert(name, data);
        Ok(())
    }

    pub fn band(&self, name: &str) -> Option<&[f32]> {
        self.bands.get(name).map(Vec::as_slice)
    }

    pub fn remove_band(&mut self, name: &str) -> Option<Vec<f32>> {
        self.bands.remove(name)
    }

    pub fn band_names(&self) -> impl Iterator<Item = &str> {
        self.bands.keys().map(String::as_str)
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Pixels whose centres fall inside `geometry`, gathered per band.
    pub fn clip(&self, geometry: &Geometry) -> ClippedStack {
        let mut indexes = Vec::new();
        if let Some((c0, r0, c1, r1)) = geometry.bbox().and_then(|b| self.geobox.window(&b)) {
            for row in r0..r1 {
                for col in c0..c1 {
                    let (x, y) = self.geobox.pixel_center(col, row);
                    if geometry.contains_point(x, y) {
                        indexes.push(self.geobox.index(col, row));
                    }
                }
            }
        }

        let bands = self
            .bands
            .iter()
            .map(|(name, data)| (name.clone(), indexes.iter().map(|&i| data[i]).collect()))
            .collect();

        ClippedStack {
            date: self.date,
            resolution: self.geobox.resolution,
            pixel_count: indexes.len(),
            bands,
        }
    }
}

/// The part of a transformed stack covered by one polygon, flattened.
#[derive(Debug, Clone)]
pub struct ClippedStack {
    pub date: DateTime<Utc>,
    pub resolution: Resolution,
    pub pixel_count: usize,
    pub bands: BTreeMap<String, Vec<f32>>,
}

impl ClippedStack {
    pub fn band(&self, name: &str) -> ConfluxResult<&[f32]> {
        self.bands
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ConfluxError::InvalidRaster(format!("clip has no band '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoundingBox, CrsCode, Polygon};
    use chrono::TimeZone;

    fn stack() -> RasterStack {
        let gb = GeoBox::new(CrsCode::Epsg6933, 4, 4, 0.0, 40.0, Resolution::new(-10.0, 10.0));
        let footprint = Polygon::rect(&gb.bbox()).into();
        let date = Utc.with_ymd_and_hms(2021, 3, 4, 0, 0, 0).unwrap();
        RasterStack::new(gb, date, footprint)
            .with_band("water", (0..16).map(|v| v as f32).collect())
            .unwrap()
    }

    #[test]
    fn test_band_size_checked() {
        let mut s = stack();
        assert!(s.insert_band("bad", vec![0.0; 3]).is_err());
        assert_eq!(s.band_count(), 1);
    }

    #[test]
    fn test_clip_selects_pixel_centres() {
        let s = stack();
        // Covers the centres of columns 1-2 in rows 1-2.
        let g: Geometry = Polygon::rect(&BoundingBox::new(11.0, 11.0, 29.0, 29.0)).into();
        let clip = s.clip(&g);
        assert_eq!(clip.pixel_count, 4);
        assert_eq!(clip.band("water").unwrap(), &[5.0, 6.0, 9.0, 10.0]);
        assert!(clip.band("missing").is_err());
    }

    #[test]
    fn test_clip_outside_grid_is_empty() {
        let s = stack();
        let g: Geometry = Polygon::rect(&BoundingBox::new(100.0, 100.0, 110.0, 110.0)).into();
        let clip = s.clip(&g);
        assert_eq!(clip.pixel_count, 0);
        assert!(clip.band("water").unwrap().is_empty());
    }

    #[test]
    fn test_resampling_parse() {
        assert_eq!("Bilinear".parse::<Resampling>().unwrap(), Resampling::Bilinear);
        assert!("cubic".parse::<Resampling>().is_err());
        assert_eq!(Resampling::default(), Resampling::Nearest);
    }
}
