//! Dataset metadata as held by the scene catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CrsCode, GeoBox, Geometry};

/// One indexed dataset: a single product's observation of one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub product: String,
    pub center_time: DateTime<Utc>,
    pub crs: CrsCode,
    /// Valid-data extent in `crs`.
    pub footprint: Geometry,
    /// Native pixel grid of the stored bands.
    pub geobox: GeoBox,
    pub bands: Vec<String>,
    /// Storage prefix the band arrays live under.
    pub location: String,
}

impl Dataset {
    pub fn has_band(&self, band: &str) -> bool {
        self.bands.iter().any(|b| b == band)
    }

    /// Requested bands this dataset does not carry.
    pub fn missing_bands<'a>(&self, requested: &'a [String]) -> Vec<&'a str> {
        requested
            .iter()
            .filter(|b| !self.has_band(b))
            .map(String::as_str)
            .collect()
    }
}
