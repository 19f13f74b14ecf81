//! Coordinate Reference System types and utilities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Well-known CRS codes a drill can be run in.
///
/// Serialized as the `EPSG:nnnn` string so plugin manifests and stored
/// dataset metadata stay human-readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CrsCode {
    /// WGS84 Geographic (lat/lon in degrees)
    Epsg4326,
    /// Web Mercator (meters)
    Epsg3857,
    /// GDA94 / Australian Albers (meters)
    Epsg3577,
    /// WGS84 / NSIDC EASE-Grid 2.0 Global (meters)
    Epsg6933,
    /// NAD83 / Conus Albers (meters)
    Epsg5070,
}

impl CrsCode {
    /// Parse a CRS string.
    ///
    /// Accepts formats like:
    /// - "EPSG:4326"
    /// - "epsg:6933"
    /// - "CRS:84" (equivalent to EPSG:4326)
    pub fn parse(s: &str) -> Result<Self, CrsParseError> {
        let normalized = s.trim().to_uppercase();

        match normalized.as_str() {
            "EPSG:4326" | "CRS:84" => Ok(CrsCode::Epsg4326),
            "EPSG:3857" | "EPSG:900913" => Ok(CrsCode::Epsg3857),
            "EPSG:3577" => Ok(CrsCode::Epsg3577),
            "EPSG:6933" => Ok(CrsCode::Epsg6933),
            "EPSG:5070" => Ok(CrsCode::Epsg5070),
            _ => Err(CrsParseError::UnsupportedCrs(s.to_string())),
        }
    }

    /// Check if this is a geographic (lat/lon) CRS.
    pub fn is_geographic(&self) -> bool {
        matches!(self, CrsCode::Epsg4326)
    }
}

impl fmt::Display for CrsCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            CrsCode::Epsg4326 => "EPSG:4326",
            CrsCode::Epsg3857 => "EPSG:3857",
            CrsCode::Epsg3577 => "EPSG:3577",
            CrsCode::Epsg6933 => "EPSG:6933",
            CrsCode::Epsg5070 => "EPSG:5070",
        };
        write!(f, "{}", code)
    }
}

impl FromStr for CrsCode {
    type Err = CrsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CrsCode::parse(s)
    }
}

impl TryFrom<String> for CrsCode {
    type Error = CrsParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CrsCode::parse(&value)
    }
}

impl From<CrsCode> for String {
    fn from(code: CrsCode) -> Self {
        code.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CrsParseError {
    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(String),
}

/// Output pixel size as `(y, x)`, matching the `[-30, 30]` convention where a
/// negative y means rows run north to south.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Resolution {
    pub y: f64,
    pub x: f64,
}

impl Resolution {
    pub fn new(y: f64, x: f64) -> Self {
        Self { y, x }
    }

    /// Both components finite and non-zero.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.x != 0.0 && self.y != 0.0
    }

    /// Area covered by a single pixel.
    pub fn pixel_area(&self) -> f64 {
        (self.x * self.y).abs()
    }
}

impl From<[f64; 2]> for Resolution {
    fn from(v: [f64; 2]) -> Self {
        Resolution { y: v[0], x: v[1] }
    }
}

impl From<Resolution> for [f64; 2] {
    fn from(r: Resolution) -> Self {
        [r.y, r.x]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crs() {
        assert_eq!(CrsCode::parse("EPSG:4326").unwrap(), CrsCode::Epsg4326);
        assert_eq!(CrsCode::parse("epsg:6933").unwrap(), CrsCode::Epsg6933);
        assert_eq!(CrsCode::parse("CRS:84").unwrap(), CrsCode::Epsg4326);
        assert!(CrsCode::parse("EPSG:99999").is_err());
    }

    #[test]
    fn test_crs_serde_as_string() {
        let json = serde_json::to_string(&CrsCode::Epsg3577).unwrap();
        assert_eq!(json, "\"EPSG:3577\"");
        let parsed: CrsCode = serde_json::from_str("\"epsg:3577\"").unwrap();
        assert_eq!(parsed, CrsCode::Epsg3577);
        assert!(serde_json::from_str::<CrsCode>("\"EPSG:1\"").is_err());
    }

    #[test]
    fn test_resolution() {
        let res: Resolution = serde_json::from_str("[-30, 30]").unwrap();
        assert_eq!(res, Resolution::new(-30.0, 30.0));
        assert!(res.is_valid());
        assert_eq!(res.pixel_area(), 900.0);
        assert!(!Resolution::new(0.0, 30.0).is_valid());
        assert!(!Resolution::new(f64::NAN, 30.0).is_valid());
    }
}
