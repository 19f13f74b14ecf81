//! Built-in drill kinds selectable from a manifest.

use std::fmt;
use std::str::FromStr;

use conflux_common::{
    ClippedStack, ConfluxError, ConfluxResult, Measurements, RasterStack,
};

use crate::plugin::{DrillPlugin, PluginManifest, PluginSpec};
use crate::polygons::DrillPolygon;

/// WOfS water observation band.
pub const WATER_BAND: &str = "water";

/// Clear and dry.
const WOFS_DRY: u32 = 0;
/// Clear and wet.
const WOFS_WET: u32 = 128;
/// Clears the sea (bit 2) and terrain/low solar angle (bit 3) flags.
const WOFS_IGNORE_SEA_AND_TERRAIN: u32 = 0b1111_0011;

/// Default fraction of missing pixels above which waterbodies reports NaN.
pub const DEFAULT_MAX_MISSING: f64 = 0.1;

/// Registered transform/summarise pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Percentage of clear pixels observed wet.
    SumWet,
    /// Waterbody wet pixel count and fraction, suppressed when too much is missing.
    Waterbodies,
}

impl PluginKind {
    pub fn required_bands(&self) -> &'static [&'static str] {
        match self {
            PluginKind::SumWet | PluginKind::Waterbodies => &[WATER_BAND],
        }
    }
}

impl FromStr for PluginKind {
    type Err = ConfluxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sum_wet" => Ok(PluginKind::SumWet),
            "waterbodies" => Ok(PluginKind::Waterbodies),
            other => Err(ConfluxError::InvalidPlugin(format!(
                "unknown plugin kind '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::SumWet => f.write_str("sum_wet"),
            PluginKind::Waterbodies => f.write_str("waterbodies"),
        }
    }
}

/// A manifest-configured instance of a [`PluginKind`].
#[derive(Debug, Clone)]
pub struct BuiltinPlugin {
    kind: PluginKind,
    spec: PluginSpec,
    max_missing: f64,
}

impl BuiltinPlugin {
    pub fn new(kind: PluginKind, spec: PluginSpec, manifest: &PluginManifest) -> ConfluxResult<Self> {
        let max_missing = manifest.param_f64("max_missing", DEFAULT_MAX_MISSING)?;
        if !(0.0..=1.0).contains(&max_missing) {
            return Err(ConfluxError::InvalidPlugin(format!(
                "max_missing must be within [0, 1], got {}",
                max_missing
            )));
        }
        Ok(Self {
            kind,
            spec,
            max_missing,
        })
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }
}

impl DrillPlugin for BuiltinPlugin {
    fn spec(&self) -> &PluginSpec {
        &self.spec
    }

    fn transform(&self, mut stack: RasterStack) -> ConfluxResult<RasterStack> {
        let water = stack.remove_band(WATER_BAND).ok_or_else(|| {
            ConfluxError::TransformFailed(format!("stack has no '{}' band", WATER_BAND))
        })?;

        let mask: fn(u32) -> u32 = match self.kind {
            PluginKind::SumWet => |bits: u32| bits,
            PluginKind::Waterbodies => |bits: u32| bits & WOFS_IGNORE_SEA_AND_TERRAIN,
        };

        // 1.0 wet, 0.0 dry, NaN anything not clear.
        let wet: Vec<f32> = water
            .into_iter()
            .map(|v| {
                if !v.is_finite() || v < 0.0 {
                    return f32::NAN;
                }
                match mask(v as u32) {
                    WOFS_WET => 1.0,
                    WOFS_DRY => 0.0,
                    _ => f32::NAN,
                }
            })
            .collect();

        stack.insert_band(WATER_BAND, wet)?;
        Ok(stack)
    }

    fn summarise(&self, clip: &ClippedStack, _polygon: &DrillPolygon) -> ConfluxResult<Measurements> {
        let water = clip.band(WATER_BAND)?;
        let total = water.len();
        let valid = water.iter().filter(|v| !v.is_nan()).count();
        let wet: f64 = water.iter().filter(|v| !v.is_nan()).map(|&v| v as f64).sum();

        let ratio = |num: f64, den: usize| {
            if den == 0 {
                f64::NAN
            } else {
                num / den as f64
            }
        };

        let mut out = Measurements::new();
        match self.kind {
            PluginKind::SumWet => {
                out.insert("wet_pixel_count".to_string(), wet);
                out.insert("wet_percentage".to_string(), ratio(wet, valid) * 100.0);
                out.insert(
                    "invalid_percentage".to_string(),
                    ratio((total - valid) as f64, total) * 100.0,
                );
            }
            PluginKind::Waterbodies => {
                let pc_missing = ratio((total - valid) as f64, total);
                let (px_wet, pc_wet) = if pc_missing <= self.max_missing {
                    (wet, ratio(wet, total))
                } else {
                    (f64::NAN, f64::NAN)
                };
                out.insert("px_wet".to_string(), px_wet);
                out.insert("pc_wet".to_string(), pc_wet);
                out.insert("pc_missing".to_string(), pc_missing);
            }
        }
        Ok(out)
    }
}
