//! The drill plugin contract.
//!
//! A plugin names its output product and version, the grid its inputs are
//! loaded onto, the bands it needs from each input product, and two
//! functions: `transform`, run once over the whole scene, and `summarise`,
//! run once per intersecting polygon on the clipped pixels.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use conflux_common::{
    ClippedStack, ConfluxError, ConfluxResult, CrsCode, Measurements, RasterStack, Resampling,
    Resolution,
};

use crate::builtin::{BuiltinPlugin, PluginKind};
use crate::polygons::DrillPolygon;

/// Static description of a drill.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSpec {
    pub product: String,
    pub version: String,
    pub resampling: Resampling,
    pub output_crs: CrsCode,
    pub resolution: Resolution,
    /// Input product name to the bands required from it.
    pub inputs: BTreeMap<String, Vec<String>>,
}

impl PluginSpec {
    /// Check the description is complete and self-consistent.
    pub fn validate(&self) -> ConfluxResult<()> {
        if self.product.trim().is_empty() {
            return Err(ConfluxError::InvalidPlugin("product is empty".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(ConfluxError::InvalidPlugin("version is empty".to_string()));
        }
        if !self.resolution.is_valid() {
            return Err(ConfluxError::InvalidPlugin(format!(
                "resolution {:?} must be finite and non-zero",
                self.resolution
            )));
        }
        if self.inputs.is_empty() {
            return Err(ConfluxError::InvalidPlugin(
                "at least one input product is required".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for (product, bands) in &self.inputs {
            if bands.is_empty() {
                return Err(ConfluxError::InvalidPlugin(format!(
                    "input product '{}' requests no bands",
                    product
                )));
            }
            for band in bands {
                if !seen.insert(band.as_str()) {
                    return Err(ConfluxError::InvalidPlugin(format!(
                        "band '{}' is requested more than once",
                        band
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every requested band, across all input products.
    pub fn bands(&self) -> impl Iterator<Item = &str> {
        self.inputs.values().flatten().map(String::as_str)
    }

    pub fn requests_band(&self, band: &str) -> bool {
        self.bands().any(|b| b == band)
    }
}

/// A drill: description plus transform and summarise.
///
/// Implementations are shared read-only across workers and must not keep
/// mutable state between calls.
pub trait DrillPlugin: Send + Sync {
    fn spec(&self) -> &PluginSpec;

    /// Whole-scene preprocessing, applied once before any clipping.
    fn transform(&self, stack: RasterStack) -> ConfluxResult<RasterStack>;

    /// Per-polygon aggregation of the clipped, transformed pixels.
    fn summarise(&self, clip: &ClippedStack, polygon: &DrillPolygon) -> ConfluxResult<Measurements>;
}

/// A plugin assembled from a spec and two closures.
pub struct FnPlugin<T, S> {
    spec: PluginSpec,
    transform: T,
    summarise: S,
}

impl<T, S> FnPlugin<T, S>
where
    T: Fn(RasterStack) -> ConfluxResult<RasterStack> + Send + Sync,
    S: Fn(&ClippedStack, &DrillPolygon) -> ConfluxResult<Measurements> + Send + Sync,
{
    pub fn new(spec: PluginSpec, transform: T, summarise: S) -> ConfluxResult<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            transform,
            summarise,
        })
    }
}

impl<T, S> DrillPlugin for FnPlugin<T, S>
where
    T: Fn(RasterStack) -> ConfluxResult<RasterStack> + Send + Sync,
    S: Fn(&ClippedStack, &DrillPolygon) -> ConfluxResult<Measurements> + Send + Sync,
{
    fn spec(&self) -> &PluginSpec {
        &self.spec
    }

    fn transform(&self, stack: RasterStack) -> ConfluxResult<RasterStack> {
        (self.transform)(stack)
    }

    fn summarise(&self, clip: &ClippedStack, polygon: &DrillPolygon) -> ConfluxResult<Measurements> {
        (self.summarise)(clip, polygon)
    }
}

/// YAML plugin manifest.
///
/// ```yaml
/// product: waterbodies_c3
/// version: 0.0.1
/// resampling: nearest
/// output_crs: EPSG:3577
/// resolution: [-30, 30]
/// inputs:
///   ga_ls_wo_3: [water]
/// kind: waterbodies
/// params:
///   max_missing: 0.1
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginManifest {
    #[serde(alias = "product_name")]
    pub product: Option<String>,
    pub version: Option<String>,
    pub resampling: Option<String>,
    pub output_crs: Option<String>,
    pub resolution: Option<[f64; 2]>,
    #[serde(default, alias = "input_products")]
    pub inputs: BTreeMap<String, Vec<String>>,
    pub kind: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

impl PluginManifest {
    pub fn from_yaml(yaml: &str) -> ConfluxResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ConfluxError::InvalidPlugin(format!("Failed to parse manifest: {}", e)))
    }

    pub fn load(path: &Path) -> ConfluxResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfluxError::InvalidPlugin(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Build the validated spec this manifest describes.
    pub fn spec(&self) -> ConfluxResult<PluginSpec> {
        let required = |field: &Option<String>, name: &str| {
            field
                .clone()
                .ok_or_else(|| ConfluxError::InvalidPlugin(format!("missing field '{}'", name)))
        };

        let output_crs = required(&self.output_crs, "output_crs")?;
        let output_crs = CrsCode::parse(&output_crs)
            .map_err(|e| ConfluxError::InvalidPlugin(e.to_string()))?;

        let resampling = match &self.resampling {
            Some(name) => name.parse()?,
            None => Resampling::default(),
        };

        let [y, x] = self
            .resolution
            .ok_or_else(|| ConfluxError::InvalidPlugin("missing field 'resolution'".to_string()))?;

        let spec = PluginSpec {
            product: required(&self.product, "product")?,
            version: required(&self.version, "version")?,
            resampling,
            output_crs,
            resolution: Resolution::new(y, x),
            inputs: self.inputs.clone(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// A float parameter, or `default` when absent.
    pub fn param_f64(&self, name: &str, default: f64) -> ConfluxResult<f64> {
        match self.params.get(name) {
            None => Ok(default),
            Some(value) => value.as_f64().ok_or_else(|| {
                ConfluxError::InvalidPlugin(format!("parameter '{}' must be a number", name))
            }),
        }
    }

    /// Validate the manifest and instantiate its registered kind.
    pub fn into_plugin(self) -> ConfluxResult<Arc<dyn DrillPlugin>> {
        let spec = self.spec()?;
        let kind_name = self
            .kind
            .as_deref()
            .ok_or_else(|| ConfluxError::InvalidPlugin("missing field 'kind'".to_string()))?;
        let kind: PluginKind = kind_name.parse()?;

        for band in kind.required_bands() {
            if !spec.requests_band(band) {
                return Err(ConfluxError::InvalidPlugin(format!(
                    "kind '{}' needs band '{}' but no input requests it",
                    kind, band
                )));
            }
        }

        Ok(Arc::new(BuiltinPlugin::new(kind, spec, &self)?))
    }
}

/// Read a manifest file and build its plugin.
pub fn load_plugin(path: &Path) -> ConfluxResult<Arc<dyn DrillPlugin>> {
    PluginManifest::load(path)?.into_plugin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_common::FailureClass;

    const WATERBODIES: &str = r#"
product: waterbodies_c3
version: 0.0.1
resampling: nearest
output_crs: EPSG:3577
resolution: [-30, 30]
inputs:
  ga_ls_wo_3: [water]
kind: waterbodies
params:
  max_missing: 0.2
"#;

    #[test]
    fn test_manifest_builds_spec() {
        let manifest = PluginManifest::from_yaml(WATERBODIES).unwrap();
        let spec = manifest.spec().unwrap();
        assert_eq!(spec.product, "waterbodies_c3");
        assert_eq!(spec.output_crs, CrsCode::Epsg3577);
        assert_eq!(spec.resolution, Resolution::new(-30.0, 30.0));
        assert_eq!(spec.resampling, Resampling::Nearest);
        assert_eq!(spec.bands().collect::<Vec<_>>(), vec!["water"]);
        assert_eq!(manifest.param_f64("max_missing", 0.1).unwrap(), 0.2);

        let plugin = manifest.into_plugin().unwrap();
        assert_eq!(plugin.spec().version, "0.0.1");
    }

    #[test]
    fn test_original_field_names_accepted() {
        let yaml = r#"
product_name: sum_wet
version: 0.0.1
output_crs: EPSG:6933
resolution: [-30, 30]
input_products:
  ga_ls_wo_3: [water]
kind: sum_wet
"#;
        let plugin = PluginManifest::from_yaml(yaml).unwrap().into_plugin().unwrap();
        assert_eq!(plugin.spec().product, "sum_wet");
        assert_eq!(plugin.spec().resampling, Resampling::Nearest);
    }

    #[test]
    fn test_invalid_manifests_are_startup_fatal() {
        let cases = [
            WATERBODIES.replace("version: 0.0.1\n", ""),
            WATERBODIES.replace("EPSG:3577", "EPSG:9999"),
            WATERBODIES.replace("nearest", "cubic_spline"),
            WATERBODIES.replace("[-30, 30]", "[0, 30]"),
            WATERBODIES.replace("ga_ls_wo_3: [water]", "ga_ls_wo_3: []"),
            WATERBODIES.replace("[water]", "[pq]"),
            WATERBODIES.replace("kind: waterbodies", "kind: nonexistent"),
            WATERBODIES.replace("kind: waterbodies\n", ""),
        ];
        for yaml in cases {
            let err = PluginManifest::from_yaml(&yaml)
                .and_then(PluginManifest::into_plugin)
                .err()
                .unwrap_or_else(|| panic!("accepted:\n{}", yaml));
            assert_eq!(err.class(), FailureClass::StartupFatal, "{}", err);
        }
    }

    #[test]
    fn test_duplicate_band_across_products_rejected() {
        let yaml = WATERBODIES.replace(
            "  ga_ls_wo_3: [water]",
            "  ga_ls_wo_3: [water]\n  ga_ls_fc_3: [water]",
        );
        let err = PluginManifest::from_yaml(&yaml)
            .unwrap()
            .spec()
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
