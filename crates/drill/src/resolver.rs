//! Scene resolution: from a scene id to a raster stack on the plugin's grid.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use conflux_common::{
    ConfluxError, ConfluxResult, CrsCode, Dataset, GeoBox, RasterStack, Resampling, Resolution,
};
use storage::{Catalog, ObjectStorage};

use crate::plugin::PluginSpec;
use crate::resample::resample;

/// The spatial data catalog plus band reads.
#[async_trait]
pub trait Datacube: Send + Sync {
    /// Look up a dataset by id. `Ok(None)` when the catalog has no such id.
    async fn get_dataset(&self, id: &str) -> ConfluxResult<Option<Dataset>>;

    /// Datasets of `product` acquired at `center_time`.
    async fn find_datasets(
        &self,
        product: &str,
        center_time: DateTime<Utc>,
    ) -> ConfluxResult<Vec<Dataset>>;

    /// One band on the dataset's native grid.
    async fn read_band(&self, dataset: &Dataset, band: &str) -> ConfluxResult<Vec<f32>>;
}

/// Datacube held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryDatacube {
    datasets: BTreeMap<String, (Dataset, BTreeMap<String, Vec<f32>>)>,
}

impl MemoryDatacube {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dataset with its band arrays.
    pub fn with_dataset<I, S>(mut self, dataset: Dataset, bands: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<f32>)>,
        S: Into<String>,
    {
        let bands = bands.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.datasets.insert(dataset.id.clone(), (dataset, bands));
        self
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

#[async_trait]
impl Datacube for MemoryDatacube {
    async fn get_dataset(&self, id: &str) -> ConfluxResult<Option<Dataset>> {
        Ok(self.datasets.get(id).map(|(d, _)| d.clone()))
    }

    async fn find_datasets(
        &self,
        product: &str,
        center_time: DateTime<Utc>,
    ) -> ConfluxResult<Vec<Dataset>> {
        Ok(self
            .datasets
            .values()
            .filter(|(d, _)| d.product == product && d.center_time == center_time)
            .map(|(d, _)| d.clone())
            .collect())
    }

    async fn read_band(&self, dataset: &Dataset, band: &str) -> ConfluxResult<Vec<f32>> {
        self.datasets
            .get(&dataset.id)
            .and_then(|(_, bands)| bands.get(band))
            .cloned()
            .ok_or_else(|| ConfluxError::MissingBands {
                dataset: dataset.id.clone(),
                bands: vec![band.to_string()],
            })
    }
}

/// Datacube backed by the PostgreSQL dataset index and band arrays in object
/// storage.
pub struct PgDatacube {
    catalog: Catalog,
    storage: ObjectStorage,
}

impl PgDatacube {
    pub fn new(catalog: Catalog, storage: ObjectStorage) -> Self {
        Self { catalog, storage }
    }
}

#[async_trait]
impl Datacube for PgDatacube {
    async fn get_dataset(&self, id: &str) -> ConfluxResult<Option<Dataset>> {
        self.catalog.get(id).await
    }

    async fn find_datasets(
        &self,
        product: &str,
        center_time: DateTime<Utc>,
    ) -> ConfluxResult<Vec<Dataset>> {
        self.catalog.find(product, center_time).await
    }

    async fn read_band(&self, dataset: &Dataset, band: &str) -> ConfluxResult<Vec<f32>> {
        // Band reads fail transiently when storage is down, as catalog lookups do.
        let values = self
            .storage
            .get_band(&dataset.location, band)
            .await
            .map_err(|e| match e {
                ConfluxError::StoreUnavailable(msg) => ConfluxError::CatalogUnavailable(msg),
                other => other,
            })?;
        values.ok_or_else(|| ConfluxError::MissingBands {
            dataset: dataset.id.clone(),
            bands: vec![band.to_string()],
        })
    }
}

/// Resolves scene ids against a [`Datacube`] and loads them onto a plugin's grid.
#[derive(Clone)]
pub struct SceneResolver {
    datacube: Arc<dyn Datacube>,
    strict: bool,
}

impl SceneResolver {
    pub fn new(datacube: Arc<dyn Datacube>) -> Self {
        Self {
            datacube,
            strict: false,
        }
    }

    /// Fail instead of warning when several datasets of an input product match a scene.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Dataset metadata for a scene id.
    #[instrument(skip(self))]
    pub async fn resolve(&self, scene_id: &str) -> ConfluxResult<Dataset> {
        self.datacube
            .get_dataset(scene_id)
            .await?
            .ok_or_else(|| ConfluxError::SceneNotFound(scene_id.to_string()))
    }

    /// The dataset to read for each input product of `spec`, paired with the
    /// bands wanted from it.
    ///
    /// The scene's own dataset serves its product; every other product is
    /// matched on acquisition time and footprint overlap.
    pub async fn find_inputs(
        &self,
        reference: &Dataset,
        spec: &PluginSpec,
    ) -> ConfluxResult<Vec<(Dataset, Vec<String>)>> {
        let reference_bbox = reference.footprint.bbox().ok_or_else(|| {
            ConfluxError::InvalidRaster(format!("dataset {} has an empty footprint", reference.id))
        })?;

        let mut inputs = Vec::with_capacity(spec.inputs.len());
        for (product, bands) in &spec.inputs {
            if *product == reference.product {
                inputs.push((reference.clone(), bands.clone()));
                continue;
            }

            let matches: Vec<Dataset> = self
                .datacube
                .find_datasets(product, reference.center_time)
                .await?
                .into_iter()
                .filter(|d| {
                    d.footprint
                        .bbox()
                        .is_some_and(|b| b.intersects(&reference_bbox))
                        && d.footprint.intersection_area(&reference.footprint) > 0.0
                })
                .collect();

            if matches.len() > 1 {
                let ids: Vec<&str> = matches.iter().map(|d| d.id.as_str()).collect();
                if self.strict {
                    return Err(ConfluxError::InvalidRaster(format!(
                        "{} datasets of {} match scene {}: {:?}",
                        matches.len(),
                        product,
                        reference.id,
                        ids
                    )));
                }
                warn!(
                    scene_id = %reference.id,
                    product = %product,
                    candidates = ?ids,
                    "Several datasets match; using the first"
                );
            }

            let dataset = matches.into_iter().next().ok_or_else(|| {
                ConfluxError::SceneNotFound(format!(
                    "no {} dataset matches scene {}",
                    product, reference.id
                ))
            })?;
            inputs.push((dataset, bands.clone()));
        }
        Ok(inputs)
    }

    /// Load `bands` of a dataset onto a grid covering its footprint at the
    /// given CRS and resolution.
    pub async fn load(
        &self,
        dataset: &Dataset,
        bands: &[String],
        crs: CrsCode,
        resolution: Resolution,
        resampling: Resampling,
    ) -> ConfluxResult<RasterStack> {
        let bbox = dataset.footprint.bbox().ok_or_else(|| {
            ConfluxError::InvalidRaster(format!("dataset {} has an empty footprint", dataset.id))
        })?;
        let geobox = GeoBox::covering(&bbox, crs, resolution);
        let mut stack = RasterStack::new(geobox, dataset.center_time, dataset.footprint.clone());
        self.load_onto(&mut stack, dataset, bands, resampling).await?;
        Ok(stack)
    }

    /// Load `bands` of a dataset onto an existing stack's grid.
    #[instrument(skip(self, stack, dataset, bands), fields(dataset_id = %dataset.id))]
    pub async fn load_onto(
        &self,
        stack: &mut RasterStack,
        dataset: &Dataset,
        bands: &[String],
        resampling: Resampling,
    ) -> ConfluxResult<()> {
        let target = &stack.geobox;
        if dataset.crs != target.crs || dataset.geobox.crs != target.crs {
            return Err(ConfluxError::UnsupportedReprojection {
                from: dataset.crs.to_string(),
                to: target.crs.to_string(),
            });
        }

        let missing = dataset.missing_bands(bands);
        if !missing.is_empty() {
            return Err(ConfluxError::MissingBands {
                dataset: dataset.id.clone(),
                bands: missing.into_iter().map(str::to_string).collect(),
            });
        }

        for band in bands {
            let native = self.datacube.read_band(dataset, band).await?;
            if native.len() != dataset.geobox.len() {
                return Err(ConfluxError::InvalidRaster(format!(
                    "band '{}' of {} has {} pixels, native grid has {}",
                    band,
                    dataset.id,
                    native.len(),
                    dataset.geobox.len()
                )));
            }
            let values = resample(&native, &dataset.geobox, &stack.geobox, resampling);
            stack.insert_band(band.clone(), values)?;
        }

        debug!(bands = bands.len(), "Loaded dataset bands");
        Ok(())
    }

    /// Resolve a scene and load every band the plugin asks for onto one stack.
    pub async fn load_scene(&self, scene_id: &str, spec: &PluginSpec) -> ConfluxResult<RasterStack> {
        let reference = self.resolve(scene_id).await?;
        let inputs = self.find_inputs(&reference, spec).await?;

        // The grid and footprint come from the reference scene even when it
        // supplies no bands itself.
        let mut stack = self
            .load(
                &reference,
                &[],
                spec.output_crs,
                spec.resolution,
                spec.resampling,
            )
            .await?;

        for (dataset, bands) in &inputs {
            self.load_onto(&mut stack, dataset, bands, spec.resampling)
                .await?;
        }
        Ok(stack)
    }
}
