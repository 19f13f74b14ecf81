//! The drill executor: one scene in, one [`OutputBatch`] out.
//!
//! Per scene the plugin's `transform` runs exactly once, over the whole
//! stack, before any clipping. Polygons are then filtered against the
//! transformed footprint, clipped, and summarised in parallel. A summarise
//! failure only drops that polygon's record.

use rayon::prelude::*;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use conflux_common::{
    ConfluxError, ConfluxResult, EdgeFlags, Geometry, OutputBatch, PolygonFailure, RasterStack,
    SummaryRecord,
};

use crate::plugin::DrillPlugin;
use crate::polygons::{DrillPolygon, PolygonSet};
use crate::resolver::SceneResolver;

/// Overlaps at or below this fraction of the polygon's area count as touching.
const MIN_OVERLAP_FRACTION: f64 = 1e-9;

/// A polygon that overlaps the scene footprint.
#[derive(Debug, Clone, Copy)]
pub struct PolygonHit<'a> {
    pub polygon: &'a DrillPolygon,
    /// Sides of the footprint the polygon spills over.
    pub overflow: EdgeFlags,
}

/// Polygons whose overlap with `footprint` has positive area.
///
/// A bounding-box pass against the footprint extent grown by its own size
/// comes first; the exact test measures each survivor's overlap with the
/// footprint itself, so concave and multi-part footprints are honoured.
pub fn intersecting_polygons<'a>(polygons: &'a PolygonSet, footprint: &Geometry) -> Vec<PolygonHit<'a>> {
    let Some(footprint_bbox) = footprint.bbox() else {
        return Vec::new();
    };
    let search = footprint_bbox.buffered_by_extent();

    polygons
        .candidates(&search)
        .filter_map(|polygon| {
            let area = polygon.geometry.area();
            let overlap = polygon.geometry.intersection_area(footprint);
            if area <= 0.0 || overlap <= area * MIN_OVERLAP_FRACTION {
                return None;
            }
            let fully_contained = overlap >= area * (1.0 - MIN_OVERLAP_FRACTION);
            Some(PolygonHit {
                polygon,
                overflow: EdgeFlags::from_extents(&polygon.bbox, &footprint_bbox, fully_contained),
            })
        })
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Transform, filter, clip and summarise one loaded scene.
pub fn drill_stack(
    plugin: &dyn DrillPlugin,
    polygons: &PolygonSet,
    scene_id: &str,
    stack: RasterStack,
) -> ConfluxResult<OutputBatch> {
    let spec = plugin.spec();

    let transformed = catch_unwind(AssertUnwindSafe(|| plugin.transform(stack)))
        .map_err(|p| ConfluxError::TransformFailed(panic_message(p)))?
        .map_err(|e| match e {
            ConfluxError::TransformFailed(_) => e,
            other => ConfluxError::TransformFailed(other.to_string()),
        })?;

    let hits = intersecting_polygons(polygons, &transformed.footprint);
    debug!(scene_id = %scene_id, candidates = hits.len(), "Polygons intersecting scene");

    let results: Vec<Result<SummaryRecord, PolygonFailure>> = hits
        .par_iter()
        .map(|hit| {
            let clip = transformed.clip(&hit.polygon.geometry);
            let summary = catch_unwind(AssertUnwindSafe(|| plugin.summarise(&clip, hit.polygon)))
                .map_err(panic_message)
                .and_then(|r| r.map_err(|e| e.to_string()));

            match summary {
                Ok(measurements) => Ok(SummaryRecord {
                    polygon_id: hit.polygon.id.clone(),
                    scene_id: scene_id.to_string(),
                    date: transformed.date,
                    plugin_version: spec.version.clone(),
                    measurements,
                    overflow: hit.overflow,
                }),
                Err(message) => Err(PolygonFailure {
                    polygon_id: hit.polygon.id.clone(),
                    message,
                }),
            }
        })
        .collect();

    let mut batch = OutputBatch::empty(scene_id, &spec.product, &spec.version, transformed.date);
    for result in results {
        match result {
            Ok(record) => batch.records.push(record),
            Err(failure) => batch.failures.push(failure),
        }
    }
    Ok(batch)
}

/// Drives one plugin over scenes, sharing the polygon set read-only.
pub struct DrillExecutor {
    plugin: Arc<dyn DrillPlugin>,
    polygons: Arc<PolygonSet>,
    resolver: SceneResolver,
}

impl DrillExecutor {
    /// Fails when the polygons are not in the plugin's output CRS.
    pub fn new(
        plugin: Arc<dyn DrillPlugin>,
        polygons: Arc<PolygonSet>,
        resolver: SceneResolver,
    ) -> ConfluxResult<Self> {
        polygons.ensure_crs(plugin.spec().output_crs)?;
        Ok(Self {
            plugin,
            polygons,
            resolver,
        })
    }

    pub fn plugin(&self) -> &Arc<dyn DrillPlugin> {
        &self.plugin
    }

    pub fn polygons(&self) -> &Arc<PolygonSet> {
        &self.polygons
    }

    /// Resolve, load and drill one scene.
    #[instrument(skip(self), fields(product = %self.plugin.spec().product))]
    pub async fn drill(&self, scene_id: &str) -> ConfluxResult<OutputBatch> {
        let started = Instant::now();
        let stack = self
            .resolver
            .load_scene(scene_id, self.plugin.spec())
            .await?;

        let plugin = self.plugin.clone();
        let polygons = self.polygons.clone();
        let id = scene_id.to_string();
        let batch = tokio::task::spawn_blocking(move || {
            drill_stack(plugin.as_ref(), &polygons, &id, stack)
        })
        .await
        .map_err(|e| ConfluxError::InternalError(format!("Drill task failed: {}", e)))??;

        let elapsed = started.elapsed();
        metrics::histogram!("conflux_drill_seconds").record(elapsed.as_secs_f64());
        info!(
            scene_id = %scene_id,
            records = batch.records.len(),
            failures = batch.failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Drilled scene"
        );
        Ok(batch)
    }
}
