//! Queue maintenance: forward only the scenes that touch the polygon set.

use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use conflux_common::{ConfluxError, ConfluxResult};
use storage::{SceneMessage, SceneQueue};

use crate::executor::intersecting_polygons;
use crate::polygons::PolygonSet;
use crate::resolver::SceneResolver;

/// Settings for [`filter_queue`].
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Messages requested per receive.
    pub receive_batch: usize,
    /// Stop after this many consecutive empty receives.
    pub max_idle_polls: u32,
    /// Pause after an empty receive.
    pub idle_backoff: Duration,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            receive_batch: 10,
            max_idle_polls: 10,
            idle_backoff: Duration::from_secs(1),
        }
    }
}

/// Counts from one [`filter_queue`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Pushed to the output queue.
    pub forwarded: u64,
    /// Footprint misses every polygon.
    pub dropped: u64,
    /// Could not be checked (unknown scene, foreign CRS); removed from input.
    pub rejected: u64,
    /// Transient failure; returned to the input queue.
    pub retried: u64,
}

/// Drain `input`, pushing each scene whose footprint intersects at least one
/// polygon onto `output`. Every message that is settled here is acked on
/// `input` only after its forward succeeded.
#[instrument(skip_all, fields(input = %input.name(), output = %output.name()))]
pub async fn filter_queue(
    input: &dyn SceneQueue,
    output: &dyn SceneQueue,
    resolver: &SceneResolver,
    polygons: &PolygonSet,
    config: &FilterConfig,
) -> ConfluxResult<FilterStats> {
    let mut stats = FilterStats::default();
    let mut idle_polls = 0;

    while idle_polls < config.max_idle_polls {
        let messages = input.receive(config.receive_batch).await?;
        if messages.is_empty() {
            idle_polls += 1;
            debug!(idle_polls, "No messages to filter");
            tokio::time::sleep(config.idle_backoff).await;
            continue;
        }
        idle_polls = 0;

        for message in messages {
            filter_one(input, output, resolver, polygons, &message, &mut stats).await?;
        }
    }

    info!(
        forwarded = stats.forwarded,
        dropped = stats.dropped,
        rejected = stats.rejected,
        retried = stats.retried,
        "Filtered queue"
    );
    Ok(stats)
}

async fn filter_one(
    input: &dyn SceneQueue,
    output: &dyn SceneQueue,
    resolver: &SceneResolver,
    polygons: &PolygonSet,
    message: &SceneMessage,
    stats: &mut FilterStats,
) -> ConfluxResult<()> {
    let scene_id = &message.scene_id;
    let verdict = resolver.resolve(scene_id).await.and_then(|dataset| {
        if dataset.crs != polygons.crs() {
            return Err(ConfluxError::UnsupportedReprojection {
                from: dataset.crs.to_string(),
                to: polygons.crs().to_string(),
            });
        }
        Ok(!intersecting_polygons(polygons, &dataset.footprint).is_empty())
    });

    match verdict {
        Ok(true) => {
            output.push(scene_id).await?;
            stats.forwarded += 1;
        }
        Ok(false) => {
            debug!(scene_id = %scene_id, "Scene touches no polygon");
            stats.dropped += 1;
        }
        Err(e) if e.is_transient() => {
            warn!(scene_id = %scene_id, error = %e, "Filter check failed; returning to queue");
            input.fail(message, &e.to_string()).await?;
            stats.retried += 1;
            return Ok(());
        }
        Err(e) => {
            warn!(scene_id = %scene_id, error = %e, "Scene cannot be filtered; removing");
            stats.rejected += 1;
        }
    }

    if let Err(e) = input.ack(message).await {
        // The scene comes round again; a second forward is harmless because
        // committed scenes are skipped at drill time.
        warn!(scene_id = %scene_id, error = %e, "Ack after filtering failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use conflux_common::{BoundingBox, CrsCode, Dataset, GeoBox, Geometry, Polygon, Resolution};
    use std::sync::Arc;
    use storage::{MemoryQueue, QueueConfig};

    use crate::polygons::DrillPolygon;
    use crate::resolver::MemoryDatacube;

    fn dataset(id: &str, crs: CrsCode, min: f64, max: f64) -> Dataset {
        let bbox = BoundingBox::new(min, min, max, max);
        Dataset {
            id: id.to_string(),
            product: "ga_ls_wo_3".to_string(),
            center_time: Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap(),
            crs,
            footprint: Geometry::from(Polygon::rect(&bbox)),
            geobox: GeoBox::covering(&bbox, crs, Resolution::new(-10.0, 10.0)),
            bands: vec!["water".to_string()],
            location: format!("ga_ls_wo_3/{}", id),
        }
    }

    fn config() -> FilterConfig {
        FilterConfig {
            receive_batch: 2,
            max_idle_polls: 1,
            idle_backoff: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_forwards_only_scenes_touching_polygons() {
        let datacube = MemoryDatacube::new()
            .with_dataset(dataset("near", CrsCode::Epsg6933, 0.0, 100.0), [("water", vec![0.0; 100])])
            .with_dataset(
                dataset("far", CrsCode::Epsg6933, 10_000.0, 10_100.0),
                [("water", vec![0.0; 100])],
            )
            .with_dataset(dataset("geographic", CrsCode::Epsg4326, 0.0, 100.0), [("water", vec![0.0; 100])]);
        let resolver = SceneResolver::new(Arc::new(datacube));

        let polygon = DrillPolygon::new(
            "lake",
            Geometry::from(Polygon::rect(&BoundingBox::new(40.0, 40.0, 60.0, 60.0))),
        )
        .unwrap();
        let polygons = PolygonSet::new(CrsCode::Epsg6933, "UID", vec![polygon]).unwrap();

        let input = MemoryQueue::with_scenes(
            "all_scenes",
            QueueConfig::default(),
            ["near", "far", "missing", "geographic"],
        )
        .await;
        let output = MemoryQueue::new("filtered_scenes", QueueConfig::default());

        let stats = filter_queue(&input, &output, &resolver, &polygons, &config())
            .await
            .unwrap();

        assert_eq!(
            stats,
            FilterStats {
                forwarded: 1,
                dropped: 1,
                rejected: 2,
                retried: 0,
            }
        );
        assert!(input.is_drained().await);

        let forwarded: Vec<String> = output
            .receive(10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.scene_id)
            .collect();
        assert_eq!(forwarded, vec!["near".to_string()]);
    }
}
