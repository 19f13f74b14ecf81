//! Aggregator/writer: commits a scene's batch and reports what was left out.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use conflux_common::{ConfluxResult, OutputBatch};
use storage::ResultStore;

use crate::plugin::PluginSpec;

/// Writes output batches to a [`ResultStore`].
#[derive(Clone)]
pub struct Writer {
    store: Arc<dyn ResultStore>,
}

impl Writer {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    /// Log each polygon-local failure, then upsert the successful records
    /// as one batch. Nothing counts as committed unless the whole batch is.
    #[instrument(skip(self, batch), fields(scene_id = %batch.scene_id))]
    pub async fn write(&self, batch: &OutputBatch) -> ConfluxResult<()> {
        for failure in &batch.failures {
            warn!(
                scene_id = %batch.scene_id,
                polygon_id = %failure.polygon_id,
                error = %failure.message,
                "Summarise failed; polygon omitted from output"
            );
        }

        self.store.write_batch(batch).await?;

        metrics::counter!("conflux_records_written_total").increment(batch.records.len() as u64);
        metrics::counter!("conflux_polygon_failures_total").increment(batch.failures.len() as u64);
        info!(
            records = batch.records.len(),
            failures = batch.failures.len(),
            destination = %self.store.describe(),
            "Committed scene"
        );
        Ok(())
    }

    /// Whether this plugin's output for a scene is already committed.
    pub async fn is_committed(&self, scene_id: &str, spec: &PluginSpec) -> ConfluxResult<bool> {
        self.store
            .is_committed(scene_id, &spec.product, &spec.version)
            .await
    }
}
