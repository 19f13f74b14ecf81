//! Drill tables as JSON objects, one per scene, on S3 or local disk.
//!
//! The table key is derived from the scene's product, plugin version, id and
//! acquisition time, so a re-run of the same plugin version overwrites the
//! same object while a new version gets its own. A small marker object under
//! `committed/` is written after the table and is what `is_committed` checks.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use conflux_common::{ConfluxResult, OutputBatch, PolygonFailure, SummaryRecord};

use crate::object_store::{ObjectStorage, StoragePath};
use crate::results::ResultStore;

const COMMITTED_PREFIX: &str = "committed/";

/// On-disk layout of one scene's drill table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillTable {
    pub drill: String,
    pub version: String,
    pub date: chrono::DateTime<chrono::Utc>,
    pub scene_id: String,
    pub records: Vec<SummaryRecord>,
    #[serde(default)]
    pub failures: Vec<PolygonFailure>,
}

/// Result store writing JSON tables through [`ObjectStorage`].
pub struct TableStore {
    storage: ObjectStorage,
}

impl TableStore {
    pub fn new(storage: ObjectStorage) -> Self {
        Self { storage }
    }

    fn marker_path(scene_id: &str, product: &str, plugin_version: &str) -> String {
        format!("{}{}/{}/{}.json", COMMITTED_PREFIX, product, plugin_version, scene_id)
    }

    /// Read back the table for a batch's scene, if written.
    pub async fn read_table(&self, batch: &OutputBatch) -> ConfluxResult<Option<DrillTable>> {
        let path = StoragePath::drill_table(
            batch.date,
            &batch.product,
            &batch.plugin_version,
            &batch.scene_id,
        );
        match self.storage.get(&path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every table written for a product and plugin version, in key order.
    ///
    /// Tables are found by listing rather than through the commit markers,
    /// so a table whose marker write failed is still included.
    #[instrument(skip(self))]
    pub async fn read_tables(
        &self,
        product: &str,
        plugin_version: &str,
    ) -> ConfluxResult<Vec<DrillTable>> {
        let stem = format!("{}_{}_", product, plugin_version);
        let mut tables = Vec::new();
        for path in self.storage.list("").await? {
            if path.starts_with(COMMITTED_PREFIX) || !path.ends_with(".json") {
                continue;
            }
            let file_name = path.rsplit('/').next().unwrap_or(&path);
            if !file_name.starts_with(&stem) {
                continue;
            }
            let Some(bytes) = self.storage.get(&path).await? else {
                continue;
            };
            let table: DrillTable = serde_json::from_slice(&bytes)?;
            // The stem alone cannot tell `1.0` from `1.0_extra`.
            if table.drill == product && table.version == plugin_version {
                tables.push(table);
            }
        }
        debug!(tables = tables.len(), "Read drill tables");
        Ok(tables)
    }
}

#[async_trait]
impl ResultStore for TableStore {
    #[instrument(skip(self, batch), fields(scene_id = %batch.scene_id, records = batch.records.len()))]
    async fn write_batch(&self, batch: &OutputBatch) -> ConfluxResult<()> {
        let table = DrillTable {
            drill: batch.product.clone(),
            version: batch.plugin_version.clone(),
            date: batch.date,
            scene_id: batch.scene_id.clone(),
            records: batch.records.clone(),
            failures: batch.failures.clone(),
        };
        let path = StoragePath::drill_table(
            batch.date,
            &batch.product,
            &batch.plugin_version,
            &batch.scene_id,
        );
        let body = serde_json::to_vec_pretty(&table)?;
        self.storage.put(&path, Bytes::from(body)).await?;

        let marker = serde_json::json!({ "table": path, "records": batch.records.len() });
        self.storage
            .put(
                &Self::marker_path(&batch.scene_id, &batch.product, &batch.plugin_version),
                Bytes::from(marker.to_string()),
            )
            .await?;

        debug!(path = %path, "Wrote drill table");
        Ok(())
    }

    async fn load_records(
        &self,
        product: &str,
        plugin_version: &str,
    ) -> ConfluxResult<Vec<SummaryRecord>> {
        Ok(self
            .read_tables(product, plugin_version)
            .await?
            .into_iter()
            .flat_map(|table| table.records)
            .collect())
    }

    async fn is_committed(
        &self,
        scene_id: &str,
        product: &str,
        plugin_version: &str,
    ) -> ConfluxResult<bool> {
        self.storage
            .exists(&Self::marker_path(scene_id, product, plugin_version))
            .await
    }

    fn describe(&self) -> String {
        self.storage.describe()
    }
}
