//! Drill result stores.
//!
//! A store commits an [`OutputBatch`] as a unit: either every record of the
//! batch and its scene marker are visible afterwards, or the write fails and
//! nothing counts as committed. Records are upserted on
//! `(polygon_id, scene_id, plugin_version)`, so replaying a batch leaves the
//! store unchanged.

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use conflux_common::{
    ConfluxError, ConfluxResult, EdgeFlags, Measurements, OutputBatch, SummaryRecord,
};

/// Destination for drill output.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Durably upsert every record of a batch and mark the scene committed.
    async fn write_batch(&self, batch: &OutputBatch) -> ConfluxResult<()>;

    /// Whether a batch for this scene, product and plugin version was committed.
    async fn is_committed(
        &self,
        scene_id: &str,
        product: &str,
        plugin_version: &str,
    ) -> ConfluxResult<bool>;

    /// Every stored record for a product and plugin version.
    async fn load_records(
        &self,
        product: &str,
        plugin_version: &str,
    ) -> ConfluxResult<Vec<SummaryRecord>>;

    /// Where results go, for logging.
    fn describe(&self) -> String;
}

type RecordKey = (String, String, String);

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<RecordKey, SummaryRecord>,
    committed: BTreeSet<RecordKey>,
}

/// Result store held in memory.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    state: RwLock<MemoryState>,
    batch_writes: AtomicU64,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, ordered by key.
    pub async fn records(&self) -> Vec<SummaryRecord> {
        self.state.read().await.records.values().cloned().collect()
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }

    /// Committed `(scene_id, product, plugin_version)` triples.
    pub async fn committed_scenes(&self) -> Vec<(String, String, String)> {
        self.state.read().await.committed.iter().cloned().collect()
    }

    /// Successful `write_batch` calls so far.
    pub fn batch_writes(&self) -> u64 {
        self.batch_writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn write_batch(&self, batch: &OutputBatch) -> ConfluxResult<()> {
        let mut state = self.state.write().await;
        for record in &batch.records {
            let key = (
                record.polygon_id.clone(),
                record.scene_id.clone(),
                record.plugin_version.clone(),
            );
            state.records.insert(key, record.clone());
        }
        state.committed.insert((
            batch.scene_id.clone(),
            batch.product.clone(),
            batch.plugin_version.clone(),
        ));
        self.batch_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn is_committed(
        &self,
        scene_id: &str,
        product: &str,
        plugin_version: &str,
    ) -> ConfluxResult<bool> {
        let key = (
            scene_id.to_string(),
            product.to_string(),
            plugin_version.to_string(),
        );
        Ok(self.state.read().await.committed.contains(&key))
    }

    async fn load_records(
        &self,
        product: &str,
        plugin_version: &str,
    ) -> ConfluxResult<Vec<SummaryRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|record| {
                record.plugin_version == plugin_version
                    && state.committed.contains(&(
                        record.scene_id.clone(),
                        product.to_string(),
                        plugin_version.to_string(),
                    ))
            })
            .cloned()
            .collect())
    }

    fn describe(&self) -> String {
        "memory:".to_string()
    }
}

/// Result store backed by PostgreSQL.
pub struct PostgresResultStore {
    pool: PgPool,
}

impl PostgresResultStore {
    /// Connect and create the result tables if needed.
    pub async fn connect(database_url: &str) -> ConfluxResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| ConfluxError::StoreUnavailable(format!("Connection failed: {}", e)))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> ConfluxResult<()> {
        for statement in SCHEMA_SQL.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        ConfluxError::StoreUnavailable(format!("Migration failed: {}", e))
                    })?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    #[instrument(skip(self, batch), fields(scene_id = %batch.scene_id, records = batch.records.len()))]
    async fn write_batch(&self, batch: &OutputBatch) -> ConfluxResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ConfluxError::StoreUnavailable(format!("Begin failed: {}", e)))?;

        for record in &batch.records {
            sqlx::query(
                r#"
                INSERT INTO conflux_records (
                    polygon_id, scene_id, plugin_version, product, date, measurements, overflow
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (polygon_id, scene_id, plugin_version)
                DO UPDATE SET
                    product = EXCLUDED.product,
                    date = EXCLUDED.date,
                    measurements = EXCLUDED.measurements,
                    overflow = EXCLUDED.overflow,
                    written_at = NOW()
                "#,
            )
            .bind(&record.polygon_id)
            .bind(&record.scene_id)
            .bind(&record.plugin_version)
            .bind(&batch.product)
            .bind(record.date)
            .bind(Json(record.measurements_json()))
            .bind(Json(&record.overflow))
            .execute(&mut *tx)
            .await
            .map_err(|e| ConfluxError::StoreUnavailable(format!("Upsert failed: {}", e)))?;
        }

        sqlx::query(
            r#"
            INSERT INTO conflux_scenes (
                scene_id, product, plugin_version, date, record_count, failure_count
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (scene_id, product, plugin_version)
            DO UPDATE SET
                date = EXCLUDED.date,
                record_count = EXCLUDED.record_count,
                failure_count = EXCLUDED.failure_count,
                committed_at = NOW()
            "#,
        )
        .bind(&batch.scene_id)
        .bind(&batch.product)
        .bind(&batch.plugin_version)
        .bind(batch.date)
        .bind(batch.records.len() as i32)
        .bind(batch.failures.len() as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| ConfluxError::StoreUnavailable(format!("Scene insert failed: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| ConfluxError::StoreUnavailable(format!("Commit failed: {}", e)))?;

        debug!("Committed batch");
        Ok(())
    }

    async fn is_committed(
        &self,
        scene_id: &str,
        product: &str,
        plugin_version: &str,
    ) -> ConfluxResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM conflux_scenes \
             WHERE scene_id = $1 AND product = $2 AND plugin_version = $3)",
        )
        .bind(scene_id)
        .bind(product)
        .bind(plugin_version)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ConfluxError::StoreUnavailable(format!("Query failed: {}", e)))
    }

    #[instrument(skip(self))]
    async fn load_records(
        &self,
        product: &str,
        plugin_version: &str,
    ) -> ConfluxResult<Vec<SummaryRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT polygon_id, scene_id, plugin_version, date, measurements, overflow \
             FROM conflux_records WHERE product = $1 AND plugin_version = $2 \
             ORDER BY polygon_id, date",
        )
        .bind(product)
        .bind(plugin_version)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ConfluxError::StoreUnavailable(format!("Query failed: {}", e)))?;

        debug!(rows = rows.len(), "Loaded records");
        Ok(rows.into_iter().map(record_from_row).collect())
    }

    fn describe(&self) -> String {
        "postgres".to_string()
    }
}

/// A `conflux_records` row; null measurements come back as NaN.
type RecordRow = (
    String,
    String,
    String,
    chrono::DateTime<chrono::Utc>,
    Json<std::collections::BTreeMap<String, Option<f64>>>,
    Json<EdgeFlags>,
);

fn record_from_row(row: RecordRow) -> SummaryRecord {
    let (polygon_id, scene_id, plugin_version, date, Json(measurements), Json(overflow)) = row;
    let measurements: Measurements = measurements
        .into_iter()
        .map(|(name, value)| (name, value.unwrap_or(f64::NAN)))
        .collect();
    SummaryRecord {
        polygon_id,
        scene_id,
        date,
        plugin_version,
        measurements,
        overflow,
    }
}

/// Database schema SQL.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS conflux_records (
    polygon_id TEXT NOT NULL,
    scene_id TEXT NOT NULL,
    plugin_version VARCHAR(50) NOT NULL,
    product VARCHAR(100) NOT NULL,
    date TIMESTAMPTZ NOT NULL,
    measurements JSONB NOT NULL,
    overflow JSONB NOT NULL,
    written_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    PRIMARY KEY (polygon_id, scene_id, plugin_version)
);

CREATE INDEX IF NOT EXISTS idx_conflux_records_scene ON conflux_records(scene_id);

CREATE TABLE IF NOT EXISTS conflux_scenes (
    scene_id TEXT NOT NULL,
    product VARCHAR(100) NOT NULL,
    plugin_version VARCHAR(50) NOT NULL,
    date TIMESTAMPTZ NOT NULL,
    record_count INTEGER NOT NULL,
    failure_count INTEGER NOT NULL,
    committed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    PRIMARY KEY (scene_id, product, plugin_version)
)
"#;
