//! Dataset index using PostgreSQL.

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, FromRow, PgPool};
use tracing::{debug, instrument};

use conflux_common::{ConfluxError, ConfluxResult, CrsCode, Dataset, GeoBox, Geometry};

/// Database connection pool and dataset index operations.
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    /// Create a new catalog connection from database URL.
    pub async fn connect(database_url: &str) -> ConfluxResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| ConfluxError::CatalogUnavailable(format!("Connection failed: {}", e)))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
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
                        ConfluxError::CatalogUnavailable(format!("Migration failed: {}", e))
                    })?;
            }
        }

        Ok(())
    }

    /// Index a dataset, replacing any previous entry with the same id.
    #[instrument(skip(self, dataset), fields(dataset_id = %dataset.id))]
    pub async fn register(&self, dataset: &Dataset) -> ConfluxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conflux_datasets (
                id, product, center_time, crs, footprint, geobox, bands, location
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id)
            DO UPDATE SET
                product = EXCLUDED.product,
                center_time = EXCLUDED.center_time,
                crs = EXCLUDED.crs,
                footprint = EXCLUDED.footprint,
                geobox = EXCLUDED.geobox,
                bands = EXCLUDED.bands,
                location = EXCLUDED.location,
                indexed_at = NOW()
            "#,
        )
        .bind(&dataset.id)
        .bind(&dataset.product)
        .bind(dataset.center_time)
        .bind(dataset.crs.to_string())
        .bind(Json(&dataset.footprint))
        .bind(Json(&dataset.geobox))
        .bind(&dataset.bands)
        .bind(&dataset.location)
        .execute(&self.pool)
        .await
        .map_err(|e| ConfluxError::CatalogUnavailable(format!("Insert failed: {}", e)))?;

        debug!("Registered dataset");
        Ok(())
    }

    /// Look up one dataset by id.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> ConfluxResult<Option<Dataset>> {
        let row = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, product, center_time, crs, footprint, geobox, bands, location \
             FROM conflux_datasets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ConfluxError::CatalogUnavailable(format!("Query failed: {}", e)))?;

        row.map(Dataset::try_from).transpose()
    }

    /// Datasets of a product acquired at exactly `center_time`.
    #[instrument(skip(self))]
    pub async fn find(
        &self,
        product: &str,
        center_time: DateTime<Utc>,
    ) -> ConfluxResult<Vec<Dataset>> {
        let rows = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, product, center_time, crs, footprint, geobox, bands, location \
             FROM conflux_datasets WHERE product = $1 AND center_time = $2 \
             ORDER BY id",
        )
        .bind(product)
        .bind(center_time)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ConfluxError::CatalogUnavailable(format!("Query failed: {}", e)))?;

        rows.into_iter().map(Dataset::try_from).collect()
    }

    /// Ids of every indexed dataset of a product, oldest first.
    pub async fn list_ids(&self, product: &str) -> ConfluxResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT id FROM conflux_datasets WHERE product = $1 ORDER BY center_time, id",
        )
        .bind(product)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ConfluxError::CatalogUnavailable(format!("Query failed: {}", e)))
    }
}

/// Database row type.
#[derive(Debug, FromRow)]
struct DatasetRow {
    id: String,
    product: String,
    center_time: DateTime<Utc>,
    crs: String,
    footprint: Json<Geometry>,
    geobox: Json<GeoBox>,
    bands: Vec<String>,
    location: String,
}

impl TryFrom<DatasetRow> for Dataset {
    type Error = ConfluxError;

    fn try_from(row: DatasetRow) -> ConfluxResult<Self> {
        let crs = CrsCode::parse(&row.crs).map_err(|e| {
            ConfluxError::InvalidRaster(format!("Dataset {} has bad CRS: {}", row.id, e))
        })?;

        Ok(Dataset {
            id: row.id,
            product: row.product,
            center_time: row.center_time,
            crs,
            footprint: row.footprint.0,
            geobox: row.geobox.0,
            bands: row.bands,
            location: row.location,
        })
    }
}

/// Database schema SQL.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS conflux_datasets (
    id TEXT PRIMARY KEY,
    product VARCHAR(100) NOT NULL,
    center_time TIMESTAMPTZ NOT NULL,
    crs VARCHAR(20) NOT NULL,
    footprint JSONB NOT NULL,
    geobox JSONB NOT NULL,
    bands TEXT[] NOT NULL,
    location TEXT NOT NULL,
    indexed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_conflux_datasets_product_time ON conflux_datasets(product, center_time)
"#;
