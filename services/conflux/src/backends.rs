//! Wiring from configuration and CLI strings to storage backends.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use drill::{Datacube, PgDatacube};
use storage::{
    Catalog, MemoryResultStore, ObjectStorage, PostgresResultStore, RedisSceneQueue, ResultStore,
    SceneQueue, TableStore,
};

use crate::config::ConfluxConfig;

/// Where drill output goes, parsed from `-o`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `postgres://` or `postgresql://` connection string.
    Postgres(String),
    /// `s3://bucket/prefix` or a local directory of JSON tables.
    Tables(String),
    /// `memory:`; results are dropped at exit.
    Memory,
}

impl Destination {
    pub fn parse(output: &str) -> Self {
        if output.starts_with("postgres://") || output.starts_with("postgresql://") {
            Destination::Postgres(output.to_string())
        } else if output == "memory:" {
            Destination::Memory
        } else {
            Destination::Tables(output.to_string())
        }
    }
}

pub async fn open_store(destination: &Destination, config: &ConfluxConfig) -> Result<Arc<dyn ResultStore>> {
    let store: Arc<dyn ResultStore> = match destination {
        Destination::Postgres(url) => Arc::new(
            PostgresResultStore::connect(url)
                .await
                .context("Failed to open result database")?,
        ),
        Destination::Tables(dest) => Arc::new(TableStore::new(
            ObjectStorage::from_destination(dest, &config.storage)
                .with_context(|| format!("Failed to open output {}", dest))?,
        )),
        Destination::Memory => Arc::new(MemoryResultStore::new()),
    };
    info!(destination = %store.describe(), "Opened result store");
    Ok(store)
}

/// Dataset index plus band storage.
pub async fn open_datacube(config: &ConfluxConfig) -> Result<Arc<dyn Datacube>> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required to resolve scenes")?;
    let catalog = Catalog::connect(database_url)
        .await
        .context("Failed to connect to the dataset index")?;
    let bands = match &config.band_storage {
        Some(dest) => ObjectStorage::from_destination(dest, &config.storage),
        None => ObjectStorage::new(&config.storage),
    }
    .context("Failed to open band storage")?;
    info!(bands = %bands.describe(), "Opened datacube");
    Ok(Arc::new(PgDatacube::new(catalog, bands)))
}

pub async fn open_queue(name: &str, config: &ConfluxConfig) -> Result<Arc<dyn SceneQueue>> {
    Ok(Arc::new(connect_queue(name, config).await?))
}

/// Concrete Redis queue, for the tooling commands that manage its lifecycle.
pub async fn connect_queue(name: &str, config: &ConfluxConfig) -> Result<RedisSceneQueue> {
    RedisSceneQueue::connect(&config.redis_url, name, config.queue.lease.clone())
        .await
        .with_context(|| format!("Failed to open queue {}", name))
}

/// Create a queue and its dead-letter stream.
pub async fn create_queue(name: &str, config: &ConfluxConfig) -> Result<RedisSceneQueue> {
    RedisSceneQueue::create(&config.redis_url, name, config.queue.lease.clone())
        .await
        .with_context(|| format!("Failed to create queue {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_parsing() {
        assert_eq!(
            Destination::parse("postgresql://u@db/out"),
            Destination::Postgres("postgresql://u@db/out".to_string())
        );
        assert_eq!(Destination::parse("memory:"), Destination::Memory);
        assert_eq!(
            Destination::parse("s3://bucket/drills"),
            Destination::Tables("s3://bucket/drills".to_string())
        );
        assert_eq!(
            Destination::parse("/tmp/out"),
            Destination::Tables("/tmp/out".to_string())
        );
    }

    #[tokio::test]
    async fn test_local_destination_opens_table_store() {
        let dir = tempfile::tempdir().unwrap();
        let dest = Destination::parse(&dir.path().join("tables").display().to_string());
        let store = open_store(&dest, &ConfluxConfig::default()).await.unwrap();
        assert!(store.describe().ends_with("tables"));
        assert!(!store.is_committed("s", "p", "1").await.unwrap());
    }
}
