//! Object storage interface for band arrays and drill tables (MinIO/S3 or local disk).

use bytes::Bytes;
use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, path::Path, ObjectStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use conflux_common::{ConfluxError, ConfluxResult};

/// Configuration for object storage connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    /// S3/MinIO endpoint URL
    pub endpoint: String,
    /// Default bucket name, used when a destination names none
    pub bucket: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// AWS region (use "us-east-1" for MinIO)
    pub region: String,
    /// Allow HTTP (for local MinIO)
    pub allow_http: bool,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://minio:9000".to_string(),
            bucket: "conflux".to_string(),
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin".to_string(),
            region: "us-east-1".to_string(),
            allow_http: true,
        }
    }
}

/// Object storage client rooted at a bucket (and optional key prefix) or a
/// local directory.
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    root: String,
    prefix: String,
}

impl ObjectStorage {
    /// Create an S3 client for the configured bucket.
    pub fn new(config: &ObjectStorageConfig) -> ConfluxResult<Self> {
        Self::s3(config, &config.bucket, "")
    }

    /// Open a destination: `s3://bucket/prefix` or a local directory path.
    pub fn from_destination(destination: &str, config: &ObjectStorageConfig) -> ConfluxResult<Self> {
        match destination.strip_prefix("s3://") {
            Some(rest) => {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(ConfluxError::Config(format!(
                        "No bucket in destination {}",
                        destination
                    )));
                }
                Self::s3(config, bucket, prefix)
            }
            None => Self::local(destination),
        }
    }

    /// Open a local directory, creating it if needed.
    pub fn local(dir: impl AsRef<std::path::Path>) -> ConfluxResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let store = LocalFileSystem::new_with_prefix(dir).map_err(|e| {
            ConfluxError::StoreUnavailable(format!("Failed to open {}: {}", dir.display(), e))
        })?;

        Ok(Self {
            store: Arc::new(store),
            root: dir.display().to_string(),
            prefix: String::new(),
        })
    }

    fn s3(config: &ObjectStorageConfig, bucket: &str, prefix: &str) -> ConfluxResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_endpoint(&config.endpoint)
            .with_bucket_name(bucket)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_region(&config.region);

        if config.allow_http {
            builder = builder.with_allow_http(true);
        }

        let store = builder.build().map_err(|e| {
            ConfluxError::StoreUnavailable(format!("Failed to create S3 client: {}", e))
        })?;

        Ok(Self {
            store: Arc::new(store),
            root: format!("s3://{}", bucket),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// Human-readable location of this store's root.
    pub fn describe(&self) -> String {
        if self.prefix.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{}", self.root, self.prefix)
        }
    }

    fn location(&self, path: &str) -> Path {
        let path = path.trim_start_matches('/');
        if self.prefix.is_empty() {
            Path::from(path)
        } else {
            Path::from(format!("{}/{}", self.prefix, path))
        }
    }

    /// Write bytes to a path.
    #[instrument(skip(self, data), fields(root = %self.root, path = %path))]
    pub async fn put(&self, path: &str, data: Bytes) -> ConfluxResult<()> {
        debug!(size = data.len(), "Writing object");

        self.store
            .put(&self.location(path), data.into())
            .await
            .map_err(|e| ConfluxError::StoreUnavailable(format!("Failed to write {}: {}", path, e)))?;

        Ok(())
    }

    /// Read bytes from a path. A missing object is reported as `None`.
    #[instrument(skip(self), fields(root = %self.root, path = %path))]
    pub async fn get(&self, path: &str) -> ConfluxResult<Option<Bytes>> {
        let result = match self.store.get(&self.location(path)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => {
                return Err(ConfluxError::StoreUnavailable(format!(
                    "Failed to read {}: {}",
                    path, e
                )))
            }
        };

        let bytes = result
            .bytes()
            .await
            .map_err(|e| ConfluxError::StoreUnavailable(format!("Failed to read bytes: {}", e)))?;

        debug!(size = bytes.len(), "Read object");
        Ok(Some(bytes))
    }

    /// Check if an object exists.
    pub async fn exists(&self, path: &str) -> ConfluxResult<bool> {
        match self.store.head(&self.location(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(ConfluxError::StoreUnavailable(format!(
                "Failed to check {}: {}",
                path, e
            ))),
        }
    }

    /// List objects under a prefix, relative to this store's root.
    pub async fn list(&self, prefix: &str) -> ConfluxResult<Vec<String>> {
        use futures::TryStreamExt;

        let prefix_path = self.location(prefix);
        let mut paths = Vec::new();

        let mut stream = self.store.list(Some(&prefix_path));
        while let Some(meta) = stream
            .try_next()
            .await
            .map_err(|e| ConfluxError::StoreUnavailable(format!("List failed: {}", e)))?
        {
            let full = meta.location.to_string();
            let relative = full
                .strip_prefix(&self.prefix)
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(&full);
            paths.push(relative.to_string());
        }

        paths.sort();
        Ok(paths)
    }

    /// Write a band as little-endian f32 values.
    pub async fn put_band(&self, location: &str, band: &str, values: &[f32]) -> ConfluxResult<()> {
        let mut buf = Vec::with_capacity(values.len() * 4);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        self.put(&StoragePath::band(location, band), Bytes::from(buf))
            .await
    }

    /// Read a band written by [`put_band`](Self::put_band).
    pub async fn get_band(&self, location: &str, band: &str) -> ConfluxResult<Option<Vec<f32>>> {
        let path = StoragePath::band(location, band);
        let Some(bytes) = self.get(&path).await? else {
            return Ok(None);
        };
        if bytes.len() % 4 != 0 {
            return Err(ConfluxError::InvalidRaster(format!(
                "{} is {} bytes, not a whole number of f32 values",
                path,
                bytes.len()
            )));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Some(values))
    }
}

/// Path builder for consistent storage layout.
pub struct StoragePath;

impl StoragePath {
    /// Build path for one band of a dataset.
    /// Format: {location}/{band}.f32
    pub fn band(location: &str, band: &str) -> String {
        format!("{}/{}.f32", location.trim_end_matches('/'), band)
    }

    /// Build path for a scene's drill table.
    /// Format: {YYYYMMDD}/{product}_{version}_{scene_id}_{YYYYMMDD-HHMMSS-ffffff}.json
    pub fn drill_table(
        date: chrono::DateTime<chrono::Utc>,
        product: &str,
        plugin_version: &str,
        scene_id: &str,
    ) -> String {
        format!(
            "{}/{}_{}_{}_{}.json",
            date.format("%Y%m%d"),
            product,
            plugin_version,
            scene_id,
            date.format("%Y%m%d-%H%M%S-%6f")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_storage_paths() {
        assert_eq!(
            StoragePath::band("ga_ls_wo_3/x41y33/2001", "water"),
            "ga_ls_wo_3/x41y33/2001/water.f32"
        );

        let date = chrono::Utc
            .with_ymd_and_hms(2001, 3, 14, 0, 12, 5)
            .unwrap()
            + chrono::Duration::microseconds(1234);
        assert_eq!(
            StoragePath::drill_table(date, "ga_ls_wo_3", "0.0.1", "abc"),
            "20010314/ga_ls_wo_3_0.0.1_abc_20010314-001205-001234.json"
        );
        assert_ne!(
            StoragePath::drill_table(date, "ga_ls_wo_3", "0.0.1", "abc"),
            StoragePath::drill_table(date, "ga_ls_wo_3", "0.0.2", "abc")
        );
    }

    #[tokio::test]
    async fn test_local_band_round_trip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ObjectStorage::from_destination(
            dir.path().join("bands").to_str().unwrap(),
            &ObjectStorageConfig::default(),
        )
        .unwrap();

        storage
            .put_band("scene-1", "water", &[0.0, 128.0, f32::NAN])
            .await
            .unwrap();
        let band = storage.get_band("scene-1", "water").await.unwrap().unwrap();
        assert_eq!(&band[..2], &[0.0, 128.0]);
        assert!(band[2].is_nan());

        assert!(storage.get_band("scene-1", "pq").await.unwrap().is_none());
        assert!(storage.exists("scene-1/water.f32").await.unwrap());
        assert_eq!(storage.list("scene-1").await.unwrap(), vec!["scene-1/water.f32"]);
    }

    #[test]
    fn test_s3_destination_requires_bucket() {
        let err = ObjectStorage::from_destination("s3:///prefix", &ObjectStorageConfig::default());
        assert!(matches!(err, Err(ConfluxError::Config(_))));
    }
}
