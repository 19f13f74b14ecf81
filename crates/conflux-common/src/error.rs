//! Error types for conflux services.

use thiserror::Error;

/// Result type alias using ConfluxError.
pub type ConfluxResult<T> = Result<T, ConfluxError>;

/// How a failure should be handled by the queue pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Backend temporarily unreachable; retry through redelivery.
    Transient,
    /// The whole scene failed; nothing is written for it.
    SceneFatal,
    /// One polygon failed; the rest of the scene carries on.
    PolygonLocal,
    /// Configuration or inputs are unusable; abort before consuming messages.
    StartupFatal,
}

/// Primary error type for drill operations.
#[derive(Debug, Error)]
pub enum ConfluxError {
    // === Catalog Errors ===
    #[error("Scene not found: {0}")]
    SceneNotFound(String),

    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Missing bands for dataset {dataset}: {bands:?}")]
    MissingBands { dataset: String, bands: Vec<String> },

    #[error("Cannot reproject from {from} to {to}")]
    UnsupportedReprojection { from: String, to: String },

    #[error("Invalid raster data: {0}")]
    InvalidRaster(String),

    // === Plugin Errors ===
    #[error("Invalid plugin: {0}")]
    InvalidPlugin(String),

    #[error("Transform failed: {0}")]
    TransformFailed(String),

    #[error("Summarise failed for polygon {polygon_id}: {message}")]
    SummariseFailed { polygon_id: String, message: String },

    // === Storage Errors ===
    #[error("Output store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Lease expired for message {0}")]
    LeaseExpired(String),

    #[error("Queue {queue} still holds {depth} messages")]
    QueueNotEmpty { queue: String, depth: u64 },

    // === Startup Errors ===
    #[error("Polygon source error: {0}")]
    PolygonSource(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ConfluxError {
    /// Classify this error for retry/dead-letter handling.
    pub fn class(&self) -> FailureClass {
        match self {
            ConfluxError::CatalogUnavailable(_)
            | ConfluxError::StoreUnavailable(_)
            | ConfluxError::QueueUnavailable(_)
            | ConfluxError::LeaseExpired(_)
            | ConfluxError::InternalError(_) => FailureClass::Transient,

            ConfluxError::SceneNotFound(_)
            | ConfluxError::MissingBands { .. }
            | ConfluxError::UnsupportedReprojection { .. }
            | ConfluxError::InvalidRaster(_)
            | ConfluxError::TransformFailed(_) => FailureClass::SceneFatal,

            ConfluxError::SummariseFailed { .. } => FailureClass::PolygonLocal,

            ConfluxError::InvalidPlugin(_)
            | ConfluxError::PolygonSource(_)
            | ConfluxError::QueueNotEmpty { .. }
            | ConfluxError::Config(_) => FailureClass::StartupFatal,
        }
    }

    /// Whether redelivery might succeed without operator intervention.
    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

impl From<std::io::Error> for ConfluxError {
    fn from(err: std::io::Error) -> Self {
        ConfluxError::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for ConfluxError {
    fn from(err: serde_json::Error) -> Self {
        ConfluxError::InternalError(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ConfluxError::CatalogUnavailable("down".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            ConfluxError::SceneNotFound("abc".into()).class(),
            FailureClass::SceneFatal
        );
        assert_eq!(
            ConfluxError::SummariseFailed {
                polygon_id: "p1".into(),
                message: "boom".into()
            }
            .class(),
            FailureClass::PolygonLocal
        );
        assert_eq!(
            ConfluxError::InvalidPlugin("no version".into()).class(),
            FailureClass::StartupFatal
        );
        assert!(ConfluxError::StoreUnavailable("x".into()).is_transient());
        assert!(!ConfluxError::TransformFailed("x".into()).is_transient());
    }
}
