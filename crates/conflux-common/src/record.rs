//! Drill output records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::BoundingBox;

/// Opaque scene identifier, usually a dataset UUID.
pub type SceneId = String;

/// Measurement name to value, as returned by a plugin's summarise step.
pub type Measurements = BTreeMap<String, f64>;

/// Which sides of the scene footprint a partially covered polygon spills over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeFlags {
    pub north: bool,
    pub south: bool,
    pub east: bool,
    pub west: bool,
}

impl EdgeFlags {
    /// Flags for a polygon with extent `polygon` against a footprint with extent
    /// `footprint`. Fully contained polygons get no flags.
    pub fn from_extents(polygon: &BoundingBox, footprint: &BoundingBox, fully_contained: bool) -> Self {
        if fully_contained {
            return Self::default();
        }
        Self {
            north: polygon.max_y > footprint.max_y,
            south: polygon.min_y < footprint.min_y,
            east: polygon.max_x > footprint.max_x,
            west: polygon.min_x < footprint.min_x,
        }
    }

    pub fn any(&self) -> bool {
        self.north || self.south || self.east || self.west
    }
}

/// One polygon's summary for one scene.
///
/// Keyed by `(polygon_id, scene_id, plugin_version)`; a later write for the
/// same key replaces the earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub polygon_id: String,
    pub scene_id: SceneId,
    pub date: DateTime<Utc>,
    pub plugin_version: String,
    #[serde(
        serialize_with = "serialize_measurements",
        deserialize_with = "deserialize_measurements"
    )]
    pub measurements: Measurements,
    #[serde(default)]
    pub overflow: EdgeFlags,
}

impl SummaryRecord {
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.polygon_id, &self.scene_id, &self.plugin_version)
    }

    /// Measurements as a JSON object, non-finite values as null.
    pub fn measurements_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.measurements
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::from(*v)))
                .collect(),
        )
    }
}

/// A polygon whose summarise step failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonFailure {
    pub polygon_id: String,
    pub message: String,
}

/// Everything one scene produced: committed as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBatch {
    pub scene_id: SceneId,
    pub product: String,
    pub plugin_version: String,
    pub date: DateTime<Utc>,
    pub records: Vec<SummaryRecord>,
    #[serde(default)]
    pub failures: Vec<PolygonFailure>,
}

impl OutputBatch {
    pub fn empty(
        scene_id: impl Into<SceneId>,
        product: impl Into<String>,
        plugin_version: impl Into<String>,
        date: DateTime<Utc>,
    ) -> Self {
        Self {
            scene_id: scene_id.into(),
            product: product.into(),
            plugin_version: plugin_version.into(),
            date,
            records: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// Non-finite values have no JSON representation; store them as null.
fn serialize_measurements<S>(m: &Measurements, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let nullable: BTreeMap<&str, Option<f64>> = m
        .iter()
        .map(|(k, v)| (k.as_str(), v.is_finite().then_some(*v)))
        .collect();
    nullable.serialize(serializer)
}

fn deserialize_measurements<'de, D>(deserializer: D) -> Result<Measurements, D::Error>
where
    D: Deserializer<'de>,
{
    let nullable: BTreeMap<String, Option<f64>> = BTreeMap::deserialize(deserializer)?;
    Ok(nullable
        .into_iter()
        .map(|(k, v)| (k, v.unwrap_or(f64::NAN)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_nan_measurements_serialize_as_null() {
        let mut measurements = Measurements::new();
        measurements.insert("pc_wet".to_string(), f64::NAN);
        measurements.insert("px_wet".to_string(), 3.0);
        let record = SummaryRecord {
            polygon_id: "p1".into(),
            scene_id: "s1".into(),
            date: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            plugin_version: "0.0.1".into(),
            measurements,
            overflow: EdgeFlags::default(),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert!(json["measurements"]["pc_wet"].is_null());
        assert_eq!(json["measurements"]["px_wet"], 3.0);

        let back: SummaryRecord = serde_json::from_value(json).unwrap();
        assert!(back.measurements["pc_wet"].is_nan());
        assert_eq!(back.measurements["px_wet"], 3.0);
    }

    #[test]
    fn test_edge_flags() {
        let footprint = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let poly = BoundingBox::new(8.0, 8.0, 12.0, 9.0);
        let flags = EdgeFlags::from_extents(&poly, &footprint, false);
        assert!(flags.east);
        assert!(!flags.north && !flags.south && !flags.west);
        assert!(!EdgeFlags::from_extents(&poly, &footprint, true).any());
    }
}
