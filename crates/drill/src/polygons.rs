//! Polygon source: a GeoJSON FeatureCollection loaded once at startup.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info};

use conflux_common::{BoundingBox, ConfluxError, ConfluxResult, CrsCode, Geometry};

/// ID columns tried in order of preference when none is given.
pub const ID_FIELD_CANDIDATES: &[&str] = &[
    "UID", "WB_ID", "FID_1", "FID", "ID", "OBJECTID", "ORIG_FID", "FeatureID",
];

/// A polygon to drill, with its id and cached extent.
#[derive(Debug, Clone, PartialEq)]
pub struct DrillPolygon {
    pub id: String,
    pub geometry: Geometry,
    pub bbox: BoundingBox,
}

impl DrillPolygon {
    pub fn new(id: impl Into<String>, geometry: Geometry) -> ConfluxResult<Self> {
        let id = id.into();
        let bbox = geometry
            .bbox()
            .ok_or_else(|| ConfluxError::PolygonSource(format!("polygon {} is empty", id)))?;
        Ok(Self { id, geometry, bbox })
    }
}

/// The immutable set of polygons drilled against every scene.
#[derive(Debug, Clone)]
pub struct PolygonSet {
    crs: CrsCode,
    id_field: String,
    polygons: Vec<DrillPolygon>,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    crs: Option<NamedCrs>,
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct NamedCrs {
    properties: NamedCrsProperties,
}

#[derive(Debug, Deserialize)]
struct NamedCrsProperties {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Option<serde_json::Map<String, Value>>,
    geometry: Option<Value>,
}

impl PolygonSet {
    pub fn new(crs: CrsCode, id_field: impl Into<String>, polygons: Vec<DrillPolygon>) -> ConfluxResult<Self> {
        let mut seen = HashSet::new();
        for p in &polygons {
            if !seen.insert(p.id.as_str()) {
                return Err(ConfluxError::PolygonSource(format!(
                    "duplicate polygon id '{}'",
                    p.id
                )));
            }
        }
        Ok(Self {
            crs,
            id_field: id_field.into(),
            polygons,
        })
    }

    /// Load a GeoJSON file. `use_id` names the id property; when `None` it is
    /// guessed from [`ID_FIELD_CANDIDATES`].
    pub fn load(path: &Path, use_id: Option<&str>) -> ConfluxResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfluxError::PolygonSource(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let set = Self::from_geojson_str(&content, use_id)?;
        info!(
            path = %path.display(),
            polygons = set.len(),
            id_field = %set.id_field,
            crs = %set.crs,
            "Loaded polygons"
        );
        Ok(set)
    }

    pub fn from_geojson_str(geojson: &str, use_id: Option<&str>) -> ConfluxResult<Self> {
        let collection: FeatureCollection = serde_json::from_str(geojson)
            .map_err(|e| ConfluxError::PolygonSource(format!("Invalid GeoJSON: {}", e)))?;

        let crs = match &collection.crs {
            Some(named) => parse_crs_name(&named.properties.name)?,
            None => CrsCode::Epsg4326,
        };

        let id_field = choose_id_field(&collection.features, use_id)?;
        debug!(id_field = %id_field, "Using polygon id field");

        let mut polygons = Vec::with_capacity(collection.features.len());
        for (index, feature) in collection.features.into_iter().enumerate() {
            let id = feature
                .properties
                .as_ref()
                .and_then(|p| p.get(&id_field))
                .and_then(id_value)
                .ok_or_else(|| {
                    ConfluxError::PolygonSource(format!(
                        "feature {} has no usable '{}' value",
                        index, id_field
                    ))
                })?;
            let geometry = feature.geometry.ok_or_else(|| {
                ConfluxError::PolygonSource(format!("polygon {} has no geometry", id))
            })?;
            let geometry: Geometry = serde_json::from_value(geometry).map_err(|e| {
                ConfluxError::PolygonSource(format!("polygon {} has bad geometry: {}", id, e))
            })?;
            polygons.push(DrillPolygon::new(id, geometry)?);
        }

        Self::new(crs, id_field, polygons)
    }

    pub fn crs(&self) -> CrsCode {
        self.crs
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DrillPolygon> {
        self.polygons.iter()
    }

    pub fn get(&self, id: &str) -> Option<&DrillPolygon> {
        self.polygons.iter().find(|p| p.id == id)
    }

    /// Polygons whose extent overlaps `bbox`.
    pub fn candidates(&self, bbox: &BoundingBox) -> impl Iterator<Item = &DrillPolygon> + '_ {
        let bbox = *bbox;
        self.polygons.iter().filter(move |p| p.bbox.intersects(&bbox))
    }

    /// Fail unless the polygons are in `crs`.
    pub fn ensure_crs(&self, crs: CrsCode) -> ConfluxResult<()> {
        if self.crs != crs {
            return Err(ConfluxError::PolygonSource(format!(
                "polygons are in {} but the plugin outputs {}; reproject the polygon file first",
                self.crs, crs
            )));
        }
        Ok(())
    }
}

/// Accepts `EPSG:6933`, `urn:ogc:def:crs:EPSG::6933` and OGC CRS84.
fn parse_crs_name(name: &str) -> ConfluxResult<CrsCode> {
    if name.ends_with("CRS84") {
        return Ok(CrsCode::Epsg4326);
    }
    let code = name
        .rsplit_once("EPSG::")
        .map(|(_, code)| format!("EPSG:{}", code))
        .unwrap_or_else(|| name.to_string());
    CrsCode::parse(&code).map_err(|e| ConfluxError::PolygonSource(e.to_string()))
}

fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_unique(features: &[Feature], field: &str) -> bool {
    let mut seen = HashSet::new();
    features.iter().all(|f| {
        match f.properties.as_ref().and_then(|p| p.get(field)).and_then(id_value) {
            Some(id) => seen.insert(id),
            None => false,
        }
    })
}

fn choose_id_field(features: &[Feature], use_id: Option<&str>) -> ConfluxResult<String> {
    let columns: BTreeSet<&str> = features
        .iter()
        .filter_map(|f| f.properties.as_ref())
        .flat_map(|p| p.keys().map(String::as_str))
        .collect();

    if let Some(field) = use_id {
        if !columns.contains(field) {
            return Err(ConfluxError::PolygonSource(format!(
                "Couldn't find ID column '{}' in columns {:?}",
                field, columns
            )));
        }
        if !is_unique(features, field) {
            return Err(ConfluxError::PolygonSource(format!(
                "Values in the column '{}' are not unique",
                field
            )));
        }
        return Ok(field.to_string());
    }

    let mut guesses: Vec<String> = ID_FIELD_CANDIDATES
        .iter()
        .filter(|c| columns.contains(*c))
        .map(|c| c.to_string())
        .collect();
    if guesses.is_empty() {
        guesses = ID_FIELD_CANDIDATES
            .iter()
            .map(|c| c.to_lowercase())
            .filter(|c| columns.contains(c.as_str()))
            .collect();
    }
    if guesses.is_empty() {
        return Err(ConfluxError::PolygonSource(format!(
            "Couldn't find any ID column {:?} in columns {:?}",
            ID_FIELD_CANDIDATES, columns
        )));
    }

    guesses
        .iter()
        .find(|g| is_unique(features, g))
        .cloned()
        .ok_or_else(|| {
            ConfluxError::PolygonSource(format!(
                "ID values in the column(s) {:?} are not unique",
                guesses
            ))
        })
}
