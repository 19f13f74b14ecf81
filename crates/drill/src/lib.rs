//! Polygon drill engine.
//!
//! Loads a plugin and a polygon set once, then turns scene identifiers into
//! per-polygon summary records:
//!
//! - [`plugin`]: the drill contract and its YAML manifest
//! - [`builtin`]: registered transform/summarise pairs
//! - [`polygons`]: GeoJSON polygon source with ID-field selection
//! - [`resolver`]: scene lookup and raster loading through a [`resolver::Datacube`]
//! - [`executor`]: transform once, filter polygons, clip and summarise
//! - [`writer`]: batch commit of the results
//! - [`orchestrator`]: the queue-driven worker pool
//! - [`queue_tools`]: queue maintenance (filtering out committed scenes)
//! - [`stack`]: per-polygon time series from committed output

pub mod builtin;
pub mod executor;
pub mod orchestrator;
pub mod plugin;
pub mod polygons;
pub mod resample;
pub mod queue_tools;
pub mod resolver;
pub mod stack;
pub mod writer;

pub use builtin::{BuiltinPlugin, PluginKind};
pub use executor::{drill_stack, intersecting_polygons, DrillExecutor, PolygonHit};
pub use orchestrator::{
    run_one, MessageOutcome, Orchestrator, OrchestratorConfig, RunStats,
};
pub use plugin::{load_plugin, DrillPlugin, FnPlugin, PluginManifest, PluginSpec};
pub use polygons::{DrillPolygon, PolygonSet};
pub use resample::resample;
pub use queue_tools::{filter_queue, FilterConfig, FilterStats};
pub use resolver::{Datacube, MemoryDatacube, PgDatacube, SceneResolver};
pub use stack::{build_series, stack, PolygonSeries, StackOptions, StackStats};
pub use writer::Writer;
