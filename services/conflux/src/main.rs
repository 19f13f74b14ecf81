//! Polygon drill runner.
//!
//! - `run-one`: drill a single scene synchronously
//! - `run-from-queue`: run a pool of drill workers against a scene queue
//! - `push-to-queue`: enqueue scene ids from a file
//! - `make-queue` / `delete-queue`: queue lifecycle
//! - `filter-from-queue`: forward only scenes that touch the polygons
//! - `stack`: per-polygon time-series CSVs from committed output

mod backends;
mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use drill::{
    filter_queue, load_plugin, run_one, stack, DrillExecutor, FilterConfig, Orchestrator,
    OrchestratorConfig, PolygonSet, SceneResolver, StackOptions, Writer,
};
use storage::ObjectStorage;

use backends::Destination;
use config::ConfluxConfig;

#[derive(Parser, Debug)]
#[command(name = "conflux")]
#[command(about = "Polygon drills over raster scenes")]
struct Cli {
    /// YAML configuration file
    #[arg(long, env = "CONFLUX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG when set)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drill one scene and exit
    RunOne {
        /// Scene id
        #[arg(long)]
        uuid: String,

        #[command(flatten)]
        drill: DrillArgs,
    },

    /// Drill scenes from a queue until it stays empty
    RunFromQueue {
        /// Queue name
        #[arg(long)]
        queue: String,

        /// Worker count (default: config, then CPU count)
        #[arg(long)]
        workers: Option<usize>,

        #[command(flatten)]
        drill: DrillArgs,
    },

    /// Push scene ids, one per line, onto a queue
    PushToQueue {
        /// Queue name
        #[arg(long)]
        queue: String,

        /// File of scene ids
        #[arg(long)]
        ids_file: PathBuf,
    },

    /// Create a queue and its dead-letter queue
    MakeQueue {
        /// Queue name
        #[arg(long)]
        queue: String,
    },

    /// Delete a queue and its dead-letter queue
    DeleteQueue {
        /// Queue name
        #[arg(long)]
        queue: String,

        /// Delete even if messages remain
        #[arg(long)]
        force: bool,
    },

    /// Move scenes whose footprint touches a polygon from one queue to another
    FilterFromQueue {
        /// Queue to read every scene id from
        #[arg(long)]
        input_queue: String,

        /// Queue to push matching scene ids to
        #[arg(long)]
        output_queue: String,

        /// Polygon source (GeoJSON)
        #[arg(short = 's', long = "shapefile")]
        polygons: PathBuf,

        /// Polygon property holding the id (guessed when omitted)
        #[arg(long)]
        use_id: Option<String>,
    },

    /// Regroup drill output into one time-series CSV per polygon
    Stack {
        /// Plugin manifest whose product and version to stack
        #[arg(long)]
        plugin: PathBuf,

        /// Drill output: postgres://..., s3://bucket/prefix or a directory
        #[arg(short = 'i', long)]
        input: String,

        /// Where the CSVs go: s3://bucket/prefix or a directory
        #[arg(short = 'o', long)]
        output: String,

        /// Keep every observation instead of one per day
        #[arg(long)]
        keep_duplicates: bool,

        /// Measurement ranking same-day observations (lowest kept)
        #[arg(long, default_value = "pc_missing")]
        missing_measurement: String,
    },
}

#[derive(Args, Debug)]
struct DrillArgs {
    /// Plugin manifest (YAML)
    #[arg(long)]
    plugin: PathBuf,

    /// Polygon source (GeoJSON)
    #[arg(short = 's', long = "shapefile")]
    polygons: PathBuf,

    /// Output destination: postgres://..., s3://bucket/prefix, a directory or memory:
    #[arg(short = 'o', long)]
    output: String,

    /// Polygon property holding the id (guessed when omitted)
    #[arg(long)]
    use_id: Option<String>,

    /// Drill scenes whose output is already committed
    #[arg(long)]
    overwrite: bool,

    /// Fail on ambiguous multi-product matches instead of picking the first
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = ConfluxConfig::load(cli.config.as_deref())?;
    init_tracing(cli.log_level.as_deref().unwrap_or(&config.log_level))?;

    if let Some(port) = config.metrics_port {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(port = port, "Prometheus metrics exporter listening");
    }

    match cli.command {
        Command::RunOne { uuid, drill } => {
            let (executor, writer) = build_drill(&drill, &config).await?;
            let overwrite = drill.overwrite || config.overwrite;
            match run_one(&executor, &writer, &uuid, overwrite).await? {
                Some(batch) => info!(
                    scene_id = %uuid,
                    records = batch.records.len(),
                    failures = batch.failures.len(),
                    "Scene drilled"
                ),
                None => info!(scene_id = %uuid, "Scene already drilled; use --overwrite to redo it"),
            }
        }
        Command::RunFromQueue {
            queue,
            workers,
            drill,
        } => {
            let (executor, writer) = build_drill(&drill, &config).await?;
            let queue = backends::open_queue(&queue, &config).await?;

            let mut orchestrator_config = OrchestratorConfig {
                receive_batch: config.queue.receive_batch,
                max_idle_polls: config.queue.max_idle_polls(),
                overwrite: drill.overwrite || config.overwrite,
                ..Default::default()
            };
            if let Some(n) = workers.or(config.workers) {
                orchestrator_config.workers = n;
            }

            // Shutdown signal
            let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received shutdown signal");
                shutdown_tx.send(()).ok();
            });

            let orchestrator = Arc::new(Orchestrator::new(queue, executor, writer, orchestrator_config));
            let stats = orchestrator.run(shutdown_rx).await?;
            if stats.dead_lettered > 0 {
                warn!(
                    dead_lettered = stats.dead_lettered,
                    "Some scenes were dead-lettered; see the error log for reasons"
                );
            }
        }
        Command::PushToQueue { queue, ids_file } => {
            let queue = backends::open_queue(&queue, &config).await?;
            let ids = read_scene_ids(&ids_file).await?;
            for id in &ids {
                queue.push(id).await?;
            }
            metrics::counter!("conflux_scenes_pushed_total").increment(ids.len() as u64);
            info!(queue = %queue.name(), count = ids.len(), "Pushed scene ids");
        }
        Command::MakeQueue { queue } => {
            backends::create_queue(&queue, &config).await?;
            info!(queue = %queue, "Queue ready");
        }
        Command::DeleteQueue { queue, force } => {
            backends::connect_queue(&queue, &config)
                .await?
                .delete(force)
                .await
                .with_context(|| format!("Failed to delete queue {}", queue))?;
            info!(queue = %queue, "Queue deleted");
        }
        Command::FilterFromQueue {
            input_queue,
            output_queue,
            polygons,
            use_id,
        } => {
            let polygons = PolygonSet::load(&polygons, use_id.as_deref())
                .with_context(|| format!("Failed to load polygons from {}", polygons.display()))?;
            let resolver = SceneResolver::new(backends::open_datacube(&config).await?);
            let input = backends::open_queue(&input_queue, &config).await?;
            let output = backends::open_queue(&output_queue, &config).await?;

            let stats = filter_queue(
                input.as_ref(),
                output.as_ref(),
                &resolver,
                &polygons,
                &FilterConfig::default(),
            )
            .await?;
            metrics::counter!("conflux_scenes_pushed_total").increment(stats.forwarded);
        }
        Command::Stack {
            plugin,
            input,
            output,
            keep_duplicates,
            missing_measurement,
        } => {
            let plugin = load_plugin(&plugin)
                .with_context(|| format!("Invalid plugin {}", plugin.display()))?;
            let spec = plugin.spec();
            let source = backends::open_store(&Destination::parse(&input), &config).await?;
            let output = ObjectStorage::from_destination(&output, &config.storage)
                .with_context(|| format!("Failed to open output {}", output))?;
            let options = StackOptions {
                remove_duplicates: !keep_duplicates,
                missing_measurement,
            };
            stack(source.as_ref(), &output, &spec.product, &spec.version, &options).await?;
        }
    }

    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let builder = FmtSubscriber::builder()
        .with_target(true)
        .with_thread_ids(true);

    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        let subscriber = builder.with_max_level(level).json().finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// Load the plugin and polygons, connect the catalog and open the output.
/// Any failure here stops the process before a scene is touched.
async fn build_drill(args: &DrillArgs, config: &ConfluxConfig) -> Result<(Arc<DrillExecutor>, Writer)> {
    let plugin = load_plugin(&args.plugin)
        .with_context(|| format!("Invalid plugin {}", args.plugin.display()))?;
    let spec = plugin.spec();
    info!(
        product = %spec.product,
        version = %spec.version,
        output_crs = %spec.output_crs,
        "Loaded plugin"
    );

    let polygons = PolygonSet::load(&args.polygons, args.use_id.as_deref())
        .with_context(|| format!("Failed to load polygons from {}", args.polygons.display()))?;
    info!(
        count = polygons.len(),
        id_field = %polygons.id_field(),
        crs = %polygons.crs(),
        "Loaded polygons"
    );

    let datacube = backends::open_datacube(config).await?;
    let resolver = SceneResolver::new(datacube).strict(args.strict || config.strict);
    let executor = DrillExecutor::new(plugin, Arc::new(polygons), resolver)?;

    let store = backends::open_store(&Destination::parse(&args.output), config).await?;
    Ok((Arc::new(executor), Writer::new(store)))
}

/// Non-empty, trimmed lines of `path`.
async fn read_scene_ids(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_read_scene_ids_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a1b2\n\n  c3d4  \n").unwrap();
        let ids = read_scene_ids(file.path()).await.unwrap();
        assert_eq!(ids, vec!["a1b2", "c3d4"]);
    }

    #[test]
    fn test_cli_parses_run_from_queue() {
        let cli = Cli::try_parse_from([
            "conflux",
            "run-from-queue",
            "--queue",
            "waterbodies",
            "--plugin",
            "wb.yaml",
            "-s",
            "polys.geojson",
            "-o",
            "s3://out/drills",
            "--use-id",
            "UID",
        ])
        .unwrap();
        match cli.command {
            Command::RunFromQueue { queue, drill, workers } => {
                assert_eq!(queue, "waterbodies");
                assert_eq!(drill.output, "s3://out/drills");
                assert_eq!(drill.use_id.as_deref(), Some("UID"));
                assert!(workers.is_none());
                assert!(!drill.overwrite);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_stack_defaults() {
        let cli = Cli::try_parse_from([
            "conflux",
            "stack",
            "--plugin",
            "wb.yaml",
            "-i",
            "postgres://u@db/out",
            "-o",
            "s3://out/timeseries",
        ])
        .unwrap();
        match cli.command {
            Command::Stack {
                input,
                output,
                keep_duplicates,
                missing_measurement,
                ..
            } => {
                assert_eq!(input, "postgres://u@db/out");
                assert_eq!(output, "s3://out/timeseries");
                assert!(!keep_duplicates);
                assert_eq!(missing_measurement, "pc_missing");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_queue_tooling() {
        let cli = Cli::try_parse_from(["conflux", "delete-queue", "--queue", "wb", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::DeleteQueue { ref queue, force: true } if queue == "wb"
        ));

        let cli = Cli::try_parse_from([
            "conflux",
            "filter-from-queue",
            "--input-queue",
            "all",
            "--output-queue",
            "wb",
            "-s",
            "polys.geojson",
        ])
        .unwrap();
        match cli.command {
            Command::FilterFromQueue {
                input_queue,
                output_queue,
                use_id,
                ..
            } => {
                assert_eq!(input_queue, "all");
                assert_eq!(output_queue, "wb");
                assert!(use_id.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
