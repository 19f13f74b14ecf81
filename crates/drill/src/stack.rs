//! Stacking: regroup per-scene drill output into one time series per polygon.
//!
//! Each polygon's series is written as `<id[..4]>/<id>.csv` with a `date`
//! column followed by the measurement columns in name order. Dates use
//! `%Y-%m-%dT%H:%M:%SZ`; NaN measurements are written as empty fields.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

use conflux_common::{ConfluxError, ConfluxResult, Measurements, SummaryRecord};
use storage::{ObjectStorage, ResultStore};

/// Format of the `date` column.
pub const STACK_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Observations closer together than this are treated as one pass.
const NEAR_DUPLICATE_WINDOW_SECS: i64 = 60;

/// How a stack run treats repeat observations.
#[derive(Debug, Clone)]
pub struct StackOptions {
    /// Keep one observation per UTC day and drop near-simultaneous pairs.
    pub remove_duplicates: bool,
    /// Measurement ranking same-day observations; lowest wins. Rows without
    /// it (or with NaN) lose to any row that has it.
    pub missing_measurement: String,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            remove_duplicates: true,
            missing_measurement: "pc_missing".to_string(),
        }
    }
}

/// One observation in a polygon's series.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub date: DateTime<Utc>,
    pub measurements: Measurements,
}

/// A polygon's observations, sorted by date.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonSeries {
    pub polygon_id: String,
    pub observations: Vec<Observation>,
}

impl PolygonSeries {
    /// Object path for this series' CSV.
    pub fn csv_path(&self) -> String {
        let shard: String = self.polygon_id.chars().take(4).collect();
        format!("{}/{}.csv", shard, self.polygon_id)
    }

    /// Every measurement name appearing in the series, in name order.
    pub fn columns(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .observations
            .iter()
            .flat_map(|o| o.measurements.keys())
            .collect();
        names.into_iter().cloned().collect()
    }

    /// Render the series as CSV.
    pub fn to_csv(&self) -> ConfluxResult<Vec<u8>> {
        let columns = self.columns();
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = Vec::with_capacity(columns.len() + 1);
        header.push("date".to_string());
        header.extend(columns.iter().cloned());
        writer.write_record(&header).map_err(csv_error)?;

        for observation in &self.observations {
            let mut row = Vec::with_capacity(columns.len() + 1);
            row.push(observation.date.format(STACK_DATE_FORMAT).to_string());
            for column in &columns {
                row.push(match observation.measurements.get(column) {
                    Some(v) if v.is_finite() => v.to_string(),
                    _ => String::new(),
                });
            }
            writer.write_record(&row).map_err(csv_error)?;
        }

        writer
            .into_inner()
            .map_err(|e| ConfluxError::InternalError(format!("CSV flush failed: {}", e)))
    }
}

fn csv_error(err: csv::Error) -> ConfluxError {
    ConfluxError::InternalError(format!("CSV error: {}", err))
}

/// Group records into per-polygon series, ordered by polygon id.
pub fn build_series(records: Vec<SummaryRecord>, options: &StackOptions) -> Vec<PolygonSeries> {
    let mut grouped: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.polygon_id).or_default().push(Observation {
            date: record.date,
            measurements: record.measurements,
        });
    }

    grouped
        .into_iter()
        .map(|(polygon_id, observations)| {
            let mut observations = if options.remove_duplicates {
                remove_duplicates(observations, &options.missing_measurement)
            } else {
                observations
            };
            observations.sort_by_key(|o| o.date);
            PolygonSeries {
                polygon_id,
                observations,
            }
        })
        .collect()
}

/// Keep the least-missing observation per UTC day, then drop any
/// observation followed within a minute by the next one. The second pass
/// catches passes that straddle midnight.
pub fn remove_duplicates(observations: Vec<Observation>, missing_measurement: &str) -> Vec<Observation> {
    let missing = |o: &Observation| {
        o.measurements
            .get(missing_measurement)
            .copied()
            .filter(|v| !v.is_nan())
            .unwrap_or(f64::INFINITY)
    };

    let mut per_day: BTreeMap<chrono::NaiveDate, Observation> = BTreeMap::new();
    for observation in observations {
        let day = observation.date.date_naive();
        let better = per_day
            .get(&day)
            .map_or(true, |kept| missing(&observation) < missing(kept));
        if better {
            per_day.insert(day, observation);
        }
    }

    let window = Duration::seconds(NEAR_DUPLICATE_WINDOW_SECS);
    let days: Vec<Observation> = per_day.into_values().collect();
    let mut kept = Vec::with_capacity(days.len());
    for (i, observation) in days.iter().enumerate() {
        let shadowed = days
            .get(i + 1)
            .is_some_and(|next| next.date - observation.date < window);
        if !shadowed {
            kept.push(observation.clone());
        }
    }
    kept
}

/// What a stack run produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StackStats {
    pub records: usize,
    pub series: usize,
}

/// Read every record of a product/version from `source` and write one CSV
/// per polygon to `output`.
#[instrument(skip(source, output, options), fields(source = %source.describe(), output = %output.describe()))]
pub async fn stack(
    source: &dyn ResultStore,
    output: &ObjectStorage,
    product: &str,
    plugin_version: &str,
    options: &StackOptions,
) -> ConfluxResult<StackStats> {
    let records = source.load_records(product, plugin_version).await?;
    let record_count = records.len();
    let series = build_series(records, options);

    for polygon in &series {
        let path = polygon.csv_path();
        output.put(&path, Bytes::from(polygon.to_csv()?)).await?;
        debug!(path = %path, observations = polygon.observations.len(), "Wrote series");
    }

    let stats = StackStats {
        records: record_count,
        series: series.len(),
    };
    info!(records = stats.records, series = stats.series, "Stacked drill output");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use conflux_common::{EdgeFlags, OutputBatch};
    use storage::MemoryResultStore;

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2001, 3, day, hour, minute, second).unwrap()
    }

    fn observation(date: DateTime<Utc>, pc_missing: f64) -> Observation {
        Observation {
            date,
            measurements: [
                ("pc_missing".to_string(), pc_missing),
                ("pc_wet".to_string(), 0.5),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn record(polygon_id: &str, scene_id: &str, date: DateTime<Utc>, pc_wet: f64) -> SummaryRecord {
        SummaryRecord {
            polygon_id: polygon_id.to_string(),
            scene_id: scene_id.to_string(),
            date,
            plugin_version: "0.0.1".to_string(),
            measurements: [
                ("pc_wet".to_string(), pc_wet),
                ("pc_missing".to_string(), 0.0),
            ]
            .into_iter()
            .collect(),
            overflow: EdgeFlags::default(),
        }
    }

    #[test]
    fn test_same_day_keeps_least_missing() {
        let kept = remove_duplicates(
            vec![
                observation(at(14, 1, 0, 0), 0.4),
                observation(at(14, 1, 0, 30), 0.1),
                observation(at(15, 1, 0, 0), f64::NAN),
            ],
            "pc_missing",
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].date, at(14, 1, 0, 30));
        assert_eq!(kept[1].date, at(15, 1, 0, 0));
    }

    #[test]
    fn test_pass_across_midnight_keeps_later_observation() {
        let kept = remove_duplicates(
            vec![
                observation(at(14, 23, 59, 40), 0.0),
                observation(at(15, 0, 0, 10), 0.2),
                observation(at(16, 0, 0, 10), 0.2),
            ],
            "pc_missing",
        );
        let dates: Vec<_> = kept.iter().map(|o| o.date).collect();
        assert_eq!(dates, vec![at(15, 0, 0, 10), at(16, 0, 0, 10)]);
    }

    #[test]
    fn test_build_series_groups_and_sorts_by_date() {
        let records = vec![
            record("r2abc", "s2", at(20, 0, 0, 0), 0.2),
            record("r2abc", "s1", at(10, 0, 0, 0), 0.1),
            record("q9xyz", "s1", at(10, 0, 0, 0), 0.3),
        ];
        let series = build_series(
            records,
            &StackOptions {
                remove_duplicates: false,
                ..StackOptions::default()
            },
        );
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].polygon_id, "q9xyz");
        assert_eq!(series[1].polygon_id, "r2abc");
        let dates: Vec<_> = series[1].observations.iter().map(|o| o.date).collect();
        assert_eq!(dates, vec![at(10, 0, 0, 0), at(20, 0, 0, 0)]);
        assert_eq!(series[1].csv_path(), "r2ab/r2abc.csv");
    }

    #[test]
    fn test_csv_has_date_column_and_blank_nan() {
        let series = PolygonSeries {
            polygon_id: "r2abc".to_string(),
            observations: vec![
                Observation {
                    date: at(14, 0, 12, 5),
                    measurements: [("pc_wet".to_string(), 0.25), ("px_wet".to_string(), 3.0)]
                        .into_iter()
                        .collect(),
                },
                Observation {
                    date: at(15, 0, 12, 5),
                    measurements: [("pc_wet".to_string(), f64::NAN)].into_iter().collect(),
                },
            ],
        };
        let text = String::from_utf8(series.to_csv().unwrap()).unwrap();
        assert_eq!(
            text,
            "date,pc_wet,px_wet\n2001-03-14T00:12:05Z,0.25,3\n2001-03-15T00:12:05Z,,\n"
        );
    }

    #[tokio::test]
    async fn test_stack_writes_one_csv_per_polygon() {
        let store = MemoryResultStore::new();
        for (scene, day, wet) in [("s1", 10, 0.1), ("s2", 20, 0.2)] {
            let date = at(day, 0, 0, 0);
            let mut batch = OutputBatch::empty(scene, "ga_ls_wo_3", "0.0.1", date);
            batch.records.push(record("r2abc", scene, date, wet));
            batch.records.push(record("q9xyz", scene, date, wet * 2.0));
            store.write_batch(&batch).await.unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let output = ObjectStorage::local(dir.path()).unwrap();
        let stats = stack(&store, &output, "ga_ls_wo_3", "0.0.1", &StackOptions::default())
            .await
            .unwrap();
        assert_eq!(stats, StackStats { records: 4, series: 2 });

        let text = std::fs::read_to_string(dir.path().join("r2ab").join("r2abc.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "date,pc_missing,pc_wet");
        assert_eq!(lines[1], "2001-03-10T00:00:00Z,0,0.1");
        assert_eq!(lines[2], "2001-03-20T00:00:00Z,0,0.2");
        assert!(dir.path().join("q9xy").join("q9xyz.csv").exists());
    }
}
