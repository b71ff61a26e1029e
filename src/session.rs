//! End-to-end distance queries
//!
//! A [`Session`] owns a probed [`Registry`] and runs the aggregation query
//! for any method identifier:
//!
//! ```text
//! method id -> Registry::dispatch -> DistanceFunction (or SQL expression)
//!           -> QueryEngine::parse -> QueryExecutor over morsels -> avg_dist
//! ```
//!
//! ## Example
//!
//! ```rust
//! use haversine_udf::session::Session;
//! use haversine_udf::storage::StorageEngine;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = StorageEngine::from_columns(
//!     vec![-86.67], vec![36.12], vec![-118.40], vec![33.94],
//! )?;
//! let session = Session::builder().build();
//! let avg = session.calc("vectorized", &storage)?;
//! assert!((avg - 2887.26).abs() < 0.01);
//! # Ok(())
//! # }
//! ```

use crate::backend::native::NativeSource;
use crate::backend::{Dispatch, Method, Registry};
use crate::bridge::{DistanceFunction, DEFAULT_FUNCTION_NAME};
use crate::observe::{ExecutionObserver, NoopObserver};
use crate::query::expr::as_f64;
use crate::query::{FunctionCatalog, QueryEngine, QueryExecutor};
use crate::storage::StorageEngine;
use crate::{Error, Result};
use arrow::array::{Array, Float64Array, RecordBatch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Default relation name
pub const DEFAULT_TABLE_NAME: &str = "points";

/// Distance written in the query language itself, used by the `sql` method
pub const SQL_DISTANCE_EXPR: &str = "6372.8 * (2 * ASIN(LEAST(1.0, GREATEST(-1.0, SQRT(\
POW(SIN(RADIANS(y1 - y0) / 2), 2) + COS(RADIANS(y0)) * COS(RADIANS(y1)) * POW(SIN(RADIANS(x1 - x0) / 2), 2))))))";

/// Session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Rows per morsel; `None` derives it from the 128MB morsel budget
    pub morsel_rows: Option<usize>,
    /// Reduce morsels on the rayon pool
    pub parallel: bool,
    /// Name the distance function is registered under
    pub function_name: String,
    /// Name the query reads from
    pub table_name: String,
    /// Where `native_ffi` gets its function table
    pub native: NativeSource,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            morsel_rows: None,
            parallel: false,
            function_name: DEFAULT_FUNCTION_NAME.to_string(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            native: NativeSource::Linked,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document; missing fields take their defaults
    ///
    /// # Errors
    /// Returns `InvalidInput` if the document is malformed
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("Invalid session config: {e}")))
    }
}

/// Session builder
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    observer: Option<Arc<dyn ExecutionObserver>>,
    registry: Option<Registry>,
}

impl SessionBuilder {
    /// Replace every setting at once
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Force a fixed number of rows per batch
    #[must_use]
    pub const fn morsel_rows(mut self, rows: usize) -> Self {
        self.config.morsel_rows = Some(rows);
        self
    }

    /// Toggle rayon-parallel reduction across morsels
    #[must_use]
    pub const fn parallel(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    /// Register the distance function under another name
    #[must_use]
    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.config.function_name = name.into();
        self
    }

    /// Query a differently named relation
    #[must_use]
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.config.table_name = name.into();
        self
    }

    /// Serve `native_ffi` from a shared library instead of the linked kernel
    #[must_use]
    pub fn native_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.native = NativeSource::Library(path.into());
        self
    }

    /// Receive per-batch events
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Use an existing registry instead of probing the host
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the session, probing backends unless a registry was supplied
    #[must_use]
    pub fn build(self) -> Session {
        let registry = match self.registry {
            Some(registry) => registry,
            None => Registry::probe_with(&self.config.native),
        };
        Session {
            config: self.config,
            registry,
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
        }
    }
}

/// Outcome of one timed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Method identifier
    pub method: String,
    /// Mean distance in km (NaN for an empty relation, written as `null`)
    #[serde(with = "nan_as_null")]
    pub avg_distance: f64,
    /// Rows in the relation
    pub rows: usize,
    /// Wall-clock time of the query
    pub elapsed_ms: f64,
    /// When the query started
    pub started_at: DateTime<Utc>,
}

/// JSON has no NaN: write it as `null` and read `null` back as NaN
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Receiver of finished runs
pub trait ResultSink {
    /// Accept one report
    ///
    /// # Errors
    /// Returns an error if the report cannot be stored
    fn write(&mut self, report: &RunReport) -> Result<()>;
}

impl ResultSink for Vec<RunReport> {
    fn write(&mut self, report: &RunReport) -> Result<()> {
        self.push(report.clone());
        Ok(())
    }
}

/// Writes each report as one JSON line
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    /// Wrap a writer
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ResultSink for JsonLinesSink<W> {
    fn write(&mut self, report: &RunReport) -> Result<()> {
        serde_json::to_writer(&mut self.writer, report).map_err(std::io::Error::from)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Distance query runner
pub struct Session {
    config: SessionConfig,
    registry: Registry,
    observer: Arc<dyn ExecutionObserver>,
}

impl Default for Session {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Session {
    /// Create a new session builder
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Active settings
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Backends probed at startup
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Methods selectable on this host
    #[must_use]
    pub fn available_methods(&self) -> &[Method] {
        self.registry.available_methods()
    }

    /// Catalog and per-row distance expression for a dispatch target
    fn prepare(&self, dispatch: Dispatch) -> Result<(FunctionCatalog, String)> {
        let mut catalog = FunctionCatalog::with_builtins();
        let expr = match dispatch {
            Dispatch::Udf(kernel) => {
                let function = DistanceFunction::new(self.config.function_name.clone(), kernel)
                    .with_observer(Arc::clone(&self.observer));
                catalog.register(Arc::new(function))?;
                format!("{}(x0, y0, x1, y1)", self.config.function_name)
            }
            Dispatch::NativeSql => SQL_DISTANCE_EXPR.to_string(),
        };
        Ok((catalog, expr))
    }

    fn execute(&self, sql: &str, catalog: &FunctionCatalog, storage: &StorageEngine) -> Result<RecordBatch> {
        let plan = QueryEngine::new().parse(sql)?;
        plan.check_table(&self.config.table_name)?;

        let mut morsels = match self.config.morsel_rows {
            Some(rows) => storage.morsels_with_rows(rows),
            None => storage.morsels(),
        };
        QueryExecutor::new(catalog)
            .with_parallel(self.config.parallel)
            .execute(&plan, &mut morsels)
    }

    /// Mean distance over `storage` using the backend named `method_id`
    ///
    /// The method is resolved before the data is touched.
    ///
    /// # Errors
    /// - `UnknownMethod` / `BackendUnavailable` from resolution
    /// - `SchemaError` if `storage` is not a points relation
    /// - backend failures (`CompilationFailure`, `DeviceError`, ...)
    pub fn calc(&self, method_id: &str, storage: &StorageEngine) -> Result<f64> {
        let dispatch = self.registry.dispatch(method_id)?;
        storage.validate()?;

        let (catalog, expr) = self.prepare(dispatch)?;
        let sql = format!(
            "SELECT AVG({expr}) AS avg_dist FROM {}",
            self.config.table_name
        );
        let result = self.execute(&sql, &catalog, storage)?;
        let avg = as_f64(result.column(0), "avg_dist")?;
        let value = if avg.is_valid(0) { avg.value(0) } else { f64::NAN };

        tracing::info!(method = method_id, rows = storage.num_rows(), avg_dist = value, "distance query finished");
        Ok(value)
    }

    /// Per-row distances in input order, nulls where any input is null
    ///
    /// # Errors
    /// Same as [`Session::calc`]
    pub fn distances(&self, method_id: &str, storage: &StorageEngine) -> Result<Float64Array> {
        let dispatch = self.registry.dispatch(method_id)?;
        storage.validate()?;

        let (catalog, expr) = self.prepare(dispatch)?;
        let sql = format!("SELECT {expr} AS dist FROM {}", self.config.table_name);
        let result = self.execute(&sql, &catalog, storage)?;
        Ok(as_f64(result.column(0), "dist")?.clone())
    }

    /// Load a Parquet dataset and compute its mean distance
    ///
    /// # Errors
    /// - resolution errors, raised before the file is opened
    /// - `Io`, `SchemaError` or `StorageError` from loading
    /// - everything [`Session::calc`] returns
    pub fn calc_file<P: AsRef<Path>>(&self, method_id: &str, path: P) -> Result<f64> {
        self.registry.resolve(method_id)?;
        let storage = StorageEngine::load_parquet(path)?;
        self.calc(method_id, &storage)
    }

    /// Timed [`Session::calc`] whose report goes to `sink`
    ///
    /// # Errors
    /// Same as [`Session::calc`], plus sink failures
    pub fn run(&self, method_id: &str, storage: &StorageEngine, sink: &mut dyn ResultSink) -> Result<RunReport> {
        let started_at = Utc::now();
        let started = Instant::now();
        let avg_distance = self.calc(method_id, storage)?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let report = RunReport {
            method: method_id.to_string(),
            avg_distance,
            rows: storage.num_rows(),
            elapsed_ms,
            started_at,
        };
        sink.write(&report)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registry::default_descriptors;
    use crate::backend::BackendDescriptor;
    use crate::formula::haversine;
    use crate::observe::ThreadTracker;

    fn three_points() -> StorageEngine {
        StorageEngine::from_columns(
            vec![0.0, 10.0, -86.67],
            vec![0.0, 10.0, 36.12],
            vec![0.0, 10.5, -118.40],
            vec![1.0, 10.5, 33.94],
        )
        .unwrap()
    }

    fn cpu_only() -> Session {
        let descriptors: Vec<BackendDescriptor> = default_descriptors()
            .into_iter()
            .filter(|d| d.method != Method::Gpu)
            .collect();
        Session::builder()
            .registry(Registry::from_descriptors(&descriptors))
            .build()
    }

    #[test]
    fn test_calc_matches_formula() {
        let storage = three_points();
        let expected = (haversine(0.0, 0.0, 0.0, 1.0)
            + haversine(10.0, 10.0, 10.5, 10.5)
            + haversine(-86.67, 36.12, -118.40, 33.94))
            / 3.0;
        let session = cpu_only();
        for method in ["scalar", "vectorized", "native_ffi", "sql"] {
            let avg = session.calc(method, &storage).unwrap();
            assert!((avg - expected).abs() <= 1e-9 * expected, "{method}: {avg} vs {expected}");
        }
    }

    #[test]
    fn test_unknown_method_fails_before_touching_data() {
        // Schema is wrong on purpose: resolution must fail first.
        let bogus = StorageEngine::new(vec![]);
        let err = cpu_only().calc("fortran", &bogus).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("vectorized"));
    }

    #[test]
    fn test_empty_relation_is_nan() {
        let storage = StorageEngine::from_columns(vec![], vec![], vec![], vec![]).unwrap();
        let session = cpu_only();
        assert!(session.calc("vectorized", &storage).unwrap().is_nan());
        assert!(session.calc("sql", &storage).unwrap().is_nan());
    }

    #[test]
    fn test_small_morsels_agree_with_single_batch() {
        let storage = three_points();
        let whole = cpu_only().calc("vectorized", &storage).unwrap();
        let split = Session::builder()
            .registry(cpu_only().registry)
            .morsel_rows(1)
            .build()
            .calc("vectorized", &storage)
            .unwrap();
        assert!((whole - split).abs() < 1e-9);
    }

    #[test]
    fn test_observer_receives_one_event_per_morsel() {
        let tracker = Arc::new(ThreadTracker::new());
        let session = Session::builder()
            .registry(cpu_only().registry)
            .morsel_rows(2)
            .observer(tracker.clone())
            .build();
        session.calc("scalar", &three_points()).unwrap();
        assert_eq!(tracker.batch_count(), 2);
        assert_eq!(tracker.row_count(), 3);
    }

    #[test]
    fn test_custom_names() {
        let session = Session::builder()
            .registry(cpu_only().registry)
            .function_name("great_circle")
            .table_name("trips")
            .build();
        let avg = session.calc("vectorized", &three_points()).unwrap();
        assert!(avg > 0.0);
    }

    #[test]
    fn test_distances_keep_order() {
        let storage = three_points();
        let out = cpu_only().distances("sql", &storage).unwrap();
        assert_eq!(out.len(), 3);
        let expected = haversine(0.0, 0.0, 0.0, 1.0);
        assert!((out.value(0) - expected).abs() <= 1e-12 * expected);
        assert!(out.value(2) > out.value(0));
    }

    #[test]
    fn test_run_writes_json_line() {
        let session = cpu_only();
        let mut sink = JsonLinesSink::new(Vec::new());
        let report = session.run("vectorized", &three_points(), &mut sink).unwrap();
        assert_eq!(report.rows, 3);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text.lines().count(), 1);
        let parsed: RunReport = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed.method, "vectorized");
        assert_eq!(parsed.rows, 3);
    }

    #[test]
    fn test_config_from_json_fills_defaults() {
        let config = SessionConfig::from_json(r#"{"parallel": true, "morsel_rows": 4096}"#).unwrap();
        assert!(config.parallel);
        assert_eq!(config.morsel_rows, Some(4096));
        assert_eq!(config.function_name, DEFAULT_FUNCTION_NAME);
        assert_eq!(config.table_name, DEFAULT_TABLE_NAME);
        assert_eq!(config.native, NativeSource::Linked);
        assert!(SessionConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_config_native_library_from_json() {
        let config = SessionConfig::from_json(r#"{"native": {"library": "/opt/lib/libhaversine_udf.so"}}"#).unwrap();
        assert_eq!(
            config.native,
            NativeSource::Library(PathBuf::from("/opt/lib/libhaversine_udf.so"))
        );
        let built = Session::builder().native_library("/opt/lib/libhaversine_udf.so");
        assert_eq!(built.config.native, config.native);
    }

    #[test]
    fn test_report_nan_average_round_trips_as_null() {
        let report = RunReport {
            method: "sql".to_string(),
            avg_distance: f64::NAN,
            rows: 0,
            elapsed_ms: 0.5,
            started_at: Utc::now(),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains(r#""avg_distance":null"#), "{json}");
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert!(parsed.avg_distance.is_nan());

        let finite: RunReport = serde_json::from_str(&json.replace("null", "12.5")).unwrap();
        assert_eq!(finite.avg_distance, 12.5);
    }
}
