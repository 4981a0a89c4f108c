use duckdb::Connection;
use polars::prelude::*;
use serde::Serialize;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::Warehouse;
use crate::error::{EngineError, Result};
use crate::filter::{FilterArgs, FilterSpec};
use crate::metrics::MetricRegistry;
use crate::timed_operation;

pub mod normalize;
pub mod queries;
pub mod sources;
pub mod stats;

pub use normalize::{Normalizer, UNKNOWN_CATEGORY};
pub use queries::{fold_top_n, Bucket, ChartSeries, FacetOptions, MeasureSeries, SegmentValue, TimeSeries, OTHER_LABEL};
pub use sources::{acquire, default_sources, CsvGlobSource, Source};
pub use stats::{compute_statistics, compute_summary, date_range, unique_values, MeasureStats, Summary};

/// Liveness report: whether the dataset can be served, and its shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The shared, normalized dataset.
///
/// Readers get an `Arc` to an immutable snapshot and never block each other.
/// Loads, rebuilds and replaces serialize on `swap_lock`. A replace rewrites
/// `prod.sales` and swaps the snapshot while holding the warehouse
/// connection, so SQL reads and in-memory reads always see the same table.
pub struct Dataset {
    config: EngineConfig,
    registry: MetricRegistry,
    normalizer: Normalizer,
    warehouse: Warehouse,
    sources: Vec<Box<dyn Source>>,
    snapshot: RwLock<Option<Arc<DataFrame>>>,
    swap_lock: Mutex<()>,
}

impl Dataset {
    /// Open the configured warehouse and wire up the standard acquisition chain
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let warehouse = match &config.duckdb_path {
            Some(path) => Warehouse::open(path)?,
            None => Warehouse::in_memory()?,
        };
        let sources = default_sources(&config, &warehouse);
        Ok(Self::new(config, warehouse, sources))
    }

    pub fn new(config: EngineConfig, warehouse: Warehouse, sources: Vec<Box<dyn Source>>) -> Self {
        let registry = MetricRegistry::new(config.metrics.clone());
        let normalizer = Normalizer::new(&config, &registry);
        Self {
            config,
            registry,
            normalizer,
            warehouse,
            sources,
            snapshot: RwLock::new(None),
            swap_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn date_column(&self) -> &str {
        &self.config.date_col
    }

    fn current(&self) -> Result<Option<Arc<DataFrame>>> {
        Ok(self.snapshot.read()?.clone())
    }

    pub fn is_loaded(&self) -> Result<bool> {
        Ok(self.current()?.is_some())
    }

    /// Shared snapshot, loading it on first use
    pub fn get(&self) -> Result<Arc<DataFrame>> {
        if let Some(snapshot) = self.current()? {
            return Ok(snapshot);
        }
        self.load()
    }

    /// Owning copy of the snapshot for callers that mutate it
    pub fn get_owned(&self) -> Result<DataFrame> {
        Ok(self.get()?.as_ref().clone())
    }

    fn load(&self) -> Result<Arc<DataFrame>> {
        let _guard = self.swap_lock.lock()?;
        if let Some(snapshot) = self.current()? {
            return Ok(snapshot);
        }

        timed_operation!("dataset_load", {
            let acquired = acquire(&self.sources);
            let raw_shape = acquired.frame.shape();
            let raw_schema = acquired.frame.schema();
            let frame = self.normalizer.normalize(acquired.frame)?;

            let snapshot = if frame.width() == 0 {
                self.publish(frame)?
            } else if acquired.persisted && frame.shape() == raw_shape && frame.schema() == raw_schema {
                self.publish(frame)?
            } else {
                self.install(frame)?
            };
            info!(
                "✅ Dataset ready from {}: {} rows x {} columns",
                acquired.source,
                snapshot.height(),
                snapshot.width()
            );
            Ok(snapshot)
        })
    }

    /// Drop the cached snapshot; the next read reloads through the chain
    pub fn invalidate(&self) -> Result<()> {
        *self.snapshot.write()? = None;
        debug!("Dataset snapshot invalidated");
        Ok(())
    }

    /// Normalize a fresh table and make it the current dataset everywhere
    pub fn replace(&self, raw: DataFrame) -> Result<Arc<DataFrame>> {
        let _guard = self.swap_lock.lock()?;
        let frame = self.normalizer.normalize(raw)?;
        info!("🔄 Replacing dataset with {} rows x {} columns", frame.height(), frame.width());
        self.install(frame)
    }

    /// Re-read every uploaded CSV file and replace the dataset with them
    pub fn rebuild_from_csv(&self) -> Result<Arc<DataFrame>> {
        let source = CsvGlobSource::new(self.config.csv_glob.clone());
        match source.fetch()? {
            Some(frame) => self.replace(frame),
            None => Err(EngineError::SourceUnavailable(format!(
                "no CSV files match {}",
                source.pattern()
            ))),
        }
    }

    /// Copy a CSV file into the uploads directory and rebuild from it
    pub fn store_upload(&self, path: &Path) -> Result<Arc<DataFrame>> {
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        let Some(file_name) = path.file_name().filter(|_| is_csv) else {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a CSV file", path.display()),
            )));
        };

        let uploads = self.config.uploads_dir();
        std::fs::create_dir_all(&uploads)?;
        let target = uploads.join(file_name);
        std::fs::copy(path, &target)?;
        info!("📤 Stored upload {}", target.display());
        self.rebuild_from_csv()
    }

    /// Load the snapshot if needed and report its shape. An empty dataset is
    /// healthy; a failed load is reported rather than returned.
    pub fn health(&self) -> Health {
        match self.get() {
            Ok(snapshot) => Health {
                ok: true,
                rows: Some(snapshot.height()),
                cols: Some(snapshot.width()),
                error: None,
            },
            Err(e) => {
                warn!("Health check failed: {}", e);
                Health {
                    ok: false,
                    rows: None,
                    cols: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Column names of the current snapshot
    pub fn schema(&self) -> Result<Vec<String>> {
        Ok(self
            .get()?
            .get_column_names()
            .into_iter()
            .map(String::from)
            .collect())
    }

    /// Build a filter from raw arguments against the current schema
    pub fn spec_from_args(&self, args: &FilterArgs) -> Result<FilterSpec> {
        let schema = self.schema()?;
        Ok(FilterSpec::from_args(args, &schema, &self.config.exclude_cols))
    }

    /// In-memory filtered view
    pub fn filter(&self, spec: &FilterSpec) -> Result<DataFrame> {
        let snapshot = self.get()?;
        Ok(spec.apply_in_memory(&snapshot, self.date_column())?)
    }

    fn publish(&self, frame: DataFrame) -> Result<Arc<DataFrame>> {
        let fresh = Arc::new(frame);
        *self.snapshot.write()? = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Write the warehouse table and swap the snapshot under one connection lock
    fn install(&self, frame: DataFrame) -> Result<Arc<DataFrame>> {
        let fresh = Arc::new(frame);
        let mut poisoned = false;
        self.warehouse.replace_table_with(&fresh, || match self.snapshot.write() {
            Ok(mut slot) => *slot = Some(Arc::clone(&fresh)),
            Err(_) => poisoned = true,
        })?;
        if poisoned {
            return Err(EngineError::LockPoisoned);
        }
        Ok(fresh)
    }

    /// Run `f` with the warehouse connection and the snapshot that matches it.
    ///
    /// The snapshot is read while the connection is held, so a concurrent
    /// replace cannot slip in between the two.
    pub(crate) fn with_view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, &DataFrame) -> Result<T>,
    {
        loop {
            self.get()?;
            let conn = self.warehouse.lock()?;
            if let Some(snapshot) = self.current()? {
                return f(&conn, &snapshot);
            }
        }
    }
}
