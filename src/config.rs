use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::metrics::MetricEntry;

/// Remote S3 object holding the dataset as a Parquet payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
    #[serde(default = "default_region")]
    pub region: String,
}

/// Engine configuration.
///
/// Resolved in three layers: built-in defaults, an optional YAML file, then
/// environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local Parquet file used when no warehouse table or remote source is available
    pub data_path: Option<PathBuf>,
    /// Glob matching uploaded CSV files
    pub csv_glob: String,
    /// DuckDB database file; `None` keeps the warehouse in memory
    pub duckdb_path: Option<PathBuf>,
    /// Remote HTTP(S) URL serving a Parquet payload
    pub bucket_url: Option<String>,
    /// Sent as the `apikey` header with `bucket_url` requests
    pub api_key: Option<String>,
    pub s3: Option<S3Location>,
    pub fetch_timeout_secs: u64,
    pub date_col: String,
    /// chrono format of the raw date column, e.g. `05-Jan-24`
    pub date_format: String,
    /// Columns hidden from checkbox-style filtering
    pub exclude_cols: BTreeSet<String>,
    /// Raw `res` codes to customer class labels
    pub res_map: BTreeMap<String, String>,
    pub metrics: Vec<MetricEntry>,
    pub meter_column: String,
    pub location_column: String,
    /// Raw coded column the categorical column is derived from
    pub category_source_column: String,
    pub category_column: String,
    pub meterid_max_options: usize,
    pub unique_values_cap: usize,
}

fn default_region() -> String {
    "eu-west-3".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        let exclude_cols = [
            "chargedate",
            "chargedate_str",
            "month",
            "month_str",
            "year",
            "kwh",
            "ghc",
            "paymoney",
            "res",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let res_map = [
            ("N-Resid [0]", "Commercial"),
            ("Resid [1]", "Residential"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            data_path: Some(PathBuf::from("data/wkfile_shiny.parquet")),
            csv_glob: "data/uploads/*.csv".to_string(),
            duckdb_path: Some(PathBuf::from("data/volta.duckdb")),
            bucket_url: None,
            api_key: None,
            s3: None,
            fetch_timeout_secs: 30,
            date_col: "chargedate".to_string(),
            date_format: "%d-%b-%y".to_string(),
            exclude_cols,
            res_map,
            metrics: vec![
                MetricEntry::new("kwh", "kWh"),
                MetricEntry::new("paymoney", "Pay"),
                MetricEntry::new("ghc", "GHC"),
            ],
            meter_column: "meterid".to_string(),
            location_column: "loc".to_string(),
            category_source_column: "res".to_string(),
            category_column: "res_mapped".to_string(),
            meterid_max_options: 500,
            unique_values_cap: 200,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional YAML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML config file; missing keys fall back to defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("VOLTA_DATA_PATH") {
            self.data_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("VOLTA_DATE_COL") {
            self.date_col = v;
        }
        if let Some(v) = get("VOLTA_DATE_FORMAT") {
            self.date_format = v;
        }
        if let Some(v) = get("VOLTA_CSV_GLOB") {
            self.csv_glob = v;
        }
        if let Some(v) = get("VOLTA_DUCKDB_PATH") {
            self.duckdb_path = if v == ":memory:" { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = get("BUCKET_URL") {
            self.bucket_url = Some(v);
        }
        if let Some(v) = get("SUPABASE_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = get("VOLTA_FETCH_TIMEOUT_SECS") {
            match v.parse() {
                Ok(secs) => self.fetch_timeout_secs = secs,
                Err(_) => debug!("Ignoring unparsable VOLTA_FETCH_TIMEOUT_SECS={}", v),
            }
        }
        if let (Some(bucket), Some(key)) = (get("VOLTA_S3_BUCKET"), get("VOLTA_S3_KEY")) {
            self.s3 = Some(S3Location {
                bucket,
                key,
                region: get("VOLTA_S3_REGION").unwrap_or_else(default_region),
            });
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.date_col.trim().is_empty() {
            return Err(EngineError::Config("date_col must not be empty".into()));
        }
        if self.date_format.trim().is_empty() {
            return Err(EngineError::Config("date_format must not be empty".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(EngineError::Config("fetch_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Directory uploaded CSV files are stored in, derived from `csv_glob`
    pub fn uploads_dir(&self) -> PathBuf {
        let pattern = Path::new(&self.csv_glob);
        let has_wildcard = self.csv_glob.contains('*') || pattern.extension().is_some();
        match (has_wildcard, pattern.parent()) {
            (true, Some(parent)) => parent.to_path_buf(),
            _ => pattern.to_path_buf(),
        }
    }
}
