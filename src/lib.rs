//! Filter-and-aggregation engine for the Volta utility billing dashboard.
//!
//! A [`FilterSpec`] describes what the user wants to see. The [`Dataset`]
//! holds one normalized snapshot of the billing table in memory and mirrors
//! it into an embedded DuckDB warehouse, so every read can run either on the
//! in-memory frame or as a parameterized SQL query with identical results.

pub mod config;
pub mod dataset;
pub mod db;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod monitoring;
pub mod plotting;
pub mod s3;

pub use config::{EngineConfig, S3Location};
pub use dataset::{Dataset, Health};
pub use error::{EngineError, Result};
pub use filter::{FilterArgs, FilterSpec, FilterSpecBuilder, Granularity};
pub use metrics::{MetricEntry, MetricRegistry};
