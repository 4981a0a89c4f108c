use chrono::NaiveDate;
use polars::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::EngineConfig;
use crate::filter::canonical_text;
use crate::filter::predicate::date_from_epoch_days;
use crate::metrics::MetricRegistry;

/// Descriptive statistics for one measure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasureStats {
    pub label: String,
    pub sum: f64,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

/// Headline numbers for a filtered table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub rows: usize,
    pub cols: usize,
    pub meters: Option<usize>,
    pub locations: Option<usize>,
    /// ISO date, empty when the table has no dates
    pub date_min: String,
    pub date_max: String,
}

/// Statistics for every registered measure present in `df`. Measures without
/// a single numeric value are left out.
pub fn compute_statistics(df: &DataFrame, registry: &MetricRegistry) -> BTreeMap<String, MeasureStats> {
    let mut stats = BTreeMap::new();
    for entry in registry.entries() {
        let Some(mut values) = numeric_values(df, &entry.key) else {
            continue;
        };
        if values.is_empty() {
            continue;
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        let n = values.len();
        let sum: f64 = values.iter().sum();
        let median = if n % 2 == 1 {
            values[n / 2]
        } else {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        };
        stats.insert(
            entry.key.clone(),
            MeasureStats {
                label: entry.label.clone(),
                sum,
                mean: sum / n as f64,
                median,
                min: values[0],
                max: values[n - 1],
            },
        );
    }
    stats
}

fn numeric_values(df: &DataFrame, column: &str) -> Option<Vec<f64>> {
    let series = df.column(column).ok()?.cast(&DataType::Float64).ok()?;
    let values = series.f64().ok()?.into_iter().flatten().filter(|v| !v.is_nan()).collect();
    Some(values)
}

pub fn compute_summary(df: &DataFrame, config: &EngineConfig) -> Summary {
    let distinct = |column: &str| df.column(column).ok().and_then(|s| s.drop_nulls().n_unique().ok());
    let (date_min, date_max) = date_range(df, &config.date_col);
    let iso = |d: Option<NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();

    Summary {
        rows: df.height(),
        cols: df.width(),
        meters: distinct(&config.meter_column),
        locations: distinct(&config.location_column),
        date_min: iso(date_min),
        date_max: iso(date_max),
    }
}

/// Earliest and latest date in `column`; `None` when absent or empty
pub fn date_range(df: &DataFrame, column: &str) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let days = df
        .column(column)
        .ok()
        .and_then(|s| s.cast(&DataType::Date).ok())
        .and_then(|s| s.cast(&DataType::Int32).ok());
    let Some(days) = days else {
        return (None, None);
    };
    let Ok(days) = days.i32() else {
        return (None, None);
    };
    let min = days.into_iter().flatten().min().and_then(date_from_epoch_days);
    let max = days.into_iter().flatten().max().and_then(date_from_epoch_days);
    (min, max)
}

/// Sorted distinct values per filterable column, capped at `cap` entries each.
/// Values are spelled the way membership filters compare them.
pub fn unique_values(df: &DataFrame, exclude: &BTreeSet<String>, cap: usize) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for series in df.get_columns() {
        if exclude.contains(series.name()) {
            continue;
        }
        let Ok(text) = canonical_text(series) else {
            continue;
        };
        let Ok(text) = text.str() else {
            continue;
        };
        let distinct: BTreeSet<&str> = text.into_iter().flatten().collect();
        out.insert(
            series.name().to_string(),
            distinct.into_iter().take(cap).map(String::from).collect(),
        );
    }
    out
}
