use chrono::NaiveDate;
use polars::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::stats::date_range;
use super::Dataset;
use crate::db::{qualified_table, query_rows_on};
use crate::error::Result;
use crate::filter::{quote_ident, FilterSpec, Granularity};

/// Label given to the folded tail of a top-N breakdown
pub const OTHER_LABEL: &str = "Other";

/// Slices shown in the composition chart before folding
const COMPOSITION_SLICES: usize = 8;

/// One time bucket of a bucketed aggregate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub start: NaiveDate,
    pub label: String,
    /// Mean per measure; `None` when the bucket had no values for it
    pub values: BTreeMap<String, Option<f64>>,
}

/// A labelled total
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentValue {
    pub label: String,
    pub value: f64,
}

impl SegmentValue {
    pub fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasureSeries {
    pub key: String,
    pub label: String,
    pub values: Vec<f64>,
}

/// Chart-ready time series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeries {
    pub granularity: Granularity,
    pub date_col: String,
    pub labels: Vec<String>,
    pub series: Vec<MeasureSeries>,
}

/// Chart-ready breakdown of one measure over one segment column
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSeries {
    pub segment: Option<String>,
    pub measure: Option<String>,
    pub metric_label: String,
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

impl ChartSeries {
    fn empty(measure: Option<&str>) -> Self {
        Self {
            segment: None,
            measure: None,
            metric_label: measure.unwrap_or_default().to_string(),
            labels: Vec::new(),
            values: Vec::new(),
        }
    }
}

/// Options for dependent filter widgets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct FacetOptions {
    pub options: BTreeMap<String, Vec<String>>,
    pub date_min: String,
    pub date_max: String,
    pub rows: usize,
}

/// Keep the `n` largest totals and fold the rest into a single "Other" entry.
///
/// Sorting is stable, so equal totals keep their input order.
pub fn fold_top_n(mut groups: Vec<SegmentValue>, n: usize) -> Vec<SegmentValue> {
    groups.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(Ordering::Equal));
    if groups.len() <= n {
        return groups;
    }
    let rest = groups.split_off(n);
    let other: f64 = rest.iter().map(|g| g.value).sum();
    groups.push(SegmentValue::new(OTHER_LABEL, other));
    groups
}

fn has_column(snapshot: &DataFrame, column: &str) -> bool {
    snapshot.get_column_names().iter().any(|c| *c == column)
}

impl Dataset {
    /// Mean of each measure per time bucket, oldest first.
    ///
    /// Buckets start at the truncated date (weeks on Monday); buckets with
    /// no rows are not returned.
    pub fn bucketed_aggregate(&self, spec: &FilterSpec, measures: &[&str]) -> Result<Vec<Bucket>> {
        let date_col = self.date_column().to_string();
        self.with_view(|conn, snapshot| {
            if snapshot.width() == 0 || !has_column(snapshot, &date_col) {
                return Ok(Vec::new());
            }
            let columns = snapshot.get_column_names();
            let measures = self.registry().validate_all(&columns, measures);
            if measures.is_empty() {
                debug!("No valid measures for bucketed aggregate");
                return Ok(Vec::new());
            }

            let fragment = spec.to_query_predicate(&date_col, &columns);
            let date_expr = format!("CAST({} AS DATE)", quote_ident(&date_col));
            let averages = measures
                .iter()
                .map(|m| format!("AVG(CAST({} AS DOUBLE))", quote_ident(m)))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT CAST(CAST(date_trunc('{unit}', {date}) AS DATE) AS VARCHAR) AS bucket, {averages}
                 FROM {table}
                 WHERE ({clause}) AND {date} IS NOT NULL
                 GROUP BY 1
                 ORDER BY 1",
                unit = spec.bucketing_unit(),
                date = date_expr,
                averages = averages,
                table = qualified_table(),
                clause = fragment.sql,
            );

            let width = measures.len();
            let rows = query_rows_on(conn, &sql, &fragment.params, |row| {
                let bucket: String = row.get(0)?;
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(row.get::<_, Option<f64>>(i + 1)?);
                }
                Ok((bucket, values))
            })?;

            let mut buckets = Vec::with_capacity(rows.len());
            for (raw, values) in rows {
                let Ok(start) = NaiveDate::parse_from_str(&raw, "%Y-%m-%d") else {
                    warn!("Skipping bucket with unexpected date {:?}", raw);
                    continue;
                };
                buckets.push(Bucket {
                    start,
                    label: spec.granularity().label(start),
                    values: measures.iter().map(|m| m.to_string()).zip(values).collect(),
                });
            }
            Ok(buckets)
        })
    }

    /// Bucketed means shaped for a line chart. Falls back to the first
    /// available measure when the filter names none; missing means plot as 0.
    pub fn time_series(&self, spec: &FilterSpec) -> Result<TimeSeries> {
        let schema = self.schema()?;
        let mut measures: Vec<String> = self
            .registry()
            .validate_all(&schema, &spec.measures())
            .into_iter()
            .map(String::from)
            .collect();
        if measures.is_empty() && spec.measure().is_none() {
            measures.extend(self.registry().available(&schema).first().map(|e| e.key.clone()));
        }

        let keys: Vec<&str> = measures.iter().map(String::as_str).collect();
        let buckets = self.bucketed_aggregate(spec, &keys)?;
        let series = keys
            .iter()
            .map(|key| MeasureSeries {
                key: key.to_string(),
                label: self.registry().label(key).to_string(),
                values: buckets
                    .iter()
                    .map(|b| b.values.get(*key).copied().flatten().unwrap_or(0.0))
                    .collect(),
            })
            .collect();

        Ok(TimeSeries {
            granularity: spec.granularity(),
            date_col: self.date_column().to_string(),
            labels: buckets.into_iter().map(|b| b.label).collect(),
            series,
        })
    }

    /// Totals of `measure` per `segment` value, largest first, with everything
    /// past the first `n` folded into "Other".
    ///
    /// Equal totals at the cutoff come back in whatever order DuckDB returns.
    pub fn top_n_by_segment(&self, spec: &FilterSpec, measure: &str, segment: &str, n: usize) -> Result<Vec<SegmentValue>> {
        let groups = self.segment_totals(spec, measure, segment)?;
        Ok(fold_top_n(groups, n))
    }

    fn segment_totals(&self, spec: &FilterSpec, measure: &str, segment: &str) -> Result<Vec<SegmentValue>> {
        let date_col = self.date_column().to_string();
        self.with_view(|conn, snapshot| {
            let columns = snapshot.get_column_names();
            let Some(measure) = self.registry().validate(&columns, Some(measure)) else {
                return Ok(Vec::new());
            };
            if !has_column(snapshot, segment) {
                return Ok(Vec::new());
            }

            let fragment = spec.to_query_predicate(&date_col, &columns);
            let seg = quote_ident(segment);
            let value = quote_ident(measure);
            let sql = format!(
                "SELECT CAST({seg} AS VARCHAR) AS label, SUM(CAST({value} AS DOUBLE)) AS total
                 FROM {table}
                 WHERE ({clause}) AND {seg} IS NOT NULL AND {value} IS NOT NULL
                 GROUP BY 1
                 ORDER BY total DESC",
                seg = seg,
                value = value,
                table = qualified_table(),
                clause = fragment.sql,
            );
            query_rows_on(conn, &sql, &fragment.params, |row| {
                Ok(SegmentValue::new(row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
        })
    }

    fn chart_measure(&self, spec: &FilterSpec, schema: &[String]) -> Option<String> {
        match spec.measure() {
            Some(requested) => self.registry().validate(schema, Some(requested)).map(String::from),
            None => self.registry().available(schema).first().map(|e| e.key.clone()),
        }
    }

    /// Share of a measure per customer class (or per location when the class
    /// column is missing), top slices plus "Other"
    pub fn composition(&self, spec: &FilterSpec) -> Result<ChartSeries> {
        let schema = self.schema()?;
        let config = self.config();
        let segment = [&config.category_column, &config.location_column]
            .into_iter()
            .find(|c| schema.contains(*c))
            .cloned();
        self.breakdown(spec, &schema, segment, Some(COMPOSITION_SLICES))
    }

    /// Total of a measure per location, unfolded
    pub fn by_location(&self, spec: &FilterSpec) -> Result<ChartSeries> {
        let schema = self.schema()?;
        let location = &self.config().location_column;
        let segment = schema.contains(location).then(|| location.clone());
        self.breakdown(spec, &schema, segment, None)
    }

    fn breakdown(&self, spec: &FilterSpec, schema: &[String], segment: Option<String>, top: Option<usize>) -> Result<ChartSeries> {
        let (Some(segment), Some(measure)) = (segment, self.chart_measure(spec, schema)) else {
            return Ok(ChartSeries::empty(spec.measure()));
        };
        let groups = self.segment_totals(spec, &measure, &segment)?;
        let groups = match top {
            Some(n) => fold_top_n(groups, n),
            None => groups,
        };
        Ok(ChartSeries {
            metric_label: self.registry().label(&measure).to_string(),
            labels: groups.iter().map(|g| g.label.clone()).collect(),
            values: groups.iter().map(|g| g.value).collect(),
            segment: Some(segment),
            measure: Some(measure),
        })
    }

    /// First `n` filtered rows
    pub fn preview(&self, spec: &FilterSpec, n: usize) -> Result<DataFrame> {
        Ok(self.filter(spec)?.head(Some(n)))
    }

    /// Filtered rows as CSV with a header line
    pub fn export_csv(&self, spec: &FilterSpec) -> Result<Vec<u8>> {
        let mut filtered = self.filter(spec)?;
        let mut buffer = Vec::new();
        if filtered.width() > 0 {
            CsvWriter::new(&mut buffer).finish(&mut filtered)?;
        }
        Ok(buffer)
    }

    /// Number of rows the filter selects, counted by the warehouse
    pub fn count_rows(&self, spec: &FilterSpec) -> Result<usize> {
        let date_col = self.date_column().to_string();
        self.with_view(|conn, snapshot| {
            if snapshot.width() == 0 {
                return Ok(0);
            }
            let fragment = spec.to_query_predicate(&date_col, &snapshot.get_column_names());
            let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", qualified_table(), fragment.sql);
            let counts = query_rows_on(conn, &sql, &fragment.params, |row| row.get::<_, i64>(0))?;
            Ok(counts.first().copied().unwrap_or(0).max(0) as usize)
        })
    }

    /// Earliest and latest date of the whole dataset
    pub fn date_bounds(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let snapshot = self.get()?;
        Ok(date_range(&snapshot, self.date_column()))
    }

    /// Distinct values, date bounds and row count under a spec, for the
    /// filter widgets. With no facets requested, location, customer class and
    /// meter id are used when present. Meter ids are capped.
    pub fn facet_options<S: AsRef<str>>(&self, spec: &FilterSpec, facets: &[S]) -> Result<FacetOptions> {
        let date_col = self.date_column().to_string();
        let config = self.config();
        self.with_view(|conn, snapshot| {
            if snapshot.width() == 0 || snapshot.height() == 0 {
                return Ok(FacetOptions::default());
            }
            let columns = snapshot.get_column_names();
            let resolve = |key: &str| {
                columns
                    .iter()
                    .find(|c| **c == key)
                    .or_else(|| columns.iter().find(|c| c.eq_ignore_ascii_case(key)))
                    .map(|c| c.to_string())
            };
            let facets: Vec<String> = if facets.is_empty() {
                [&config.location_column, &config.category_column, &config.meter_column]
                    .into_iter()
                    .filter_map(|c| resolve(c.as_str()))
                    .collect()
            } else {
                facets.iter().filter_map(|f| resolve(f.as_ref())).collect()
            };

            let fragment = spec.to_query_predicate(&date_col, &columns);
            let table = qualified_table();
            let mut options = BTreeMap::new();
            for facet in facets {
                let col = quote_ident(&facet);
                let mut sql = format!(
                    "SELECT DISTINCT CAST({col} AS VARCHAR) AS v FROM {table} WHERE ({clause}) AND {col} IS NOT NULL ORDER BY v",
                    col = col,
                    table = table,
                    clause = fragment.sql,
                );
                if facet.eq_ignore_ascii_case(&config.meter_column) {
                    sql.push_str(&format!(" LIMIT {}", config.meterid_max_options));
                }
                let values = query_rows_on(conn, &sql, &fragment.params, |row| row.get::<_, String>(0))?;
                options.insert(facet, values);
            }

            let (date_min, date_max) = if has_column(snapshot, &date_col) {
                let date = format!("CAST({} AS DATE)", quote_ident(&date_col));
                let sql = format!(
                    "SELECT CAST(MIN({date}) AS VARCHAR), CAST(MAX({date}) AS VARCHAR) FROM {table} WHERE {clause}",
                    date = date,
                    table = table,
                    clause = fragment.sql,
                );
                query_rows_on(conn, &sql, &fragment.params, |row| {
                    Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
                })?
                .into_iter()
                .next()
                .map(|(lo, hi)| (lo.unwrap_or_default(), hi.unwrap_or_default()))
                .unwrap_or_default()
            } else {
                (String::new(), String::new())
            };

            let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, fragment.sql);
            let rows = query_rows_on(conn, &sql, &fragment.params, |row| row.get::<_, i64>(0))?
                .first()
                .copied()
                .unwrap_or(0)
                .max(0) as usize;

            Ok(FacetOptions {
                options,
                date_min,
                date_max,
                rows,
            })
        })
    }

    /// Distinct meter ids under the filter, ignoring its own meter selection,
    /// optionally narrowed by a case-insensitive substring
    pub fn search_meters(&self, spec: &FilterSpec, query: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let date_col = self.date_column().to_string();
        let meter_key = self.config().meter_column.clone();
        self.with_view(|conn, snapshot| {
            let columns = snapshot.get_column_names();
            let Some(meter) = columns
                .iter()
                .find(|c| c.eq_ignore_ascii_case(&meter_key))
                .map(|c| c.to_string())
            else {
                return Ok(Vec::new());
            };

            let mut fragment = spec
                .clone()
                .without_selection(&meter)
                .to_query_predicate(&date_col, &columns);
            let col = quote_ident(&meter);
            fragment = fragment.and_raw(&format!("{} IS NOT NULL", col));
            if let Some(q) = query.map(str::trim).filter(|q| !q.is_empty()) {
                fragment = fragment.and_raw(&format!("CAST({} AS VARCHAR) ILIKE '%' || ? || '%'", col));
                fragment.params.push(q.to_string());
            }
            let sql = format!(
                "SELECT DISTINCT CAST({col} AS VARCHAR) AS v FROM {table} WHERE {clause} ORDER BY v LIMIT {limit}",
                col = col,
                table = qualified_table(),
                clause = fragment.sql,
                limit = limit.max(1),
            );
            query_rows_on(conn, &sql, &fragment.params, |row| row.get::<_, String>(0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::{dataset_with, raw_sales};
    use crate::dataset::unique_values;
    use std::collections::BTreeSet;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_fold_top_n_preserves_total() {
        let groups: Vec<SegmentValue> = (1..=10).map(|i| SegmentValue::new(format!("g{}", i), i as f64)).collect();
        let total: f64 = groups.iter().map(|g| g.value).sum();

        let folded = fold_top_n(groups, 8);
        assert_eq!(folded.len(), 9);
        assert_eq!(folded[0].label, "g10");
        assert_eq!(folded[8].label, OTHER_LABEL);
        assert_eq!(folded[8].value, 3.0);
        let folded_total: f64 = folded.iter().map(|g| g.value).sum();
        assert_eq!(folded_total, total);
    }

    #[test]
    fn test_fold_top_n_short_input_unchanged() {
        let groups = vec![SegmentValue::new("a", 1.0), SegmentValue::new("b", 2.0)];
        let folded = fold_top_n(groups, 8);
        assert_eq!(folded, vec![SegmentValue::new("b", 2.0), SegmentValue::new("a", 1.0)]);
    }

    #[test]
    fn test_weekly_buckets_start_on_monday() {
        let ds = dataset_with(raw_sales());
        let spec = FilterSpec::new()
            .with_granularity(Granularity::Week)
            .with_range(Some(d(2024, 1, 1)), Some(d(2024, 1, 31)));
        let buckets = ds.bucketed_aggregate(&spec, &["kwh", "bogus"]).unwrap();

        // 2024-01-01 is a Monday: days 1..3 then 8..9
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].start, d(2024, 1, 1));
        assert_eq!(buckets[1].start, d(2024, 1, 8));
        assert_eq!(buckets[0].values["kwh"], Some(20.0));
        assert_eq!(buckets[1].values["kwh"], Some(45.0));
        assert!(!buckets[0].values.contains_key("bogus"));
    }

    #[test]
    fn test_monthly_buckets_and_time_series() {
        let ds = dataset_with(raw_sales());
        let spec = FilterSpec::new()
            .with_granularity(Granularity::Month)
            .with_measure(Some("kwh,paymoney"));
        let ts = ds.time_series(&spec).unwrap();
        assert_eq!(ts.labels, vec!["2024-01", "2024-02"]);
        assert_eq!(ts.series.len(), 2);
        assert_eq!(ts.series[0].label, "kWh");
        assert_eq!(ts.series[0].values, vec![30.0, 70.0]);
        assert_eq!(ts.series[1].values, vec![3.0, 7.0]);
    }

    #[test]
    fn test_unknown_measure_gives_empty_series() {
        let ds = dataset_with(raw_sales());
        let spec = FilterSpec::new().with_measure(Some("ghc"));
        assert!(ds.time_series(&spec).unwrap().labels.is_empty());
        assert!(ds.top_n_by_segment(&spec, "ghc", "loc", 3).unwrap().is_empty());
    }

    #[test]
    fn test_top_n_by_location() {
        let ds = dataset_with(raw_sales());
        let spec = FilterSpec::new();
        let top = ds.top_n_by_segment(&spec, "kwh", "loc", 1).unwrap();
        // Accra 180, Kumasi 110, Tema 70
        assert_eq!(top, vec![SegmentValue::new("Accra", 180.0), SegmentValue::new(OTHER_LABEL, 180.0)]);
    }

    #[test]
    fn test_composition_prefers_customer_class() {
        let ds = dataset_with(raw_sales());
        let spec = FilterSpec::new().with_selection("loc", ["Accra"]);
        let chart = ds.composition(&spec).unwrap();
        assert_eq!(chart.segment.as_deref(), Some("res_mapped"));
        assert_eq!(chart.measure.as_deref(), Some("kwh"));
        assert_eq!(chart.labels, vec!["Residential", "Commercial"]);
        assert_eq!(chart.values, vec![100.0, 80.0]);

        let by_loc = ds.by_location(&FilterSpec::new().with_measure(Some("paymoney"))).unwrap();
        assert_eq!(by_loc.metric_label, "Pay");
        assert_eq!(by_loc.labels, vec!["Accra", "Kumasi", "Tema"]);
    }

    #[test]
    fn test_facet_options_follow_filters() {
        let ds = dataset_with(raw_sales());
        let spec = FilterSpec::new().with_selection("loc", ["Tema"]);
        let facets = ds.facet_options::<&str>(&spec, &[]).unwrap();
        assert_eq!(facets.rows, 2);
        assert_eq!(facets.options["meterid"], vec!["102", "104"]);
        assert_eq!(facets.options["res_mapped"], vec!["Commercial"]);
        assert_eq!(facets.date_min, "2024-01-02");
        assert_eq!(facets.date_max, "2024-01-09");

        let only_loc = ds.facet_options(&FilterSpec::new(), &["LOC"]).unwrap();
        assert_eq!(only_loc.options.len(), 1);
        assert_eq!(only_loc.options["loc"], vec!["Accra", "Kumasi", "Tema"]);
    }

    #[test]
    fn test_facet_values_match_in_memory_values() {
        let ds = dataset_with(raw_sales());
        let facets = ds.facet_options(&FilterSpec::new(), &["lat", "billed_at"]).unwrap();
        let snapshot = ds.get().unwrap();
        let in_memory = unique_values(&snapshot, &BTreeSet::new(), 100);

        assert_eq!(facets.options["lat"], in_memory["lat"]);
        assert_eq!(facets.options["billed_at"], in_memory["billed_at"]);
        assert!(facets.options["lat"].contains(&"1e+16".to_string()));
        assert!(facets.options["billed_at"].contains(&"2024-01-01 00:00:00.5".to_string()));
    }

    #[test]
    fn test_search_meters_ignores_own_selection() {
        let ds = dataset_with(raw_sales());
        let spec = FilterSpec::new()
            .with_selection("loc", ["Accra"])
            .with_selection("meterid", ["101"]);
        assert_eq!(ds.search_meters(&spec, None, 10).unwrap(), vec!["101", "102", "103"]);
        assert_eq!(ds.search_meters(&spec, Some("03"), 10).unwrap(), vec!["103"]);
        assert_eq!(ds.search_meters(&spec, None, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_preview_export_and_bounds() {
        let ds = dataset_with(raw_sales());
        let spec = FilterSpec::new().with_selection("loc", ["Kumasi"]);
        assert_eq!(ds.preview(&spec, 1).unwrap().height(), 1);

        let csv = String::from_utf8(ds.export_csv(&spec).unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("meterid"));

        assert_eq!(ds.date_bounds().unwrap(), (Some(d(2024, 1, 1)), Some(d(2024, 2, 3))));
    }
}
