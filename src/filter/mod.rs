use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub mod predicate;
pub mod text;

pub use predicate::{quote_ident, Predicate, SqlFragment};
pub use text::canonical_text;

/// Request keys that carry filter options rather than column selections
pub const RESERVED_KEYS: [&str; 4] = ["start_date", "end_date", "freq", "metric"];

/// Layouts tried, in order, when a date is not strict `%Y-%m-%d`
const FALLBACK_DATE_FORMATS: [&str; 6] = ["%Y/%m/%d", "%d-%b-%y", "%d-%b-%Y", "%m/%d/%Y", "%d.%m.%Y", "%Y%m%d"];
const FALLBACK_DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Multi-valued raw filter arguments, as they arrive from a query string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterArgs {
    pairs: Vec<(String, String)>,
}

impl FilterArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// First value for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Every value for a key, in arrival order
    pub fn get_list(&self, key: &str) -> Vec<&str> {
        self.pairs.iter().filter(|(k, _)| k == key).map(|(_, v)| v.as_str()).collect()
    }

    /// Distinct keys in first-seen order
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for (k, _) in &self.pairs {
            if !keys.contains(&k.as_str()) {
                keys.push(k);
            }
        }
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FilterArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Time granularity for bucketed aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Parse `D`/`W`/`M` (or `day`/`week`/`month`); anything else is daily
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|r| r.trim().to_ascii_uppercase()).as_deref() {
            Some("W") | Some("WEEK") => Granularity::Week,
            Some("M") | Some("MONTH") => Granularity::Month,
            _ => Granularity::Day,
        }
    }

    /// DuckDB `date_trunc` unit
    pub fn bucketing_unit(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Granularity::Day => "D",
            Granularity::Week => "W",
            Granularity::Month => "M",
        }
    }

    /// Chart label for a bucket start
    pub fn label(&self, bucket: NaiveDate) -> String {
        match self {
            Granularity::Month => bucket.format("%Y-%m").to_string(),
            _ => bucket.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Parse a user-supplied date: strict ISO first, then a list of common layouts
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    for format in FALLBACK_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    for format in FALLBACK_DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts.date());
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.date_naive());
    }
    debug!("Unparsable date filter value: {:?}", value);
    None
}

/// What the user currently wants to see.
///
/// Immutable once built: every `with_*` method returns a new value. Selection
/// sets are never empty; an empty set is the same as no filter on that column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterSpec {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    selections: BTreeMap<String, BTreeSet<String>>,
    granularity: Granularity,
    measure: Option<String>,
}

impl FilterSpec {
    /// A spec with no filters
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) -> Option<NaiveDate> {
        self.start
    }

    pub fn end(&self) -> Option<NaiveDate> {
        self.end
    }

    pub fn selections(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.selections
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Raw measure key as requested, unvalidated
    pub fn measure(&self) -> Option<&str> {
        self.measure.as_deref()
    }

    /// Measure keys from a comma-separated request, trimmed, empties dropped
    pub fn measures(&self) -> Vec<&str> {
        self.measure
            .as_deref()
            .map(|m| m.split(',').map(str::trim).filter(|k| !k.is_empty()).collect())
            .unwrap_or_default()
    }

    pub fn bucketing_unit(&self) -> &'static str {
        self.granularity.bucketing_unit()
    }

    pub fn with_range(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Add a selection; values are stringified and an empty set removes the column
    pub fn with_selection<I, S>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let set: BTreeSet<String> = values
            .into_iter()
            .map(|v| v.to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if set.is_empty() {
            self.selections.remove(column);
        } else {
            self.selections.insert(column.to_string(), set);
        }
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_measure(mut self, measure: Option<&str>) -> Self {
        self.measure = measure.map(str::trim).filter(|m| !m.is_empty()).map(String::from);
        self
    }

    /// Same spec without a selection on `column`
    pub fn without_selection(mut self, column: &str) -> Self {
        self.selections.remove(column);
        self
    }

    /// Canonical predicate over the given schema.
    ///
    /// Selections on columns missing from `known_columns` are dropped, as is
    /// the date range when the date column is missing.
    pub fn predicate<S: AsRef<str>>(&self, date_column: &str, known_columns: &[S]) -> Predicate {
        let known = |c: &str| known_columns.iter().any(|k| k.as_ref() == c);
        let mut clauses = Vec::with_capacity(self.selections.len() + 1);

        for (column, values) in &self.selections {
            if known(column) {
                clauses.push(Predicate::Member {
                    column: column.clone(),
                    values: values.iter().cloned().collect(),
                });
            } else {
                debug!("Dropping selection on unknown column '{}'", column);
            }
        }

        if (self.start.is_some() || self.end.is_some()) && known(date_column) {
            clauses.push(Predicate::Range {
                column: date_column.to_string(),
                start: self.start,
                end: self.end,
            });
        }

        Predicate::and(clauses)
    }

    /// In-memory projection: filter a loaded frame
    pub fn apply_in_memory(&self, df: &DataFrame, date_column: &str) -> PolarsResult<DataFrame> {
        let columns = df.get_column_names();
        self.predicate(date_column, &columns).apply(df)
    }

    /// Query projection: parameterized WHERE expression for the warehouse
    pub fn to_query_predicate<S: AsRef<str>>(&self, date_column: &str, known_columns: &[S]) -> SqlFragment {
        self.predicate(date_column, known_columns).to_sql()
    }

    /// True when this spec shows the whole dataset: no selections and a date
    /// range that is absent or equal to the dataset's own bounds
    pub fn is_neutral(&self, base_min: Option<NaiveDate>, base_max: Option<NaiveDate>) -> bool {
        if !self.selections.is_empty() {
            return false;
        }
        let start_neutral = self.start.is_none() || self.start == base_min;
        let end_neutral = self.end.is_none() || self.end == base_max;
        start_neutral && end_neutral
    }
}

/// Validating builder: resolves request keys against a discovered schema
pub struct FilterSpecBuilder<'a> {
    schema: Vec<&'a str>,
    exclude: &'a BTreeSet<String>,
    spec: FilterSpec,
}

impl<'a> FilterSpecBuilder<'a> {
    pub fn new<S: AsRef<str>>(schema: &'a [S], exclude: &'a BTreeSet<String>) -> Self {
        Self {
            schema: schema.iter().map(|c| c.as_ref()).collect(),
            exclude,
            spec: FilterSpec::default(),
        }
    }

    /// Map a request key onto a filterable column: exact match first, then
    /// the first column equal ignoring ASCII case
    pub fn resolve(&self, key: &str) -> Option<&'a str> {
        let column = self
            .schema
            .iter()
            .find(|c| **c == key)
            .or_else(|| self.schema.iter().find(|c| c.eq_ignore_ascii_case(key)))
            .copied()?;
        (!self.exclude.contains(column)).then_some(column)
    }

    /// Add values for a request key; unknown or excluded keys are ignored and
    /// values for keys resolving to the same column are merged
    pub fn select<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let Some(column) = self.resolve(key) else {
            debug!("Ignoring filter on unknown or excluded column '{}'", key);
            return self;
        };
        let mut merged: BTreeSet<String> = self.spec.selections.get(column).cloned().unwrap_or_default();
        merged.extend(values.into_iter().map(|v| v.to_string()));
        self.spec = self.spec.with_selection(column, merged);
        self
    }

    pub fn range(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.spec = self.spec.with_range(start, end);
        self
    }

    pub fn granularity(mut self, granularity: Granularity) -> Self {
        self.spec = self.spec.with_granularity(granularity);
        self
    }

    pub fn measure(mut self, measure: Option<&str>) -> Self {
        self.spec = self.spec.with_measure(measure);
        self
    }

    /// Consume raw request arguments
    pub fn args(mut self, args: &FilterArgs) -> Self {
        for key in args.keys() {
            if RESERVED_KEYS.contains(&key) {
                continue;
            }
            let values = args.get_list(key);
            self = self.select(key, values);
        }
        self.range(
            args.get("start_date").and_then(parse_date),
            args.get("end_date").and_then(parse_date),
        )
        .granularity(Granularity::parse(args.get("freq")))
        .measure(args.get("metric"))
    }

    pub fn build(self) -> FilterSpec {
        self.spec
    }
}

impl FilterSpec {
    /// Build a spec from raw arguments against the current schema
    pub fn from_args<S: AsRef<str>>(args: &FilterArgs, schema: &[S], exclude: &BTreeSet<String>) -> Self {
        FilterSpecBuilder::new(schema, exclude).args(args).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn schema() -> Vec<String> {
        ["chargedate", "MeterID", "loc", "res_mapped", "kwh"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn exclude() -> BTreeSet<String> {
        ["chargedate", "kwh"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_date_strict_and_fallback() {
        assert_eq!(parse_date("2024-01-05"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date("05-Jan-24"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date("2024/01/05"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date("2024-01-05T10:30:00"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date("2024-01-05T10:30:00+02:00"), Some(d(2024, 1, 5)));
        assert_eq!(parse_date("yesterday"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn test_granularity_parse() {
        assert_eq!(Granularity::parse(Some("w")), Granularity::Week);
        assert_eq!(Granularity::parse(Some("M")), Granularity::Month);
        assert_eq!(Granularity::parse(Some("month")), Granularity::Month);
        assert_eq!(Granularity::parse(Some("Y")), Granularity::Day);
        assert_eq!(Granularity::parse(None), Granularity::Day);
        assert_eq!(Granularity::Week.bucketing_unit(), "week");
        assert_eq!(Granularity::Month.label(d(2024, 3, 1)), "2024-03");
        assert_eq!(Granularity::Week.label(d(2024, 3, 4)), "2024-03-04");
    }

    #[test]
    fn test_from_args_resolves_case_insensitively() {
        let schema = schema();
        let exclude = exclude();
        let upper: FilterArgs = [("MeterID", "7")].into_iter().collect();
        let lower: FilterArgs = [("meterid", "7")].into_iter().collect();

        let a = FilterSpec::from_args(&upper, &schema, &exclude);
        let b = FilterSpec::from_args(&lower, &schema, &exclude);
        assert_eq!(a, b);
        assert!(a.selections().contains_key("MeterID"));
    }

    #[test]
    fn test_from_args_merges_case_variants() {
        let schema = schema();
        let exclude = exclude();
        let args: FilterArgs = [("meterid", "1"), ("METERID", "2"), ("MeterID", "3")].into_iter().collect();
        let spec = FilterSpec::from_args(&args, &schema, &exclude);
        let values: Vec<&str> = spec.selections()["MeterID"].iter().map(String::as_str).collect();
        assert_eq!(values, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_from_args_drops_unknown_excluded_and_empty() {
        let schema = schema();
        let exclude = exclude();
        let args: FilterArgs = [
            ("bogus", "1"),
            ("kwh", "12"),
            ("loc", ""),
            ("res_mapped", "Commercial"),
            ("start_date", "2024-01-01"),
            ("end_date", "not a date"),
            ("freq", "w"),
            ("metric", "kwh"),
        ]
        .into_iter()
        .collect();
        let spec = FilterSpec::from_args(&args, &schema, &exclude);

        assert_eq!(spec.selections().len(), 1);
        assert!(spec.selections().contains_key("res_mapped"));
        assert_eq!(spec.start(), Some(d(2024, 1, 1)));
        assert_eq!(spec.end(), None);
        assert_eq!(spec.granularity(), Granularity::Week);
        assert_eq!(spec.measure(), Some("kwh"));
    }

    #[test]
    fn test_empty_selection_is_neutral() {
        let empty: Vec<String> = Vec::new();
        let with_empty = FilterSpec::new().with_selection("loc", empty);
        assert_eq!(with_empty, FilterSpec::new());
        assert!(with_empty.predicate("chargedate", &schema()).is_true());
        assert_eq!(
            with_empty.to_query_predicate("chargedate", &schema()),
            SqlFragment::tautology()
        );
    }

    #[test]
    fn test_predicate_skips_unknown_columns() {
        let spec = FilterSpec::new()
            .with_selection("loc", ["Accra"])
            .with_selection("gone", ["x"])
            .with_range(Some(d(2024, 1, 1)), None);
        let frag = spec.to_query_predicate("chargedate", &["loc"]);
        assert_eq!(frag.sql, "CAST(\"loc\" AS VARCHAR) IN (?)");
        assert_eq!(frag.params, vec!["Accra"]);
    }

    #[test]
    fn test_measures_split() {
        let spec = FilterSpec::new().with_measure(Some("kwh, paymoney,,"));
        assert_eq!(spec.measures(), vec!["kwh", "paymoney"]);
        assert!(FilterSpec::new().with_measure(Some("  ")).measure().is_none());
    }

    #[test]
    fn test_is_neutral() {
        let lo = Some(d(2024, 1, 1));
        let hi = Some(d(2024, 12, 31));
        assert!(FilterSpec::new().is_neutral(lo, hi));
        assert!(FilterSpec::new().with_range(lo, hi).is_neutral(lo, hi));
        assert!(!FilterSpec::new().with_range(Some(d(2024, 2, 1)), None).is_neutral(lo, hi));
        assert!(!FilterSpec::new().with_selection("loc", ["Accra"]).is_neutral(lo, hi));
    }

    #[test]
    fn test_apply_in_memory_case_variants_match() {
        let df = DataFrame::new(vec![
            Series::new("MeterID", &[1i64, 2, 3]),
            Series::new("loc", &["a", "b", "c"]),
        ])
        .unwrap();
        let schema: Vec<&str> = df.get_column_names();
        let exclude = BTreeSet::new();
        let upper = FilterSpec::from_args(&[("MeterID", "2")].into_iter().collect(), &schema, &exclude);
        let lower = FilterSpec::from_args(&[("meterid", "2")].into_iter().collect(), &schema, &exclude);

        let a = upper.apply_in_memory(&df, "chargedate").unwrap();
        let b = lower.apply_in_memory(&df, "chargedate").unwrap();
        assert_eq!(a.height(), 1);
        assert_eq!(b.height(), 1);
        let id = |f: &DataFrame| f.column("MeterID").unwrap().i64().unwrap().get(0);
        assert_eq!(id(&a), Some(2));
        assert_eq!(id(&a), id(&b));
    }
}
