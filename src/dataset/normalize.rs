use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::filter::predicate::days_since_epoch;
use crate::metrics::MetricRegistry;

/// Label for category codes missing from the mapping table
pub const UNKNOWN_CATEGORY: &str = "Unknown";

/// One-time cleanup applied to every freshly acquired table.
///
/// Running it on its own output changes nothing.
#[derive(Debug, Clone)]
pub struct Normalizer {
    date_column: String,
    date_format: String,
    category_source: String,
    category_column: String,
    category_map: BTreeMap<String, String>,
    measures: Vec<String>,
}

impl Normalizer {
    pub fn new(config: &EngineConfig, registry: &MetricRegistry) -> Self {
        Self {
            date_column: config.date_col.clone(),
            date_format: config.date_format.clone(),
            category_source: config.category_source_column.clone(),
            category_column: config.category_column.clone(),
            category_map: config.res_map.clone(),
            measures: registry.keys().map(String::from).collect(),
        }
    }

    pub fn normalize(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        if df.width() == 0 {
            return Ok(df);
        }
        let raw_rows = df.height();
        let mut df = df;

        self.derive_category(&mut df)?;
        self.coerce_dates(&mut df)?;
        self.coerce_timestamps(&mut df)?;
        self.coerce_measures(&mut df)?;

        let df = drop_incomplete_rows(&df)?;
        let df = df.unique_stable(None, UniqueKeepStrategy::First, None)?;

        debug!(
            "Normalized table: {} -> {} rows, {} columns",
            raw_rows,
            df.height(),
            df.width()
        );
        Ok(df)
    }

    fn derive_category(&self, df: &mut DataFrame) -> PolarsResult<()> {
        if self.category_map.is_empty() {
            return Ok(());
        }
        let Ok(source) = df.column(&self.category_source) else {
            return Ok(());
        };
        let codes = source.cast(&DataType::String)?;
        let mapped: Vec<&str> = codes
            .str()?
            .into_iter()
            .map(|code| {
                code.and_then(|c| self.category_map.get(c))
                    .map(String::as_str)
                    .unwrap_or(UNKNOWN_CATEGORY)
            })
            .collect();
        df.with_column(Series::new(&self.category_column, mapped))?;
        Ok(())
    }

    fn coerce_dates(&self, df: &mut DataFrame) -> PolarsResult<()> {
        let Ok(column) = df.column(&self.date_column) else {
            return Ok(());
        };
        let parsed = match column.dtype() {
            DataType::Date => return Ok(()),
            DataType::Datetime(_, _) => column.cast(&DataType::Date)?,
            _ => {
                let text = column.cast(&DataType::String)?;
                let days: Vec<Option<i32>> = text
                    .str()?
                    .into_iter()
                    .map(|v| v.and_then(|v| parse_source_date(v, &self.date_format)).map(days_since_epoch))
                    .collect();
                let unparsed = days.iter().filter(|d| d.is_none()).count();
                if unparsed > 0 {
                    warn!(
                        "{} of {} values in '{}' did not match date format {}",
                        unparsed,
                        days.len(),
                        self.date_column,
                        self.date_format
                    );
                }
                Series::new(&self.date_column, days).cast(&DataType::Date)?
            }
        };
        df.with_column(parsed)?;
        Ok(())
    }

    /// Other datetime columns become naive microsecond timestamps, the
    /// precision the warehouse stores and prints
    fn coerce_timestamps(&self, df: &mut DataFrame) -> PolarsResult<()> {
        let target = DataType::Datetime(TimeUnit::Microseconds, None);
        let pending: Vec<String> = df
            .get_columns()
            .iter()
            .filter(|s| s.name() != self.date_column)
            .filter(|s| matches!(s.dtype(), DataType::Datetime(_, _)) && s.dtype() != &target)
            .map(|s| s.name().to_string())
            .collect();
        for name in pending {
            let cast = df.column(&name)?.cast(&target)?;
            df.with_column(cast)?;
        }
        Ok(())
    }

    fn coerce_measures(&self, df: &mut DataFrame) -> PolarsResult<()> {
        for measure in &self.measures {
            let Ok(column) = df.column(measure) else {
                continue;
            };
            if column.dtype() == &DataType::Float64 {
                continue;
            }
            let numeric = column.cast(&DataType::Float64)?;
            if numeric.null_count() == numeric.len() && !numeric.is_empty() {
                warn!("Measure '{}' has no numeric values; excluding it from statistics", measure);
            }
            df.with_column(numeric)?;
        }
        Ok(())
    }
}

/// Parse one raw date with the configured format; values carrying a time of
/// day are truncated to the date
pub fn parse_source_date(raw: &str, format: &str) -> Option<NaiveDate> {
    let value = raw.trim();
    NaiveDate::parse_from_str(value, format)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(value, format).ok().map(|ts| ts.date()))
}

/// Drop rows with a missing value. Columns that are missing everywhere are
/// left out of the check so a single unusable column cannot empty the table.
fn drop_incomplete_rows(df: &DataFrame) -> PolarsResult<DataFrame> {
    if df.height() == 0 {
        return Ok(df.clone());
    }
    let subset: Vec<String> = df
        .get_columns()
        .iter()
        .filter(|s| s.null_count() < s.len())
        .map(|s| s.name().to_string())
        .collect();
    if subset.is_empty() {
        return Ok(df.clone());
    }
    df.drop_nulls(Some(subset.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::predicate::date_from_epoch_days;
    use crate::metrics::MetricEntry;

    fn normalizer() -> Normalizer {
        let config = EngineConfig::default();
        let registry = MetricRegistry::new(config.metrics.clone());
        Normalizer::new(&config, &registry)
    }

    fn raw() -> DataFrame {
        DataFrame::new(vec![
            Series::new("chargedate", &["05-Jan-24", "05-Jan-24", "06-Jan-24", "bogus", "07-Jan-24", "08-Jan-24"]),
            Series::new("meterid", &[1i64, 1, 2, 3, 4, 5]),
            Series::new("res", &["Resid [1]", "Resid [1]", "N-Resid [0]", "Resid [1]", "Other [9]", "Resid [1]"]),
            Series::new("kwh", &[Some("1.5"), Some("1.5"), Some("2"), Some("3"), Some("x"), None]),
        ])
        .unwrap()
    }

    #[test]
    fn test_normalize_cleans_and_derives() {
        let df = normalizer().normalize(raw()).unwrap();

        // duplicate row, unparsable date, unparsable measure and missing measure are gone
        assert_eq!(df.height(), 2);
        assert_eq!(df.column("chargedate").unwrap().dtype(), &DataType::Date);
        assert_eq!(df.column("kwh").unwrap().dtype(), &DataType::Float64);

        let mapped: Vec<Option<&str>> = df.column("res_mapped").unwrap().str().unwrap().into_iter().collect();
        assert_eq!(mapped, vec![Some("Residential"), Some("Commercial")]);

        let days = df.column("chargedate").unwrap().cast(&DataType::Int32).unwrap();
        let first = days.i32().unwrap().get(0).and_then(date_from_epoch_days);
        assert_eq!(first, NaiveDate::from_ymd_opt(2024, 1, 5));
    }

    #[test]
    fn test_unmapped_codes_become_unknown() {
        let df = DataFrame::new(vec![
            Series::new("res", &["Other [9]", "Resid [1]"]),
            Series::new("meterid", &[1i64, 2]),
        ])
        .unwrap();
        let df = normalizer().normalize(df).unwrap();
        let mapped: Vec<Option<&str>> = df.column("res_mapped").unwrap().str().unwrap().into_iter().collect();
        assert_eq!(mapped, vec![Some(UNKNOWN_CATEGORY), Some("Residential")]);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let n = normalizer();
        let once = n.normalize(raw()).unwrap();
        let twice = n.normalize(once.clone()).unwrap();

        assert_eq!(once.shape(), twice.shape());
        assert_eq!(once.get_column_names(), twice.get_column_names());
        for (a, b) in once.get_columns().iter().zip(twice.get_columns()) {
            assert_eq!(a.dtype(), b.dtype());
            let a: Vec<String> = a.cast(&DataType::String).unwrap().str().unwrap().into_iter().map(|v| format!("{:?}", v)).collect();
            let b: Vec<String> = b.cast(&DataType::String).unwrap().str().unwrap().into_iter().map(|v| format!("{:?}", v)).collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_all_missing_measure_does_not_empty_table() {
        let config = EngineConfig::default();
        let registry = MetricRegistry::new(vec![MetricEntry::new("ghc", "GHC")]);
        let n = Normalizer::new(&config, &registry);
        let df = DataFrame::new(vec![
            Series::new("meterid", &[1i64, 2, 3]),
            Series::new("ghc", &["n/a", "n/a", "-"]),
        ])
        .unwrap();
        let df = n.normalize(df).unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(df.column("ghc").unwrap().null_count(), 3);
    }

    #[test]
    fn test_datetime_column_truncated_to_date() {
        let ts = Series::new("chargedate", &[86_400_000i64 + 3_600_000, 2 * 86_400_000])
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .unwrap();
        let df = DataFrame::new(vec![ts, Series::new("meterid", &[1i64, 2])]).unwrap();
        let df = normalizer().normalize(df).unwrap();
        let days = df.column("chargedate").unwrap().cast(&DataType::Int32).unwrap();
        let days: Vec<Option<i32>> = days.i32().unwrap().into_iter().collect();
        assert_eq!(days, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_other_timestamps_become_naive_microseconds() {
        let billed = Series::new("billed_at", &[1_704_067_200_500i64, 1_704_067_201_000])
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .unwrap();
        let df = DataFrame::new(vec![billed, Series::new("meterid", &[1i64, 2])]).unwrap();
        let n = normalizer();
        let once = n.normalize(df).unwrap();
        let column = once.column("billed_at").unwrap();
        assert_eq!(column.dtype(), &DataType::Datetime(TimeUnit::Microseconds, None));
        let ticks: Vec<Option<i64>> = column.cast(&DataType::Int64).unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(ticks, vec![Some(1_704_067_200_500_000), Some(1_704_067_201_000_000)]);

        let twice = n.normalize(once.clone()).unwrap();
        assert_eq!(twice.column("billed_at").unwrap().dtype(), column.dtype());
    }

    #[test]
    fn test_parse_source_date_formats() {
        assert_eq!(parse_source_date("05-Jan-24", "%d-%b-%y"), NaiveDate::from_ymd_opt(2024, 1, 5));
        assert_eq!(parse_source_date(" 2024-01-05 ", "%Y-%m-%d"), NaiveDate::from_ymd_opt(2024, 1, 5));
        assert_eq!(
            parse_source_date("2024-01-05 10:00", "%Y-%m-%d %H:%M"),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(parse_source_date("2024-01-05", "%d-%b-%y"), None);
    }

    #[test]
    fn test_empty_frame_passes_through() {
        let df = normalizer().normalize(DataFrame::empty()).unwrap();
        assert_eq!(df.shape(), (0, 0));
    }
}
