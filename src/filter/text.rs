use chrono::{Duration, NaiveDateTime, Timelike};
use polars::prelude::*;

/// Render a column as the text DuckDB produces for `CAST(col AS VARCHAR)`.
///
/// Membership clauses compare this text on the in-memory path, so it has to
/// match the warehouse byte for byte. Polars agrees with DuckDB for strings,
/// integers, booleans and dates; floats and datetimes are formatted here.
pub fn canonical_text(series: &Series) -> PolarsResult<Series> {
    let text: StringChunked = match series.dtype() {
        DataType::Float64 => series.f64()?.into_iter().map(|v| v.map(float_text)).collect(),
        DataType::Float32 => series.f32()?.into_iter().map(|v| v.map(float32_text)).collect(),
        DataType::Datetime(unit, _) => {
            let unit = *unit;
            let ticks = series.cast(&DataType::Int64)?;
            let out: StringChunked = ticks
                .i64()?
                .into_iter()
                .map(|v| v.and_then(|t| datetime_from_ticks(t, unit)).map(|ts| datetime_text(&ts)))
                .collect();
            out
        }
        _ => return series.cast(&DataType::String),
    };
    Ok(text.with_name(series.name()).into_series())
}

fn datetime_from_ticks(ticks: i64, unit: TimeUnit) -> Option<NaiveDateTime> {
    let offset = match unit {
        TimeUnit::Nanoseconds => Duration::nanoseconds(ticks),
        TimeUnit::Microseconds => Duration::microseconds(ticks),
        TimeUnit::Milliseconds => Duration::milliseconds(ticks),
    };
    NaiveDateTime::default().checked_add_signed(offset)
}

/// `YYYY-MM-DD HH:MM:SS`, plus the microseconds with trailing zeros trimmed
/// when they are not zero
pub fn datetime_text(ts: &NaiveDateTime) -> String {
    let mut out = ts.format("%Y-%m-%d %H:%M:%S").to_string();
    let micros = ts.nanosecond() / 1_000 % 1_000_000;
    if micros > 0 {
        let fraction = format!("{:06}", micros);
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }
    out
}

pub fn float_text(value: f64) -> String {
    if !value.is_finite() {
        return non_finite_text(value.is_nan(), value.is_sign_negative());
    }
    shortest_to_text(&format!("{:e}", value))
}

pub fn float32_text(value: f32) -> String {
    if !value.is_finite() {
        return non_finite_text(value.is_nan(), value.is_sign_negative());
    }
    shortest_to_text(&format!("{:e}", value))
}

fn non_finite_text(nan: bool, negative: bool) -> String {
    match (nan, negative) {
        (true, _) => "nan".to_string(),
        (false, true) => "-inf".to_string(),
        (false, false) => "inf".to_string(),
    }
}

/// Lay out shortest round-trip digits (`1.5e20`, `-3e-7`) the way DuckDB
/// does: positional with a `.0` floor for decimal exponents in `-4..16`,
/// otherwise `1.5e+20` with a signed, two-digit-minimum exponent.
fn shortest_to_text(scientific: &str) -> String {
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };

    if !(-4..16).contains(&exponent) {
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}{}e{}{:02}", sign, mantissa, exp_sign, exponent.abs());
    }

    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let point = exponent + 1;
    let body = if point <= 0 {
        format!("0.{}{}", "0".repeat(point.unsigned_abs() as usize), digits)
    } else if point as usize >= digits.len() {
        format!("{}{}.0", digits, "0".repeat(point as usize - digits.len()))
    } else {
        let (whole, fraction) = digits.split_at(point as usize);
        format!("{}.{}", whole, fraction)
    };
    format!("{}{}", sign, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_float_text_positional_range() {
        assert_eq!(float_text(1.0), "1.0");
        assert_eq!(float_text(0.0), "0.0");
        assert_eq!(float_text(-0.0), "-0.0");
        assert_eq!(float_text(5.5), "5.5");
        assert_eq!(float_text(0.1), "0.1");
        assert_eq!(float_text(-123.25), "-123.25");
        assert_eq!(float_text(0.0001), "0.0001");
        assert_eq!(float_text(1e15), "1000000000000000.0");
    }

    #[test]
    fn test_float_text_exponent_range() {
        assert_eq!(float_text(1e16), "1e+16");
        assert_eq!(float_text(1.5e20), "1.5e+20");
        assert_eq!(float_text(0.00001), "1e-05");
        assert_eq!(float_text(-2.5e-7), "-2.5e-07");
        assert_eq!(float_text(1e100), "1e+100");
        assert_eq!(float_text(f64::NAN), "nan");
        assert_eq!(float_text(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn test_float32_uses_single_precision_digits() {
        assert_eq!(float32_text(0.1f32), "0.1");
        assert_eq!(float32_text(2.5f32), "2.5");
    }

    #[test]
    fn test_datetime_text_trims_fraction() {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(datetime_text(&base.and_hms_opt(0, 0, 0).unwrap()), "2024-01-01 00:00:00");
        assert_eq!(
            datetime_text(&base.and_hms_milli_opt(10, 5, 7, 500).unwrap()),
            "2024-01-01 10:05:07.5"
        );
        assert_eq!(
            datetime_text(&base.and_hms_micro_opt(0, 0, 1, 120).unwrap()),
            "2024-01-01 00:00:01.00012"
        );
    }

    #[test]
    fn test_canonical_text_by_dtype() {
        let ts = Series::new("billed_at", &[1_704_067_200_000i64, 1_704_067_200_250])
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .unwrap();
        let text = canonical_text(&ts).unwrap();
        let values: Vec<Option<&str>> = text.str().unwrap().into_iter().collect();
        assert_eq!(values, vec![Some("2024-01-01 00:00:00"), Some("2024-01-01 00:00:00.25")]);
        assert_eq!(text.name(), "billed_at");

        let floats = Series::new("lat", &[Some(1e16f64), None, Some(2.0)]);
        let text = canonical_text(&floats).unwrap();
        let values: Vec<Option<&str>> = text.str().unwrap().into_iter().collect();
        assert_eq!(values, vec![Some("1e+16"), None, Some("2.0")]);

        let ints = Series::new("meterid", &[7i64]);
        assert_eq!(canonical_text(&ints).unwrap().str().unwrap().get(0), Some("7"));
    }
}
