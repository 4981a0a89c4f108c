use chrono::{Duration, NaiveDate};
use polars::prelude::*;
use std::collections::HashSet;

use super::text::canonical_text;

/// Canonical description of a row filter.
///
/// Both execution paths are compiled from this one tree: [`Predicate::mask`]
/// evaluates it against an in-memory frame and [`Predicate::to_sql`] renders
/// a parameterized DuckDB expression. Keeping a single tree is what makes the
/// two paths select the same rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Matches every row
    True,
    /// Inclusive date range on a column; a `None` bound is open
    Range {
        column: String,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
    /// Row's value, rendered as DuckDB renders it as VARCHAR, is one of `values`
    Member { column: String, values: Vec<String> },
    And(Vec<Predicate>),
}

/// A SQL boolean expression with positional `?` placeholders and their values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<String>,
}

impl SqlFragment {
    pub fn tautology() -> Self {
        Self {
            sql: "1=1".to_string(),
            params: Vec::new(),
        }
    }

    /// AND an extra, parameter-free condition onto the fragment
    pub fn and_raw(mut self, condition: &str) -> Self {
        self.sql = format!("({}) AND {}", self.sql, condition);
        self
    }
}

impl Predicate {
    /// Build a conjunction, flattening nested ANDs and dropping `True` clauses
    pub fn and(clauses: Vec<Predicate>) -> Predicate {
        let mut flat = Vec::with_capacity(clauses.len());
        for clause in clauses {
            match clause {
                Predicate::True => {}
                Predicate::And(inner) => match Predicate::and(inner) {
                    Predicate::True => {}
                    Predicate::And(items) => flat.extend(items),
                    other => flat.push(other),
                },
                Predicate::Range { start: None, end: None, .. } => {}
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::True,
            1 => flat.remove(0),
            _ => Predicate::And(flat),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Predicate::True)
    }

    /// Render as a DuckDB boolean expression. Values only ever travel as
    /// parameters; identifiers are double-quoted.
    pub fn to_sql(&self) -> SqlFragment {
        let mut params = Vec::new();
        let sql = self.render_sql(&mut params);
        SqlFragment { sql, params }
    }

    fn render_sql(&self, params: &mut Vec<String>) -> String {
        match self {
            Predicate::True => "1=1".to_string(),
            Predicate::Range { column, start, end } => {
                let col = format!("CAST({} AS DATE)", quote_ident(column));
                match (start, end) {
                    (Some(s), Some(e)) => {
                        params.push(s.format("%Y-%m-%d").to_string());
                        params.push(e.format("%Y-%m-%d").to_string());
                        format!("{} BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)", col)
                    }
                    (Some(s), None) => {
                        params.push(s.format("%Y-%m-%d").to_string());
                        format!("{} >= CAST(? AS DATE)", col)
                    }
                    (None, Some(e)) => {
                        params.push(e.format("%Y-%m-%d").to_string());
                        format!("{} <= CAST(? AS DATE)", col)
                    }
                    (None, None) => "1=1".to_string(),
                }
            }
            Predicate::Member { column, values } => {
                if values.is_empty() {
                    return "1=0".to_string();
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                params.extend(values.iter().cloned());
                format!("CAST({} AS VARCHAR) IN ({})", quote_ident(column), placeholders)
            }
            Predicate::And(clauses) => {
                if clauses.is_empty() {
                    return "1=1".to_string();
                }
                clauses
                    .iter()
                    .map(|c| match c {
                        Predicate::And(_) => format!("({})", c.render_sql(params)),
                        _ => c.render_sql(params),
                    })
                    .collect::<Vec<_>>()
                    .join(" AND ")
            }
        }
    }

    /// Evaluate against a frame, one bool per row.
    ///
    /// Clauses on columns the frame does not have are treated as satisfied,
    /// mirroring the SQL side where such clauses are never emitted.
    pub fn mask(&self, df: &DataFrame) -> PolarsResult<Vec<bool>> {
        let mut mask = vec![true; df.height()];
        self.narrow(df, &mut mask)?;
        Ok(mask)
    }

    fn narrow(&self, df: &DataFrame, mask: &mut [bool]) -> PolarsResult<()> {
        match self {
            Predicate::True => {}
            Predicate::Range { column, start, end } => {
                let Ok(series) = df.column(column) else {
                    return Ok(());
                };
                let days = series.cast(&DataType::Date)?.cast(&DataType::Int32)?;
                let lo = start.map(days_since_epoch);
                let hi = end.map(days_since_epoch);
                for (keep, value) in mask.iter_mut().zip(days.i32()?.into_iter()) {
                    *keep &= match value {
                        Some(d) => lo.map_or(true, |lo| d >= lo) && hi.map_or(true, |hi| d <= hi),
                        None => false,
                    };
                }
            }
            Predicate::Member { column, values } => {
                let Ok(series) = df.column(column) else {
                    return Ok(());
                };
                let allowed: HashSet<&str> = values.iter().map(String::as_str).collect();
                let as_text = canonical_text(series)?;
                for (keep, value) in mask.iter_mut().zip(as_text.str()?.into_iter()) {
                    *keep &= value.map_or(false, |v| allowed.contains(v));
                }
            }
            Predicate::And(clauses) => {
                for clause in clauses {
                    clause.narrow(df, mask)?;
                }
            }
        }
        Ok(())
    }

    /// Filter a frame; `True` returns a cheap clone
    pub fn apply(&self, df: &DataFrame) -> PolarsResult<DataFrame> {
        if self.is_true() {
            return Ok(df.clone());
        }
        let mask = self.mask(df)?;
        df.filter(&BooleanChunked::new("mask", mask.as_slice()))
    }
}

/// Double-quote a SQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Polars stores dates as days since the Unix epoch
pub fn days_since_epoch(date: NaiveDate) -> i32 {
    date.signed_duration_since(NaiveDate::default()).num_days() as i32
}

pub fn date_from_epoch_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::default().checked_add_signed(Duration::days(i64::from(days)))
}
