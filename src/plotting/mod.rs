use textplots::{Chart, Plot, Shape};

use crate::dataset::{ChartSeries, TimeSeries};

const DEFAULT_WIDTH: usize = 80;
const DEFAULT_HEIGHT: usize = 20;

/// ASCII rendering of dashboard charts
pub struct ChartPlotter {
    width: usize,
    height: usize,
}

impl Default for ChartPlotter {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl ChartPlotter {
    pub fn new(width: Option<usize>, height: Option<usize>) -> Self {
        Self {
            width: width.unwrap_or(DEFAULT_WIDTH).clamp(32, 240),
            height: height.unwrap_or(DEFAULT_HEIGHT).clamp(8, 80),
        }
    }

    /// Plot every measure of a bucketed series, one chart per measure.
    ///
    /// The x axis is the bucket index so sparse periods stay evenly spaced;
    /// the first and last bucket labels are printed underneath.
    pub fn plot_time_series(&self, ts: &TimeSeries) -> String {
        if ts.labels.is_empty() || ts.series.is_empty() {
            return "📊 No data available for the current filters".to_string();
        }

        let mut output = String::new();
        for series in &ts.series {
            let (min_val, max_val, avg_val) = summarize(&series.values);
            output.push_str(&format!("📊 {} by {:?} ({})\n", series.label, ts.granularity, ts.date_col));
            output.push_str(&format!(
                "📈 Buckets: {} | Min: {:.2} | Max: {:.2} | Avg: {:.2}\n",
                series.values.len(),
                min_val,
                max_val,
                avg_val
            ));
            output.push_str(&"─".repeat(self.width));
            output.push('\n');

            let points: Vec<(f32, f32)> = series
                .values
                .iter()
                .enumerate()
                .map(|(i, v)| (i as f32, *v as f32))
                .collect();
            // textplots needs a non-empty x range
            let x_max = (points.len().max(2) - 1) as f32;
            let chart = if points.len() == 1 {
                Chart::new(self.width as u32, self.height as u32, 0.0, x_max)
                    .lineplot(&Shape::Points(&points))
                    .to_string()
            } else {
                Chart::new(self.width as u32, self.height as u32, 0.0, x_max)
                    .lineplot(&Shape::Lines(&points))
                    .to_string()
            };
            output.push_str(&chart);
            output.push('\n');
            output.push_str(&self.axis_markers(&ts.labels));
            output.push_str(&"─".repeat(self.width));
            output.push('\n');
        }
        output
    }

    /// Horizontal bar listing of a segment breakdown, largest first
    pub fn plot_segments(&self, chart: &ChartSeries) -> String {
        if chart.labels.is_empty() {
            return format!("📊 No data available for '{}'", chart.metric_label);
        }

        let segment = chart.segment.as_deref().unwrap_or("segment");
        let total: f64 = chart.values.iter().sum();
        let max_val = chart.values.iter().cloned().fold(0.0_f64, f64::max);
        let label_width = chart.labels.iter().map(|l| l.chars().count()).max().unwrap_or(0).min(24);
        let bar_room = self.width.saturating_sub(label_width + 24).max(10);

        let mut output = format!("📊 {} by {}\n", chart.metric_label, segment);
        output.push_str(&"─".repeat(self.width));
        output.push('\n');

        let bars: Vec<(f32, f32)> = chart
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| (i as f32, *v as f32))
            .collect();
        if bars.len() > 1 {
            output.push_str(
                &Chart::new(self.width as u32, self.height as u32, 0.0, (bars.len() - 1) as f32)
                    .lineplot(&Shape::Bars(&bars))
                    .to_string(),
            );
            output.push('\n');
        }

        for (label, value) in chart.labels.iter().zip(&chart.values) {
            let filled = if max_val > 0.0 {
                ((value / max_val) * bar_room as f64).round() as usize
            } else {
                0
            };
            let share = if total > 0.0 { value / total * 100.0 } else { 0.0 };
            let shown: String = label.chars().take(label_width).collect();
            output.push_str(&format!(
                "{:<lw$} │{} {:.2} ({:.1}%)\n",
                shown,
                "█".repeat(filled),
                value,
                share,
                lw = label_width
            ));
        }
        output.push_str(&"─".repeat(self.width));
        output
    }

    fn axis_markers(&self, labels: &[String]) -> String {
        match (labels.first(), labels.last()) {
            (Some(first), Some(last)) if labels.len() > 1 => {
                let gap = self.width.saturating_sub(first.len() + last.len()).max(1);
                format!("{}{}{}\n", first, " ".repeat(gap), last)
            }
            (Some(only), _) => format!("{}\n", only),
            _ => String::new(),
        }
    }
}

fn summarize(values: &[f64]) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let min_val = values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_val = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let avg_val = values.iter().sum::<f64>() / values.len() as f64;
    (min_val, max_val, avg_val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MeasureSeries;
    use crate::filter::Granularity;

    fn series(values: Vec<f64>) -> TimeSeries {
        TimeSeries {
            granularity: Granularity::Month,
            date_col: "chargedate".to_string(),
            labels: (1..=values.len()).map(|m| format!("2024-{:02}", m)).collect(),
            series: vec![MeasureSeries {
                key: "kwh".to_string(),
                label: "kWh".to_string(),
                values,
            }],
        }
    }

    #[test]
    fn test_time_series_plot_has_header_and_axis() {
        let out = ChartPlotter::default().plot_time_series(&series(vec![1.0, 3.0, 2.0]));
        assert!(out.contains("kWh by Month"));
        assert!(out.contains("Buckets: 3"));
        assert!(out.contains("2024-01"));
        assert!(out.contains("2024-03"));
    }

    #[test]
    fn test_single_bucket_does_not_panic() {
        let out = ChartPlotter::new(Some(40), Some(10)).plot_time_series(&series(vec![5.0]));
        assert!(out.contains("Buckets: 1"));
    }

    #[test]
    fn test_empty_series_message() {
        let out = ChartPlotter::default().plot_time_series(&series(Vec::new()));
        assert!(out.contains("No data available"));
    }

    #[test]
    fn test_segment_bars() {
        let chart = ChartSeries {
            segment: Some("loc".to_string()),
            measure: Some("kwh".to_string()),
            metric_label: "kWh".to_string(),
            labels: vec!["Accra".to_string(), "Other".to_string()],
            values: vec![75.0, 25.0],
        };
        let out = ChartPlotter::default().plot_segments(&chart);
        assert!(out.contains("kWh by loc"));
        assert!(out.contains("Accra"));
        assert!(out.contains("(75.0%)"));
        assert!(out.contains("(25.0%)"));
    }
}
