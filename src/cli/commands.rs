use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use volta::dataset::{compute_statistics, compute_summary, unique_values, ChartSeries};
use volta::plotting::ChartPlotter;
use volta::{Dataset, FilterArgs, FilterSpec};

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Filter flags shared by every read command
#[derive(Args, Debug, Clone, Default)]
pub struct FilterFlags {
    /// First day to include (YYYY-MM-DD preferred)
    #[arg(long)]
    start_date: Option<String>,

    /// Last day to include
    #[arg(long)]
    end_date: Option<String>,

    /// Bucket size: D, W or M
    #[arg(long)]
    freq: Option<String>,

    /// Measure key, or several separated by commas
    #[arg(long)]
    metric: Option<String>,

    /// Column selection, repeatable: --filter loc=Accra --filter loc=Tema
    #[arg(short = 'f', long = "filter", value_name = "COLUMN=VALUE")]
    filters: Vec<String>,
}

impl FilterFlags {
    fn to_args(&self) -> Result<FilterArgs> {
        let mut args = FilterArgs::new();
        for raw in &self.filters {
            let Some((column, value)) = raw.split_once('=') else {
                bail!("filter '{}' must look like COLUMN=VALUE", raw);
            };
            args.push(column.trim(), value.trim());
        }
        let options = [
            ("start_date", &self.start_date),
            ("end_date", &self.end_date),
            ("freq", &self.freq),
            ("metric", &self.metric),
        ];
        for (key, value) in options {
            if let Some(value) = value {
                args.push(key, value.as_str());
            }
        }
        Ok(args)
    }

    fn resolve(&self, dataset: &Dataset) -> Result<FilterSpec> {
        let spec = dataset.spec_from_args(&self.to_args()?)?;
        info!("Filter: {} selection(s), range {:?}..{:?}", spec.selections().len(), spec.start(), spec.end());
        Ok(spec)
    }
}

#[derive(Args)]
pub struct SummaryCommand {
    #[command(flatten)]
    filters: FilterFlags,

    #[arg(long, value_enum, default_value = "table", help = "Output format: table or json")]
    format: OutputFormat,
}

impl SummaryCommand {
    pub fn execute(self, dataset: &Dataset) -> Result<()> {
        let spec = self.filters.resolve(dataset)?;
        let filtered = dataset.filter(&spec)?;
        let summary = compute_summary(&filtered, dataset.config());
        let stats = compute_statistics(&filtered, dataset.registry());
        let (base_min, base_max) = dataset.date_bounds()?;

        match self.format {
            OutputFormat::Json => {
                let out = json!({
                    "summary": summary,
                    "stats": stats,
                    "no_filters": spec.is_neutral(base_min, base_max),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            OutputFormat::Table => {
                println!("\n📊 Dataset Summary:");
                println!("{:-<60}", "");
                println!("  🔢 Rows: {}", summary.rows);
                println!("  🧱 Columns: {}", summary.cols);
                if let Some(meters) = summary.meters {
                    println!("  🔌 Meters: {}", meters);
                }
                if let Some(locations) = summary.locations {
                    println!("  📍 Locations: {}", locations);
                }
                if !summary.date_min.is_empty() {
                    println!("  📅 Date Range: {} to {}", summary.date_min, summary.date_max);
                }
                if spec.is_neutral(base_min, base_max) {
                    println!("  (no filters applied)");
                }
                println!();
                println!("📈 Measures:");
                for (key, s) in &stats {
                    println!(
                        "  • {} ({}): sum {:.2} | mean {:.2} | median {:.2} | min {:.2} | max {:.2}",
                        s.label, key, s.sum, s.mean, s.median, s.min, s.max
                    );
                }
                if stats.is_empty() {
                    println!("  (no numeric measures)");
                }
            }
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct PreviewCommand {
    #[command(flatten)]
    filters: FilterFlags,

    #[arg(short = 'n', long, default_value = "20", help = "Number of rows to show")]
    rows: usize,
}

impl PreviewCommand {
    pub fn execute(self, dataset: &Dataset) -> Result<()> {
        let spec = self.filters.resolve(dataset)?;
        let preview = dataset.preview(&spec, self.rows)?;
        println!("{}", preview);
        Ok(())
    }
}

#[derive(Args)]
pub struct ChartCommand {
    #[command(flatten)]
    filters: FilterFlags,

    #[arg(long, help = "Render an ASCII chart instead of JSON")]
    plot: bool,

    #[arg(long, help = "Chart width in characters")]
    width: Option<usize>,

    #[arg(long, help = "Chart height in characters")]
    height: Option<usize>,
}

impl ChartCommand {
    pub fn execute(self, dataset: &Dataset) -> Result<()> {
        let spec = self.filters.resolve(dataset)?;
        let series = dataset.time_series(&spec)?;
        if self.plot {
            println!("{}", ChartPlotter::new(self.width, self.height).plot_time_series(&series));
        } else {
            println!("{}", serde_json::to_string_pretty(&series)?);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct BreakdownCommand {
    #[command(flatten)]
    filters: FilterFlags,

    #[arg(long, help = "Render ASCII bars instead of JSON")]
    plot: bool,

    #[arg(long, help = "Chart width in characters")]
    width: Option<usize>,
}

impl BreakdownCommand {
    pub fn execute_composition(self, dataset: &Dataset) -> Result<()> {
        let spec = self.filters.resolve(dataset)?;
        let chart = dataset.composition(&spec)?;
        self.render(&chart)
    }

    pub fn execute_locations(self, dataset: &Dataset) -> Result<()> {
        let spec = self.filters.resolve(dataset)?;
        let chart = dataset.by_location(&spec)?;
        self.render(&chart)
    }

    fn render(&self, chart: &ChartSeries) -> Result<()> {
        if self.plot {
            println!("{}", ChartPlotter::new(self.width, None).plot_segments(chart));
        } else {
            println!("{}", serde_json::to_string_pretty(chart)?);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct OptionsCommand {
    #[command(flatten)]
    filters: FilterFlags,

    /// Facet column, repeatable; defaults to location, customer class and meter id
    #[arg(long = "facet")]
    facets: Vec<String>,

    #[arg(long, help = "List distinct values of every filterable column instead")]
    all_columns: bool,
}

impl OptionsCommand {
    pub fn execute(self, dataset: &Dataset) -> Result<()> {
        let spec = self.filters.resolve(dataset)?;
        if self.all_columns {
            let filtered = dataset.filter(&spec)?;
            let config = dataset.config();
            let values = unique_values(&filtered, &config.exclude_cols, config.unique_values_cap);
            println!("{}", serde_json::to_string_pretty(&values)?);
        } else {
            let options = dataset.facet_options(&spec, &self.facets)?;
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct MetersCommand {
    #[command(flatten)]
    filters: FilterFlags,

    #[arg(short, long, help = "Case-insensitive substring of the meter id")]
    query: Option<String>,

    #[arg(short, long, default_value = "200", help = "Maximum number of ids to return")]
    limit: usize,
}

impl MetersCommand {
    pub fn execute(self, dataset: &Dataset) -> Result<()> {
        let spec = self.filters.resolve(dataset)?;
        let meters = dataset.search_meters(&spec, self.query.as_deref(), self.limit)?;
        println!("{}", serde_json::to_string_pretty(&meters)?);
        Ok(())
    }
}

#[derive(Args)]
pub struct ExportCommand {
    #[command(flatten)]
    filters: FilterFlags,

    #[arg(short, long, help = "Write to this file instead of stdout")]
    output: Option<PathBuf>,
}

impl ExportCommand {
    pub fn execute(self, dataset: &Dataset) -> Result<()> {
        let spec = self.filters.resolve(dataset)?;
        let csv = dataset.export_csv(&spec)?;
        match &self.output {
            Some(path) => {
                std::fs::write(path, &csv).with_context(|| format!("writing {}", path.display()))?;
                println!("💾 Wrote {} bytes to {}", csv.len(), path.display());
            }
            None => std::io::stdout().write_all(&csv)?,
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct RebuildCommand {}

impl RebuildCommand {
    pub fn execute(self, dataset: &Dataset) -> Result<()> {
        let snapshot = dataset
            .rebuild_from_csv()
            .with_context(|| format!("rebuilding from {}", dataset.config().csv_glob))?;
        println!("🎉 Rebuilt dataset: {} rows x {} columns", snapshot.height(), snapshot.width());
        Ok(())
    }
}

#[derive(Args)]
pub struct UploadCommand {
    #[arg(help = "CSV file to add to the uploads directory")]
    path: PathBuf,
}

impl UploadCommand {
    pub fn execute(self, dataset: &Dataset) -> Result<()> {
        let snapshot = dataset
            .store_upload(&self.path)
            .with_context(|| format!("uploading {}", self.path.display()))?;
        println!("📤 Uploaded {}", self.path.display());
        println!("🎉 Dataset now has {} rows", snapshot.height());
        Ok(())
    }
}

#[derive(Args)]
pub struct HealthCommand {}

impl HealthCommand {
    pub fn execute(self, dataset: &Dataset) -> Result<()> {
        let health = dataset.health();
        println!("{}", serde_json::to_string(&health)?);
        if !health.ok {
            bail!("health check failed: {}", health.error.unwrap_or_default());
        }
        Ok(())
    }
}
