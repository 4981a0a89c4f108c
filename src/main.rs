use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{self, EnvFilter};

use volta::{Dataset, EngineConfig};

mod cli;

use cli::commands::{
    BreakdownCommand, ChartCommand, ExportCommand, HealthCommand, MetersCommand, OptionsCommand, PreviewCommand, RebuildCommand,
    SummaryCommand, UploadCommand,
};

#[derive(Parser)]
#[command(name = "volta")]
#[command(about = "Filter and aggregate utility billing data")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Row counts, date range and measure statistics
    Summary(SummaryCommand),
    /// First rows of the filtered table
    Preview(PreviewCommand),
    /// Bucketed time series of one or more measures
    Chart(ChartCommand),
    /// Measure share per customer class
    Composition(BreakdownCommand),
    /// Measure total per location
    Locations(BreakdownCommand),
    /// Values available to each filter widget
    Options(OptionsCommand),
    /// Search meter ids
    Meters(MetersCommand),
    /// Filtered rows as CSV
    Export(ExportCommand),
    /// Rebuild the dataset from the uploaded CSV files
    Rebuild(RebuildCommand),
    /// Add a CSV file to the uploads and rebuild
    Upload(UploadCommand),
    /// Check that the dataset loads and report its shape
    Health(HealthCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Cap Polars threads so a dashboard host is not saturated by one query
    let max_polars_threads = std::cmp::min(4, num_cpus::get());
    std::env::set_var("POLARS_MAX_THREADS", max_polars_threads.to_string());

    let base_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let quiet_deps = "aws_smithy_runtime=error,aws_sdk_s3=error,aws_config=error,aws_smithy_http=error,aws_credential_types=error,aws_sigv4=error,aws_types=error,hyper=error,hyper_util=error,h2=error,reqwest=error,rustls=error,tower=error";

    tracing_subscriber::fmt()
        .with_max_level(base_level)
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::new(format!(
            "volta={},{}",
            if cli.verbose { "debug" } else { "info" },
            quiet_deps
        )))
        .init();

    info!("Starting Volta v{}", env!("CARGO_PKG_VERSION"));
    info!("🧵 Limited Polars to {} threads", max_polars_threads);

    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let dataset = Dataset::from_config(config).context("opening dataset")?;

    match cli.command {
        Commands::Summary(cmd) => cmd.execute(&dataset),
        Commands::Preview(cmd) => cmd.execute(&dataset),
        Commands::Chart(cmd) => cmd.execute(&dataset),
        Commands::Composition(cmd) => cmd.execute_composition(&dataset),
        Commands::Locations(cmd) => cmd.execute_locations(&dataset),
        Commands::Options(cmd) => cmd.execute(&dataset),
        Commands::Meters(cmd) => cmd.execute(&dataset),
        Commands::Export(cmd) => cmd.execute(&dataset),
        Commands::Rebuild(cmd) => cmd.execute(&dataset),
        Commands::Upload(cmd) => cmd.execute(&dataset),
        Commands::Health(cmd) => cmd.execute(&dataset),
    }
}
