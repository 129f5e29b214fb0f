//! roman-roads - Itiner-e harvester entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use roman_roads_harvester::config::{
    database_url, ConflictPolicy, DatabaseConfig, HarvesterConfig, DEFAULT_BASE_URL,
};
use roman_roads_harvester::harvest::{
    packaged_sink, ExportFormat, GeoJsonSink, HarvestPipeline, HarvestRequest, HarvestResult,
    ItinereClient, PostGisSink, RecordParser,
};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const BULK_FILENAME: &str = "itinere_all_segments.ndjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Download the nightly NDJSON export
    Bulk,
    /// Fetch individual segment ids
    Segments,
    /// Load local NDJSON files into PostGIS
    Load,
    /// Convert local NDJSON files to gpkg/shp/geojson
    Export,
}

/// Roman Roads GIS data harvester: fetch Itiner-e data and load it into PostGIS
#[derive(Debug, Parser)]
#[command(name = "roman-roads", version, about)]
struct Cli {
    #[arg(long, value_enum)]
    mode: Mode,

    /// Segment ids to fetch (segments mode)
    #[arg(long, num_args = 1..)]
    ids: Vec<i64>,

    /// Inclusive range of segment ids to fetch
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    id_range: Option<Vec<i64>>,

    /// Output directory
    #[arg(long, default_value = "./data/roman_roads")]
    output: PathBuf,

    /// Input directory or NDJSON file (load/export); defaults to --output
    #[arg(long)]
    input: Option<PathBuf>,

    /// Export format
    #[arg(long, value_enum, default_value_t = ExportFormat::Gpkg)]
    format: ExportFormat,

    /// Also load fetched data into PostGIS
    #[arg(long)]
    load_db: bool,

    /// PostGIS URL (overrides the PG* environment variables)
    #[arg(long)]
    db_url: Option<String>,

    /// Behavior when a table exists
    #[arg(long, value_enum, default_value_t = ConflictPolicy::Replace)]
    db_if_exists: ConflictPolicy,

    /// PostGIS schema
    #[arg(long, default_value = "public")]
    schema: String,

    /// Seconds between individual API requests
    #[arg(long, default_value_t = 0.5, allow_negative_numbers = true)]
    delay: f64,

    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn segment_ids(&self) -> Vec<i64> {
        let mut ids = self.ids.clone();
        if let Some(range) = &self.id_range {
            if let [start, end] = range.as_slice() {
                ids.extend(*start..=*end);
            }
        }
        ids
    }

    fn request_delay(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.delay).with_context(|| {
            format!(
                "--delay must be a non-negative number of seconds, got {}",
                self.delay
            )
        })
    }

    fn input_path(&self) -> PathBuf {
        self.input.clone().unwrap_or_else(|| self.output.clone())
    }

    fn database(&self) -> DatabaseConfig {
        DatabaseConfig::new(database_url(self.db_url.as_deref()))
            .with_schema(self.schema.clone())
            .with_conflict_policy(self.db_if_exists)
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = HarvesterConfig::default()
        .with_base_url(cli.base_url.clone())
        .with_request_delay(cli.request_delay()?);
    config.validate().context("Invalid harvester configuration")?;

    let client = ItinereClient::new(config.clone()).context("Failed to build HTTP client")?;
    let parser = RecordParser::new(config.clone());
    let pipeline = HarvestPipeline::new(client, parser).with_request_delay(config.request_delay);
    let tables = config.tables.clone();

    let (mut pipeline, request) = match cli.mode {
        Mode::Bulk | Mode::Segments => {
            let request = if cli.mode == Mode::Bulk {
                HarvestRequest::Bulk {
                    dest: cli.output.join(BULK_FILENAME),
                }
            } else {
                let ids = cli.segment_ids();
                if ids.is_empty() {
                    bail!("--mode segments requires --ids or --id-range");
                }
                HarvestRequest::Segments(ids)
            };
            let mut pipeline =
                pipeline.with_sink(Box::new(GeoJsonSink::raw(&cli.output, tables.clone())));
            if cli.load_db {
                pipeline = pipeline
                    .with_sink_if_nonempty(Box::new(PostGisSink::new(cli.database(), tables)));
            }
            (pipeline, request)
        }
        Mode::Load => (
            pipeline.with_sink(Box::new(PostGisSink::new(cli.database(), tables))),
            HarvestRequest::LocalFiles(cli.input_path()),
        ),
        Mode::Export => (
            pipeline.with_sink(packaged_sink(cli.format, &cli.output, &tables)),
            HarvestRequest::LocalFiles(cli.input_path()),
        ),
    };

    let result = pipeline.run(request).await?;
    log_summary(&result);
    Ok(())
}

fn log_summary(result: &HarvestResult) {
    let stats = &result.stats;
    if stats.requested > 0 {
        info!(
            "Fetched {} / {} segments successfully ({} not found, {} failed)",
            stats.parsed, stats.requested, stats.not_found, stats.fetch_failed
        );
    }
    if stats.parse_failed > 0 {
        info!("{} records could not be parsed", stats.parse_failed);
    }
    for report in &result.reports {
        for target in &report.targets {
            info!(sink = %report.sink, "Wrote {}", target);
        }
    }
    info!(
        duration_ms = stats.total_duration_ms,
        places = stats.places,
        "Done. {} total segments processed.",
        result.batch.segments.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_segment_ids_merge_list_and_range() {
        let cli = Cli::parse_from([
            "roman-roads",
            "--mode",
            "segments",
            "--ids",
            "5",
            "9",
            "--id-range",
            "1",
            "3",
        ]);
        assert_eq!(cli.segment_ids(), vec![5, 9, 1, 2, 3]);
    }

    #[test]
    fn test_input_defaults_to_output() {
        let cli = Cli::parse_from(["roman-roads", "--mode", "load", "--output", "/tmp/rr"]);
        assert_eq!(cli.input_path(), PathBuf::from("/tmp/rr"));
        assert_eq!(cli.db_if_exists, ConflictPolicy::Replace);
        assert_eq!(cli.format, ExportFormat::Gpkg);
    }

    #[test]
    fn test_request_delay_rejects_unrepresentable_values() {
        let parse = |delay: &str| {
            Cli::parse_from(["roman-roads", "--mode", "bulk", "--delay", delay]).request_delay()
        };
        assert_eq!(parse("0.25").unwrap(), Duration::from_millis(250));
        assert!(parse("1e30").is_err());
        assert!(parse("-1").is_err());
        assert!(parse("NaN").is_err());
    }

    #[tokio::test]
    async fn test_run_fails_cleanly_on_huge_delay() {
        let cli = Cli::parse_from(["roman-roads", "--mode", "bulk", "--delay", "1e30"]);
        let err = run(&cli).await.unwrap_err();
        assert!(err.to_string().contains("--delay"));
    }

    #[test]
    fn test_conflict_policy_values() {
        let cli = Cli::parse_from(["roman-roads", "--mode", "load", "--db-if-exists", "fail"]);
        assert_eq!(cli.db_if_exists, ConflictPolicy::Fail);
    }
}
