//! CLI entry point for the telemetry lake tools.
//!
//! `plan` previews the batches of a backlog, `backlog` decodes them into the
//! data lake and `aggregate` writes per-trip signal summaries for a date range.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use telemetry_lake::aggregation::{Aggregator, SummaryFormat, load_config};
use telemetry_lake::aggregation::config::AGGREGATIONS_KEY;
use telemetry_lake::backlog::{BacklogProcessor, load_backlog, plan};
use telemetry_lake::decoder::CommandDecoder;
use telemetry_lake::storage::{self, output_location};
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "telemetry_lake")]
#[command(about = "Decode CAN logger backlogs and aggregate trips", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve backlog.json and print the batches it would produce
    Plan {
        /// Input store holding backlog.json and the raw log files (directory or s3://bucket)
        #[arg(long, env = "INPUT_BUCKET")]
        input: String,
    },
    /// Decode every file listed in backlog.json and upload the results
    Backlog {
        /// Input store holding backlog.json and the raw log files
        #[arg(long, env = "INPUT_BUCKET")]
        input: String,

        /// Output store for decoded files (default: <input>-parquet)
        #[arg(long)]
        output: Option<String>,

        /// Decoder executable
        #[arg(long, env = "MF4_DECODER", default_value = "mdf2parquet_decode")]
        decoder: String,

        /// Maximum number of batches decoded at once
        #[arg(short, long, default_value_t = 1)]
        concurrency: usize,

        /// Directory for per-batch scratch space (default: system temp dir)
        #[arg(long)]
        scratch_dir: Option<String>,
    },
    /// Segment trips and write per-trip signal aggregations
    Aggregate {
        /// Input store holding the aggregation config
        #[arg(long, env = "INPUT_BUCKET")]
        input: String,

        /// Data lake with decoded frames; summaries are written here too (default: <input>-parquet)
        #[arg(long, env = "OUTPUT_BUCKET")]
        lake: Option<String>,

        /// Key of the aggregation config inside the input store
        #[arg(long, default_value = AGGREGATIONS_KEY)]
        config: String,

        /// Maximum number of devices aggregated at once
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// File format of the daily trip summary
        #[arg(long, value_enum, default_value_t = SummaryFormat::Parquet)]
        format: SummaryFormat,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/telemetry_lake.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("telemetry_lake.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { input } => {
            let store = storage::open(&input).await?;
            let backlog = load_backlog(store.as_ref()).await?;
            let batches = plan(store.as_ref(), &backlog).await?;
            println!("{}", serde_json::to_string_pretty(&batches)?);
        }
        Commands::Backlog {
            input,
            output,
            decoder,
            concurrency,
            scratch_dir,
        } => {
            let output = output.unwrap_or_else(|| output_location(&input));
            info!(input = %input, output = %output, decoder = %decoder, "Starting backlog run");

            let mut processor = BacklogProcessor::new(
                storage::open(&input).await?,
                storage::open(&output).await?,
                Arc::new(CommandDecoder::new(decoder)),
            )
            .with_concurrency(concurrency);
            if let Some(dir) = scratch_dir {
                processor = processor.with_scratch_dir(dir);
            }

            let report = processor.run().await?;
            if !report.is_success() {
                error!(failed = ?report.failed_batches, "Backlog run had failed batches");
                anyhow::bail!("{} of {} batches failed", report.failed_batches.len(), report.batches);
            }
        }
        Commands::Aggregate {
            input,
            lake,
            config,
            concurrency,
            format,
        } => {
            let lake = lake.unwrap_or_else(|| output_location(&input));
            let config = load_config(storage::open(&input).await?.as_ref(), &config).await?;
            let range = config.dates.resolve(Utc::now().date_naive());
            info!(lake = %lake, start = %range.start, end = %range.end, "Starting aggregation run");

            let report = Aggregator::new(storage::open(&lake).await?, config)
                .with_concurrency(concurrency)
                .with_format(format)
                .run(range)
                .await?;

            for skipped in &report.skipped {
                info!(device_id = %skipped.device_id, reason = %skipped.reason, "Device skipped");
            }
            info!(report = %serde_json::to_string(&report)?, "Aggregation report");
        }
    }

    Ok(())
}
