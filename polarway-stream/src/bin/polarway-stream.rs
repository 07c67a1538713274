//! Command-line front end: stream, query and inspect partitions.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polarway_stream::{DateRange, RemoteStore, StreamConfig, StreamEngine, StreamRequest};

#[derive(Parser)]
#[command(name = "polarway-stream")]
#[command(about = "Filtered streaming over time-partitioned Parquet data", long_about = None)]
struct Args {
    /// Read partitions from a local directory instead of a cloud bucket.
    #[arg(long)]
    root: Option<PathBuf>,
    /// Bucket name; defaults to POLARWAY_STREAM_BUCKET.
    #[arg(long)]
    bucket: Option<String>,
    /// Decode with the fallback backend only.
    #[arg(long, default_value_t = false)]
    fallback_decoder: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
struct RequestArgs {
    /// Month to read, as YYYY_MM or YYYY-MM.
    #[arg(long)]
    year_month: Option<String>,
    /// Range start (YYYY-MM or YYYY-MM-DD); requires --end.
    #[arg(long, requires = "end")]
    start: Option<String>,
    #[arg(long, requires = "start")]
    end: Option<String>,
    #[arg(long)]
    platform: Option<String>,
    #[arg(long)]
    genre: Option<String>,
    #[arg(long)]
    advertiser: Option<String>,
    #[arg(long)]
    min_play_count: Option<f64>,
    #[arg(long)]
    min_cost: Option<f64>,
    #[arg(long)]
    limit: Option<usize>,
}

impl From<RequestArgs> for StreamRequest {
    fn from(args: RequestArgs) -> Self {
        StreamRequest {
            year_month: args.year_month,
            platform: args.platform,
            genre: args.genre,
            advertiser: args.advertiser,
            min_play_count: args.min_play_count,
            min_cost: args.min_cost,
            limit: args.limit,
            start: args.start,
            end: args.end,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SummaryKind {
    Platform,
    Genre,
    Daily,
}

#[derive(Subcommand)]
enum Command {
    /// Stream matching records to stdout as NDJSON.
    Stream {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Run a query and print the buffered JSON result.
    Query {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Build the partition catalog and print it.
    Catalog,
    /// Print the column schema of one object.
    Schema {
        #[arg(long)]
        path: String,
    },
    /// Summarize a pre-aggregated series.
    Summary {
        #[arg(value_enum)]
        kind: SummaryKind,
        #[arg(long)]
        platform: Option<String>,
        #[arg(long, requires = "end")]
        start: Option<String>,
        #[arg(long, requires = "start")]
        end: Option<String>,
    },
    /// Print engine status.
    Status,
}

fn open_store(args: &Args, bucket: &str) -> anyhow::Result<RemoteStore> {
    match &args.root {
        Some(root) => RemoteStore::local(root)
            .with_context(|| format!("opening local store at {}", root.display())),
        None => cloud_store(bucket),
    }
}

#[cfg(feature = "gcp")]
fn cloud_store(bucket: &str) -> anyhow::Result<RemoteStore> {
    Ok(RemoteStore::gcs(bucket)?)
}

#[cfg(all(feature = "aws", not(feature = "gcp")))]
fn cloud_store(bucket: &str) -> anyhow::Result<RemoteStore> {
    Ok(RemoteStore::s3(bucket)?)
}

#[cfg(not(any(feature = "gcp", feature = "aws")))]
fn cloud_store(bucket: &str) -> anyhow::Result<RemoteStore> {
    anyhow::bail!("bucket {bucket:?} needs the gcp or aws feature; use --root for a local directory")
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polarway_stream=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = StreamConfig::from_env()?;
    if let Some(bucket) = &args.bucket {
        config = config.with_bucket(bucket);
    }
    if config.bucket.is_none() {
        if let Some(root) = &args.root {
            config = config.with_bucket(root.to_string_lossy());
        }
    }
    if args.fallback_decoder {
        config = config.with_primary_decoder_disabled(true);
    }

    let bucket = config
        .bucket
        .clone()
        .context("no bucket: pass --bucket, --root or set POLARWAY_STREAM_BUCKET")?;
    let store = open_store(&args, &bucket)?;
    let engine = StreamEngine::new(config, Arc::new(store))?;
    engine.refresh_catalog().await?;

    match args.command {
        Command::Stream { request } => {
            let mut lines = engine.stream_ndjson(&request.into())?;
            let mut out = std::io::stdout().lock();
            while let Some(line) = lines.next().await {
                out.write_all(&line)?;
            }
            out.flush()?;
            let summary = lines.finish().await?;
            eprintln!("{}", serde_json::to_string(&summary)?);
        }
        Command::Query { request } => {
            print_json(&engine.query(&request.into()).await?)?;
        }
        Command::Catalog => {
            let catalog = engine.catalog();
            let entries: Vec<_> = catalog.iter().collect();
            print_json(&entries)?;
        }
        Command::Schema { path } => {
            print_json(&engine.schema(&path).await?)?;
        }
        Command::Summary {
            kind,
            platform,
            start,
            end,
        } => {
            let range = start.zip(end).map(|(s, e)| DateRange::new(s, e));
            match kind {
                SummaryKind::Platform => {
                    let report = engine.platform_summary(platform.as_deref(), range).await?;
                    print_json(&report.value.summary())?;
                }
                SummaryKind::Genre => {
                    let report = engine.genre_summary(range).await?;
                    print_json(&report.value.summary())?;
                }
                SummaryKind::Daily => {
                    let report = engine.daily_summary(range).await?;
                    print_json(&report.value.summary())?;
                }
            }
        }
        Command::Status => {
            print_json(&engine.status())?;
        }
    }

    Ok(())
}
