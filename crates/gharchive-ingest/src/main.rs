//! gharchive-ingest - GH Archive ingestion tool

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use gharchive_common::logging::{init_logging, LogConfig, LogLevel};
use gharchive_ingest::archive::ArchiveSource;
use gharchive_ingest::config::{IngestConfig, DEFAULT_ARCHIVE_TOKEN_PATH};
use gharchive_ingest::store::{postgres, BlobStorage, ObjectFallbackStore, PgLedger, PgPrimaryStore};
use gharchive_ingest::unit::DATE_FORMAT;
use gharchive_ingest::{drivers, Ingestor, Unit};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gharchive-ingest")]
#[command(author, version, about = "Ingest hourly GH Archive payloads exactly once")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root of the local archive cache
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Database user, overrides the one in DATABASE_URL
    #[arg(long, global = true)]
    db_user: Option<String>,

    /// Database password, overrides the one in DATABASE_URL
    #[arg(long, global = true)]
    db_password: Option<String>,

    /// Archive token file with base URL and request headers
    #[arg(long, global = true, default_value = DEFAULT_ARCHIVE_TOKEN_PATH)]
    archive_token: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a single hour
    Hour {
        /// Date as YYYY-MM-DD
        #[arg(value_parser = parse_date)]
        date: NaiveDate,

        /// Hour of day, 0-23
        #[arg(value_parser = clap::value_parser!(u8).range(0..=23))]
        hour: u8,
    },

    /// Ingest all 24 hours of a day
    Day {
        /// Date as YYYY-MM-DD
        #[arg(value_parser = parse_date)]
        date: NaiveDate,
    },

    /// Ingest every hour of a month
    Month {
        year: i32,

        #[arg(value_parser = clap::value_parser!(u32).range(1..=12))]
        month: u32,
    },

    /// Ingest every hour of a year
    Year { year: i32 },
}

fn parse_date(value: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("gharchive-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::load(Some(&cli.archive_token))?;
    if let Some(dir) = cli.cache_dir {
        config.archive.cache_dir = dir;
    }
    if let Some(user) = cli.db_user {
        config.database.user = Some(user);
    }
    if let Some(password) = cli.db_password {
        config.database.password = Some(password);
    }

    let pool = postgres::connect(&config.database)
        .await
        .context("Failed to connect to the database")?;
    postgres::migrate(&pool)
        .await
        .context("Failed to apply migrations")?;

    let blobs = BlobStorage::new(&config.storage);
    let ingestor = Ingestor::new(
        ArchiveSource::new(&config.archive)?,
        Arc::new(PgPrimaryStore::new(
            pool.clone(),
            config.engine.max_document_bytes,
        )),
        Arc::new(ObjectFallbackStore::new(blobs, pool.clone())),
        Arc::new(PgLedger::new(pool.clone())),
        config.engine.clone(),
    );

    let mut out = std::io::stdout();
    let reports = match cli.command {
        Command::Hour { date, hour } => {
            let unit = Unit::new(date, hour)?;
            drivers::ingest_units(&ingestor, [unit], &mut out).await?
        },
        Command::Day { date } => drivers::ingest_day(&ingestor, date, &mut out).await?,
        Command::Month { year, month } => {
            drivers::ingest_month(&ingestor, year, month, &mut out).await?
        },
        Command::Year { year } => drivers::ingest_year(&ingestor, year, &mut out).await?,
    };

    pool.close().await;

    let failed = reports.iter().filter(|r| !r.outcome.is_pass()).count();
    let lines: u64 = reports.iter().map(|r| r.lines).sum();
    info!(units = reports.len(), failed, lines, "Ingestion complete");

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
