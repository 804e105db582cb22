//! High-level runner API for the ingestion job.
//!
//! This module provides a simplified public interface that encapsulates all the
//! internal complexity of setting up the connection pool, output directory,
//! publisher and coordinator.
//!
//! This is the primary API for external users and for the CLI.

use aws_config::{BehaviorVersion, Region};
use chrono::Utc;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RUN_STAMP_FORMAT;
use crate::db::pool::PoolArgsBuilder;
use crate::db::{self as db_pool, safe_ident};
use crate::error::IngestError;
use crate::output::OutputDir;
use crate::pipeline::{Coordinator, ExportSettings, RunConfig};
use crate::publish::{ArtifactPublisher, S3Publisher};
use crate::source::{DatabaseSource, RecordSource};

pub use crate::config::{DEFAULT_CHUNK_SIZE, DEFAULT_OUTPUT_DIR};
pub use crate::formats::{CsvOptions, LineTerminator, QuoteStyle, parse_delimiter};
pub use crate::retry::RetryPolicy;
pub use crate::source::RejectPolicy;

/// Arguments for running an ingestion
#[derive(Debug, Clone)]
pub struct IngestArgs {
    // Connection configuration
    pub pg_host: String,
    pub pg_port: u16,
    pub pg_database: String,
    pub pg_user: String,
    pub pg_password: String,
    pub pg_schema: String,
    /// One of `disable`, `allow`, `prefer`, `require`, `verify-ca`, `verify-full`
    pub pg_ssl_mode: String,

    // What to export
    pub tables: Vec<String>,
    pub csv: CsvOptions,
    pub chunk_size: usize,
    pub output_dir: PathBuf,

    // Publishing; skipped when no bucket is set
    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
    pub aws_region: String,

    // Failure handling
    pub retry: RetryPolicy,
    pub reject: RejectPolicy,
    pub fail_on_empty: bool,

    pub quiet: bool,
    /// Fixed run stamp instead of the current UTC time (reruns, tests)
    pub run_stamp: Option<String>,

    // Test-only: inject a pre-created pool (for SQLite testing)
    #[cfg(test)]
    pub test_pool: Option<crate::db::Pool>,
}

impl IngestArgs {
    /// Check everything that can be checked before touching the network
    pub fn validate(&self) -> Result<(), IngestError> {
        let config_error = |e: anyhow::Error| IngestError::Config(format!("{e:#}"));

        for (name, value) in [
            ("PG_DB", &self.pg_database),
            ("PG_USER", &self.pg_user),
            ("PG_PASSWORD", &self.pg_password),
        ] {
            if value.trim().is_empty() {
                return Err(IngestError::Config(format!("{name} is required")));
            }
        }
        if self.tables.is_empty() {
            return Err(IngestError::Config(
                "TABLES is required (comma-separated table names)".to_string(),
            ));
        }

        safe_ident(&self.pg_schema).map_err(config_error)?;
        for table in &self.tables {
            safe_ident(table).map_err(config_error)?;
        }

        sqlx::postgres::PgSslMode::from_str(&self.pg_ssl_mode).map_err(|_| {
            IngestError::Config(format!("Unknown PG_SSLMODE {:?}", self.pg_ssl_mode))
        })?;

        if self.chunk_size == 0 {
            return Err(IngestError::Config("Chunk size must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.reject.max_ratio) {
            return Err(IngestError::Config(format!(
                "Reject ratio must be between 0 and 1, got {}",
                self.reject.max_ratio
            )));
        }
        if let Some(bucket) = &self.s3_bucket
            && bucket.trim().is_empty()
        {
            return Err(IngestError::Config("S3 bucket name is empty".to_string()));
        }

        Ok(())
    }

    fn location(&self) -> String {
        format!(
            "postgres://{}:{}/{}?schema={}",
            self.pg_host, self.pg_port, self.pg_database, self.pg_schema
        )
    }
}

/// Result of a completed ingestion
#[derive(Debug)]
pub struct IngestResult {
    pub run_id: String,
    pub run_stamp: String,
    pub manifest_path: PathBuf,
    pub artifacts: Vec<PathBuf>,
    pub skipped_tables: Vec<String>,
    pub rows_written: u64,
    pub rows_rejected: u64,
    pub duration: Duration,
}

/// Run an ingestion with the specified arguments
///
/// This is the main entry point. It handles all the internal setup including:
/// - Validating configuration
/// - Preparing the output directory
/// - Creating the PostgreSQL connection pool
/// - Creating the S3 publisher when a bucket is configured
/// - Running the coordinator and summarizing its report
///
/// # Example
///
/// ```no_run
/// use ingesta::runner::{CsvOptions, IngestArgs, RejectPolicy, RetryPolicy, run_ingest};
///
/// # async fn example() -> Result<(), ingesta::error::IngestError> {
/// let args = IngestArgs {
///     pg_host: "localhost".to_string(),
///     pg_port: 5432,
///     pg_database: "sales".to_string(),
///     pg_user: "reader".to_string(),
///     pg_password: "secret".to_string(),
///     pg_schema: "public".to_string(),
///     pg_ssl_mode: "prefer".to_string(),
///     tables: vec!["orders".to_string(), "customers".to_string()],
///     csv: CsvOptions::default(),
///     chunk_size: 100_000,
///     output_dir: "/app/out".into(),
///     s3_bucket: None,
///     s3_prefix: None,
///     aws_region: "us-east-1".to_string(),
///     retry: RetryPolicy::default(),
///     reject: RejectPolicy::default(),
///     fail_on_empty: false,
///     quiet: true,
///     run_stamp: None,
/// };
///
/// let result = run_ingest(args).await?;
/// println!("Wrote {} rows in {:?}", result.rows_written, result.duration);
/// # Ok(())
/// # }
/// ```
pub async fn run_ingest(args: IngestArgs) -> Result<IngestResult, IngestError> {
    args.validate()?;

    let started_at = Utc::now();
    let run_stamp = args
        .run_stamp
        .clone()
        .unwrap_or_else(|| started_at.format(RUN_STAMP_FORMAT).to_string());

    let output = OutputDir::prepare(&args.output_dir)
        .await
        .map_err(IngestError::Write)?;

    // Create connection pool (or use test pool if provided)
    #[cfg(test)]
    let pool = match args.test_pool.clone() {
        Some(test_pool) => test_pool,
        None => connect(&args).await?,
    };

    #[cfg(not(test))]
    let pool = connect(&args).await?;

    let source: Arc<dyn RecordSource> = Arc::new(DatabaseSource::new(
        pool,
        args.pg_schema.clone(),
        args.location(),
    ));

    let publisher = match &args.s3_bucket {
        Some(bucket) => Some(s3_publisher(&args, bucket.trim()).await),
        None => None,
    };

    let coordinator = Coordinator::new(
        source,
        output,
        publisher,
        RunConfig {
            tables: args.tables,
            run_stamp,
            started_at,
            export: ExportSettings {
                csv: args.csv,
                chunk_size: args.chunk_size,
                retry: args.retry,
                reject: args.reject,
            },
            fail_on_empty: args.fail_on_empty,
            quiet: args.quiet,
        },
    );

    let report = coordinator.run().await?;
    if let Some(stats) = &report.progress {
        let (p50, p90, p99) = stats.get_percentiles();
        tracing::debug!(
            chunks = stats.chunk_durations_ms.len(),
            p50_ms = p50.unwrap_or(0),
            p90_ms = p90.unwrap_or(0),
            p99_ms = p99.unwrap_or(0),
            "chunk write latency"
        );
    }
    let manifest = report.manifest;
    let output_root = report
        .manifest_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();

    Ok(IngestResult {
        rows_written: manifest.rows_written(),
        rows_rejected: manifest.rows_rejected(),
        artifacts: manifest
            .artifacts
            .iter()
            .map(|a| output_root.join(&a.file_name))
            .collect(),
        run_id: manifest.run_id,
        run_stamp: manifest.run_stamp,
        skipped_tables: manifest.skipped_tables,
        manifest_path: report.manifest_path,
        duration: report.duration,
    })
}

async fn connect(args: &IngestArgs) -> Result<db_pool::Pool, IngestError> {
    let ssl_mode = sqlx::postgres::PgSslMode::from_str(&args.pg_ssl_mode)
        .map_err(|e| IngestError::Config(format!("Unknown PG_SSLMODE: {e}")))?;

    let pool_args = PoolArgsBuilder::default()
        .host(&args.pg_host)
        .port(args.pg_port)
        .database(&args.pg_database)
        .username(&args.pg_user)
        .password(&args.pg_password)
        .schema(&args.pg_schema)
        .ssl_mode(ssl_mode)
        .build()
        .map_err(|e| IngestError::Config(e.to_string()))?;

    // Connections are opened lazily, so this only fails on local setup problems
    db_pool::pool::pool(pool_args)
        .await
        .map_err(|cause| IngestError::Source { attempts: 1, cause })
}

async fn s3_publisher(args: &IngestArgs, bucket: &str) -> Arc<dyn ArtifactPublisher> {
    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(args.aws_region.clone()))
        .load()
        .await;

    let publisher = S3Publisher::from_sdk_config(
        &aws_config,
        bucket.to_string(),
        args.s3_prefix.clone(),
        args.retry,
    );
    tracing::info!(destination = %publisher.destination(), "publishing artifacts to S3");
    Arc::new(publisher)
}
