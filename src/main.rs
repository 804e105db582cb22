use clap::Parser;
use clap::builder::FalseyValueParser;
use clap::error::ErrorKind;
use ingesta::error::IngestError;
use ingesta::runner::{
    CsvOptions, IngestArgs, LineTerminator, QuoteStyle, RejectPolicy, RetryPolicy, parse_delimiter,
    run_ingest,
};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

/// Export PostgreSQL tables to CSV artifacts, optionally publishing them to S3
#[derive(Parser, Clone, Debug)]
#[command(version, about)]
struct Args {
    /// PostgreSQL host
    #[arg(long, env = "PG_HOST", default_value = "localhost")]
    pg_host: String,

    /// PostgreSQL port
    #[arg(long, env = "PG_PORT", default_value = "5432")]
    pg_port: u16,

    /// Database name
    #[arg(long, env = "PG_DB", default_value = "")]
    pg_db: String,

    /// Database user
    #[arg(long, env = "PG_USER", default_value = "")]
    pg_user: String,

    /// Database password
    #[arg(long, env = "PG_PASSWORD", default_value = "", hide_env_values = true)]
    pg_password: String,

    /// Schema holding the tables
    #[arg(long, env = "PG_SCHEMA", default_value = "public")]
    pg_schema: String,

    /// TLS mode (disable, allow, prefer, require, verify-ca, verify-full)
    #[arg(long, env = "PG_SSLMODE", default_value = "prefer")]
    pg_sslmode: String,

    /// Comma-separated list of tables to export (e.g., orders,customers)
    #[arg(short, long, env = "TABLES", default_value = "")]
    tables: String,

    /// Field separator (a single character, or \t)
    #[arg(long, env = "CSV_SEP", default_value = ",")]
    csv_sep: String,

    /// Quoting: MINIMAL, ALL, NONNUMERIC or NONE
    #[arg(long, env = "CSV_QUOTE", default_value = "MINIMAL")]
    csv_quote: String,

    /// Line terminator (\n, \r\n, \r or a single character)
    #[arg(long, env = "CSV_LINE_TERMINATOR", default_value = "\\n")]
    csv_line_terminator: String,

    /// Records encoded and written per chunk
    #[arg(long, env = "CHUNKSIZE", default_value_t = ingesta::runner::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Directory the artifacts and the run manifest are written to
    #[arg(short, long, env = "OUTPUT_DIR", default_value = ingesta::runner::DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// S3 bucket to publish artifacts to (publishing is skipped when unset)
    #[arg(long, env = "S3_BUCKET")]
    s3_bucket: Option<String>,

    /// Key prefix inside the bucket
    #[arg(long, env = "S3_PREFIX")]
    s3_prefix: Option<String>,

    /// AWS region for S3 (falls back to AWS_REGION, then us-east-1)
    #[arg(long, env = "AWS_DEFAULT_REGION")]
    aws_region: Option<String>,

    /// Attempts per operation before a transient failure fails the run
    #[arg(long, env = "INGEST_MAX_ATTEMPTS", default_value = "5")]
    max_attempts: u32,

    /// First retry delay in milliseconds, doubled on every retry
    #[arg(long, env = "INGEST_RETRY_BASE_DELAY_MS", default_value = "500")]
    retry_base_delay_ms: u64,

    /// Largest tolerated share of malformed records per table (0 aborts on the first one)
    #[arg(long, env = "INGEST_MAX_REJECT_RATIO", default_value = "0.5")]
    max_reject_ratio: f64,

    /// Exit with an error when no table was exported
    #[arg(long, env = "INGEST_FAIL_ON_EMPTY", value_parser = FalseyValueParser::new())]
    fail_on_empty: bool,

    /// Suppress progress output and informational logs
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("[ERROR] {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    // Initialize tracing based on quiet mode; RUST_LOG takes precedence
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let default_filter = if args.quiet {
        "ingesta=warn,sqlx=warn"
    } else {
        "ingesta=info,sqlx=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let start = Instant::now();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[ERROR] {e}");
            eprintln!("Run failed after {:.2}s", start.elapsed().as_secs_f64());
            ExitCode::from(e.exit_code())
        }
    }
}

/// Parse flags and environment; help and version exit directly, any other
/// parse failure is a configuration error
fn parse_args<I, T>(argv: I) -> Result<Args, IngestError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Args::try_parse_from(argv).map_err(|e| match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
        _ => IngestError::Config(e.to_string().trim_end().to_string()),
    })
}

async fn run(args: Args) -> Result<(), IngestError> {
    let ingest_args = build_ingest_args(args)?;
    let quiet = ingest_args.quiet;

    if !quiet {
        println!("Ingesta");
        println!("=======");
        println!(
            "Source: {}:{}/{} (schema {})",
            ingest_args.pg_host,
            ingest_args.pg_port,
            ingest_args.pg_database,
            ingest_args.pg_schema
        );
        println!("Tables: {}", ingest_args.tables.join(", "));
        println!("Output: {}", ingest_args.output_dir.display());
        if let Some(bucket) = &ingest_args.s3_bucket {
            println!("Publish: s3://{}", bucket);
        }
        println!();
    }

    let result = run_ingest(ingest_args).await?;

    println!();
    println!("Ingestion Summary");
    println!("=================");
    println!("Run ID: {}", result.run_id);
    println!("Run stamp: {}", result.run_stamp);
    println!("Artifacts: {}", result.artifacts.len());
    for artifact in &result.artifacts {
        println!("  {}", artifact.display());
    }
    if !result.skipped_tables.is_empty() {
        println!("Skipped (not found): {}", result.skipped_tables.join(", "));
    }
    println!("Rows written: {}", result.rows_written);
    println!("Rows rejected: {}", result.rows_rejected);
    println!("Manifest: {}", result.manifest_path.display());
    println!("Duration: {:.2}s", result.duration.as_secs_f64());

    Ok(())
}

fn build_ingest_args(args: Args) -> Result<IngestArgs, IngestError> {
    let config_error = |e: anyhow::Error| IngestError::Config(format!("{e:#}"));

    let csv = CsvOptions {
        delimiter: parse_delimiter(&args.csv_sep).map_err(config_error)?,
        quote_style: cli::parse_quote_style(&args.csv_quote),
        terminator: LineTerminator::parse(&args.csv_line_terminator).map_err(config_error)?,
        ..CsvOptions::default()
    };

    let aws_region = args
        .aws_region
        .or_else(|| std::env::var("AWS_REGION").ok())
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "us-east-1".to_string());

    Ok(IngestArgs {
        pg_host: args.pg_host,
        pg_port: args.pg_port,
        pg_database: args.pg_db,
        pg_user: args.pg_user,
        pg_password: args.pg_password,
        pg_schema: args.pg_schema.trim().to_string(),
        pg_ssl_mode: args.pg_sslmode,
        tables: cli::parse_table_list(&args.tables),
        csv,
        chunk_size: args.chunk_size,
        output_dir: args.output_dir,
        s3_bucket: cli::non_blank(args.s3_bucket),
        s3_prefix: cli::non_blank(args.s3_prefix),
        aws_region,
        retry: RetryPolicy::new(
            args.max_attempts,
            Duration::from_millis(args.retry_base_delay_ms),
        ),
        reject: RejectPolicy {
            max_ratio: args.max_reject_ratio,
        },
        fail_on_empty: args.fail_on_empty,
        quiet: args.quiet,
        run_stamp: None,
    })
}

/// CLI utility functions for parsing command-line arguments
mod cli {
    use super::QuoteStyle;

    /// Split a comma-separated table list, dropping blank entries
    pub fn parse_table_list(s: &str) -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Parse a quote style, falling back to MINIMAL for unknown names
    pub fn parse_quote_style(s: &str) -> QuoteStyle {
        QuoteStyle::parse(s).unwrap_or_else(|| {
            tracing::warn!("unknown CSV_QUOTE {:?}, using MINIMAL", s);
            QuoteStyle::Minimal
        })
    }

    /// Treat empty or whitespace-only values (e.g. `S3_BUCKET=`) as unset
    pub fn non_blank(value: Option<String>) -> Option<String> {
        value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

}
