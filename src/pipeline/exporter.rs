use anyhow::Context;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{FETCH_TIMEOUT, MAX_RECORDED_REJECTIONS};
use crate::error::IngestError;
use crate::formats::CsvOptions;
use crate::output::{CommittedArtifact, OutputDir, PendingArtifact};
use crate::retry::{self, RetryPolicy, with_retry};
use crate::source::{RecordSource, RejectPolicy, Rejection, RowStream, SourceRecord, validate_row};
use crate::telemetry::TelemetryEvent;

/// Knobs shared by every table export of a run
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub csv: CsvOptions,
    pub chunk_size: usize,
    pub retry: RetryPolicy,
    pub reject: RejectPolicy,
}

/// Result of exporting one table
#[derive(Debug, Clone)]
pub struct TableExport {
    pub table: String,
    pub columns: Vec<String>,
    pub artifact: CommittedArtifact,
    pub rows_written: u64,
    pub rows_rejected: u64,
    pub rejections: Vec<Rejection>,
}

/// Failure of a single export attempt
#[derive(Debug)]
enum AttemptError {
    Config(String),
    Source(anyhow::Error),
    Write(anyhow::Error),
    Rejected { rejected: u64, total: u64 },
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Source(e) => retry::is_transient(e),
            _ => false,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Config(message) => write!(f, "{message}"),
            AttemptError::Source(e) | AttemptError::Write(e) => write!(f, "{e:#}"),
            AttemptError::Rejected { rejected, total } => {
                write!(f, "{rejected} of {total} records rejected")
            }
        }
    }
}

/// Row counts of a completed table scan
#[derive(Debug, Default)]
struct ScanCounts {
    total: u64,
    rejected: u64,
    rejections: Vec<Rejection>,
}

/// Exports whole tables into artifacts, one at a time
///
/// Each table is streamed into a temporary file which is committed under its
/// final name only after the scan finished and the reject policy held. A
/// transient source failure discards the temporary file and restarts the
/// table from its first row.
pub struct TableExporter {
    source: Arc<dyn RecordSource>,
    output: OutputDir,
    settings: ExportSettings,
    telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl TableExporter {
    pub fn new(
        source: Arc<dyn RecordSource>,
        output: OutputDir,
        settings: ExportSettings,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Self {
        Self {
            source,
            output,
            settings,
            telemetry_tx,
        }
    }

    pub async fn export(&self, table: &str, run_stamp: &str) -> Result<TableExport, IngestError> {
        let file_name = OutputDir::artifact_name(table, run_stamp);
        let exporter = self;
        let file_name = file_name.as_str();
        let mut attempt = 0u32;

        let result = with_retry(
            &self.settings.retry,
            "export table",
            AttemptError::is_transient,
            || {
                attempt += 1;
                let attempt = attempt;
                async move { exporter.export_once(table, file_name, attempt).await }
            },
        )
        .await;

        result.map_err(|exhausted| match exhausted.error {
            AttemptError::Config(message) => IngestError::Config(message),
            AttemptError::Source(cause) => IngestError::Source {
                attempts: exhausted.attempts,
                cause: cause.context(format!("Failed to export table '{table}'")),
            },
            AttemptError::Write(e) => {
                IngestError::Write(e.context(format!("Failed to write artifact for '{table}'")))
            }
            AttemptError::Rejected { rejected, total } => IngestError::TooManyRejected {
                table: table.to_string(),
                rejected,
                total,
            },
        })
    }

    async fn export_once(
        &self,
        table: &str,
        file_name: &str,
        attempt: u32,
    ) -> Result<TableExport, AttemptError> {
        let _ = self.telemetry_tx.send(TelemetryEvent::TableStarted {
            table: table.to_string(),
            attempt,
        });
        info!(table, attempt, "exporting table");

        let columns = self
            .source
            .columns(table)
            .await
            .map_err(AttemptError::Source)?;
        let header = self
            .settings
            .csv
            .encode_header(&columns)
            .map_err(|e| AttemptError::Config(format!("{e:#}")))?;
        let rows = self
            .source
            .rows(table, &columns)
            .await
            .map_err(AttemptError::Source)?;

        let mut pending = self
            .output
            .begin(file_name)
            .await
            .map_err(AttemptError::Write)?;

        let scanned = async {
            pending.append(&header).await.map_err(AttemptError::Write)?;
            self.scan(table, &columns, rows, &mut pending).await
        }
        .await;

        let counts = match scanned {
            Ok(counts) => counts,
            Err(e) => {
                pending.discard().await;
                return Err(e);
            }
        };

        if self.settings.reject.is_exceeded(counts.rejected, counts.total) {
            pending.discard().await;
            return Err(AttemptError::Rejected {
                rejected: counts.rejected,
                total: counts.total,
            });
        }

        let artifact = pending.commit().await.map_err(AttemptError::Write)?;
        let rows_written = counts.total - counts.rejected;

        info!(
            table,
            file = %artifact.file_name,
            rows_written,
            rows_rejected = counts.rejected,
            bytes = artifact.bytes,
            "table exported"
        );
        let _ = self.telemetry_tx.send(TelemetryEvent::TableCompleted {
            table: table.to_string(),
        });

        Ok(TableExport {
            table: table.to_string(),
            columns,
            artifact,
            rows_written,
            rows_rejected: counts.rejected,
            rejections: counts.rejections,
        })
    }

    /// Validate every row of the stream and append valid ones chunk by chunk
    async fn scan(
        &self,
        table: &str,
        columns: &[String],
        mut rows: RowStream,
        pending: &mut PendingArtifact,
    ) -> Result<ScanCounts, AttemptError> {
        let chunk_size = self.settings.chunk_size.max(1);
        let mut chunk: Vec<SourceRecord> = Vec::with_capacity(chunk_size.min(4096));
        let mut counts = ScanCounts::default();

        loop {
            let next = tokio::time::timeout(FETCH_TIMEOUT, rows.next())
                .await
                .with_context(|| format!("Timed out waiting for rows of '{table}'"))
                .map_err(AttemptError::Source)?;

            let Some(row) = next else { break };
            let row = row.map_err(AttemptError::Source)?;
            counts.total += 1;

            match validate_row(columns, counts.total, row, &self.settings.csv) {
                Ok(record) => {
                    chunk.push(record);
                    if chunk.len() >= chunk_size {
                        self.write_chunk(pending, &mut chunk).await?;
                    }
                }
                Err(issue) => {
                    counts.rejected += 1;
                    warn!(table, ordinal = counts.total, "skipping malformed record: {issue}");
                    let _ = self.telemetry_tx.send(TelemetryEvent::RecordRejected);

                    if counts.rejections.len() < MAX_RECORDED_REJECTIONS {
                        counts.rejections.push(Rejection::new(counts.total, &issue));
                    }
                    if self.settings.reject.aborts_immediately() {
                        return Err(AttemptError::Rejected {
                            rejected: counts.rejected,
                            total: counts.total,
                        });
                    }
                }
            }
        }

        if !chunk.is_empty() {
            self.write_chunk(pending, &mut chunk).await?;
        }

        Ok(counts)
    }

    async fn write_chunk(
        &self,
        pending: &mut PendingArtifact,
        chunk: &mut Vec<SourceRecord>,
    ) -> Result<(), AttemptError> {
        let start = Instant::now();
        let bytes = self
            .settings
            .csv
            .encode_records(chunk)
            .map_err(AttemptError::Write)?;
        pending.append(&bytes).await.map_err(AttemptError::Write)?;

        let _ = self.telemetry_tx.send(TelemetryEvent::ChunkWritten {
            records: chunk.len() as u64,
            bytes: bytes.len() as u64,
            duration_ms: start.elapsed().as_millis() as u64,
        });
        chunk.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{MockSource, row};
    use crate::source::FieldValue;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    const STAMP: &str = "20251203T100000Z";

    fn settings() -> ExportSettings {
        ExportSettings {
            csv: CsvOptions::default(),
            chunk_size: 2,
            retry: RetryPolicy::new(3, Duration::ZERO),
            reject: RejectPolicy::default(),
        }
    }

    async fn exporter(
        source: MockSource,
        settings: ExportSettings,
    ) -> (TableExporter, TempDir, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let tmp = TempDir::new().unwrap();
        let output = OutputDir::prepare(tmp.path()).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TableExporter::new(Arc::new(source), output, settings, tx),
            tmp,
            rx,
        )
    }

    fn file_names(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_export_writes_header_and_rows_in_chunks() {
        let source = MockSource::new().with_table(
            "people",
            &["id", "name"],
            vec![
                row(&["1", "Ada"]),
                vec![FieldValue::text("2"), FieldValue::Null],
                row(&["3", "Doe, Jane"]),
            ],
        );
        let (exporter, tmp, mut rx) = exporter(source, settings()).await;

        let export = exporter.export("people", STAMP).await.unwrap();

        assert_eq!(export.rows_written, 3);
        assert_eq!(export.rows_rejected, 0);
        assert_eq!(export.artifact.file_name, "people_20251203T100000Z.csv");
        let contents = std::fs::read_to_string(&export.artifact.path).unwrap();
        assert_eq!(contents, "id,name\n1,Ada\n2,\n3,\"Doe, Jane\"\n");
        assert_eq!(export.artifact.bytes, contents.len() as u64);
        assert_eq!(file_names(tmp.path()), vec!["people_20251203T100000Z.csv"]);

        drop(exporter);
        let mut chunks = 0;
        while let Some(event) = rx.recv().await {
            if let TelemetryEvent::ChunkWritten { .. } = event {
                chunks += 1;
            }
        }
        assert_eq!(chunks, 2);
    }

    #[tokio::test]
    async fn test_empty_table_produces_header_only_artifact() {
        let source = MockSource::new().with_table("empty", &["id"], vec![]);
        let (exporter, _tmp, _rx) = exporter(source, settings()).await;

        let export = exporter.export("empty", STAMP).await.unwrap();

        assert_eq!(export.rows_written, 0);
        assert_eq!(std::fs::read_to_string(&export.artifact.path).unwrap(), "id\n");
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped_and_recorded() {
        let source = MockSource::new().with_table(
            "people",
            &["id", "name"],
            vec![row(&["1", "Ada"]), row(&["2"]), row(&["3", "Grace"])],
        );
        let (exporter, _tmp, _rx) = exporter(source, settings()).await;

        let export = exporter.export("people", STAMP).await.unwrap();

        assert_eq!(export.rows_written, 2);
        assert_eq!(export.rows_rejected, 1);
        assert_eq!(export.rejections.len(), 1);
        assert_eq!(export.rejections[0].ordinal, 2);
        assert_eq!(export.rejections[0].error_type, "width_mismatch");
        let contents = std::fs::read_to_string(&export.artifact.path).unwrap();
        assert_eq!(contents, "id,name\n1,Ada\n3,Grace\n");
    }

    #[tokio::test]
    async fn test_majority_malformed_aborts_without_artifact() {
        let source = MockSource::new().with_table(
            "people",
            &["id", "name"],
            vec![row(&["1"]), row(&["2"]), row(&["3", "Grace"])],
        );
        let (exporter, tmp, _rx) = exporter(source, settings()).await;

        let err = exporter.export("people", STAMP).await.unwrap_err();

        assert!(matches!(
            err,
            IngestError::TooManyRejected {
                rejected: 2,
                total: 3,
                ..
            }
        ));
        assert_eq!(err.exit_code(), 6);
        assert!(file_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_strict_policy_aborts_on_first_malformed_record() {
        let source = MockSource::new().with_table(
            "people",
            &["id", "name"],
            vec![row(&["1", "Ada"]), row(&["2"]), row(&["3", "Grace"])],
        );
        let settings = ExportSettings {
            reject: RejectPolicy::strict(),
            ..settings()
        };
        let (exporter, tmp, _rx) = exporter(source, settings).await;

        let err = exporter.export("people", STAMP).await.unwrap_err();

        assert!(matches!(
            err,
            IngestError::TooManyRejected {
                rejected: 1,
                total: 2,
                ..
            }
        ));
        assert!(file_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_mid_stream_restarts_table() {
        let source = MockSource::new()
            .with_table("people", &["id"], vec![row(&["1"]), row(&["2"])])
            .failing_streams(1);
        let (exporter, tmp, _rx) = exporter(source, settings()).await;

        let export = exporter.export("people", STAMP).await.unwrap();

        assert_eq!(export.rows_written, 2);
        let contents = std::fs::read_to_string(&export.artifact.path).unwrap();
        assert_eq!(contents, "id\n1\n2\n");
        assert_eq!(file_names(tmp.path()), vec!["people_20251203T100000Z.csv"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_times_out_and_restarts_table() {
        let source = MockSource::new()
            .with_table("people", &["id"], vec![row(&["1"]), row(&["2"])])
            .stalling_streams(1);
        let (exporter, tmp, mut rx) = exporter(source, settings()).await;

        let export = exporter.export("people", STAMP).await.unwrap();

        assert_eq!(export.rows_written, 2);
        assert_eq!(file_names(tmp.path()), vec!["people_20251203T100000Z.csv"]);

        drop(exporter);
        let mut attempts = Vec::new();
        while let Some(event) = rx.recv().await {
            if let TelemetryEvent::TableStarted { attempt, .. } = event {
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_exhausts_attempts_without_output() {
        let source = MockSource::new()
            .with_table("people", &["id"], vec![row(&["1"]), row(&["2"])])
            .stalling_streams(u32::MAX);
        let settings = ExportSettings {
            retry: RetryPolicy::new(3, Duration::from_secs(1)),
            ..settings()
        };
        let (exporter, tmp, _rx) = exporter(source, settings).await;
        let started = tokio::time::Instant::now();

        let err = exporter.export("people", STAMP).await.unwrap_err();

        assert!(matches!(err, IngestError::Source { attempts: 3, .. }));
        assert!(format!("{err}").contains("Timed out waiting for rows of 'people'"));
        assert!(started.elapsed() >= FETCH_TIMEOUT * 3);
        assert!(file_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_persistent_transient_failure_exhausts_attempts() {
        let source = Arc::new(
            MockSource::new()
                .with_table("people", &["id"], vec![row(&["1"])])
                .failing_columns(10),
        );
        let tmp = TempDir::new().unwrap();
        let output = OutputDir::prepare(tmp.path()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let exporter = TableExporter::new(source.clone(), output, settings(), tx);

        let err = exporter.export("people", STAMP).await.unwrap_err();

        assert!(matches!(err, IngestError::Source { attempts: 3, .. }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(source.column_calls.load(Ordering::SeqCst), 3);
        assert!(file_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let source = Arc::new(
            MockSource::new()
                .with_table("people", &["id"], vec![])
                .permanently_broken(),
        );
        let tmp = TempDir::new().unwrap();
        let output = OutputDir::prepare(tmp.path()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let exporter = TableExporter::new(source.clone(), output, settings(), tx);

        let err = exporter.export("people", STAMP).await.unwrap_err();

        assert!(matches!(err, IngestError::Source { attempts: 1, .. }));
        assert_eq!(source.column_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unwritable_header_is_a_config_error() {
        let source = MockSource::new().with_table("people", &["last, first"], vec![]);
        let settings = ExportSettings {
            csv: CsvOptions {
                quote_style: crate::formats::QuoteStyle::None,
                ..CsvOptions::default()
            },
            ..settings()
        };
        let (exporter, _tmp, _rx) = exporter(source, settings).await;

        let err = exporter.export("people", STAMP).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
