use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::exporter::{ExportSettings, TableExport, TableExporter};
use crate::error::IngestError;
use crate::output::{ArtifactEntry, CommittedArtifact, OutputDir, RunManifest, write_manifest};
use crate::publish::ArtifactPublisher;
use crate::retry::{self, with_retry};
use crate::source::RecordSource;
use crate::telemetry::{ProgressStats, TelemetryEvent, spawn_progress};

/// Configuration for one ingestion run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub tables: Vec<String>,
    pub run_stamp: String,
    pub started_at: DateTime<Utc>,
    pub export: ExportSettings,
    pub fail_on_empty: bool,
    pub quiet: bool,
}

/// Result of a completed run
#[derive(Debug)]
pub struct RunReport {
    pub manifest: RunManifest,
    pub manifest_path: PathBuf,
    pub duration: Duration,
    /// Chunk statistics, when progress was rendered
    pub progress: Option<ProgressStats>,
}

/// The Coordinator drives a run from the first table to the manifest.
///
/// Either every step succeeds and the manifest is written last, or every file
/// committed by the run is removed again (or restored to what an earlier run
/// with the same stamp left there) before the error is returned.
pub struct Coordinator {
    source: Arc<dyn RecordSource>,
    output: OutputDir,
    publisher: Option<Arc<dyn ArtifactPublisher>>,
    config: RunConfig,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn RecordSource>,
        output: OutputDir,
        publisher: Option<Arc<dyn ArtifactPublisher>>,
        config: RunConfig,
    ) -> Self {
        Self {
            source,
            output,
            publisher,
            config,
        }
    }

    /// Run the complete ingestion
    ///
    /// 1. Export each configured table that exists, in order
    /// 2. Fail if nothing was exported and the run requires output
    /// 3. Publish artifacts
    /// 4. Write the manifest, then publish it
    pub async fn run(&self) -> Result<RunReport, IngestError> {
        let start_time = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        info!(
            %run_id,
            run_stamp = %self.config.run_stamp,
            source = %self.source.location(),
            output = %self.output.path().display(),
            tables = self.config.tables.len(),
            "starting ingestion run"
        );

        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let progress = if self.config.quiet {
            None
        } else {
            Some(spawn_progress(self.config.tables.len(), telemetry_rx))
        };

        let mut committed = Vec::new();
        let outcome = self.execute(&run_id, telemetry_tx, &mut committed).await;

        // The channel is closed once `execute` returns, which ends the progress task
        let progress = match progress {
            Some(handle) => handle.await.ok(),
            None => None,
        };

        match outcome {
            Ok((manifest, manifest_path)) => {
                self.output.release(&committed).await;
                Ok(RunReport {
                    manifest,
                    manifest_path,
                    duration: start_time.elapsed(),
                    progress,
                })
            }
            Err(e) => {
                error!(%run_id, exit_code = e.exit_code(), "ingestion run failed: {e}");
                self.output.remove_committed(&committed).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run_id: &str,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
        committed: &mut Vec<CommittedArtifact>,
    ) -> Result<(RunManifest, PathBuf), IngestError> {
        let exporter = TableExporter::new(
            self.source.clone(),
            self.output.clone(),
            self.config.export.clone(),
            telemetry_tx,
        );

        let mut exports = Vec::with_capacity(self.config.tables.len());
        let mut skipped_tables = Vec::new();

        for table in &self.config.tables {
            if !self.table_exists(table).await? {
                warn!(%table, "table not found, skipping");
                skipped_tables.push(table.clone());
                continue;
            }

            let export = exporter.export(table, &self.config.run_stamp).await?;
            committed.push(export.artifact.clone());
            exports.push(export);
        }
        drop(exporter);

        if exports.is_empty() {
            if self.config.fail_on_empty {
                return Err(IngestError::NothingExported);
            }
            warn!("no tables were exported; writing an empty manifest");
        }

        let mut artifacts = Vec::with_capacity(exports.len());
        for export in exports {
            let published_to = self.publish(&export.artifact).await?;
            artifacts.push(Self::artifact_entry(export, published_to));
        }

        let manifest = RunManifest {
            run_id: run_id.to_string(),
            run_stamp: self.config.run_stamp.clone(),
            status: "succeeded".to_string(),
            started_at: self.config.started_at.to_rfc3339(),
            completed_at: Utc::now().to_rfc3339(),
            source: self.source.location(),
            artifacts,
            skipped_tables,
        };

        let written = write_manifest(&self.output, &manifest)
            .await
            .map_err(IngestError::Write)?;
        committed.push(written.clone());
        self.publish(&written).await?;

        info!(
            run_id,
            artifacts = manifest.artifacts.len(),
            rows_written = manifest.rows_written(),
            rows_rejected = manifest.rows_rejected(),
            manifest = %written.file_name,
            "ingestion run succeeded"
        );

        Ok((manifest, written.path))
    }

    async fn table_exists(&self, table: &str) -> Result<bool, IngestError> {
        let source = self.source.as_ref();
        with_retry(
            &self.config.export.retry,
            "table existence check",
            retry::is_transient,
            || source.table_exists(table),
        )
        .await
        .map_err(|exhausted| IngestError::Source {
            attempts: exhausted.attempts,
            cause: exhausted.error,
        })
    }

    async fn publish(&self, artifact: &CommittedArtifact) -> Result<Option<String>, IngestError> {
        let Some(publisher) = &self.publisher else {
            return Ok(None);
        };
        publisher
            .publish(&artifact.path, &artifact.file_name)
            .await
            .map(Some)
            .map_err(|e| {
                IngestError::Publish(e.context(format!(
                    "Failed to publish {} to {}",
                    artifact.file_name,
                    publisher.destination()
                )))
            })
    }

    fn artifact_entry(export: TableExport, published_to: Option<String>) -> ArtifactEntry {
        ArtifactEntry {
            table: export.table,
            file_name: export.artifact.file_name,
            columns: export.columns,
            rows_written: export.rows_written,
            rows_rejected: export.rows_rejected,
            bytes: export.artifact.bytes,
            sha256: export.artifact.sha256,
            published_to,
            rejections: export.rejections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::CsvOptions;
    use crate::output::manifest::read_manifest;
    use crate::pipeline::test_support::{MockPublisher, MockSource, row};
    use crate::retry::RetryPolicy;
    use crate::source::RejectPolicy;
    use tempfile::TempDir;

    const STAMP: &str = "20251203T100000Z";

    fn config(tables: &[&str]) -> RunConfig {
        RunConfig {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            run_stamp: STAMP.to_string(),
            started_at: Utc::now(),
            export: ExportSettings {
                csv: CsvOptions::default(),
                chunk_size: 100,
                retry: RetryPolicy::new(2, Duration::ZERO),
                reject: RejectPolicy::default(),
            },
            fail_on_empty: false,
            quiet: true,
        }
    }

    fn warehouse() -> MockSource {
        MockSource::new()
            .with_table("orders", &["id", "total"], vec![row(&["1", "9.99"]), row(&["2", "5.00"])])
            .with_table("customers", &["id", "name"], vec![row(&["7", "Ada"])])
    }

    async fn coordinator(
        source: MockSource,
        publisher: Option<Arc<dyn ArtifactPublisher>>,
        config: RunConfig,
    ) -> (Coordinator, TempDir) {
        let tmp = TempDir::new().unwrap();
        let output = OutputDir::prepare(tmp.path()).await.unwrap();
        (
            Coordinator::new(Arc::new(source), output, publisher, config),
            tmp,
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
    async fn test_run_exports_tables_and_writes_manifest_last() {
        let (coordinator, tmp) =
            coordinator(warehouse(), None, config(&["orders", "ghost", "customers"])).await;

        let report = coordinator.run().await.unwrap();

        assert_eq!(
            file_names(tmp.path()),
            vec![
                "customers_20251203T100000Z.csv",
                "manifest_20251203T100000Z.json",
                "orders_20251203T100000Z.csv",
            ]
        );
        let manifest = read_manifest(&report.manifest_path).await.unwrap();
        assert_eq!(manifest, report.manifest);
        assert_eq!(manifest.status, "succeeded");
        assert_eq!(manifest.skipped_tables, vec!["ghost"]);
        assert_eq!(manifest.rows_written(), 3);
        let tables: Vec<&str> = manifest.artifacts.iter().map(|a| a.table.as_str()).collect();
        assert_eq!(tables, vec!["orders", "customers"]);
        assert_eq!(manifest.artifacts[0].sha256.len(), 64);
        assert!(manifest.artifacts[0].published_to.is_none());
    }

    #[tokio::test]
    async fn test_empty_run_writes_empty_manifest() {
        let (coordinator, tmp) = coordinator(warehouse(), None, config(&["ghost"])).await;

        let report = coordinator.run().await.unwrap();

        assert!(report.manifest.artifacts.is_empty());
        assert_eq!(file_names(tmp.path()), vec!["manifest_20251203T100000Z.json"]);
    }

    #[tokio::test]
    async fn test_empty_run_fails_when_output_required() {
        let config = RunConfig {
            fail_on_empty: true,
            ..config(&["ghost"])
        };
        let (coordinator, tmp) = coordinator(warehouse(), None, config).await;

        let err = coordinator.run().await.unwrap_err();

        assert!(matches!(err, IngestError::NothingExported));
        assert_eq!(err.exit_code(), 2);
        assert!(file_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_table_rolls_back_earlier_artifacts() {
        let source = warehouse().with_table("broken", &["id", "note"], vec![row(&["1"])]);
        let (coordinator, tmp) =
            coordinator(source, None, config(&["orders", "broken", "customers"])).await;

        let err = coordinator.run().await.unwrap_err();

        assert_eq!(err.exit_code(), 6);
        assert!(file_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_source_outage_fails_run_without_output() {
        let (coordinator, tmp) =
            coordinator(warehouse().failing_columns(5), None, config(&["orders"])).await;

        let err = coordinator.run().await.unwrap_err();

        assert!(matches!(err, IngestError::Source { attempts: 2, .. }));
        assert!(file_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_leaves_no_partial_output() {
        let (coordinator, tmp) = coordinator(warehouse(), None, config(&["orders", "customers"])).await;
        // A directory squatting on the second artifact's name makes its rename fail
        std::fs::create_dir(tmp.path().join("customers_20251203T100000Z.csv")).unwrap();

        let err = coordinator.run().await.unwrap_err();

        assert_eq!(err.exit_code(), 4);
        assert_eq!(file_names(tmp.path()), vec!["customers_20251203T100000Z.csv"]);
        assert!(tmp.path().join("customers_20251203T100000Z.csv").is_dir());
    }

    #[tokio::test]
    async fn test_artifacts_and_manifest_are_published() {
        let publisher = Arc::new(MockPublisher::default());
        let (coordinator, _tmp) = coordinator(
            warehouse(),
            Some(publisher.clone() as Arc<dyn ArtifactPublisher>),
            config(&["orders", "customers"]),
        )
        .await;

        let report = coordinator.run().await.unwrap();

        assert_eq!(
            publisher.uploaded(),
            vec![
                "orders_20251203T100000Z.csv",
                "customers_20251203T100000Z.csv",
                "manifest_20251203T100000Z.json",
            ]
        );
        assert_eq!(
            report.manifest.artifacts[1].published_to.as_deref(),
            Some("mock://bucket/customers_20251203T100000Z.csv")
        );
    }

    #[tokio::test]
    async fn test_publish_failure_rolls_back_local_output() {
        let publisher = Arc::new(MockPublisher::failing_on(3));
        let (coordinator, tmp) = coordinator(
            warehouse(),
            Some(publisher.clone() as Arc<dyn ArtifactPublisher>),
            config(&["orders", "customers"]),
        )
        .await;

        let err = coordinator.run().await.unwrap_err();

        assert_eq!(err.exit_code(), 5);
        assert_eq!(publisher.uploaded().len(), 2);
        assert!(file_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_rerun_with_same_stamp_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let output = OutputDir::prepare(tmp.path()).await.unwrap();

        let mut digests = Vec::new();
        for _ in 0..2 {
            let coordinator = Coordinator::new(
                Arc::new(warehouse()),
                output.clone(),
                None,
                config(&["orders", "customers"]),
            );
            let report = coordinator.run().await.unwrap();
            let run: Vec<String> = report
                .manifest
                .artifacts
                .iter()
                .map(|a| a.sha256.clone())
                .collect();
            digests.push(run);
        }

        assert_eq!(digests[0], digests[1]);
        assert_eq!(file_names(tmp.path()).len(), 3);
    }

    #[tokio::test]
    async fn test_failed_rerun_keeps_earlier_run_intact() {
        let tmp = TempDir::new().unwrap();
        let output = OutputDir::prepare(tmp.path()).await.unwrap();
        let orders = tmp.path().join("orders_20251203T100000Z.csv");
        let manifest = tmp.path().join("manifest_20251203T100000Z.json");

        Coordinator::new(
            Arc::new(warehouse()),
            output.clone(),
            None,
            config(&["orders", "customers"]),
        )
        .run()
        .await
        .unwrap();
        let orders_before = std::fs::read(&orders).unwrap();
        let manifest_before = std::fs::read(&manifest).unwrap();

        let changed = MockSource::new()
            .with_table("orders", &["id", "total"], vec![row(&["3", "1.00"])])
            .with_table("broken", &["id", "note"], vec![row(&["1"])]);
        let err = Coordinator::new(
            Arc::new(changed),
            output,
            None,
            config(&["orders", "broken"]),
        )
        .run()
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), 6);
        assert_eq!(
            file_names(tmp.path()),
            vec![
                "customers_20251203T100000Z.csv",
                "manifest_20251203T100000Z.json",
                "orders_20251203T100000Z.csv",
            ]
        );
        assert_eq!(std::fs::read(&orders).unwrap(), orders_before);
        assert_eq!(std::fs::read(&manifest).unwrap(), manifest_before);
    }
}
