use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::mpsc;

/// Telemetry events sent from the exporter to the progress task
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// Export of a table started (or restarted after a transient failure)
    TableStarted { table: String, attempt: u32 },
    /// A chunk of records was encoded and appended to the artifact
    ChunkWritten {
        records: u64,
        bytes: u64,
        duration_ms: u64,
    },
    /// A malformed record was skipped
    RecordRejected,
    /// The table's artifact was committed
    TableCompleted { table: String },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub tables_started: usize,
    pub tables_completed: usize,
    pub records_written: u64,
    pub records_rejected: u64,
    pub bytes_written: u64,
    pub chunk_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::TableStarted { attempt, .. } => {
                // A restart is the same table, not a new one
                if *attempt == 1 {
                    self.tables_started += 1;
                }
            }
            TelemetryEvent::ChunkWritten {
                records,
                bytes,
                duration_ms,
            } => {
                self.records_written += records;
                self.bytes_written += bytes;
                self.chunk_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::RecordRejected => {
                self.records_rejected += 1;
            }
            TelemetryEvent::TableCompleted { .. } => {
                self.tables_completed += 1;
            }
        }
    }

    /// Calculate percentile from chunk write durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.chunk_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.chunk_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}

/// Spawn the task rendering a progress spinner from telemetry events
///
/// The task ends when every sender has been dropped.
pub fn spawn_progress(
    total_tables: usize,
    mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
) -> tokio::task::JoinHandle<ProgressStats> {
    tokio::spawn(async move {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("[{elapsed_precise}] {spinner} {prefix} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));

        let mut stats = ProgressStats::new();
        let mut current_table = String::new();

        while let Some(event) = telemetry_rx.recv().await {
            stats.update(&event);

            match &event {
                TelemetryEvent::TableStarted { table, .. } => current_table = table.clone(),
                TelemetryEvent::TableCompleted { table } => bar.println(format!("exported {table}")),
                _ => {}
            }

            bar.set_prefix(format!(
                "Tables {}/{} | {}",
                stats.tables_completed, total_tables, current_table
            ));
            let (p50, _, p99) = stats.get_percentiles();
            bar.set_message(format!(
                "{} rows, {} rejected, {} | chunk p50: {}ms p99: {}ms",
                stats.records_written,
                stats.records_rejected,
                indicatif::HumanBytes(stats.bytes_written),
                p50.unwrap_or(0),
                p99.unwrap_or(0)
            ));
        }

        bar.finish_and_clear();
        stats
    })
}
