use thiserror::Error;

/// Run-level failure of an ingestion job
///
/// Lower layers report failures as `anyhow::Error` with context; the pipeline
/// classifies them into one of these variants before they reach the process
/// boundary, where each variant maps to a distinct exit code.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("source unavailable after {attempts} attempt(s): {cause:#}")]
    Source { attempts: u32, cause: anyhow::Error },

    #[error("table '{table}' has too many malformed records: {rejected} of {total} rejected")]
    TooManyRejected {
        table: String,
        rejected: u64,
        total: u64,
    },

    #[error("failed to write artifacts: {0:#}")]
    Write(anyhow::Error),

    #[error("failed to publish artifacts: {0:#}")]
    Publish(anyhow::Error),

    #[error("no tables were exported; check table names and permissions")]
    NothingExported,
}

impl IngestError {
    pub fn exit_code(&self) -> u8 {
        match self {
            IngestError::Config(_) => 1,
            IngestError::NothingExported => 2,
            IngestError::Source { .. } => 3,
            IngestError::Write(_) => 4,
            IngestError::Publish(_) => 5,
            IngestError::TooManyRejected { .. } => 6,
        }
    }
}
