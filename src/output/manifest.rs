use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::artifact::{CommittedArtifact, OutputDir};
use crate::source::Rejection;

/// Entry for one exported table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub table: String,
    pub file_name: String,
    pub columns: Vec<String>,
    pub rows_written: u64,
    pub rows_rejected: u64,
    pub bytes: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_to: Option<String>,
    /// First rejections of the table (see `MAX_RECORDED_REJECTIONS`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejections: Vec<Rejection>,
}

/// The manifest file written as the last step of a successful run
///
/// Its presence marks the run's artifacts as complete. Layout:
///   {output_dir}/manifest_{run_stamp}.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub run_stamp: String,
    pub status: String,
    pub started_at: String,   // ISO 8601
    pub completed_at: String, // ISO 8601
    pub source: String,
    pub artifacts: Vec<ArtifactEntry>,
    /// Requested tables that did not exist at export time
    #[serde(default)]
    pub skipped_tables: Vec<String>,
}

impl RunManifest {
    pub fn file_name(run_stamp: &str) -> String {
        format!("manifest_{run_stamp}.json")
    }

    pub fn rows_written(&self) -> u64 {
        self.artifacts.iter().map(|a| a.rows_written).sum()
    }

    pub fn rows_rejected(&self) -> u64 {
        self.artifacts.iter().map(|a| a.rows_rejected).sum()
    }
}

/// Serialize and atomically write the manifest into the output directory
pub async fn write_manifest(output: &OutputDir, manifest: &RunManifest) -> Result<CommittedArtifact> {
    let json = serde_json::to_string_pretty(manifest).context("Failed to serialize run manifest")?;

    output
        .write_atomic(&RunManifest::file_name(&manifest.run_stamp), json.as_bytes())
        .await
        .context("Failed to write run manifest")
}

/// Read a manifest back from disk
#[cfg(test)]
pub async fn read_manifest(path: &std::path::Path) -> Result<RunManifest> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    serde_json::from_str(&contents).context("Failed to parse run manifest")
}
