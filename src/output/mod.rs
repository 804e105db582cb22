//! Output directory handling: atomic artifact writes, rollback and the run manifest

pub mod artifact;
pub mod manifest;

pub use artifact::{CommittedArtifact, OutputDir, PendingArtifact};
pub use manifest::{ArtifactEntry, RunManifest, write_manifest};
