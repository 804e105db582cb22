//! Publishing committed artifacts to remote storage

pub mod s3;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

pub use s3::S3Publisher;

/// Destination for committed artifacts
///
/// Implementations handle their own transient-failure retries; an error
/// returned from `publish` fails the run.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    /// Human-readable destination, e.g. `s3://bucket/prefix`
    fn destination(&self) -> String;

    /// Upload one local file and return the location it was stored at
    async fn publish(&self, local_path: &Path, file_name: &str) -> Result<String>;
}
