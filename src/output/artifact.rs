use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// The directory a run writes its artifacts into
///
/// Files become visible under their final name only through `commit`, which
/// renames a fully written and synced temporary file. Temporaries are hidden
/// dot-files carrying a random suffix:
///   {root}/.{name}.{uuid}.partial
///
/// A file replaced by a commit is kept as `.{name}.{uuid}.previous` until the
/// run either succeeds (`release`) or is rolled back (`remove_committed`).
#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    /// Create the directory if needed and check it is usable
    pub async fn prepare(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create output directory {}", root.display()))?;

        let metadata = fs::metadata(&root)
            .await
            .with_context(|| format!("Failed to inspect output directory {}", root.display()))?;
        if !metadata.is_dir() {
            bail!("Output path {} is not a directory", root.display());
        }

        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Artifact file name for a table within a run
    pub fn artifact_name(table: &str, run_stamp: &str) -> String {
        format!("{table}_{run_stamp}.csv")
    }

    /// Start writing a file that will become `file_name` on commit
    pub async fn begin(&self, file_name: &str) -> Result<PendingArtifact> {
        let final_path = self.root.join(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.partial", file_name, Uuid::new_v4().simple()));

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;

        Ok(PendingArtifact {
            file_name: file_name.to_string(),
            temp_path,
            final_path,
            file: Some(file),
            hasher: Sha256::new(),
            bytes_written: 0,
        })
    }

    /// Write a small file atomically (temporary file, then rename)
    pub async fn write_atomic(&self, file_name: &str, contents: &[u8]) -> Result<CommittedArtifact> {
        let mut pending = self.begin(file_name).await?;
        if let Err(e) = pending.append(contents).await {
            pending.discard().await;
            return Err(e);
        }
        pending.commit().await
    }

    /// Undo the commits of a failed run
    ///
    /// Files that replaced an earlier one get the earlier file back; new files
    /// are removed. Commits are undone newest first. Best effort: every file is
    /// attempted and failures are logged, since the caller is already reporting
    /// a more important error.
    pub async fn remove_committed(&self, artifacts: &[CommittedArtifact]) {
        for artifact in artifacts.iter().rev() {
            if let Some(previous) = &artifact.replaced {
                match fs::rename(previous, &artifact.path).await {
                    Ok(()) => tracing::info!(
                        file = %artifact.file_name,
                        "restored file replaced by failed run"
                    ),
                    Err(e) => tracing::error!(
                        file = %artifact.file_name,
                        "failed to restore file replaced by failed run: {e}"
                    ),
                }
                continue;
            }
            match fs::remove_file(&artifact.path).await {
                Ok(()) => tracing::info!(file = %artifact.file_name, "removed artifact of failed run"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::error!(
                    file = %artifact.file_name,
                    "failed to remove artifact of failed run: {e}"
                ),
            }
        }
    }

    /// Drop the copies of replaced files once a run has succeeded
    pub async fn release(&self, artifacts: &[CommittedArtifact]) {
        for previous in artifacts.iter().filter_map(|a| a.replaced.as_ref()) {
            if let Err(e) = fs::remove_file(previous).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %previous.display(), "failed to remove replaced file: {e}");
            }
        }
    }
}

/// A file being written under a temporary name
pub struct PendingArtifact {
    file_name: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<fs::File>,
    hasher: Sha256,
    bytes_written: u64,
}

impl PendingArtifact {
    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .context("Artifact file already closed")?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("Failed to write {}", self.temp_path.display()))?;
        self.hasher.update(bytes);
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flush, sync and rename onto the final name
    pub async fn commit(mut self) -> Result<CommittedArtifact> {
        let mut file = self.file.take().context("Artifact file already closed")?;

        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = synced {
            self.remove_temp().await;
            return Err(e).with_context(|| format!("Failed to sync {}", self.temp_path.display()));
        }

        let replaced = match self.keep_previous().await {
            Ok(replaced) => replaced,
            Err(e) => {
                self.remove_temp().await;
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&self.temp_path, &self.final_path).await {
            self.remove_temp().await;
            if let Some(previous) = &replaced {
                let _ = fs::remove_file(previous).await;
            }
            return Err(e).with_context(|| {
                format!(
                    "Failed to move {} into place as {}",
                    self.temp_path.display(),
                    self.final_path.display()
                )
            });
        }

        Ok(CommittedArtifact {
            file_name: std::mem::take(&mut self.file_name),
            path: self.final_path.clone(),
            bytes: self.bytes_written,
            sha256: format!("{:x}", std::mem::take(&mut self.hasher).finalize()),
            replaced,
        })
    }

    /// Link (or copy) a regular file already holding the final name aside
    async fn keep_previous(&self) -> Result<Option<PathBuf>> {
        match fs::symlink_metadata(&self.final_path).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to inspect {}", self.final_path.display()));
            }
        }

        let previous = self.temp_path.with_extension("previous");
        if fs::hard_link(&self.final_path, &previous).await.is_err() {
            fs::copy(&self.final_path, &previous).await.with_context(|| {
                format!("Failed to keep a copy of {}", self.final_path.display())
            })?;
        }
        Ok(Some(previous))
    }

    /// Drop the temporary file without publishing it
    pub async fn discard(mut self) {
        self.file.take();
        self.remove_temp().await;
    }

    async fn remove_temp(&self) {
        if let Err(e) = fs::remove_file(&self.temp_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.temp_path.display(), "failed to remove temporary file: {e}");
        }
    }
}

impl Drop for PendingArtifact {
    fn drop(&mut self) {
        // Still open means neither commit nor discard ran (error path or panic).
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// A file that is visible under its final name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedArtifact {
    pub file_name: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    /// Copy of the file this commit replaced, if any
    pub replaced: Option<PathBuf>,
}
