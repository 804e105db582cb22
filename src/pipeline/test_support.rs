//! In-memory sources and publishers for pipeline tests

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::publish::ArtifactPublisher;
use crate::source::{FieldValue, RawRow, RecordSource, RowStream};

fn timed_out(what: &str) -> anyhow::Error {
    anyhow::Error::new(IoError::new(ErrorKind::TimedOut, "read timed out"))
        .context(format!("Failed to {what}"))
}

#[derive(Clone)]
struct MockTable {
    columns: Vec<String>,
    rows: Vec<RawRow>,
}

/// Source serving fixed tables, optionally failing a number of times first
#[derive(Default)]
pub struct MockSource {
    tables: HashMap<String, MockTable>,
    /// Transient failures injected into `columns` before it succeeds
    column_failures: AtomicU32,
    /// Transient failures injected mid-stream (after the first row)
    stream_failures: AtomicU32,
    /// Streams that stop answering (after the first row) instead of failing
    stream_stalls: AtomicU32,
    permanent_failure: bool,
    pub column_calls: AtomicU32,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, columns: &[&str], rows: Vec<RawRow>) -> Self {
        self.tables.insert(
            name.to_string(),
            MockTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        );
        self
    }

    pub fn failing_columns(self, times: u32) -> Self {
        self.column_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn failing_streams(self, times: u32) -> Self {
        self.stream_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn stalling_streams(self, times: u32) -> Self {
        self.stream_stalls.store(times, Ordering::SeqCst);
        self
    }

    pub fn permanently_broken(mut self) -> Self {
        self.permanent_failure = true;
        self
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn table(&self, name: &str) -> Result<&MockTable> {
        self.tables
            .get(name)
            .ok_or_else(|| anyhow!("relation \"{name}\" does not exist"))
    }
}

#[async_trait]
impl RecordSource for MockSource {
    fn location(&self) -> String {
        "mock://warehouse".to_string()
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.contains_key(table))
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>> {
        self.column_calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent_failure {
            bail!("permission denied for table {table}");
        }
        if Self::take_failure(&self.column_failures) {
            return Err(timed_out("list table columns"));
        }
        Ok(self.table(table)?.columns.clone())
    }

    async fn rows(&self, table: &str, _columns: &[String]) -> Result<RowStream> {
        let mut items: Vec<Result<RawRow>> = self.table(table)?.rows.iter().cloned().map(Ok).collect();
        if Self::take_failure(&self.stream_failures) {
            items.truncate(1);
            items.push(Err(timed_out("read rows")));
        }
        if Self::take_failure(&self.stream_stalls) {
            items.truncate(1);
            return Ok(Box::pin(
                futures::stream::iter(items).chain(futures::stream::pending()),
            ));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Shorthand for a row of text values
pub fn row(values: &[&str]) -> RawRow {
    values.iter().map(|v| FieldValue::text(*v)).collect()
}

/// Publisher recording uploads, optionally refusing the n-th one (1-based)
#[derive(Default)]
pub struct MockPublisher {
    pub uploads: Mutex<Vec<String>>,
    fail_on: Option<usize>,
}

impl MockPublisher {
    pub fn failing_on(upload: usize) -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            fail_on: Some(upload),
        }
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactPublisher for MockPublisher {
    fn destination(&self) -> String {
        "mock://bucket".to_string()
    }

    async fn publish(&self, local_path: &Path, file_name: &str) -> Result<String> {
        if !local_path.is_file() {
            bail!("{} is not a file", local_path.display());
        }
        let mut uploads = self.uploads.lock().unwrap();
        if self.fail_on == Some(uploads.len() + 1) {
            bail!("AccessDenied: not allowed to write {file_name}");
        }
        uploads.push(file_name.to_string());
        Ok(format!("mock://bucket/{file_name}"))
    }
}
