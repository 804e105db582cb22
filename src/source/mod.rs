//! Source acquisition: where Source Records come from and how they are validated

pub mod database;
pub mod record;
pub mod validate;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use database::DatabaseSource;
pub use record::{FieldValue, RawRow, Rejection, SourceRecord};
pub use validate::{RejectPolicy, validate_row};

/// Stream of raw rows for one table, in scan order
pub type RowStream = BoxStream<'static, Result<RawRow>>;

/// Abstraction over the external system records are ingested from
///
/// Errors returned here are acquisition errors. The pipeline retries the ones
/// `retry::is_transient` accepts and fails the run on the rest.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Human-readable location of the source for logs and the run manifest
    fn location(&self) -> String;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Column names of the table, in ordinal order
    async fn columns(&self, table: &str) -> Result<Vec<String>>;

    /// Open a stream over every row of the table, one value per column
    async fn rows(&self, table: &str, columns: &[String]) -> Result<RowStream>;
}
