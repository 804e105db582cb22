use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::TryStreamExt;

use super::{RecordSource, RowStream};
use crate::config::QUERY_TIMEOUT;
use crate::db::{Pool, quote_ident};

/// `RecordSource` backed by the tables of one database schema
pub struct DatabaseSource {
    pool: Pool,
    schema: String,
    location: String,
}

impl DatabaseSource {
    pub fn new(pool: Pool, schema: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
            location: location.into(),
        }
    }

    /// Build the export query; every column is cast to text so any column
    /// type can be written to CSV without per-type handling
    fn select_sql(&self, table: &str, columns: &[String]) -> String {
        let projection: Vec<String> = columns
            .iter()
            .map(|c| format!("CAST({} AS TEXT)", quote_ident(c)))
            .collect();
        format!(
            "SELECT {} FROM {}",
            projection.join(", "),
            self.pool.qualified_table_name(&self.schema, table)
        )
    }
}

#[async_trait]
impl RecordSource for DatabaseSource {
    fn location(&self) -> String {
        self.location.clone()
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        tokio::time::timeout(QUERY_TIMEOUT, self.pool.table_exists(&self.schema, table))
            .await
            .context("Timed out checking table existence")?
            .context("Failed to check table existence")
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>> {
        let columns =
            tokio::time::timeout(QUERY_TIMEOUT, self.pool.table_columns(&self.schema, table))
                .await
                .context("Timed out listing table columns")?
                .context("Failed to list table columns")?;

        if columns.is_empty() {
            bail!("Table '{}.{}' has no columns", self.schema, table);
        }
        Ok(columns)
    }

    async fn rows(&self, table: &str, columns: &[String]) -> Result<RowStream> {
        let sql = self.select_sql(table, columns);
        tracing::debug!(%sql, "opening row stream");

        let table = table.to_string();
        let stream = self
            .pool
            .stream_text_rows(sql)
            .map_err(move |e| anyhow::Error::new(e).context(format!("Failed to read rows of '{table}'")));

        Ok(Box::pin(stream))
    }
}
