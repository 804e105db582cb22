//! Adapter between bb8 and the sqlx::Postgres driver.
use anyhow::{Context, Result};
use async_stream::try_stream;
use derive_builder::Builder;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Row};
use std::sync::Arc;

use super::ident::quote_ident;
use crate::config::{CONNECT_TIMEOUT, CONNECTION_MAX_LIFETIME, PING_TIMEOUT, POOL_MAX_SIZE};
use crate::source::{FieldValue, RawRow};

/// Inner pool variants
#[derive(Debug, Clone)]
enum PoolInner {
    Postgres(bb8::Pool<ConnectionManager>),
    #[cfg(test)]
    Sqlite(sqlx::SqlitePool),
}

// Wrap pool implementations so the rest of the crate sees one connection source.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: PoolInner,
}

#[derive(Builder)]
pub struct PoolArgs {
    #[builder(setter(into))]
    host: String,
    #[builder(default = "5432")]
    port: u16,
    #[builder(setter(into))]
    database: String,
    #[builder(setter(into))]
    username: String,
    #[builder(setter(into))]
    password: String,
    /// Schema placed on the connection's `search_path`
    #[builder(setter(into), default = "\"public\".to_string()")]
    schema: String,
    #[builder(default = "PgSslMode::Prefer")]
    ssl_mode: PgSslMode,
    #[builder(default = "POOL_MAX_SIZE")]
    max_pool_size: u32,
}

pub async fn pool(args: PoolArgs) -> Result<Pool> {
    let PoolArgs {
        host,
        port,
        database,
        username,
        password,
        schema,
        ssl_mode,
        max_pool_size,
    } = args;

    let connect_options = PgConnectOptions::new()
        .host(&host)
        .port(port)
        .database(&database)
        .username(&username)
        .password(&password)
        .ssl_mode(ssl_mode)
        .options([("search_path", schema.as_str())]);

    let conn_manager = ConnectionManager::new(connect_options);

    // No min_idle: connections are opened on first use, so connection errors
    // surface inside the retried acquisition calls instead of here.
    let bb8_pool = bb8::Builder::new()
        .max_size(max_pool_size)
        .connection_timeout(CONNECT_TIMEOUT)
        .max_lifetime(CONNECTION_MAX_LIFETIME)
        .test_on_check_out(true)
        .build(conn_manager)
        .await
        .context("Failed to create connection pool")?;

    tracing::info!(%host, port, %database, "connection pool ready");

    Ok(Pool {
        inner: PoolInner::Postgres(bb8_pool),
    })
}

fn run_error(e: bb8::RunError<sqlx::Error>) -> sqlx::Error {
    match e {
        bb8::RunError::User(e) => e,
        bb8::RunError::TimedOut => sqlx::Error::PoolTimedOut,
    }
}

impl Pool {
    /// Create an in-memory SQLite pool for testing
    ///
    /// Limited to one connection: every SQLite in-memory connection is its own
    /// database, so a second connection would not see the test tables.
    #[cfg(test)]
    pub async fn sqlite_in_memory() -> Result<Self, sqlx::Error> {
        let sqlite_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Pool {
            inner: PoolInner::Sqlite(sqlite_pool),
        })
    }

    /// Execute a statement (test setup only)
    #[cfg(test)]
    pub async fn execute_query(&self, sql: &str) -> Result<(), sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(run_error)?;
                sqlx::query(sql).execute(&mut *conn).await?;
                Ok(())
            }
            PoolInner::Sqlite(pool) => {
                sqlx::query(sql).execute(pool).await?;
                Ok(())
            }
        }
    }

    /// Table reference as it must appear in SQL
    ///
    /// SQLite has no schemas, so the test variant uses the bare table name.
    pub fn qualified_table_name(&self, schema: &str, table: &str) -> String {
        match &self.inner {
            PoolInner::Postgres(_) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
            #[cfg(test)]
            PoolInner::Sqlite(_) => quote_ident(table),
        }
    }

    pub async fn table_exists(&self, schema: &str, table: &str) -> Result<bool, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(run_error)?;
                let sql = r#"
                    SELECT COUNT(*)
                    FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                "#;
                let (count,): (i64,) = sqlx::query_as(sql)
                    .bind(schema)
                    .bind(table)
                    .fetch_one(&mut *conn)
                    .await?;
                Ok(count > 0)
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let sql = "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?";
                let (count,): (i64,) = sqlx::query_as(sql).bind(table).fetch_one(pool).await?;
                Ok(count > 0)
            }
        }
    }

    /// Column names of a table in ordinal order
    pub async fn table_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<String>, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(run_error)?;
                let sql = r#"
                    SELECT column_name::text
                    FROM information_schema.columns
                    WHERE table_schema = $1 AND table_name = $2
                    ORDER BY ordinal_position
                "#;
                let rows: Vec<(String,)> = sqlx::query_as(sql)
                    .bind(schema)
                    .bind(table)
                    .fetch_all(&mut *conn)
                    .await?;
                Ok(rows.into_iter().map(|(name,)| name).collect())
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let pragma_sql = format!("PRAGMA table_info({})", quote_ident(table));
                let rows: Vec<(i32, String, String, i32, Option<String>, i32)> =
                    sqlx::query_as(&pragma_sql).fetch_all(pool).await?;
                Ok(rows.into_iter().map(|row| row.1).collect())
            }
        }
    }

    /// Stream the rows of a query whose columns are all text
    ///
    /// The connection is held by the stream until it is dropped or exhausted.
    pub fn stream_text_rows(&self, sql: String) -> BoxStream<'static, Result<RawRow, sqlx::Error>> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let pool = pool.clone();
                Box::pin(try_stream! {
                    let mut conn = pool.get_owned().await.map_err(run_error)?;
                    let mut rows = sqlx::query(&sql).fetch(&mut *conn);
                    while let Some(row) = rows.try_next().await? {
                        yield row_to_fields(&row);
                    }
                })
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let pool = pool.clone();
                Box::pin(try_stream! {
                    let mut rows = sqlx::query(&sql).fetch(&pool);
                    while let Some(row) = rows.try_next().await? {
                        yield row_to_fields(&row);
                    }
                })
            }
        }
    }
}

/// Decode every column of a row as optional text. A value that fails to decode
/// is kept as `FieldValue::Undecodable` so validation can reject just that row.
fn row_to_fields<R>(row: &R) -> RawRow
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
    for<'r> Option<String>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    (0..row.len())
        .map(|idx| match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(value)) => FieldValue::Text(value),
            Ok(None) => FieldValue::Null,
            Err(e) => FieldValue::Undecodable(e.to_string()),
        })
        .collect()
}

// Wrap the connect options so that we can implement the bb8::ManageConnection trait.
pub struct ConnectionManager {
    connect_options: Arc<PgConnectOptions>,
}

impl ConnectionManager {
    /// Create a new `ConnectionManager` with the specified connect options.
    pub fn new(connect_options: PgConnectOptions) -> Self {
        Self {
            connect_options: Arc::new(connect_options),
        }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        tokio::time::timeout(CONNECT_TIMEOUT, self.connect_options.connect())
            .await
            .map_err(|_| sqlx::Error::PoolTimedOut)?
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        tokio::time::timeout(PING_TIMEOUT, sqlx::Connection::ping(conn))
            .await
            // Convert tokio timeouts into sqlx pool timeouts. bb8 will retry a different connection on ping failure.
            .map_err(|_| sqlx::Error::PoolTimedOut)
            // Make sure that we also look at the actual ping result
            .and_then(|result| result)?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        // sqlx::PgConnection provides no non-async way to check for closed/broken connections.
        false
    }
}
