//! SQLite implementation of [`Store`].
//!
//! Writes go onto a bounded channel drained by one background task, so
//! callers on the trading path never wait on disk. A batch is applied in a
//! single transaction. Reads use the pool directly.

use async_trait::async_trait;
use cryptobot_core::{DatabaseConfig, Row, SqlValue, Statement, Store, StoreError};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum WriteOp {
    Execute { sql: String, params: Vec<SqlValue> },
    Batch(Vec<Statement>),
    Flush(oneshot::Sender<()>),
}

pub struct SqliteStore {
    pool: SqlitePool,
    writes: Mutex<Option<mpsc::Sender<WriteOp>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `config.url` and starts
    /// the write task.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(StoreError::backend)?
            .create_if_missing(true);
        // in-memory databases live only as long as their connection
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StoreError::backend)?;

        let (tx, rx) = mpsc::channel(config.write_queue_capacity.max(1));
        let writer = tokio::spawn(run_writer(pool.clone(), rx));
        info!(url = %config.url, "SQLite store opened");

        Ok(Self {
            pool,
            writes: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// In-memory database for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..DatabaseConfig::default()
        })
        .await
    }

    fn sender(&self) -> Result<mpsc::Sender<WriteOp>, StoreError> {
        self.writes.lock().clone().ok_or(StoreError::Closed)
    }

    /// Stops accepting writes and waits up to `timeout` for the queue to
    /// drain.
    ///
    /// # Errors
    ///
    /// `FlushTimeout` if the writer did not finish in time.
    pub async fn close(&self, timeout: Duration) -> Result<(), StoreError> {
        drop(self.writes.lock().take());
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            match tokio::time::timeout(timeout, writer).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(StoreError::backend(err)),
                Err(_) => return Err(StoreError::FlushTimeout),
            }
        }
        self.pool.close().await;
        info!("SQLite store closed");
        Ok(())
    }
}

async fn run_writer(pool: SqlitePool, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Execute { sql, params } => {
                if let Err(err) = bind(sqlx::query(&sql), params).execute(&pool).await {
                    error!(error = %err, sql = %sql, "Queued write failed");
                }
            }
            WriteOp::Batch(statements) => {
                let count = statements.len();
                if let Err(err) = apply_batch(&pool, statements).await {
                    error!(error = %err, statements = count, "Queued batch rolled back");
                }
            }
            WriteOp::Flush(ack) => {
                // the caller may have given up waiting
                let _ = ack.send(());
            }
        }
    }
    debug!("Write queue drained");
}

async fn apply_batch(pool: &SqlitePool, statements: Vec<Statement>) -> Result<(), sqlx::Error> {
    // dropping an uncommitted transaction rolls it back
    let mut tx = pool.begin().await?;
    for Statement { sql, params } in statements {
        bind(sqlx::query(&sql), params).execute(&mut *tx).await?;
    }
    tx.commit().await
}

fn bind<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    params: Vec<SqlValue>,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(v) => query.bind(v),
            SqlValue::Real(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for column in row.columns() {
        let index = column.ordinal();
        let (is_null, type_name) = {
            let raw = row.try_get_raw(index)?;
            (raw.is_null(), raw.type_info().name().to_string())
        };
        let value = if is_null {
            SqlValue::Null
        } else {
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get(index)?),
                "REAL" => SqlValue::Real(row.try_get(index)?),
                _ => SqlValue::Text(row.try_get(index)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

#[async_trait]
impl Store for SqliteStore {
    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<(), StoreError> {
        let tx = self.sender()?;
        tx.send(WriteOp::Execute {
            sql: sql.to_string(),
            params,
        })
        .await
        .map_err(|_| StoreError::Closed)
    }

    async fn execute_batch(&self, statements: Vec<Statement>) -> Result<(), StoreError> {
        if statements.is_empty() {
            return Ok(());
        }
        let tx = self.sender()?;
        tx.send(WriteOp::Batch(statements))
            .await
            .map_err(|_| StoreError::Closed)
    }

    async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, StoreError> {
        let rows = bind(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::backend)
    }

    async fn flush_writes(&self, timeout: Duration) -> Result<(), StoreError> {
        let tx = self.sender()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        let flushed = async move {
            tx.send(WriteOp::Flush(ack_tx))
                .await
                .map_err(|_| StoreError::Closed)?;
            ack_rx.await.map_err(|_| StoreError::Closed)
        };
        match tokio::time::timeout(timeout, flushed).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Write flush timed out");
                Err(StoreError::FlushTimeout)
            }
        }
    }
}
