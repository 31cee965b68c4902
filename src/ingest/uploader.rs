use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::UPLOAD_TIMEOUT;
use crate::db::{Pool, PoolConnection, TableRef};
use crate::error::IngestError;
use crate::formats::RowBatch;

/// Receipt for a successfully appended batch.
#[derive(Debug, Clone)]
pub struct BatchReceipt {
    pub seq: u32,
    pub rows: u64,
    pub duration: Duration,
}

/// Outcome of one upload attempt.
pub type UploadOutcome = Result<BatchReceipt, IngestError>;

/// The remote bulk-append seam: one call is one network round trip, and rows
/// are visible in the destination table once it returns success.
///
/// Implementations must not retry internally; a failed batch fails its file,
/// and the retry decision stays with the caller.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn put_rows(&self, table: &TableRef, batch: &RowBatch) -> UploadOutcome;
}

/// `BatchSink` backed by the warehouse connection pool.
///
/// Each call checks out its own pooled connection; a single connection is
/// never shared across in-flight batches. Destination row order is not
/// source order once batches of one file upload concurrently — only
/// `upload_concurrency = 1` preserves it.
pub struct WarehouseSink {
    pool: Pool,
}

impl WarehouseSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchSink for WarehouseSink {
    async fn put_rows(&self, table: &TableRef, batch: &RowBatch) -> UploadOutcome {
        let start = Instant::now();

        if batch.rows.is_empty() {
            return Ok(BatchReceipt {
                seq: batch.seq,
                rows: 0,
                duration: start.elapsed(),
            });
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| IngestError::ConnectionLost {
                detail: format!("failed to acquire connection: {}", e),
            })?;

        let sql = insert_sql(&self.pool.table_target(table), batch);

        // Branch based on connection type
        let executed = match &mut conn {
            PoolConnection::Postgres(_) => {
                let mut query = sqlx::query(&sql);
                for record in &batch.rows {
                    for field in &record.fields {
                        query = query.bind(field);
                    }
                }
                tokio::time::timeout(UPLOAD_TIMEOUT, query.execute(&mut *conn))
                    .await
                    .map(|result| result.map(|_| ()))
            }
            #[cfg(test)]
            PoolConnection::Sqlite(sqlite_conn) => {
                // SQLite uses ? placeholders instead of $n
                let sqlite_sql = convert_to_sqlite_placeholders(&sql);
                let mut query = sqlx::query(&sqlite_sql);
                for record in &batch.rows {
                    for field in &record.fields {
                        query = query.bind(field);
                    }
                }
                tokio::time::timeout(UPLOAD_TIMEOUT, query.execute(&mut **sqlite_conn))
                    .await
                    .map(|result| result.map(|_| ()))
            }
        };

        match executed {
            Ok(Ok(())) => Ok(BatchReceipt {
                seq: batch.seq,
                rows: batch.rows.len() as u64,
                duration: start.elapsed(),
            }),
            Ok(Err(e)) => Err(classify_db_error(batch.seq, &e)),
            Err(_) => Err(IngestError::Timeout {
                timeout: UPLOAD_TIMEOUT,
            }),
        }
    }
}

/// Build the multi-row INSERT for one batch:
/// `INSERT INTO target ("c1", "c2") VALUES ($1, $2), ($3, $4), ...`
///
/// Every field is bound as text; the destination table's column types
/// govern conversion.
fn insert_sql(target: &str, batch: &RowBatch) -> String {
    let column_list = match &batch.columns {
        Some(cols) => {
            let quoted: Vec<String> = cols
                .iter()
                .map(|c| format!("\"{}\"", c.replace('"', "\"\"")))
                .collect();
            format!(" ({})", quoted.join(", "))
        }
        None => String::new(),
    };

    let width = match &batch.columns {
        Some(cols) => cols.len(),
        None => batch.rows.first().map(|r| r.fields.len()).unwrap_or(0),
    };

    let mut value_groups = Vec::with_capacity(batch.rows.len());
    let mut param_idx = 1;
    for _ in 0..batch.rows.len() {
        let placeholders: Vec<String> = (0..width)
            .map(|_| {
                let placeholder = format!("${}", param_idx);
                param_idx += 1;
                placeholder
            })
            .collect();
        value_groups.push(format!("({})", placeholders.join(", ")));
    }

    format!(
        "INSERT INTO {}{} VALUES {}",
        target,
        column_list,
        value_groups.join(", ")
    )
}

/// Convert Postgres-style placeholders ($1, $2, ...) to SQLite-style (?, ?, ...)
#[cfg(test)]
fn convert_to_sqlite_placeholders(sql: &str) -> String {
    let mut result = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            result.push('?');
        } else {
            result.push(ch);
        }
    }

    result
}

fn classify_db_error(seq: u32, error: &sqlx::Error) -> IngestError {
    if connection_is_gone(error) {
        IngestError::ConnectionLost {
            detail: error.to_string(),
        }
    } else {
        IngestError::UploadFailed {
            detail: format!("batch {}: {}", seq, error),
        }
    }
}

/// Errors that mean the link itself is dead, as opposed to the server
/// rejecting this particular batch.
fn connection_is_gone(error: &sqlx::Error) -> bool {
    if matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut
    ) {
        return true;
    }

    let msg = error.to_string();
    msg.contains("connection reset")
        || msg.contains("broken pipe")
        || msg.contains("connection closed")
        || msg.contains("server unavailable")
}
