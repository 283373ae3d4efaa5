use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::backends::{BackendOutput, BackendRequest, ColumnSchema, QueryBackend, TableSchema, SAMPLE_ROWS};
use crate::core::{Dialect, Row, Value};
use crate::error::BackendError;

/// Local embedded database, opened read-only for every call
pub struct SqliteBackend {
    path: PathBuf,
    busy_timeout: Duration,
}

/// Shared between the awaiting future and the blocking worker
#[derive(Default)]
struct Cancellation {
    cancelled: bool,
    handle: Option<InterruptHandle>,
}

type CancelSlot = Arc<Mutex<Cancellation>>;

fn lock_slot(slot: &CancelSlot) -> MutexGuard<'_, Cancellation> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Interrupts the running statement if the awaiting future is dropped
struct InterruptGuard {
    slot: Option<CancelSlot>,
}

impl InterruptGuard {
    fn new() -> (Self, CancelSlot) {
        let slot = CancelSlot::default();
        (Self { slot: Some(slot.clone()) }, slot)
    }

    fn disarm(mut self) {
        self.slot = None;
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let mut state = lock_slot(&slot);
        state.cancelled = true;
        if let Some(handle) = state.handle.take() {
            tracing::debug!("Interrupting abandoned SQLite statement");
            handle.interrupt();
        }
    }
}

fn open_read_only(path: &Path, busy_timeout: Duration) -> Result<Connection, BackendError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(map_sqlite_error)?;
    conn.busy_timeout(busy_timeout).map_err(map_sqlite_error)?;
    Ok(conn)
}

impl SqliteBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `work` on a fresh read-only connection off the async runtime
    async fn with_connection<T, F>(&self, work: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, BackendError> + Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let (guard, slot) = InterruptGuard::new();

        let outcome = tokio::task::spawn_blocking(move || {
            let conn = open_read_only(&path, busy_timeout)?;
            {
                let mut state = lock_slot(&slot);
                if state.cancelled {
                    return Err(BackendError::Timeout(
                        "cancelled before the statement started".to_string(),
                    ));
                }
                state.handle = Some(conn.get_interrupt_handle());
            }
            work(&conn)
        })
        .await
            .map_err(|e| BackendError::Unknown(format!("SQLite worker failed: {}", e)))?;

        guard.disarm();
        outcome
    }
}

#[async_trait]
impl QueryBackend for SqliteBackend {
    async fn execute(&self, request: &BackendRequest) -> Result<BackendOutput, BackendError> {
        let sql = request.sql.clone();
        let fetch_limit = request.fetch_limit;

        self.with_connection(move |conn| {
            let (columns, rows) = query_rows(conn, &sql, fetch_limit)?;
            Ok(BackendOutput {
                columns,
                rows,
                bytes_processed: None,
                bytes_billed: None,
            })
        })
        .await
    }

    async fn describe_table(&self, table: &str) -> Result<TableSchema, BackendError> {
        let known = self.list_tables().await?;
        let Some(name) = known.into_iter().find(|t| t == table) else {
            return Err(BackendError::NotFound(format!("no such table: {}", table)));
        };

        self.with_connection(move |conn| {
            let quoted = Dialect::Sqlite.quote_table(&name);

            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info({})", quoted))
                .map_err(map_sqlite_error)?;
            let columns = stmt
                .query_map([], |row| {
                    let not_null: i64 = row.get(3)?;
                    Ok(ColumnSchema {
                        name: row.get(1)?,
                        data_type: row.get(2)?,
                        nullable: not_null == 0,
                    })
                })
                .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())
                .map_err(map_sqlite_error)?;

            let sample = format!("SELECT * FROM {} LIMIT {}", quoted, SAMPLE_ROWS);
            let (_, sample_rows) = query_rows(conn, &sample, Some(SAMPLE_ROWS))?;

            Ok(TableSchema {
                name,
                columns,
                sample_rows,
            })
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<String>, BackendError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master
                     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
                     ORDER BY name",
                )
                .map_err(map_sqlite_error)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())
                .map_err(map_sqlite_error)?;
            Ok(names)
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        self.with_connection(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(map_sqlite_error)?;
            Ok(())
        })
        .await
    }
}

/// Read up to `limit` rows, preserving column order
fn query_rows(
    conn: &Connection,
    sql: &str,
    limit: Option<usize>,
) -> Result<(Vec<String>, Vec<Row>), BackendError> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = Vec::new();
    let mut cursor = stmt.query([]).map_err(map_sqlite_error)?;
    while let Some(row) = cursor.next().map_err(map_sqlite_error)? {
        if limit.is_some_and(|l| rows.len() >= l) {
            break;
        }
        let mut record = Row::new();
        for (i, column) in columns.iter().enumerate() {
            let value = row.get_ref(i).map_err(map_sqlite_error)?;
            record.insert(column.clone(), to_value(value));
        }
        rows.push(record);
    }

    Ok((columns, rows))
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Text(format!("<{} byte blob>", bytes.len())),
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> BackendError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let detail = message.clone().unwrap_or_else(|| err.to_string());
            match failure.code {
                ErrorCode::OperationInterrupted => BackendError::Timeout(detail),
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly | ErrorCode::AuthorizationForStatementDenied => {
                    BackendError::AccessDenied(detail)
                }
                ErrorCode::CannotOpen | ErrorCode::NotFound => BackendError::NotFound(detail),
                ErrorCode::Unknown if detail.contains("no such table") => BackendError::NotFound(detail),
                ErrorCode::Unknown => BackendError::BadRequest(detail),
                _ => BackendError::Unknown(detail),
            }
        }
        rusqlite::Error::SqlInputError { msg, .. } if msg.contains("no such table") => {
            BackendError::NotFound(msg.clone())
        }
        rusqlite::Error::SqlInputError { msg, .. } => BackendError::BadRequest(msg.clone()),
        rusqlite::Error::InvalidColumnIndex(_)
        | rusqlite::Error::InvalidColumnName(_)
        | rusqlite::Error::MultipleStatement
        | rusqlite::Error::InvalidParameterCount(_, _) => BackendError::BadRequest(err.to_string()),
        _ => BackendError::Unknown(err.to_string()),
    }
}
