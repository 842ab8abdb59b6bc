//! DuckDB warehouse backend
//!
//! Embedded warehouse used for local runs and for tests. Staging tables are
//! connection-local temporary tables; the backend drops each one when its
//! merge finishes, whether the merge succeeded or not.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::schema::{WarehouseNames, WarehouseSchema};
use super::upsert::{Placeholder, SqlType, SqlValue, StagingBatch};
use super::{DatabaseBackend, DatabaseError, DatabaseResult, QueryResult};

/// Days between 0001-01-01 (CE day 1) and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// DuckDB warehouse backend
///
/// Supports both file-based persistence and in-memory mode.
pub struct DuckDBBackend {
    /// Path to the database file (None for in-memory)
    db_path: Option<PathBuf>,
    /// DuckDB connection (wrapped in Mutex for thread safety)
    connection: Mutex<duckdb::Connection>,
}

/// Drops a staging table when it goes out of scope
struct StagingGuard<'c> {
    conn: &'c duckdb::Connection,
    drop_sql: String,
}

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.execute_batch(&self.drop_sql) {
            warn!("Failed to drop staging table ({}): {}", self.drop_sql, e);
        }
    }
}

impl DuckDBBackend {
    /// Open (or create) a file-based warehouse
    pub fn new(db_path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let connection = duckdb::Connection::open(&path).map_err(|e| {
            DatabaseError::ConnectionFailed(format!("Failed to open DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: Some(path),
            connection: Mutex::new(connection),
        })
    }

    /// Create an in-memory warehouse
    pub fn in_memory() -> DatabaseResult<Self> {
        let connection = duckdb::Connection::open_in_memory().map_err(|e| {
            DatabaseError::ConnectionFailed(format!("Failed to create in-memory DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: None,
            connection: Mutex::new(connection),
        })
    }

    /// Get the database file path (None for in-memory)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Check if this is an in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.db_path.is_none()
    }

    fn lock(&self) -> DatabaseResult<std::sync::MutexGuard<'_, duckdb::Connection>> {
        self.connection
            .lock()
            .map_err(|e| DatabaseError::ConnectionFailed(format!("Lock error: {}", e)))
    }

    fn row_to_json(row: &duckdb::Row, columns: &[String]) -> serde_json::Value {
        let map = columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = row
                    .get_ref(i)
                    .map(Self::value_ref_to_json)
                    .unwrap_or(serde_json::Value::Null);
                (name.clone(), value)
            })
            .collect();
        serde_json::Value::Object(map)
    }

    /// Convert a DuckDB value to JSON
    ///
    /// Dates come back as `YYYY-MM-DD` strings so they can be staged again
    /// without loss.
    fn value_ref_to_json(value: duckdb::types::ValueRef) -> serde_json::Value {
        use duckdb::types::ValueRef;
        use serde_json::Value;

        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Boolean(b) => Value::Bool(b),
            ValueRef::TinyInt(i) => i.into(),
            ValueRef::SmallInt(i) => i.into(),
            ValueRef::Int(i) => i.into(),
            ValueRef::BigInt(i) => i.into(),
            ValueRef::HugeInt(i) => Value::String(i.to_string()),
            ValueRef::UTinyInt(i) => i.into(),
            ValueRef::USmallInt(i) => i.into(),
            ValueRef::UInt(i) => i.into(),
            ValueRef::UBigInt(i) => i.into(),
            ValueRef::Float(f) => serde_json::Number::from_f64(f as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Double(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Decimal(d) => Value::String(d.to_string()),
            ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
            ValueRef::Blob(bytes) => {
                use base64::Engine;
                Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            ValueRef::Date32(days) => {
                chrono::NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
                    .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                    .unwrap_or(Value::Null)
            }
            other => Value::String(format!("{:?}", other)),
        }
    }

    /// Convert a staged value into a DuckDB parameter
    ///
    /// Integers in a widened `DOUBLE` column are bound as doubles; dates are
    /// bound as text and cast by the insert statement.
    fn to_param(value: &SqlValue, column_type: SqlType) -> duckdb::types::Value {
        use duckdb::types::Value;

        match (value, column_type) {
            (SqlValue::Null, _) => Value::Null,
            (SqlValue::Int(i), SqlType::Double) => Value::Double(*i as f64),
            (SqlValue::Int(i), _) => Value::BigInt(*i),
            (SqlValue::Float(f), _) => Value::Double(*f),
            (SqlValue::Text(s), _) => Value::Text(s.clone()),
            (SqlValue::Date(d), _) => Value::Text(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Map a DuckDB error raised while merging into the error taxonomy
    fn classify_merge_error(e: duckdb::Error, batch: &StagingBatch) -> DatabaseError {
        let message = e.to_string();
        if message.contains("Catalog Error") && message.contains("does not exist") {
            DatabaseError::SchemaError {
                table: batch.table().to_string(),
                message,
            }
        } else if message.contains("conflict target") || message.contains("UNIQUE/PRIMARY KEY") {
            DatabaseError::ConstraintError {
                table: batch.table().to_string(),
                key: batch.primary_key().join(", "),
                message,
            }
        } else {
            DatabaseError::QueryFailed(format!("Merge into {} failed: {}", batch.table(), message))
        }
    }
}

#[async_trait(?Send)]
impl DatabaseBackend for DuckDBBackend {
    async fn initialize(&self, names: &WarehouseNames) -> DatabaseResult<()> {
        names.validate()?;
        let conn = self.lock()?;

        conn.execute_batch(&WarehouseSchema::create_tables_sql(names))
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to create tables: {}", e))
            })?;

        conn.execute_batch(&WarehouseSchema::record_version_sql(names))
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to record schema version: {}", e))
            })?;

        conn.execute_batch(&WarehouseSchema::seed_variables_sql(names))
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to seed variables: {}", e))
            })?;

        debug!("Initialized DuckDB warehouse ({:?})", self.db_path);
        Ok(())
    }

    async fn execute_query(&self, sql: &str) -> DatabaseResult<QueryResult> {
        let start = std::time::Instant::now();
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| DatabaseError::QueryFailed(format!("Prepare failed: {}", e)))?;

        // Columns are only known once the statement has run
        let mut result_rows = stmt
            .query([])
            .map_err(|e| DatabaseError::QueryFailed(format!("Query failed: {}", e)))?;

        let column_count = result_rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let columns: Vec<String> = (0..column_count)
            .map(|i| {
                result_rows
                    .as_ref()
                    .and_then(|r| r.column_name(i).ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("col{}", i))
            })
            .collect();

        let mut rows = Vec::new();
        while let Some(row) = result_rows
            .next()
            .map_err(|e| DatabaseError::QueryFailed(format!("Row fetch error: {}", e)))?
        {
            rows.push(Self::row_to_json(row, &columns));
        }

        let mut result = QueryResult::new(columns, rows);
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    async fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|e| DatabaseError::QueryFailed(format!("Batch execute failed: {}", e)))
    }

    async fn merge_staged(&self, batch: &StagingBatch, merge_sql: &str) -> DatabaseResult<u64> {
        let conn = self.lock()?;

        conn.execute_batch(&batch.create_table_sql()).map_err(|e| {
            DatabaseError::QueryFailed(format!(
                "Failed to create staging table {}: {}",
                batch.staging_name(),
                e
            ))
        })?;
        let _guard = StagingGuard {
            conn: &conn,
            drop_sql: batch.drop_table_sql(),
        };

        {
            let mut stmt = conn
                .prepare(&batch.insert_row_sql(Placeholder::Question))
                .map_err(|e| DatabaseError::QueryFailed(format!("Prepare failed: {}", e)))?;

            for (i, row) in batch.rows().iter().enumerate() {
                let params: Vec<duckdb::types::Value> = row
                    .iter()
                    .zip(batch.column_types())
                    .map(|(value, ty)| Self::to_param(value, *ty))
                    .collect();
                stmt.execute(duckdb::params_from_iter(params)).map_err(|e| {
                    DatabaseError::QueryFailed(format!("Failed to stage row {}: {}", i, e))
                })?;
            }
        }

        let written = conn
            .execute(merge_sql, [])
            .map_err(|e| Self::classify_merge_error(e, batch))?;

        Ok(written as u64)
    }

    async fn health_check(&self) -> DatabaseResult<bool> {
        let conn = self.lock()?;
        let result: Result<i32, _> = conn.query_row("SELECT 1", [], |row| row.get(0));
        Ok(result.is_ok())
    }

    fn backend_type(&self) -> &'static str {
        "duckdb"
    }

    async fn close(&self) -> DatabaseResult<()> {
        // DuckDB closes the connection when the backend is dropped
        Ok(())
    }
}
