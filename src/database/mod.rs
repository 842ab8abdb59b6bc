//! Warehouse backend abstraction
//!
//! This module provides the persistence side of the ingestion pipeline:
//! - DuckDB: embedded warehouse for local runs and tests
//! - PostgreSQL: the shared production warehouse
//!
//! All writes go through the upsert engine in [`upsert`], which stages a
//! batch in a temporary table and merges it into its target with a single
//! `INSERT ... ON CONFLICT` statement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(feature = "duckdb-backend")]
pub mod duckdb;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

pub mod schema;
pub mod upsert;

#[cfg(feature = "duckdb-backend")]
pub use self::duckdb::DuckDBBackend;

#[cfg(feature = "postgres-backend")]
pub use self::postgres::PostgresBackend;

pub use schema::{WarehouseNames, WarehouseSchema};
pub use upsert::{
    ConflictPolicy, InsertShape, PersistTarget, SqlType, SqlValue, StageRow, StagingBatch,
    UpsertEngine,
};

/// Error type for warehouse operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Rows in one batch do not share a column set
    #[error("Schema mismatch in row {row}: expected columns [{expected}], found [{found}]")]
    SchemaMismatch {
        row: usize,
        expected: String,
        found: String,
    },

    /// Target table, schema, or lookup table does not exist
    #[error("Schema error on {table}: {message}")]
    SchemaError { table: String, message: String },

    /// Conflict target does not match a unique constraint on the target
    #[error("Constraint error on {table} ({key}): {message}")]
    ConstraintError {
        table: String,
        key: String,
        message: String,
    },

    /// Failed to connect to database
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema bootstrap failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

/// Result type for database operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Query result row as a JSON value
pub type QueryRow = serde_json::Value;

/// Query result set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Rows of data
    pub rows: Vec<QueryRow>,
    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    pub rows_affected: Option<u64>,
    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create a new query result
    pub fn new(columns: Vec<String>, rows: Vec<QueryRow>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms: 0,
        }
    }

    /// Get the number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First column of the first row, if any
    pub fn scalar(&self) -> Option<&serde_json::Value> {
        let column = self.columns.first()?;
        self.rows.first().and_then(|row| row.get(column))
    }
}

/// Warehouse backend trait
///
/// Backends expose plain query execution plus the one write primitive the
/// pipeline needs: load a staged batch into a session-private table, run the
/// merge statement against it, and release the staging table whatever the
/// outcome.
#[async_trait(?Send)]
pub trait DatabaseBackend: Send + Sync {
    /// Create the warehouse schemas and tables if they don't exist
    async fn initialize(&self, names: &WarehouseNames) -> DatabaseResult<()>;

    /// Execute a SQL query and return results
    async fn execute_query(&self, sql: &str) -> DatabaseResult<QueryResult>;

    /// Execute one or more statements that return no rows
    async fn execute_batch(&self, sql: &str) -> DatabaseResult<()>;

    /// Stage `batch` and run `merge_sql` against it
    ///
    /// The staging table named by `batch.staging_name()` exists only for the
    /// duration of this call. Returns the number of rows the merge wrote.
    async fn merge_staged(&self, batch: &StagingBatch, merge_sql: &str) -> DatabaseResult<u64>;

    /// Check if database is healthy and accessible
    async fn health_check(&self) -> DatabaseResult<bool>;

    /// Backend type string ("duckdb" or "postgres")
    fn backend_type(&self) -> &'static str;

    /// Close the database connection
    async fn close(&self) -> DatabaseResult<()>;
}
