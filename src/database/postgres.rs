//! PostgreSQL warehouse backend
//!
//! The shared production warehouse. Connections come from a deadpool-postgres
//! pool; each merge runs in its own transaction with an `ON COMMIT DROP`
//! staging table, so a failed merge rolls back and leaves nothing behind.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tracing::debug;

use super::schema::{WarehouseNames, WarehouseSchema};
use super::upsert::{Placeholder, SqlType, SqlValue, StagingBatch};
use super::{DatabaseBackend, DatabaseError, DatabaseResult, QueryResult};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// PostgreSQL warehouse backend
pub struct PostgresBackend {
    /// Connection string
    connection_string: String,
    /// Connection pool
    pool: Pool,
}

impl PostgresBackend {
    /// Create a pooled backend
    ///
    /// No connection is opened until the first statement runs.
    pub fn new(connection_string: &str, pool_size: usize) -> DatabaseResult<Self> {
        let pg_config: tokio_postgres::Config = connection_string.parse().map_err(|e| {
            DatabaseError::ConfigError(format!("Invalid PostgreSQL connection string: {}", e))
        })?;

        let manager = Manager::from_config(
            pg_config,
            tokio_postgres::NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size.max(1))
            .build()
            .map_err(|e| {
                DatabaseError::ConnectionFailed(format!("Failed to build connection pool: {}", e))
            })?;

        Ok(Self {
            connection_string: connection_string.to_string(),
            pool,
        })
    }

    /// Get the connection string with the password masked
    pub fn connection_string_masked(&self) -> String {
        mask_password(&self.connection_string)
    }

    async fn client(&self) -> DatabaseResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| {
            DatabaseError::ConnectionFailed(format!(
                "Failed to connect to {}: {}",
                self.connection_string_masked(),
                e
            ))
        })
    }

    fn row_to_json(row: &tokio_postgres::Row, columns: &[String]) -> serde_json::Value {
        let map = columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), Self::get_column_value(row, i)))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Get a column value as JSON, trying the types the warehouse uses
    fn get_column_value(row: &tokio_postgres::Row, idx: usize) -> serde_json::Value {
        use serde_json::Value;

        if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
            return v.map(Value::String).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
            return v.map(Value::from).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
            return v.map(Value::from).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
            return v
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<chrono::NaiveDate>>(idx) {
            return v
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }

        Value::Null
    }

    /// Box a staged value as a parameter of its column's type
    fn to_param(value: &SqlValue, column_type: SqlType) -> BoxedParam {
        match (value, column_type) {
            (SqlValue::Null, SqlType::BigInt) => Box::new(None::<i64>),
            (SqlValue::Null, SqlType::Double) => Box::new(None::<f64>),
            (SqlValue::Null, SqlType::Text) => Box::new(None::<String>),
            (SqlValue::Null, SqlType::Date) => Box::new(None::<chrono::NaiveDate>),
            (SqlValue::Int(i), SqlType::Double) => Box::new(*i as f64),
            (SqlValue::Int(i), _) => Box::new(*i),
            (SqlValue::Float(f), _) => Box::new(*f),
            (SqlValue::Text(s), _) => Box::new(s.clone()),
            (SqlValue::Date(d), _) => Box::new(*d),
        }
    }

    /// Map a PostgreSQL error raised while merging into the error taxonomy
    fn classify_merge_error(e: tokio_postgres::Error, batch: &StagingBatch) -> DatabaseError {
        let message = e
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| e.to_string());

        match e.code() {
            Some(code)
                if *code == SqlState::UNDEFINED_TABLE
                    || *code == SqlState::INVALID_SCHEMA_NAME
                    || *code == SqlState::UNDEFINED_COLUMN =>
            {
                DatabaseError::SchemaError {
                    table: batch.table().to_string(),
                    message,
                }
            }
            Some(code) if *code == SqlState::INVALID_COLUMN_REFERENCE => {
                DatabaseError::ConstraintError {
                    table: batch.table().to_string(),
                    key: batch.primary_key().join(", "),
                    message,
                }
            }
            _ => DatabaseError::QueryFailed(format!(
                "Merge into {} failed: {}",
                batch.table(),
                message
            )),
        }
    }
}

/// Staging DDL scoped to the enclosing transaction
fn staging_ddl(batch: &StagingBatch) -> String {
    format!("{} ON COMMIT DROP", batch.create_table_sql())
}

fn mask_password(connection_string: &str) -> String {
    if let Some(at_pos) = connection_string.find('@')
        && let Some(colon_pos) = connection_string[..at_pos].rfind(':')
        && !connection_string[colon_pos + 1..].starts_with("//")
    {
        let prefix = &connection_string[..colon_pos + 1];
        let suffix = &connection_string[at_pos..];
        return format!("{}****{}", prefix, suffix);
    }
    connection_string.to_string()
}

#[async_trait(?Send)]
impl DatabaseBackend for PostgresBackend {
    async fn initialize(&self, names: &WarehouseNames) -> DatabaseResult<()> {
        names.validate()?;
        let client = self.client().await?;

        client
            .batch_execute(&WarehouseSchema::create_tables_sql(names))
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to create tables: {}", e))
            })?;

        client
            .batch_execute(&WarehouseSchema::record_version_sql(names))
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to record schema version: {}", e))
            })?;

        client
            .batch_execute(&WarehouseSchema::seed_variables_sql(names))
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to seed variables: {}", e))
            })?;

        debug!("Initialized PostgreSQL warehouse at {}", self.connection_string_masked());
        Ok(())
    }

    async fn execute_query(&self, sql: &str) -> DatabaseResult<QueryResult> {
        let start = std::time::Instant::now();
        let client = self.client().await?;

        let stmt = client
            .prepare(sql)
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Prepare failed: {}", e)))?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

        let rows = client
            .query(&stmt, &[])
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Query failed: {}", e)))?;

        let rows = rows.iter().map(|r| Self::row_to_json(r, &columns)).collect();
        let mut result = QueryResult::new(columns, rows);
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    async fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        let client = self.client().await?;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Batch execute failed: {}", e)))
    }

    async fn merge_staged(&self, batch: &StagingBatch, merge_sql: &str) -> DatabaseResult<u64> {
        let mut client = self.client().await?;
        let pg: &mut tokio_postgres::Client = &mut client;

        // Dropping the transaction without commit rolls it back
        let tx = pg
            .transaction()
            .await
            .map_err(|e| {
                DatabaseError::QueryFailed(format!("Failed to begin transaction: {}", e))
            })?;

        tx.batch_execute(&staging_ddl(batch)).await.map_err(|e| {
            DatabaseError::QueryFailed(format!(
                "Failed to create staging table {}: {}",
                batch.staging_name(),
                e
            ))
        })?;

        let insert = tx
            .prepare(&batch.insert_row_sql(Placeholder::Numbered))
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Prepare failed: {}", e)))?;

        for (i, row) in batch.rows().iter().enumerate() {
            let params: Vec<BoxedParam> = row
                .iter()
                .zip(batch.column_types())
                .map(|(value, ty)| Self::to_param(value, *ty))
                .collect();
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            tx.execute(&insert, &refs).await.map_err(|e| {
                DatabaseError::QueryFailed(format!("Failed to stage row {}: {}", i, e))
            })?;
        }

        let written = tx
            .execute(merge_sql, &[])
            .await
            .map_err(|e| Self::classify_merge_error(e, batch))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Commit failed: {}", e)))?;

        Ok(written)
    }

    async fn health_check(&self) -> DatabaseResult<bool> {
        match self.client().await {
            Ok(client) => Ok(client.simple_query("SELECT 1").await.is_ok()),
            Err(_) => Ok(false),
        }
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }

    async fn close(&self) -> DatabaseResult<()> {
        self.pool.close();
        Ok(())
    }
}
