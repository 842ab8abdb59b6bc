//! Upsert via a temporary staging table
//!
//! A batch of rows is validated and typed into a [`StagingBatch`], loaded
//! into a session-private staging table, and merged into its target with one
//! statement of the form:
//!
//! ```text
//! INSERT INTO <schema>.<target> (<cols>)
//! SELECT <cols> FROM <staging>
//! ON CONFLICT (<primary key>) { DO NOTHING | DO UPDATE SET value = excluded.value }
//! ```
//!
//! Because the merge is a single statement, re-running an adapter for the same
//! day converges on the same final table state, and concurrent writers are
//! serialised by the storage engine's own constraint checks.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::schema::WarehouseNames;
use super::{DatabaseBackend, DatabaseError, DatabaseResult};
use crate::models::{CanonicalRow, Location, Record};

/// A typed value bound into the staging table
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl SqlValue {
    /// SQL type of a non-null value
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            SqlValue::Null => None,
            SqlValue::Int(_) => Some(SqlType::BigInt),
            SqlValue::Float(_) => Some(SqlType::Double),
            SqlValue::Text(_) => Some(SqlType::Text),
            SqlValue::Date(_) => Some(SqlType::Date),
        }
    }

    /// Convert a JSON value
    ///
    /// Strings in `YYYY-MM-DD` form become dates; booleans become 0/1;
    /// nested arrays and objects are stored as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Int(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => n.as_f64().map(SqlValue::Float).unwrap_or(SqlValue::Null),
            },
            Value::String(s) => match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                Ok(date) => SqlValue::Date(date),
                Err(_) => SqlValue::Text(s.clone()),
            },
            other => SqlValue::Text(other.to_string()),
        }
    }

    /// Value as f64, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(i) => Some(*i as f64),
            SqlValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Column type of a staging table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    BigInt,
    Double,
    Text,
    Date,
}

impl SqlType {
    /// DDL spelling, valid in both DuckDB and PostgreSQL
    pub fn ddl(&self) -> &'static str {
        match self {
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Text => "TEXT",
            SqlType::Date => "DATE",
        }
    }
}

/// A row that can be staged
///
/// `columns` and `values` must have the same length and order.
pub trait StageRow {
    /// Column names of this row, in order
    fn columns(&self) -> Vec<String>;
    /// Values of this row, aligned with `columns`
    fn values(&self) -> Vec<SqlValue>;
}

impl StageRow for CanonicalRow {
    fn columns(&self) -> Vec<String> {
        vec![
            "vintage".to_string(),
            "dt".to_string(),
            self.location.column_name().to_string(),
            "variable_name".to_string(),
            "value".to_string(),
        ]
    }

    fn values(&self) -> Vec<SqlValue> {
        let location = match &self.location {
            Location::Fips(fips) => SqlValue::Int(i64::from(*fips)),
            Location::County(name) => SqlValue::Text(name.clone()),
        };
        vec![
            SqlValue::Date(self.vintage),
            SqlValue::Date(self.dt),
            location,
            SqlValue::Text(self.variable_name.clone()),
            SqlValue::Float(self.value),
        ]
    }
}

impl StageRow for Record {
    fn columns(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn values(&self) -> Vec<SqlValue> {
        serde_json::Map::values(self).map(SqlValue::from_json).collect()
    }
}

/// What to do when an incoming row collides with an existing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the existing row, discard the incoming one
    DoNothing,
    /// Overwrite only the `value` column
    DoUpdate,
    /// Overwrite `value` and the priority column only when the incoming
    /// row's priority is strictly higher
    PreferHigherPriority { column: String },
}

impl ConflictPolicy {
    /// Render the action part of the `ON CONFLICT` clause
    fn action(&self, table: &str) -> String {
        match self {
            ConflictPolicy::DoNothing => "DO NOTHING".to_string(),
            ConflictPolicy::DoUpdate => "DO UPDATE SET value = excluded.value".to_string(),
            ConflictPolicy::PreferHigherPriority { column } => format!(
                "DO UPDATE SET value = excluded.value, {c} = excluded.{c} WHERE excluded.{c} > {t}.{c}",
                c = column,
                t = table
            ),
        }
    }
}

/// How staged columns map onto the target table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertShape {
    /// Copy the staged columns verbatim
    Direct,
    /// Resolve `variable_name` to `variable_id` through the variable lookup
    VariableLookup { provider: Option<String> },
    /// Resolve `county` to `fips` within one state, and `variable_name` to
    /// `variable_id`
    CountyLookup {
        state_fips: u32,
        provider: Option<String>,
    },
}

/// Persistence configuration of one adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistTarget {
    /// Target table in the data schema
    pub table: String,
    /// Conflict target; must match a unique constraint on the table
    pub primary_key: Vec<String>,
    /// Conflict policy applied on merge
    pub policy: ConflictPolicy,
    /// Column mapping from staging to target
    pub shape: InsertShape,
}

impl PersistTarget {
    /// Direct insert with `DO NOTHING`
    pub fn new(table: impl Into<String>, primary_key: &[&str]) -> Self {
        Self {
            table: table.into(),
            primary_key: primary_key.iter().map(|s| s.to_string()).collect(),
            policy: ConflictPolicy::DoNothing,
            shape: InsertShape::Direct,
        }
    }

    /// Set the conflict policy
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the insert shape
    pub fn with_shape(mut self, shape: InsertShape) -> Self {
        self.shape = shape;
        self
    }
}

/// Placeholder style for parameterised inserts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?` (DuckDB); dates are bound as ISO text and cast
    Question,
    /// `$1, $2, ...` (PostgreSQL)
    Numbered,
}

/// Check that a name is a plain SQL identifier
pub fn validate_identifier(name: &str) -> DatabaseResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DatabaseError::InvalidInput(format!(
            "'{}' is not a valid SQL identifier",
            name
        )))
    }
}

/// One batch of rows, typed and ready to load into a staging table
#[derive(Debug, Clone)]
pub struct StagingBatch {
    staging_name: String,
    table: String,
    primary_key: Vec<String>,
    shape: InsertShape,
    columns: Vec<String>,
    column_types: Vec<SqlType>,
    rows: Vec<Vec<SqlValue>>,
}

impl StagingBatch {
    /// Validate and type a batch of rows for `target`
    ///
    /// Fails with `InvalidInput` for an empty batch or a bad identifier, and
    /// with `SchemaMismatch` when rows disagree on columns or column types.
    pub fn stage<R: StageRow>(rows: &[R], target: &PersistTarget) -> DatabaseResult<Self> {
        let first = rows.first().ok_or_else(|| {
            DatabaseError::InvalidInput(format!("Cannot stage an empty batch for {}", target.table))
        })?;

        validate_identifier(&target.table)?;
        if target.primary_key.is_empty() {
            return Err(DatabaseError::InvalidInput(format!(
                "No primary key declared for {}",
                target.table
            )));
        }
        for key in &target.primary_key {
            validate_identifier(key)?;
        }

        let columns = first.columns();
        for column in &columns {
            validate_identifier(column)?;
        }

        let mut column_types: Vec<Option<SqlType>> = vec![None; columns.len()];
        let mut staged = Vec::with_capacity(rows.len());

        for (i, row) in rows.iter().enumerate() {
            let row_columns = row.columns();
            if row_columns != columns {
                return Err(DatabaseError::SchemaMismatch {
                    row: i,
                    expected: columns.join(", "),
                    found: row_columns.join(", "),
                });
            }

            let values = row.values();
            for (j, value) in values.iter().enumerate() {
                let Some(found) = value.sql_type() else {
                    continue;
                };
                column_types[j] = match (column_types[j], found) {
                    (None, t) => Some(t),
                    (Some(a), b) if a == b => Some(a),
                    (Some(SqlType::BigInt), SqlType::Double)
                    | (Some(SqlType::Double), SqlType::BigInt) => Some(SqlType::Double),
                    (Some(a), b) => {
                        return Err(DatabaseError::SchemaMismatch {
                            row: i,
                            expected: format!("{} {}", columns[j], a.ddl()),
                            found: format!("{} {}", columns[j], b.ddl()),
                        });
                    }
                };
            }
            staged.push(values);
        }

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Ok(Self {
            staging_name: format!("__{}_{}", target.table, &suffix[..8]),
            table: target.table.clone(),
            primary_key: target.primary_key.clone(),
            shape: target.shape.clone(),
            columns,
            column_types: column_types
                .into_iter()
                .map(|t| t.unwrap_or(SqlType::Text))
                .collect(),
            rows: staged,
        })
    }

    /// Name of the staging table
    pub fn staging_name(&self) -> &str {
        &self.staging_name
    }

    /// Target table (without schema)
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Conflict target columns
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Staged column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Inferred column types, aligned with `columns()`
    pub fn column_types(&self) -> &[SqlType] {
        &self.column_types
    }

    /// Staged rows
    pub fn rows(&self) -> &[Vec<SqlValue>] {
        &self.rows
    }

    /// Number of staged rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Always false; an empty batch cannot be staged
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `CREATE TEMP TABLE` statement for the staging table
    pub fn create_table_sql(&self) -> String {
        let defs: Vec<String> = self
            .columns
            .iter()
            .zip(&self.column_types)
            .map(|(c, t)| format!("{} {}", c, t.ddl()))
            .collect();
        format!(
            "CREATE TEMP TABLE {} ({})",
            self.staging_name,
            defs.join(", ")
        )
    }

    /// Single-row parameterised insert into the staging table
    pub fn insert_row_sql(&self, style: Placeholder) -> String {
        let placeholders: Vec<String> = self
            .column_types
            .iter()
            .enumerate()
            .map(|(i, ty)| match (style, ty) {
                (Placeholder::Question, SqlType::Date) => "CAST(? AS DATE)".to_string(),
                (Placeholder::Question, _) => "?".to_string(),
                (Placeholder::Numbered, _) => format!("${}", i + 1),
            })
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.staging_name,
            self.columns.join(", "),
            placeholders.join(", ")
        )
    }

    /// `DROP TABLE` statement for the staging table
    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.staging_name)
    }

    fn require_columns(&self, required: &[&str]) -> DatabaseResult<()> {
        if required
            .iter()
            .all(|r| self.columns.iter().any(|c| c == r))
        {
            Ok(())
        } else {
            Err(DatabaseError::SchemaMismatch {
                row: 0,
                expected: required.join(", "),
                found: self.columns.join(", "),
            })
        }
    }

    /// Build the merge statement for this batch
    pub fn merge_sql(
        &self,
        names: &WarehouseNames,
        policy: &ConflictPolicy,
    ) -> DatabaseResult<String> {
        names.validate()?;

        let staging = &self.staging_name;
        let target = format!("{}.{}", names.data_schema, self.table);
        let conflict = format!("({})", self.primary_key.join(", "));

        let (insert_columns, select_list, from_clause) = match &self.shape {
            InsertShape::Direct => {
                let cols = self.columns.join(", ");
                (self.columns.clone(), cols, staging.clone())
            }
            InsertShape::VariableLookup { provider } => {
                self.require_columns(&["vintage", "dt", "fips", "variable_name", "value"])?;
                let mut insert = string_vec(&["vintage", "dt", "fips", "variable_id", "value"]);
                let mut select =
                    "tt.vintage, tt.dt, tt.fips, mv.id AS variable_id, tt.value".to_string();
                push_provider(&mut insert, &mut select, provider.as_deref());
                let from = format!(
                    "{staging} tt\nINNER JOIN {meta}.covid_variables mv ON tt.variable_name = mv.name",
                    meta = names.meta_schema
                );
                (insert, select, from)
            }
            InsertShape::CountyLookup {
                state_fips,
                provider,
            } => {
                self.require_columns(&["vintage", "dt", "county", "variable_name", "value"])?;
                let mut insert = string_vec(&["vintage", "dt", "fips", "variable_id", "value"]);
                let mut select =
                    "tt.vintage, tt.dt, us.fips, mv.id AS variable_id, tt.value".to_string();
                push_provider(&mut insert, &mut select, provider.as_deref());
                let from = format!(
                    "{staging} tt\nINNER JOIN {meta}.us_fips us ON tt.county = us.name\n\
                     INNER JOIN {meta}.covid_variables mv ON tt.variable_name = mv.name\n\
                     WHERE us.state = '{state:02}'",
                    meta = names.meta_schema,
                    state = state_fips
                );
                (insert, select, from)
            }
        };

        match policy {
            ConflictPolicy::DoNothing => {}
            ConflictPolicy::DoUpdate => {
                if !insert_columns.iter().any(|c| c == "value") {
                    return Err(DatabaseError::InvalidInput(format!(
                        "DO UPDATE on {} requires a value column",
                        self.table
                    )));
                }
            }
            ConflictPolicy::PreferHigherPriority { column } => {
                validate_identifier(column)?;
                if !insert_columns.iter().any(|c| c == column) {
                    return Err(DatabaseError::InvalidInput(format!(
                        "Priority column {} is not inserted into {}",
                        column, self.table
                    )));
                }
            }
        }

        Ok(format!(
            "INSERT INTO {target} ({cols})\nSELECT {select}\nFROM {from}\nON CONFLICT {conflict} {action}",
            cols = insert_columns.join(", "),
            select = select_list,
            from = from_clause,
            action = policy.action(&self.table),
        ))
    }
}

fn string_vec(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn push_provider(insert: &mut Vec<String>, select: &mut String, provider: Option<&str>) {
    if let Some(provider) = provider {
        insert.push("provider".to_string());
        select.push_str(&format!(", '{}'", provider.replace('\'', "''")));
    }
}

/// Stages batches and merges them through a backend
pub struct UpsertEngine<'a, B: DatabaseBackend + ?Sized> {
    backend: &'a B,
    names: WarehouseNames,
}

impl<'a, B: DatabaseBackend + ?Sized> UpsertEngine<'a, B> {
    /// Create an engine writing into the schemas named by `names`
    pub fn new(backend: &'a B, names: WarehouseNames) -> Self {
        Self { backend, names }
    }

    /// Validate and type `rows` for `target`
    pub fn stage<R: StageRow>(
        &self,
        rows: &[R],
        target: &PersistTarget,
    ) -> DatabaseResult<StagingBatch> {
        StagingBatch::stage(rows, target)
    }

    /// Merge a staged batch into its target under `policy`
    ///
    /// The batch is consumed; its staging table is released before this
    /// returns, on success and on error alike.
    pub async fn merge(&self, batch: StagingBatch, policy: &ConflictPolicy) -> DatabaseResult<u64> {
        let sql = batch.merge_sql(&self.names, policy)?;
        debug!(
            staging = batch.staging_name(),
            rows = batch.len(),
            "Merge statement:\n{}",
            sql
        );

        let written = self.backend.merge_staged(&batch, &sql).await?;
        info!(
            "Merged {} of {} staged rows into {}.{}",
            written,
            batch.len(),
            self.names.data_schema,
            batch.table()
        );
        Ok(written)
    }

    /// Stage and merge in one call using the target's own policy
    ///
    /// An empty batch writes nothing and is not an error here.
    pub async fn persist<R: StageRow>(
        &self,
        rows: &[R],
        target: &PersistTarget,
    ) -> DatabaseResult<u64> {
        if rows.is_empty() {
            debug!("No rows to persist into {}", target.table);
            return Ok(0);
        }
        let batch = self.stage(rows, target)?;
        self.merge(batch, &target.policy).await
    }
}
