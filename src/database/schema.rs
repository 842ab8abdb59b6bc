//! Warehouse schema definitions
//!
//! Provides bootstrap SQL that works with both DuckDB and PostgreSQL: the
//! `meta` lookup tables the merge statements join against, and the `data`
//! tables the shipped adapters write into.

use serde::{Deserialize, Serialize};

use super::DatabaseResult;
use super::upsert::validate_identifier;

/// Schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Variable names known to the warehouse, in id order (ids start at 1)
pub const COVID_VARIABLES: &[&str] = &[
    "cases_total",
    "cases_confirmed",
    "deaths_total",
    "deaths_confirmed",
    "deaths_suspected",
    "recovered_total",
    "active_total",
    "positive_tests_total",
    "negative_tests_total",
    "tests_total",
    "hospital_beds_in_use_covid_total",
    "icu_beds_in_use_covid_total",
    "ventilators_in_use_covid_total",
];

/// Names of the warehouse schemas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseNames {
    /// Schema holding adapter target tables
    #[serde(default = "default_data_schema")]
    pub data_schema: String,
    /// Schema holding lookup tables
    #[serde(default = "default_meta_schema")]
    pub meta_schema: String,
}

fn default_data_schema() -> String {
    "data".to_string()
}

fn default_meta_schema() -> String {
    "meta".to_string()
}

impl WarehouseNames {
    /// Both schema names must be plain SQL identifiers
    pub fn validate(&self) -> DatabaseResult<()> {
        validate_identifier(&self.data_schema)?;
        validate_identifier(&self.meta_schema)
    }
}

impl Default for WarehouseNames {
    fn default() -> Self {
        Self {
            data_schema: default_data_schema(),
            meta_schema: default_meta_schema(),
        }
    }
}

/// Warehouse schema helper
pub struct WarehouseSchema;

impl WarehouseSchema {
    /// Bootstrap SQL for schemas, lookup tables and target tables
    pub fn create_tables_sql(names: &WarehouseNames) -> String {
        let meta = &names.meta_schema;
        let data = &names.data_schema;

        let mut sql = format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {meta};
CREATE SCHEMA IF NOT EXISTS {data};

CREATE TABLE IF NOT EXISTS {meta}.schema_version (
    version INTEGER PRIMARY KEY
);

-- Variable lookup: variable_name -> variable_id
CREATE TABLE IF NOT EXISTS {meta}.covid_variables (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

-- County lookup: county name within a state -> fips
CREATE TABLE IF NOT EXISTS {meta}.us_fips (
    fips INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    state TEXT NOT NULL
);

-- Official state and county data, one row per provider-resolved key
CREATE TABLE IF NOT EXISTS {data}.us_covid (
    vintage DATE NOT NULL,
    dt DATE NOT NULL,
    fips INTEGER NOT NULL,
    variable_id INTEGER NOT NULL,
    value DOUBLE PRECISION,
    provider TEXT,
    PRIMARY KEY (vintage, dt, fips, variable_id)
);
"#
        );

        for table in ["ctp_covid", "covid_nytimes", "jhu_daily_reports_us"] {
            sql.push_str(&format!(
                r#"
CREATE TABLE IF NOT EXISTS {data}.{table} (
    vintage DATE NOT NULL,
    dt DATE NOT NULL,
    fips INTEGER NOT NULL,
    variable_id INTEGER NOT NULL,
    value DOUBLE PRECISION,
    PRIMARY KEY (vintage, dt, fips, variable_id)
);
"#
            ));
        }

        sql
    }

    /// Record the schema version
    pub fn record_version_sql(names: &WarehouseNames) -> String {
        format!(
            "INSERT INTO {}.schema_version (version) VALUES ({}) ON CONFLICT (version) DO NOTHING;",
            names.meta_schema, SCHEMA_VERSION
        )
    }

    /// Seed SQL for the variable lookup
    pub fn seed_variables_sql(names: &WarehouseNames) -> String {
        let values: Vec<String> = COVID_VARIABLES
            .iter()
            .enumerate()
            .map(|(i, name)| format!("({}, '{}')", i + 1, name))
            .collect();

        format!(
            "INSERT INTO {}.covid_variables (id, name) VALUES {} ON CONFLICT (id) DO NOTHING;",
            names.meta_schema,
            values.join(", ")
        )
    }
}
