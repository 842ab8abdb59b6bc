//! CMDC Ingest - COVID-19 public-health data ingestion
//!
//! Provides:
//! - Dataset adapters that pull from public sources into canonical long rows
//! - A paginated ArcGIS feature-server client
//! - A staging-table upsert engine over DuckDB and PostgreSQL warehouses
//! - A dynamic query client for the CMDC REST API

pub mod client;
pub mod config;
pub mod database;
pub mod datasets;
pub mod models;
pub mod source;

// Re-export commonly used types
pub use client::{Client, ClientError, Filters};
pub use config::IngestConfig;
pub use database::{
    ConflictPolicy, DatabaseBackend, DatabaseError, DatabaseResult, InsertShape, PersistTarget,
    UpsertEngine, WarehouseNames,
};
pub use datasets::{DatasetAdapter, DatasetError, IngestResult, registry};
pub use models::{CanonicalRow, Frame, Location, Record};
pub use source::{ArcGisClient, ArcGisConfig, FetchError, HttpTransport};

#[cfg(feature = "duckdb-backend")]
pub use database::DuckDBBackend;
#[cfg(feature = "postgres-backend")]
pub use database::PostgresBackend;
#[cfg(feature = "api-backend")]
pub use source::ReqwestTransport;
