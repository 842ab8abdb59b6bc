//! Dataset adapters
//!
//! An adapter pulls from exactly one external source and returns canonical
//! long rows; it never writes. Persistence goes through [`persist`], which
//! hands the rows to the upsert engine under the adapter's [`PersistTarget`].
//!
//! Adapters come in two capabilities: [`LatestSource`] for sources that only
//! publish their current state, and [`DatedSource`] for sources addressed by
//! date. [`DatasetAdapter`] wraps either so a scheduler can run them alike.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::info;

use crate::config::IngestConfig;
use crate::database::{DatabaseBackend, DatabaseError, PersistTarget, UpsertEngine, WarehouseNames};
use crate::models::{CanonicalRow, today};
use crate::source::{FetchError, HttpTransport};

pub mod ctp;
pub mod jhu;
pub mod nytimes;
pub mod official;

pub use ctp::CovidTrackingProject;
pub use jhu::JhuDailyReportsUs;
pub use nytimes::NyTimesState;
pub use official::{Delaware, Wisconsin};

/// Error type for adapter runs
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Source data did not have the expected shape
    #[error("Could not parse {dataset} data: {message}")]
    Parse { dataset: String, message: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl DatasetError {
    pub(crate) fn parse(dataset: &str, message: impl Into<String>) -> Self {
        DatasetError::Parse {
            dataset: dataset.to_string(),
            message: message.into(),
        }
    }
}

pub type DatasetResult<T> = Result<T, DatasetError>;

/// What every adapter declares about itself
pub trait Dataset: Send + Sync {
    /// Short unique name
    fn name(&self) -> &str;

    /// Where and how its rows are persisted
    fn target(&self) -> &PersistTarget;

    /// URLs the adapter reads from
    fn sources(&self) -> Vec<String>;
}

/// A source that only publishes its current state
#[async_trait]
pub trait LatestSource: Dataset {
    async fn fetch(&self, http: &dyn HttpTransport) -> DatasetResult<Vec<CanonicalRow>>;
}

/// A source addressed by date
#[async_trait]
pub trait DatedSource: Dataset {
    async fn fetch_for(
        &self,
        http: &dyn HttpTransport,
        date: NaiveDate,
    ) -> DatasetResult<Vec<CanonicalRow>>;

    /// Map the requested date to the date the source publishes under
    fn transform_date(&self, date: NaiveDate) -> NaiveDate {
        date
    }

    /// Reason to skip `date` without fetching, if any
    fn quit_early(&self, _date: NaiveDate) -> Option<String> {
        None
    }
}

/// Summary of one adapter run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestResult {
    pub dataset: String,
    pub rows_fetched: usize,
    pub rows_written: u64,
    /// Set when a dated adapter declined the requested date
    pub skipped: Option<String>,
    pub duration_ms: u64,
}

impl fmt::Display for IngestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.skipped {
            Some(reason) => write!(f, "{}: skipped ({})", self.dataset, reason),
            None => write!(
                f,
                "{}: fetched {} rows, wrote {} in {} ms",
                self.dataset, self.rows_fetched, self.rows_written, self.duration_ms
            ),
        }
    }
}

/// Persist rows under `target`
pub async fn persist(
    target: &PersistTarget,
    rows: &[CanonicalRow],
    backend: &dyn DatabaseBackend,
    names: &WarehouseNames,
) -> DatasetResult<u64> {
    let engine = UpsertEngine::new(backend, names.clone());
    Ok(engine.persist(rows, target).await?)
}

/// An adapter of either capability
pub enum DatasetAdapter {
    Latest(Box<dyn LatestSource>),
    Dated(Box<dyn DatedSource>),
}

impl DatasetAdapter {
    pub fn name(&self) -> &str {
        match self {
            DatasetAdapter::Latest(source) => source.name(),
            DatasetAdapter::Dated(source) => source.name(),
        }
    }

    pub fn target(&self) -> &PersistTarget {
        match self {
            DatasetAdapter::Latest(source) => source.target(),
            DatasetAdapter::Dated(source) => source.target(),
        }
    }

    pub fn sources(&self) -> Vec<String> {
        match self {
            DatasetAdapter::Latest(source) => source.sources(),
            DatasetAdapter::Dated(source) => source.sources(),
        }
    }

    pub fn needs_date(&self) -> bool {
        matches!(self, DatasetAdapter::Dated(_))
    }

    /// Fetch without persisting
    ///
    /// Dated adapters use `date`, or today when none is given. Returns
    /// `Ok(Err(reason))` when a dated adapter declines the date.
    pub async fn fetch(
        &self,
        http: &dyn HttpTransport,
        date: Option<NaiveDate>,
    ) -> DatasetResult<Result<Vec<CanonicalRow>, String>> {
        match self {
            DatasetAdapter::Latest(source) => Ok(Ok(source.fetch(http).await?)),
            DatasetAdapter::Dated(source) => {
                let date = source.transform_date(date.unwrap_or_else(today));
                if let Some(reason) = source.quit_early(date) {
                    return Ok(Err(reason));
                }
                Ok(Ok(source.fetch_for(http, date).await?))
            }
        }
    }

    /// Fetch then persist
    pub async fn run(
        &self,
        http: &dyn HttpTransport,
        backend: &dyn DatabaseBackend,
        names: &WarehouseNames,
        date: Option<NaiveDate>,
    ) -> DatasetResult<IngestResult> {
        let start = Instant::now();
        let mut result = IngestResult {
            dataset: self.name().to_string(),
            rows_fetched: 0,
            rows_written: 0,
            skipped: None,
            duration_ms: 0,
        };

        match self.fetch(http, date).await? {
            Ok(rows) => {
                result.rows_fetched = rows.len();
                result.rows_written = persist(self.target(), &rows, backend, names).await?;
            }
            Err(reason) => result.skipped = Some(reason),
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        info!("{}", result);
        Ok(result)
    }
}

/// Every shipped adapter, configured from `config`
pub fn registry(config: &IngestConfig) -> Vec<DatasetAdapter> {
    vec![
        DatasetAdapter::Latest(Box::new(CovidTrackingProject::new())),
        DatasetAdapter::Latest(Box::new(NyTimesState::new())),
        DatasetAdapter::Dated(Box::new(JhuDailyReportsUs::new())),
        DatasetAdapter::Latest(Box::new(Wisconsin::from_config(config))),
        DatasetAdapter::Latest(Box::new(Delaware::new())),
    ]
}

/// Parse a source date in one of the given formats
pub(crate) fn parse_date(text: &str, formats: &[&str]) -> Option<NaiveDate> {
    let text = text.trim();
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

/// Parse a FIPS code published as a number or numeric text (`"36"`, `36.0`)
pub(crate) fn parse_fips(value: &serde_json::Value) -> Option<u32> {
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64).then_some(n as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_names_are_unique() {
        let adapters = registry(&IngestConfig::default());
        let mut names: Vec<&str> = adapters.iter().map(|a| a.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), adapters.len());
        assert!(adapters.iter().any(|a| a.needs_date()));
    }

    #[test]
    fn test_parse_fips() {
        assert_eq!(parse_fips(&json!("36")), Some(36));
        assert_eq!(parse_fips(&json!(36061.0)), Some(36061));
        assert_eq!(parse_fips(&json!("36.5")), None);
        assert_eq!(parse_fips(&json!(null)), None);
    }

    #[test]
    fn test_parse_date_formats() {
        let d = NaiveDate::from_ymd_opt(2020, 7, 6).unwrap();
        assert_eq!(parse_date("20200706", &["%Y-%m-%d", "%Y%m%d"]), Some(d));
        assert_eq!(parse_date(" 2020-07-06 ", &["%Y-%m-%d"]), Some(d));
        assert_eq!(parse_date("07/06/2020", &["%Y-%m-%d"]), None);
    }

    #[test]
    fn test_ingest_result_display() {
        let result = IngestResult {
            dataset: "jhu_daily_reports_us".to_string(),
            rows_fetched: 0,
            rows_written: 0,
            skipped: Some("no report".to_string()),
            duration_ms: 1,
        };
        assert_eq!(result.to_string(), "jhu_daily_reports_us: skipped (no report)");
    }
}
