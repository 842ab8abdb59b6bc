//! New York Times state-level cumulative counts

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

use super::{Dataset, DatasetError, DatasetResult, LatestSource, parse_date, parse_fips};
use crate::database::{ConflictPolicy, InsertShape, PersistTarget};
use crate::models::{CanonicalRow, Location, Record, today};
use crate::source::HttpTransport;
use crate::source::csv::{fetch_csv, number};

pub const STATES_URL: &str =
    "https://raw.githubusercontent.com/nytimes/covid-19-data/master/us-states.csv";

/// Cumulative cases and deaths by state
///
/// A state missing from the file on some date (it had no cases yet) is
/// reported as zero for that date, so every state has a row on every date
/// that appears in the file.
pub struct NyTimesState {
    url: String,
    target: PersistTarget,
}

impl NyTimesState {
    pub fn new() -> Self {
        Self::with_url(STATES_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            target: PersistTarget::new("covid_nytimes", &["vintage", "dt", "fips", "variable_id"])
                .with_policy(ConflictPolicy::DoNothing)
                .with_shape(InsertShape::VariableLookup { provider: None }),
        }
    }

    fn rows_from(&self, records: &[Record]) -> DatasetResult<Vec<CanonicalRow>> {
        let mut observed: BTreeMap<(NaiveDate, u32), (f64, f64)> = BTreeMap::new();
        let mut dates = BTreeSet::new();
        let mut states = BTreeSet::new();

        for (i, record) in records.iter().enumerate() {
            let line = i + 2;
            let dt = record
                .get("date")
                .and_then(|d| d.as_str())
                .and_then(|d| parse_date(d, &["%Y-%m-%d"]))
                .ok_or_else(|| {
                    DatasetError::parse(self.name(), format!("line {}: invalid date", line))
                })?;
            let fips = record
                .get("fips")
                .and_then(parse_fips)
                .ok_or_else(|| {
                    DatasetError::parse(self.name(), format!("line {}: invalid fips", line))
                })?;

            let cases = number(record, "cases").unwrap_or(0.0);
            let deaths = number(record, "deaths").unwrap_or(0.0);
            observed.insert((dt, fips), (cases, deaths));
            dates.insert(dt);
            states.insert(fips);
        }

        let vintage = today();
        let mut rows = Vec::with_capacity(dates.len() * states.len() * 2);
        for dt in &dates {
            for fips in &states {
                let (cases, deaths) = observed.get(&(*dt, *fips)).copied().unwrap_or((0.0, 0.0));
                let location = Location::Fips(*fips);
                rows.push(CanonicalRow::new(vintage, *dt, location.clone(), "cases_total", cases));
                rows.push(CanonicalRow::new(vintage, *dt, location, "deaths_total", deaths));
            }
        }

        Ok(rows)
    }
}

impl Default for NyTimesState {
    fn default() -> Self {
        Self::new()
    }
}

impl Dataset for NyTimesState {
    fn name(&self) -> &str {
        "covid_nytimes"
    }

    fn target(&self) -> &PersistTarget {
        &self.target
    }

    fn sources(&self) -> Vec<String> {
        vec![self.url.clone()]
    }
}

#[async_trait]
impl LatestSource for NyTimesState {
    async fn fetch(&self, http: &dyn HttpTransport) -> DatasetResult<Vec<CanonicalRow>> {
        let records = fetch_csv(http, &self.url).await?;
        self.rows_from(&records)
    }
}
