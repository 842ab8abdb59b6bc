//! COVID Tracking Project state history

use async_trait::async_trait;
use serde_json::Value;

use super::{Dataset, DatasetError, DatasetResult, LatestSource, parse_date, parse_fips};
use crate::database::{ConflictPolicy, InsertShape, PersistTarget};
use crate::models::{CanonicalRow, Location, today};
use crate::source::HttpTransport;
use crate::source::csv::number;

pub const HISTORIC_URL: &str = "https://covidtracking.com/api/v1/states/daily.json";

/// Source field to variable name
const VARIABLES: &[(&str, &str)] = &[
    ("death", "deaths_total"),
    ("positive", "positive_tests_total"),
    ("negative", "negative_tests_total"),
    ("hospitalizedCurrently", "hospital_beds_in_use_covid_total"),
    ("inIcuCurrently", "icu_beds_in_use_covid_total"),
    ("onVentilatorCurrently", "ventilators_in_use_covid_total"),
];

/// Daily state-level history from the COVID Tracking Project
pub struct CovidTrackingProject {
    url: String,
    target: PersistTarget,
}

impl CovidTrackingProject {
    pub fn new() -> Self {
        Self::with_url(HISTORIC_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            target: PersistTarget::new("ctp_covid", &["vintage", "dt", "fips", "variable_id"])
                .with_policy(ConflictPolicy::DoUpdate)
                .with_shape(InsertShape::VariableLookup { provider: None }),
        }
    }

    fn rows_from(&self, body: Value) -> DatasetResult<Vec<CanonicalRow>> {
        let Value::Array(records) = body else {
            return Err(DatasetError::parse(self.name(), "expected an array of state records"));
        };

        let vintage = today();
        let mut rows = Vec::new();
        for (i, record) in records.iter().enumerate() {
            let record = record
                .as_object()
                .ok_or_else(|| {
                    DatasetError::parse(self.name(), format!("record {} is not an object", i))
                })?;

            let dt = record
                .get("date")
                .map(|d| match d {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .and_then(|d| parse_date(&d, &["%Y%m%d", "%Y-%m-%d"]))
                .ok_or_else(|| {
                    DatasetError::parse(self.name(), format!("record {} has no valid date", i))
                })?;
            let fips = record
                .get("fips")
                .and_then(parse_fips)
                .ok_or_else(|| {
                    DatasetError::parse(self.name(), format!("record {} has no valid fips", i))
                })?;

            for (field, variable) in VARIABLES {
                if let Some(value) = number(record, field) {
                    let location = Location::Fips(fips);
                    rows.push(CanonicalRow::new(vintage, dt, location, *variable, value));
                }
            }
        }

        Ok(rows)
    }
}

impl Default for CovidTrackingProject {
    fn default() -> Self {
        Self::new()
    }
}

impl Dataset for CovidTrackingProject {
    fn name(&self) -> &str {
        "ctp_covid"
    }

    fn target(&self) -> &PersistTarget {
        &self.target
    }

    fn sources(&self) -> Vec<String> {
        vec![self.url.clone()]
    }
}

#[async_trait]
impl LatestSource for CovidTrackingProject {
    async fn fetch(&self, http: &dyn HttpTransport) -> DatasetResult<Vec<CanonicalRow>> {
        let body = http.get_json(&self.url, &[]).await?;
        self.rows_from(body)
    }
}
