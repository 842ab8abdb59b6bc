//! Delaware Health and Social Services county downloads

use async_trait::async_trait;
use chrono::NaiveDate;

use super::STATE_PROVIDER;
use crate::datasets::{Dataset, DatasetError, DatasetResult, LatestSource};
use crate::database::{ConflictPolicy, InsertShape, PersistTarget};
use crate::models::{CanonicalRow, Location, Record, today};
use crate::source::HttpTransport;
use crate::source::csv::{fetch_csv, number, text};

pub const STATE_FIPS: u32 = 10;

const COUNTY_URL: &str = "https://myhealthycommunity.dhss.delaware.gov/locations";

/// Published statistic to variable name; other statistics are dropped
const STATISTICS: &[(&str, &str)] = &[
    ("Deaths", "deaths_total"),
    ("Cumulative Number of Positive Cases", "cases_total"),
    ("Recovered", "recovered_total"),
    ("Cumulative Number of Confirmed Positive Cases", "positive_tests_total"),
    ("Tested Negative", "negative_tests_total"),
    ("Total Persons Tested", "tests_total"),
];

/// County totals for Delaware, one download per county
///
/// The files carry no FIPS codes, so rows are keyed by county name and
/// resolved against the FIPS lookup at merge time.
pub struct Delaware {
    sources: Vec<(String, String)>,
    target: PersistTarget,
}

impl Delaware {
    pub fn new() -> Self {
        let sources = [("Sussex", "sussex"), ("Kent", "kent"), ("New Castle", "new-castle")]
            .iter()
            .map(|(county, slug)| {
                (
                    county.to_string(),
                    format!("{}/county-{}/download_covid_19_data", COUNTY_URL, slug),
                )
            })
            .collect();
        Self::with_sources(sources)
    }

    /// Read from the given (county, url) pairs instead
    pub fn with_sources(sources: Vec<(String, String)>) -> Self {
        Self {
            sources,
            target: PersistTarget::new("us_covid", &["vintage", "dt", "fips", "variable_id"])
                .with_policy(ConflictPolicy::DoUpdate)
                .with_shape(InsertShape::CountyLookup {
                    state_fips: STATE_FIPS,
                    provider: Some(STATE_PROVIDER.to_string()),
                }),
        }
    }

    fn rows_from(
        &self,
        county: &str,
        records: &[Record],
        vintage: NaiveDate,
    ) -> DatasetResult<Vec<CanonicalRow>> {
        let mut rows = Vec::new();

        for (i, record) in records.iter().enumerate() {
            if text(record, "Unit") != Some("people") {
                continue;
            }
            let Some(variable) = text(record, "Statistic")
                .and_then(|s| STATISTICS.iter().find(|(name, _)| *name == s))
                .map(|(_, variable)| *variable)
            else {
                continue;
            };

            let line = i + 2;
            let part = |column: &str| number(record, column).map(|n| n as i64);
            let dt = match (part("Year"), part("Month"), part("Day")) {
                (Some(y), Some(m), Some(d)) => {
                    NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32)
                }
                _ => None,
            }
            .ok_or_else(|| {
                DatasetError::parse(self.name(), format!("{} line {}: invalid date", county, line))
            })?;
            let value = number(record, "Value").ok_or_else(|| {
                DatasetError::parse(self.name(), format!("{} line {}: invalid value", county, line))
            })?;

            rows.push(CanonicalRow::new(
                vintage,
                dt,
                Location::County(county.to_string()),
                variable,
                value,
            ));
        }

        Ok(rows)
    }
}

impl Default for Delaware {
    fn default() -> Self {
        Self::new()
    }
}

impl Dataset for Delaware {
    fn name(&self) -> &str {
        "delaware"
    }

    fn target(&self) -> &PersistTarget {
        &self.target
    }

    fn sources(&self) -> Vec<String> {
        self.sources.iter().map(|(_, url)| url.clone()).collect()
    }
}

#[async_trait]
impl LatestSource for Delaware {
    async fn fetch(&self, http: &dyn HttpTransport) -> DatasetResult<Vec<CanonicalRow>> {
        let vintage = today();
        let mut rows = Vec::new();
        for (county, url) in &self.sources {
            let records = fetch_csv(http, url).await?;
            rows.extend(self.rows_from(county, &records, vintage)?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::csv::parse_csv;

    #[test]
    fn test_sources_cover_three_counties() {
        let de = Delaware::new();
        assert_eq!(de.sources().len(), 3);
        assert!(de.sources()[2].ends_with("county-new-castle/download_covid_19_data"));
    }

    #[test]
    fn test_rows_keep_people_totals_only() {
        let records = parse_csv(
            "Location,Statistic,Value,Unit,Year,Month,Day\n\
             Kent County,Deaths,12,people,2020,5,1\n\
             Kent County,Cumulative Number of Positive Cases,\"1,204\",people,2020,5,1\n\
             Kent County,Deaths,3.1,rate per 10k,2020,5,1\n\
             Kent County,Hospitalizations,40,people,2020,5,1\n",
        )
        .unwrap();
        let vintage = NaiveDate::from_ymd_opt(2020, 5, 2).unwrap();

        let rows = Delaware::new().rows_from("Kent", &records, vintage).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].variable_name, "cases_total");
        assert_eq!(rows[1].value, 1204.0);
        assert!(rows.iter().all(|r| r.location == Location::County("Kent".to_string())));
        assert!(rows.iter().all(|r| r.dt == NaiveDate::from_ymd_opt(2020, 5, 1).unwrap()));
    }
}
