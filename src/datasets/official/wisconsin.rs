//! Wisconsin DHS historical table (ArcGIS)

use async_trait::async_trait;
use serde_json::Value;

use super::STATE_PROVIDER;
use crate::config::IngestConfig;
use crate::datasets::{Dataset, DatasetError, DatasetResult, LatestSource, parse_fips};
use crate::database::{ConflictPolicy, InsertShape, PersistTarget};
use crate::models::{CanonicalRow, Location, Record, esri_timestamp_to_date, today};
use crate::source::HttpTransport;
use crate::source::arcgis::{ArcGisClient, ArcGisConfig, ArcGisLayer};
use crate::source::csv::number;

pub const ARCGIS_ID: &str = "ISZ89Z51ft1G16OK";
pub const SOURCE_URL: &str =
    "https://data.dhsgis.wi.gov/datasets/covid-19-historical-data-table/data";

const VARIABLES: &[(&str, &str)] = &[
    ("NEGATIVE", "negative_tests_total"),
    ("POSITIVE", "positive_tests_total"),
    ("DEATHS", "deaths_total"),
];

/// State and county totals for Wisconsin
pub struct Wisconsin {
    config: ArcGisConfig,
    layer: ArcGisLayer,
    target: PersistTarget,
}

impl Wisconsin {
    pub fn new() -> Self {
        Self::with_config(ArcGisConfig::new(ARCGIS_ID, Some(1)))
    }

    /// Hosted layer with the `[arcgis]` paging bounds applied
    pub fn from_config(config: &IngestConfig) -> Self {
        let arcgis = ArcGisConfig::new(ARCGIS_ID, Some(1)).with_policy((&config.arcgis).into());
        Self::with_config(arcgis)
    }

    /// Use a custom organisation config; the geography filter is always applied
    pub fn with_config(config: ArcGisConfig) -> Self {
        Self {
            config: config.with_param("where", "GEO='State' OR GEO='County'"),
            layer: ArcGisLayer::new("COVID19_WI", 10),
            target: PersistTarget::new("us_covid", &["vintage", "dt", "fips", "variable_id"])
                .with_policy(ConflictPolicy::DoUpdate)
                .with_shape(InsertShape::VariableLookup {
                    provider: Some(STATE_PROVIDER.to_string()),
                }),
        }
    }

    fn rows_from(&self, records: &[Record]) -> DatasetResult<Vec<CanonicalRow>> {
        let vintage = today();
        let mut rows = Vec::new();

        for record in records {
            let dt = record
                .get("DATE")
                .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
                .and_then(esri_timestamp_to_date)
                .ok_or_else(|| DatasetError::parse(self.name(), "record without a valid DATE"))?;
            let fips = record
                .get("GEOID")
                .and_then(parse_fips)
                .ok_or_else(|| {
                    DatasetError::parse(self.name(), format!("invalid GEOID on {}", dt))
                })?;

            let mut push = |variable: &str, value: f64| {
                rows.push(CanonicalRow::new(vintage, dt, Location::Fips(fips), variable, value));
            };

            for (column, variable) in VARIABLES {
                if let Some(value) = number(record, column) {
                    push(variable, value);
                }
            }

            let positive = number(record, "POSITIVE");
            if let (Some(pos), Some(neg)) = (positive, number(record, "NEGATIVE")) {
                push("tests_total", pos + neg);
            }
            if let Some(pos) = positive {
                push("cases_total", pos);
            }
        }

        Ok(rows)
    }
}

impl Default for Wisconsin {
    fn default() -> Self {
        Self::new()
    }
}

impl Dataset for Wisconsin {
    fn name(&self) -> &str {
        "wisconsin"
    }

    fn target(&self) -> &PersistTarget {
        &self.target
    }

    fn sources(&self) -> Vec<String> {
        vec![SOURCE_URL.to_string()]
    }
}

#[async_trait]
impl LatestSource for Wisconsin {
    async fn fetch(&self, http: &dyn HttpTransport) -> DatasetResult<Vec<CanonicalRow>> {
        let client = ArcGisClient::new(http, self.config.clone());
        let records = client.fetch_all(&self.layer).await?;
        self.rows_from(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_derived_totals() {
        let wi = Wisconsin::new();
        let rows = wi
            .rows_from(&[record(json!({
                "DATE": 1_588_291_200_000i64,
                "GEOID": "55025",
                "NEGATIVE": 900,
                "POSITIVE": 100,
                "DEATHS": 3
            }))])
            .unwrap();

        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.dt == NaiveDate::from_ymd_opt(2020, 5, 1).unwrap()));
        let tests = rows.iter().find(|r| r.variable_name == "tests_total").unwrap();
        assert_eq!(tests.value, 1000.0);
        assert_eq!(tests.location, Location::Fips(55025));
    }

    #[test]
    fn test_missing_negative_skips_tests_total() {
        let rows = Wisconsin::new()
            .rows_from(&[record(json!({
                "DATE": 1_588_291_200_000i64,
                "GEOID": "55",
                "NEGATIVE": null,
                "POSITIVE": 40,
                "DEATHS": null
            }))])
            .unwrap();

        let names: Vec<&str> = rows.iter().map(|r| r.variable_name.as_str()).collect();
        assert_eq!(names, vec!["positive_tests_total", "cases_total"]);
    }

    #[test]
    fn test_geography_filter_applied() {
        let wi = Wisconsin::with_config(
            ArcGisConfig::new("org", None).with_base_url("http://localhost"),
        );
        assert!(
            wi.config
                .params
                .contains(&("where".to_string(), "GEO='State' OR GEO='County'".to_string()))
        );
    }
}
