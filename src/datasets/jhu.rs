//! Johns Hopkins CSSE daily reports for US states

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{DatedSource, Dataset, DatasetError, DatasetResult, parse_date, parse_fips};
use crate::database::{ConflictPolicy, InsertShape, PersistTarget};
use crate::models::{CanonicalRow, Location, Record};
use crate::source::HttpTransport;
use crate::source::csv::{fetch_csv, number, text};

pub const BASE_URL: &str = "https://raw.githubusercontent.com/CSSEGISandData/COVID-19/master";

/// Source column to variable name; missing counts are reported as zero
const VARIABLES: &[(&str, &str)] = &[
    ("confirmed", "cases_total"),
    ("deaths", "deaths_total"),
    ("recovered", "recovered_total"),
    ("active", "active_total"),
];

/// One US daily report per date
///
/// Rows are vintaged by the report's own `last_update` date when present.
/// Rows without a FIPS code (cruise ships, repatriated travellers) are
/// dropped.
pub struct JhuDailyReportsUs {
    base_url: String,
    target: PersistTarget,
}

impl JhuDailyReportsUs {
    /// Date of the first published US daily report
    pub fn first_report() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 4, 12).unwrap_or_default()
    }

    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            target: PersistTarget::new(
                "jhu_daily_reports_us",
                &["vintage", "dt", "fips", "variable_id"],
            )
            .with_policy(ConflictPolicy::DoUpdate)
            .with_shape(InsertShape::VariableLookup { provider: None }),
        }
    }

    /// URL of the report for `date`
    pub fn report_url(&self, date: NaiveDate) -> String {
        format!(
            "{}/csse_covid_19_data/csse_covid_19_daily_reports_us/{}.csv",
            self.base_url,
            date.format("%m-%d-%Y")
        )
    }

    fn rows_from(&self, records: &[Record], dt: NaiveDate) -> DatasetResult<Vec<CanonicalRow>> {
        let mut rows = Vec::new();

        for record in records {
            // Headers vary in case between report generations
            let record: Record = record
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect();

            let Some(fips) = record.get("fips").filter(|v| !v.is_null()) else {
                continue;
            };
            let fips = parse_fips(fips).ok_or_else(|| {
                DatasetError::parse(self.name(), format!("invalid fips {} on {}", fips, dt))
            })?;

            let vintage = text(&record, "last_update")
                .and_then(|s| s.get(..10))
                .and_then(|s| parse_date(s, &["%Y-%m-%d"]))
                .unwrap_or(dt);

            for (column, variable) in VARIABLES {
                let value = number(&record, column).unwrap_or(0.0);
                rows.push(CanonicalRow::new(vintage, dt, Location::Fips(fips), *variable, value));
            }
        }

        Ok(rows)
    }
}

impl Default for JhuDailyReportsUs {
    fn default() -> Self {
        Self::new()
    }
}

impl Dataset for JhuDailyReportsUs {
    fn name(&self) -> &str {
        "jhu_daily_reports_us"
    }

    fn target(&self) -> &PersistTarget {
        &self.target
    }

    fn sources(&self) -> Vec<String> {
        vec![format!(
            "{}/csse_covid_19_data/csse_covid_19_daily_reports_us/",
            self.base_url
        )]
    }
}

#[async_trait]
impl DatedSource for JhuDailyReportsUs {
    async fn fetch_for(
        &self,
        http: &dyn HttpTransport,
        date: NaiveDate,
    ) -> DatasetResult<Vec<CanonicalRow>> {
        let records = fetch_csv(http, &self.report_url(date)).await?;
        self.rows_from(&records, date)
    }

    fn quit_early(&self, date: NaiveDate) -> Option<String> {
        (date < Self::first_report()).then(|| {
            format!(
                "no US daily report before {}",
                Self::first_report().format("%Y-%m-%d")
            )
        })
    }
}
