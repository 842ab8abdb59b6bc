//! Canonical long-format rows
//!
//! Every adapter produces rows of the same shape: one observation of one
//! variable, for one location, on one date, as retrieved on one vintage date.
//! The tuple (`vintage`, `dt`, location, `variable_name`) is the natural key.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an observation applies
///
/// Sources either publish numeric FIPS codes directly, or only a county name
/// that the warehouse resolves against its FIPS lookup table at merge time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// State or county FIPS code (e.g. 24 for Maryland, 24031 for Montgomery County)
    Fips(u32),
    /// Free-text county name, resolved later
    County(String),
}

impl Location {
    /// Column name this location is stored under in the export shape
    pub fn column_name(&self) -> &'static str {
        match self {
            Location::Fips(_) => "fips",
            Location::County(_) => "county",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Fips(fips) => write!(f, "{}", fips),
            Location::County(name) => write!(f, "{}", name),
        }
    }
}

/// One observation in canonical long format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    /// Date the value was retrieved
    pub vintage: NaiveDate,
    /// Date the value describes
    pub dt: NaiveDate,
    /// FIPS code or county name
    pub location: Location,
    /// Name of the measured quantity (e.g. `cases_total`)
    pub variable_name: String,
    /// Observed value
    pub value: f64,
}

impl CanonicalRow {
    /// Create a new row
    pub fn new(
        vintage: NaiveDate,
        dt: NaiveDate,
        location: Location,
        variable_name: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            vintage,
            dt,
            location,
            variable_name: variable_name.into(),
            value,
        }
    }

    /// Natural key of the row
    pub fn key(&self) -> (NaiveDate, NaiveDate, &Location, &str) {
        (self.vintage, self.dt, &self.location, &self.variable_name)
    }
}

/// Today's date in UTC, used as the vintage of a fresh pull
pub fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// Convert an Esri epoch-milliseconds timestamp to a calendar date (UTC)
pub fn esri_timestamp_to_date(millis: i64) -> Option<NaiveDate> {
    chrono::DateTime::from_timestamp_millis(millis).map(|ts| ts.date_naive())
}
