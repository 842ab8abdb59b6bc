//! Filter sets and query URL construction
//!
//! Row filters are rendered PostgREST style (`fips=eq.12`,
//! `fips=in.(12,34)`); reserved query parameters such as `select` or `limit`
//! are sent as given.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::schema::EndpointSchema;
use super::ClientError;

/// Filter that is never unified across endpoints
pub const VARIABLE_FILTER: &str = "variable";

/// Query parameters PostgREST interprets itself
const RESERVED_PARAMS: &[&str] = &["select", "order", "limit", "offset", "on_conflict", "columns"];

/// Filters for one endpoint: name to value
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Filters(BTreeMap<String, Value>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter; an array value filters on membership
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert(&mut self, name: String, value: Value) {
        self.0.insert(name, value);
    }
}

impl fmt::Display for Filters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Pending request: endpoint name to its filters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet(BTreeMap<String, Filters>);

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record filters for an endpoint, replacing any earlier selection
    pub fn insert(&mut self, endpoint: impl Into<String>, filters: Filters) {
        self.0.insert(endpoint.into(), filters);
    }

    pub fn get(&self, endpoint: &str) -> Option<&Filters> {
        self.0.get(endpoint)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Filters)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Union of every filter except `variable` across all endpoints
    ///
    /// Two endpoints giving different values for the same filter is a
    /// [`ClientError::ConflictingFilter`].
    pub fn shared_filters(&self) -> Result<Filters, ClientError> {
        let mut shared = Filters::new();
        let mut origin: BTreeMap<&str, &str> = BTreeMap::new();

        for (endpoint, filters) in &self.0 {
            for (name, value) in filters.iter() {
                if name == VARIABLE_FILTER {
                    continue;
                }
                match shared.get(name) {
                    Some(current) if current != value => {
                        return Err(ClientError::ConflictingFilter {
                            filter: name.clone(),
                            first: current.clone(),
                            first_endpoint: origin.get(name.as_str()).unwrap_or(&"").to_string(),
                            second: value.clone(),
                            second_endpoint: endpoint.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        shared.insert(name.clone(), value.clone());
                        origin.insert(name.as_str(), endpoint.as_str());
                    }
                }
            }
        }

        Ok(shared)
    }
}

impl fmt::Display for FilterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(endpoint, filters)| format!("{}: {}", endpoint, filters))
            .collect();
        write!(f, "{}", parts.join("\n  -"))
    }
}

/// One endpoint request, ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRequest {
    pub endpoint: String,
    pub url: String,
}

/// Resolve the filter set into one request per endpoint
///
/// Each endpoint gets its own filters plus every shared filter it declares
/// as valid. Conflicts are detected here, before anything is sent.
pub fn plan_requests(
    base_url: &str,
    schema: &EndpointSchema,
    filter_set: &FilterSet,
) -> Result<Vec<PlannedRequest>, ClientError> {
    let shared = filter_set.shared_filters()?;
    let base = base_url.trim_end_matches('/');

    filter_set
        .iter()
        .map(|(name, own)| {
            let endpoint = schema.get(name).ok_or_else(|| ClientError::UnknownEndpoint {
                name: name.clone(),
                known: schema.names(),
            })?;

            let mut filters = own.clone();
            for (filter, value) in shared.iter() {
                if filters.get(filter).is_none() && endpoint.accepts(filter) {
                    filters.insert(filter.clone(), value.clone());
                }
            }

            let query = query_string(&filters);
            let url = if query.is_empty() {
                format!("{}/{}", base, name)
            } else {
                format!("{}/{}?{}", base, name, query)
            };
            Ok(PlannedRequest {
                endpoint: name.clone(),
                url,
            })
        })
        .collect()
}

/// Render filters as an encoded query string, names in sorted order
pub fn query_string(filters: &Filters) -> String {
    filters
        .iter()
        .map(|(name, value)| {
            let rendered = if RESERVED_PARAMS.contains(&name.as_str()) {
                scalar_text(value)
            } else {
                row_filter(value)
            };
            format!(
                "{}={}",
                urlencoding::encode(name),
                urlencoding::encode(&rendered)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn row_filter(value: &Value) -> String {
    match value {
        Value::Null => "is.null".to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(scalar_text).collect();
            format!("in.({})", items.join(","))
        }
        other => format!("eq.{}", scalar_text(other)),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(scalar_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> EndpointSchema {
        EndpointSchema::parse(&json!({
            "paths": {
                "/econ": {"get": {"parameters": [{"name": "fips", "in": "query"}, {"name": "variable", "in": "query"}]}},
                "/demo": {"get": {"parameters": [{"name": "fips", "in": "query"}]}},
                "/mobility": {"get": {"parameters": [{"name": "dt", "in": "query"}]}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_query_string() {
        let filters = Filters::new()
            .with("fips", json!([12, 34]))
            .with("variable", "cases_total")
            .with("limit", 10);
        assert_eq!(
            query_string(&filters),
            "fips=in.%2812%2C34%29&limit=10&variable=eq.cases_total"
        );
    }

    #[test]
    fn test_conflicting_filter() {
        let mut set = FilterSet::new();
        set.insert("econ", Filters::new().with("fips", 12));
        set.insert("demo", Filters::new().with("fips", 34));

        let err = set.shared_filters().unwrap_err();
        match err {
            ClientError::ConflictingFilter { filter, .. } => assert_eq!(filter, "fips"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_variable_is_not_shared() {
        let mut set = FilterSet::new();
        set.insert("econ", Filters::new().with("variable", "gdp"));
        set.insert("demo", Filters::new().with("variable", "population"));
        assert!(set.shared_filters().unwrap().is_empty());
    }

    #[test]
    fn test_shared_filters_propagate_to_accepting_endpoints() {
        let mut set = FilterSet::new();
        set.insert("econ", Filters::new().with("fips", 12));
        set.insert("demo", Filters::new());
        set.insert("mobility", Filters::new());

        let planned = plan_requests("https://api.example.org/", &schema(), &set).unwrap();
        let urls: Vec<&str> = planned.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://api.example.org/demo?fips=eq.12",
                "https://api.example.org/econ?fips=eq.12",
                "https://api.example.org/mobility",
            ]
        );
    }
}
