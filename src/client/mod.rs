//! Dynamic query client
//!
//! Discovers the API's endpoints from its swagger document, lets callers
//! chain filtered selections across endpoints, and fetches them as one wide
//! table:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use cmdc_ingest::client::{Client, Filters};
//! # async fn run(http: Arc<dyn cmdc_ingest::source::HttpTransport>) -> Result<(), cmdc_ingest::client::ClientError> {
//! let mut client = Client::connect(http, "https://api.covid.valorum.ai").await?;
//! client
//!     .select("economics", Filters::new().with("fips", 12))?
//!     .select("demographics", Filters::new())?;
//! let table = client.fetch().await?;
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::models::{Frame, Record};
use crate::source::{FetchError, HttpTransport};

pub mod request;
pub mod reshape;
pub mod schema;

pub use request::{FilterSet, Filters, PlannedRequest};
pub use schema::{Endpoint, EndpointSchema, FilterSpec};

/// Error type for the query client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Two endpoints set different values for the same shared filter
    #[error(
        "Found conflicting values for common filter {filter}: {first} ({first_endpoint}) and {second} ({second_endpoint})"
    )]
    ConflictingFilter {
        filter: String,
        first: Value,
        first_endpoint: String,
        second: Value,
        second_endpoint: String,
    },

    #[error("{endpoint} endpoint given filter {filter}. Valid filters are {}", .valid.join(", "))]
    UnknownFilter {
        endpoint: String,
        filter: String,
        valid: Vec<String>,
    },

    #[error("Unknown endpoint {name}. Known endpoints are {}", .known.join(", "))]
    UnknownEndpoint { name: String, known: Vec<String> },

    #[error("Invalid API schema: {0}")]
    InvalidSchema(String),

    #[error("No endpoints selected")]
    EmptyRequest,

    #[error("Could not reshape {endpoint} response: {message}")]
    Reshape { endpoint: String, message: String },

    /// A request task panicked or was cancelled
    #[error("Request task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Query client bound to one API
pub struct Client {
    http: Arc<dyn HttpTransport>,
    base_url: String,
    schema: EndpointSchema,
    pending: FilterSet,
}

impl Client {
    /// Fetch `<base_url>/swagger.json` and build the endpoint registry
    pub async fn connect(
        http: Arc<dyn HttpTransport>,
        base_url: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let doc = http.get_json(&format!("{}/swagger.json", base_url), &[]).await?;
        let schema = EndpointSchema::parse(&doc)?;
        info!("Discovered {} endpoints at {}", schema.len(), base_url);
        Ok(Self::with_schema(http, base_url, schema))
    }

    /// Build a client from an already parsed schema
    pub fn with_schema(
        http: Arc<dyn HttpTransport>,
        base_url: impl Into<String>,
        schema: EndpointSchema,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            schema,
            pending: FilterSet::new(),
        }
    }

    pub fn schema(&self) -> &EndpointSchema {
        &self.schema
    }

    /// The selections recorded since the last fetch
    pub fn pending(&self) -> &FilterSet {
        &self.pending
    }

    /// Look up an endpoint by name
    pub fn endpoint(&self, name: &str) -> Result<&Endpoint, ClientError> {
        self.schema.get(name).ok_or_else(|| ClientError::UnknownEndpoint {
            name: name.to_string(),
            known: self.schema.names(),
        })
    }

    /// Select an endpoint with filters
    ///
    /// Every filter name must be declared by the endpoint; on error nothing
    /// is recorded. Selecting the same endpoint again replaces its filters.
    pub fn select(&mut self, name: &str, filters: Filters) -> Result<&mut Self, ClientError> {
        let endpoint = self.endpoint(name)?;
        if let Some((bad, _)) = filters.iter().find(|(f, _)| !endpoint.accepts(f)) {
            return Err(ClientError::UnknownFilter {
                endpoint: name.to_string(),
                filter: bad.clone(),
                valid: endpoint.filter_names(),
            });
        }

        debug!("Selected {} with {}", name, filters);
        self.pending.insert(name, filters);
        Ok(self)
    }

    /// Run every pending selection and return one wide table
    ///
    /// The pending selections are cleared whether or not the fetch succeeds.
    /// An endpoint with no matching rows makes the result empty. Filter
    /// conflicts are reported before any request is sent; the first failing
    /// request aborts the rest.
    pub async fn fetch(&mut self) -> Result<Frame, ClientError> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Err(ClientError::EmptyRequest);
        }

        let planned = request::plan_requests(&self.base_url, &self.schema, &pending)?;
        let responses = self.execute(planned).await?;

        if let Some((endpoint, _)) = responses.iter().find(|(_, records)| records.is_empty()) {
            info!("{} returned no rows; the joined result is empty", endpoint);
            return Ok(Frame::new(Vec::new()));
        }

        let mut wide_frames = Vec::with_capacity(responses.len());
        for (endpoint, records) in responses {
            let fallback = self
                .schema
                .get(&endpoint)
                .map(|e| e.filter_names())
                .unwrap_or_default();
            let long = Frame::from_records(&records);
            let wide = reshape::long_to_wide(long, &endpoint, &fallback)?;
            wide_frames.push((endpoint, wide));
        }

        let mut frames = wide_frames.into_iter();
        let Some((_, mut combined)) = frames.next() else {
            return Err(ClientError::EmptyRequest);
        };
        for (endpoint, frame) in frames {
            combined = reshape::inner_join(&combined, &frame, &endpoint)?;
        }

        info!(
            "Fetched {} rows x {} columns from {} endpoints",
            combined.len(),
            combined.columns().len(),
            pending.len()
        );
        Ok(combined)
    }

    /// Send all requests concurrently; results come back in endpoint order
    async fn execute(
        &self,
        planned: Vec<PlannedRequest>,
    ) -> Result<Vec<(String, Vec<Record>)>, ClientError> {
        let order: Vec<String> = planned.iter().map(|p| p.endpoint.clone()).collect();
        let mut tasks = JoinSet::new();

        for PlannedRequest { endpoint, url } in planned {
            let http = Arc::clone(&self.http);
            tasks.spawn(async move {
                debug!("GET {}", url);
                let body = http.get_json(&url, &[]).await;
                (endpoint, url, body)
            });
        }

        let mut results: Vec<(String, Vec<Record>)> = Vec::with_capacity(order.len());
        while let Some(joined) = tasks.join_next().await {
            let (endpoint, url, body) = joined.map_err(|e| ClientError::Task(e.to_string()))?;
            let records = records_from(&url, body?)?;
            results.push((endpoint, records));
        }

        results.sort_by_key(|(endpoint, _)| order.iter().position(|o| o == endpoint));
        Ok(results)
    }
}

fn records_from(url: &str, body: Value) -> Result<Vec<Record>, FetchError> {
    let decode = |message: String| FetchError::Decode {
        url: url.to_string(),
        message,
    };
    match body {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(record) => Ok(record),
                other => Err(decode(format!("expected a record, found {}", other))),
            })
            .collect(),
        other => Err(decode(format!("expected an array of records, found {}", other))),
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CMDC Client")?;
        if !self.pending.is_empty() {
            write!(f, ". Current request:\n  -{}", self.pending)?;
        }
        Ok(())
    }
}
