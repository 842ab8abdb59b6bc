//! Source-side HTTP access
//!
//! Every network read in the crate goes through [`HttpTransport`], so the
//! paginated client, the dataset adapters and the query client can all be
//! driven by a scripted transport in tests.

use async_trait::async_trait;
use serde_json::Value;

pub mod arcgis;
pub mod csv;

pub use arcgis::{ArcGisClient, ArcGisConfig, ArcGisLayer, PageCursor, PagePolicy, paginate};

/// Error type for source fetches
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The request could not be sent or the connection failed
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    /// The server answered with a non-success status
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The response body was not in the expected shape
    #[error("Could not decode response from {url}: {message}")]
    Decode { url: String, message: String },

    /// The server reported an error inside a successful response
    #[error("{url} reported an error: {message}")]
    Remote { url: String, message: String },

    /// Empty pages kept arriving while the server still reported more records
    #[error(
        "Pagination of {url} stalled at offset {offset}: {attempts} empty pages still flagged as incomplete"
    )]
    IncompletePagination {
        url: String,
        offset: usize,
        attempts: u32,
    },
}

/// Query parameters as sent on the wire
pub type QueryParams = [(String, String)];

/// Minimal async HTTP GET interface
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// GET `url` with `params` appended, returning the body of a 2xx response
    async fn get(&self, url: &str, params: &QueryParams) -> Result<String, FetchError>;

    /// GET and decode the body as JSON
    async fn get_json(&self, url: &str, params: &QueryParams) -> Result<Value, FetchError> {
        let body = self.get(url, params).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// Build owned query parameters from string pairs
pub fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(feature = "api-backend")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "api-backend")]
mod reqwest_transport {
    use super::{FetchError, HttpTransport, QueryParams};
    use crate::config::IngestConfig;
    use async_trait::async_trait;
    use std::time::Duration;
    use tracing::debug;

    /// [`HttpTransport`] backed by a shared `reqwest::Client`
    #[derive(Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
        api_key: Option<String>,
    }

    impl ReqwestTransport {
        /// Build a transport with a request timeout, a user agent and an
        /// optional `apikey` header
        pub fn new(
            timeout: Duration,
            user_agent: &str,
            api_key: Option<String>,
        ) -> Result<Self, FetchError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(user_agent)
                .build()
                .map_err(|e| FetchError::Request {
                    url: String::new(),
                    message: format!("Failed to build HTTP client: {}", e),
                })?;
            Ok(Self { client, api_key })
        }

        /// Build from the `[http]` and `[client]` configuration sections
        pub fn from_config(config: &IngestConfig) -> Result<Self, FetchError> {
            Self::new(
                Duration::from_secs(config.http.timeout_secs),
                &config.http.user_agent,
                config.client.api_key.clone(),
            )
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        async fn get(&self, url: &str, params: &QueryParams) -> Result<String, FetchError> {
            let mut request = self.client.get(url);
            if !params.is_empty() {
                request = request.query(params);
            }
            if let Some(key) = &self.api_key {
                request = request.header("apikey", key);
            }

            debug!("GET {} ({} params)", url, params.len());
            let response = request.send().await.map_err(|e| FetchError::Request {
                url: url.to_string(),
                message: e.to_string(),
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            response.text().await.map_err(|e| FetchError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            })
        }
    }

}
