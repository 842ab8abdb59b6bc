//! Paginated ArcGIS feature-server client
//!
//! A layer query returns at most the server's transfer limit per response and
//! sets `exceededTransferLimit` while more records remain. The walk below
//! requests successive offsets until that flag clears, so the result is the
//! complete record set or an error, never a silent prefix.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{FetchError, HttpTransport};
use crate::models::{Frame, Record};

/// Position of a pagination walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    /// Records received so far, sent as `resultOffset`
    pub offset: usize,
    /// Whether the last page reported more records
    pub more: bool,
}

impl PageCursor {
    fn start() -> Self {
        Self {
            offset: 0,
            more: true,
        }
    }
}

/// Bounds applied while walking pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePolicy {
    /// Re-requests allowed for an empty page that still reports more records
    pub max_empty_page_retries: u32,
}

impl Default for PagePolicy {
    fn default() -> Self {
        Self {
            max_empty_page_retries: 3,
        }
    }
}

/// One decoded page
struct Page {
    records: Vec<Record>,
    more: bool,
}

fn parse_page(url: &str, body: Value) -> Result<Page, FetchError> {
    if let Some(error) = body.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(FetchError::Remote {
            url: url.to_string(),
            message,
        });
    }

    let decode = |message: &str| FetchError::Decode {
        url: url.to_string(),
        message: message.to_string(),
    };

    let features = body
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| decode("response has no features array"))?;

    let records = features
        .iter()
        .map(|feature| {
            feature
                .get("attributes")
                .and_then(Value::as_object)
                .cloned()
                .ok_or_else(|| decode("feature without attributes object"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let more = body
        .get("exceededTransferLimit")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(Page { records, more })
}

/// Fetch every record of a paged query
///
/// `params` are sent with every page; `resultOffset` is managed here and
/// overrides any value supplied by the caller. Records are returned in
/// response order.
pub async fn paginate(
    http: &dyn HttpTransport,
    url: &str,
    params: &[(String, String)],
    policy: PagePolicy,
) -> Result<Vec<Record>, FetchError> {
    let mut base: Vec<(String, String)> = params
        .iter()
        .filter(|(k, _)| k != "resultOffset")
        .cloned()
        .collect();
    base.push(("resultOffset".to_string(), String::new()));
    let offset_slot = base.len() - 1;

    let mut records: Vec<Record> = Vec::new();
    let mut cursor = PageCursor::start();
    let mut empty_pages: u32 = 0;
    let mut pages: usize = 0;

    while cursor.more {
        base[offset_slot].1 = cursor.offset.to_string();
        let body = http.get_json(url, &base).await?;
        let page = parse_page(url, body)?;
        pages += 1;

        if page.records.is_empty() && page.more {
            empty_pages += 1;
            if empty_pages > policy.max_empty_page_retries {
                return Err(FetchError::IncompletePagination {
                    url: url.to_string(),
                    offset: cursor.offset,
                    attempts: empty_pages,
                });
            }
            warn!(
                "Empty page at offset {} of {} still flags more records (retry {}/{})",
                cursor.offset, url, empty_pages, policy.max_empty_page_retries
            );
            continue;
        }

        empty_pages = 0;
        debug!(
            "Page {} of {}: {} records at offset {}",
            pages,
            url,
            page.records.len(),
            cursor.offset
        );
        cursor.offset += page.records.len();
        cursor.more = page.more;
        records.extend(page.records);
    }

    info!("Fetched {} records from {} in {} pages", records.len(), url, pages);
    Ok(records)
}

/// A feature-server layer: service name and layer (sheet) number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcGisLayer {
    pub service: String,
    pub sheet: u32,
}

impl ArcGisLayer {
    pub fn new(service: impl Into<String>, sheet: u32) -> Self {
        Self {
            service: service.into(),
            sheet,
        }
    }
}

/// Immutable configuration of one ArcGIS organisation
#[derive(Debug, Clone)]
pub struct ArcGisConfig {
    /// Organisation id in `services<N>.arcgis.com/<arcgis_id>/...`
    pub arcgis_id: String,
    /// Server number `<N>`; `None` addresses `services.arcgis.com`
    pub server_id: Option<u32>,
    /// Full `.../rest/services` root overriding the hosted form
    pub base_url: Option<String>,
    /// Query parameters sent with every page
    pub params: Vec<(String, String)>,
    pub policy: PagePolicy,
}

impl ArcGisConfig {
    /// Hosted organisation with the default "all records, all fields" query
    pub fn new(arcgis_id: impl Into<String>, server_id: Option<u32>) -> Self {
        Self {
            arcgis_id: arcgis_id.into(),
            server_id,
            base_url: None,
            params: super::params(&[
                ("f", "json"),
                ("where", "1=1"),
                ("outFields", "*"),
                ("returnGeometry", "false"),
            ]),
            policy: PagePolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set a query parameter, replacing any earlier value
    pub fn with_param(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name.to_string(), value)),
        }
        self
    }

    pub fn with_policy(mut self, policy: PagePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn services_root(&self) -> String {
        match &self.base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => {
                let server = self.server_id.map(|n| n.to_string()).unwrap_or_default();
                format!(
                    "https://services{}.arcgis.com/{}/ArcGIS/rest/services",
                    server, self.arcgis_id
                )
            }
        }
    }
}

/// Client for the layers of one ArcGIS organisation
pub struct ArcGisClient<'a> {
    http: &'a dyn HttpTransport,
    config: ArcGisConfig,
}

impl<'a> ArcGisClient<'a> {
    pub fn new(http: &'a dyn HttpTransport, config: ArcGisConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &ArcGisConfig {
        &self.config
    }

    /// Query URL of a layer
    pub fn query_url(&self, layer: &ArcGisLayer) -> String {
        format!(
            "{}/{}/FeatureServer/{}/query",
            self.config.services_root(),
            layer.service,
            layer.sheet
        )
    }

    /// Fetch every record of a layer
    pub async fn fetch_all(&self, layer: &ArcGisLayer) -> Result<Vec<Record>, FetchError> {
        let url = self.query_url(layer);
        paginate(self.http, &url, &self.config.params, self.config.policy).await
    }

    /// Fetch every record of a layer as a frame
    pub async fn fetch_frame(&self, layer: &ArcGisLayer) -> Result<Frame, FetchError> {
        Ok(Frame::from_records(&self.fetch_all(layer).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_page_reads_flag_and_attributes() {
        let page = parse_page(
            "u",
            json!({
                "features": [{"attributes": {"GEOID": "55025"}}],
                "exceededTransferLimit": true
            }),
        )
        .unwrap();
        assert!(page.more);
        assert_eq!(page.records[0]["GEOID"], "55025");
    }

    #[test]
    fn test_parse_page_flag_absent_means_done() {
        let page = parse_page("u", json!({"features": []})).unwrap();
        assert!(!page.more);
        assert!(page.records.is_empty());
    }

    #[test]
    fn test_parse_page_remote_error() {
        let err = parse_page(
            "u",
            json!({"error": {"code": 400, "message": "Invalid query parameters"}}),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            FetchError::Remote { ref message, .. } if message == "Invalid query parameters"
        ));
    }

    #[test]
    fn test_parse_page_without_features() {
        let err = parse_page("u", json!({"fields": []})).err().unwrap();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn test_query_url() {
        struct Never;
        #[async_trait::async_trait]
        impl HttpTransport for Never {
            async fn get(&self, url: &str, _: &[(String, String)]) -> Result<String, FetchError> {
                Err(FetchError::Request {
                    url: url.to_string(),
                    message: "offline".to_string(),
                })
            }
        }

        let client = ArcGisClient::new(&Never, ArcGisConfig::new("org123", Some(1)));
        assert_eq!(
            client.query_url(&ArcGisLayer::new("COVID19_WI", 10)),
            "https://services1.arcgis.com/org123/ArcGIS/rest/services/COVID19_WI/FeatureServer/10/query"
        );

        let local = ArcGisClient::new(
            &Never,
            ArcGisConfig::new("org123", None).with_base_url("http://localhost/rest/services/"),
        );
        assert_eq!(
            local.query_url(&ArcGisLayer::new("Cases", 0)),
            "http://localhost/rest/services/Cases/FeatureServer/0/query"
        );
    }

    #[test]
    fn test_with_param_replaces() {
        let config = ArcGisConfig::new("org123", None).with_param("where", "GEO='State'");
        let wheres: Vec<&str> = config
            .params
            .iter()
            .filter(|(k, _)| k == "where")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(wheres, vec!["GEO='State'"]);
    }
}
