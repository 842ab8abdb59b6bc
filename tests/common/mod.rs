//! Scripted HTTP transport shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cmdc_ingest::source::{FetchError, HttpTransport};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Replays queued bodies per URL
///
/// Each URL has its own queue; the last body queued for a URL is repeated
/// once the queue is down to it. Unknown URLs answer HTTP 404.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<HashMap<String, VecDeque<String>>>,
    requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
    calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a body for `url`
    pub fn respond(self, url: &str, body: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(body.into());
        self
    }

    /// Queue a JSON body for `url`
    pub fn respond_json(self, url: &str, body: serde_json::Value) -> Self {
        self.respond(url, body.to_string())
    }

    /// Number of requests sent
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request sent, in order
    pub fn requests(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.requests.lock().unwrap().clone()
    }

    /// Value of `name` in each request, in order
    pub fn param_history(&self, name: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|(_, params)| params.into_iter().find(|(k, _)| k == name).map(|(_, v)| v))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn get(&self, url: &str, params: &[(String, String)]) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), params.to_vec()));

        let mut responses = self.responses.lock().unwrap();
        let queue = responses.get_mut(url).ok_or_else(|| FetchError::Status {
            url: url.to_string(),
            status: 404,
        })?;
        let body = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        body.ok_or_else(|| FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

/// An ArcGIS query page of `GEOID` records
pub fn arcgis_page(geoids: &[&str], more: bool) -> serde_json::Value {
    let features: Vec<serde_json::Value> = geoids
        .iter()
        .map(|g| serde_json::json!({"attributes": {"GEOID": g}}))
        .collect();
    serde_json::json!({"features": features, "exceededTransferLimit": more})
}
