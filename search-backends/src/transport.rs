use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use search_model::{Result, SearchError};
use tracing::debug;

pub(crate) const ENGINE: &str = "elasticsearch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Head,
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Head => reqwest::Method::HEAD,
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self { Self { status, body: body.into() } }

    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }

    pub fn json(&self) -> Result<serde_json::Value> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&self.body)
            .map_err(|e| SearchError::engine(ENGINE, format!("malformed response body: {e}")))
    }

    /// Turn a non-2xx response into an engine error carrying the body.
    pub fn error_for_status(self, what: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SearchError::engine(ENGINE, format!("{what} failed with HTTP {}: {}", self.status, self.body)))
        }
    }
}

/// Minimal request/response seam so the adapter can run against a fake.
pub trait Transport: Send + Sync {
    /// `path` starts with `/`. Non-2xx statuses are returned, not raised.
    fn send(&self, method: Method, path: &str, body: Option<&str>, content_type: Option<&str>) -> Result<Response>;
}

/// Blocking HTTP transport rotating over the configured hosts.
pub struct HttpTransport {
    client: Client,
    hosts: Vec<String>,
    next: AtomicUsize,
}

impl HttpTransport {
    pub fn new(hosts: &[String], timeout: Duration) -> Result<Self> {
        if hosts.is_empty() {
            return Err(SearchError::InvalidConfig("at least one elasticsearch host is required".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SearchError::InvalidConfig(format!("http client: {e}")))?;
        let hosts = hosts.iter().map(|h| h.trim_end_matches('/').to_string()).collect();
        Ok(Self { client, hosts, next: AtomicUsize::new(0) })
    }

    fn host(&self) -> &str {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        &self.hosts[i]
    }
}

impl Transport for HttpTransport {
    fn send(&self, method: Method, path: &str, body: Option<&str>, content_type: Option<&str>) -> Result<Response> {
        let url = format!("{}{}", self.host(), path);
        debug!(method = ?method, url = %url, "elasticsearch request");
        let mut req = self.client.request(method.as_reqwest(), &url);
        if let Some(body) = body {
            req = req
                .header(CONTENT_TYPE, content_type.unwrap_or("application/json"))
                .body(body.to_string());
        }
        let resp = req.send().map_err(map_err)?;
        let status = resp.status().as_u16();
        let body = resp.text().map_err(map_err)?;
        Ok(Response { status, body })
    }
}

pub(crate) fn map_err(e: reqwest::Error) -> SearchError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        SearchError::BackendUnavailable(e.to_string())
    } else {
        SearchError::engine(ENGINE, e.to_string())
    }
}
