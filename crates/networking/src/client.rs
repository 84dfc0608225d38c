//! HTTP request model and client
//!
//! This module defines the request/response pair every other layer speaks,
//! the `Fetcher` seam through which the engine reaches the network, and a
//! reqwest-backed implementation of it.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

// =============================================================================
// Error Types
// =============================================================================

/// Failure to obtain any response at all
///
/// An HTTP error status is *not* a `FetchError`: the server answered, so the
/// caller receives the `Response` and decides what the status means.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Transport-level failure (DNS, refused connection, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// The request did not complete within the configured timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// No network and no usable cached copy
    #[error("Offline: {0}")]
    Offline(String),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The response body could not be read
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    /// Whether this failure means "could not reach the server"
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::Offline(_)
        )
    }
}

/// Result type for fetch operations
pub type Result<T> = std::result::Result<T, FetchError>;

// =============================================================================
// Request Types
// =============================================================================

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
    /// OPTIONS
    Options,
}

impl Method {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }

    /// Only GET responses are ever cached
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Method::Get)
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            other => Err(FetchError::InvalidRequest(format!("unsupported method {}", other))),
        }
    }
}

/// An outbound request as the application issued it
///
/// `url` is either absolute (`https://host/api/players`) or an absolute path
/// (`/api/players`) resolved against the client's base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Target URL or absolute path
    pub url: String,
    /// Request headers
    pub headers: BTreeMap<String, String>,
    /// Optional body
    pub body: Option<Vec<u8>>,
}

impl Request {
    /// Create a request
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), headers: BTreeMap::new(), body: None }
    }

    /// Create a GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Create a POST request
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Add a header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the raw body
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Set a JSON body and content type
    pub fn json_body<T: Serialize>(mut self, value: &T) -> std::result::Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_vec(value)?);
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        Ok(self)
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Option<T> {
        self.body
            .as_deref()
            .and_then(|body| serde_json::from_slice(body).ok())
    }

    /// Canonical identity used as a cache key: method plus URL
    pub fn cache_key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// Path component, without query or fragment
    pub fn path(&self) -> String {
        match Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => self
                .url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// URL scheme, if the URL is absolute
    pub fn scheme(&self) -> Option<String> {
        Url::parse(&self.url).ok().map(|url| url.scheme().to_string())
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// A response, either from the network or synthesized/cached locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response headers (lowercase names)
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: Vec<u8>,
}

impl Response {
    /// Create a response
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, headers: BTreeMap::new(), body: body.into() }
    }

    /// A 200 response
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    /// A JSON response
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string().into_bytes())
            .with_header("content-type", "application/json")
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&String> {
        self.headers.get(&key.to_ascii_lowercase())
    }

    /// Check if the response is successful (2xx status)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as UTF-8 text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON
    pub fn json_body<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

// =============================================================================
// Fetcher Seam
// =============================================================================

/// Anything that can turn a request into a response over the network
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issue the request
    async fn fetch(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
    async fn fetch(&self, request: Request) -> Result<Response> {
        (**self).fetch(request).await
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Base URL that path-only requests are resolved against
    pub base_url: Option<String>,
    /// Request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Headers included in every request
    pub default_headers: BTreeMap<String, String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(30),
            user_agent: format!("Rosterline/{}", env!("CARGO_PKG_VERSION")),
            default_headers: BTreeMap::new(),
        }
    }
}

impl HttpClientConfig {
    /// Create a config with a base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: Some(base_url.into()), ..Default::default() }
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Add a default header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// HTTP Client Implementation
// =============================================================================

/// reqwest-backed `Fetcher`
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: Option<Url>,
    config: HttpClientConfig,
}

impl HttpClient {
    /// Create a new client
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = config
            .base_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| FetchError::InvalidRequest(format!("Invalid base URL: {}", e)))?;

        Ok(Self { client, base_url, config })
    }

    /// Get the client configuration
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Resolve a request URL against the base URL
    pub fn resolve(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
                Some(base) => base
                    .join(url)
                    .map_err(|e| FetchError::InvalidRequest(format!("{}: {}", url, e))),
                None => Err(FetchError::InvalidRequest(format!(
                    "relative URL {} without a base URL",
                    url
                ))),
            },
            Err(e) => Err(FetchError::InvalidRequest(format!("{}: {}", url, e))),
        }
    }
}

#[async_trait]
impl Fetcher for HttpClient {
    async fn fetch(&self, request: Request) -> Result<Response> {
        let url = self.resolve(&request.url)?;
        let mut req = self.client.request(request.method.to_reqwest(), url);

        for (key, value) in &self.config.default_headers {
            req = req.header(key, value);
        }
        for (key, value) in &request.headers {
            req = req.header(key, value);
        }
        if let Some(body) = request.body {
            req = req.body(body);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(format!("{} {}", request.method, request.url))
            } else {
                FetchError::Network(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (key, value) in response.headers() {
            if let Ok(value_str) = value.to_str() {
                headers.insert(key.as_str().to_ascii_lowercase(), value_str.to_string());
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::InvalidResponse(format!("Failed to read body: {}", e)))?;

        tracing::trace!("{} {} -> {}", request.method, request.url, status);
        Ok(Response { status, headers, body: body.to_vec() })
    }
}

// =============================================================================
// Tests
// =============================================================================
