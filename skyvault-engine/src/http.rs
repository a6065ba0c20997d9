//! HTTP capability: the minimal client surface provider adapters need.
//!
//! Adapters never construct a `reqwest` client themselves; they go through
//! [`HttpClient`] so tests can script responses without a network.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::Patch, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    /// JSON body with content type.
    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.body = Some(value.to_string().into_bytes());
        self.header("Content-Type", "application/json")
    }

    /// `application/x-www-form-urlencoded` body, as token endpoints expect.
    pub fn form(mut self, pairs: &[(&str, &str)]) -> Self {
        let mut body = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in pairs {
            body.append_pair(name, value);
        }
        self.body = Some(body.finish().into_bytes());
        self.header("Content-Type", "application/x-www-form-urlencoded")
    }

    pub fn raw_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self.header("Content-Type", content_type.to_string())
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

// ---------------------------------------------------------------------------
// Errors and trait
// ---------------------------------------------------------------------------

/// Transport-level failure. Status-code handling happens above this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    Timeout,
    Cancelled,
    Transport(String),
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Cancelled => write!(f, "request cancelled"),
            Self::Transport(detail) => write!(f, "transport: {}", detail),
        }
    }
}

impl std::error::Error for HttpError {}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// Production client backed by `reqwest` with rustls.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("skyvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HttpError::Transport(format!("client init: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout
            } else {
                HttpError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, headers, body })
    }
}

// ---------------------------------------------------------------------------
// Scripted client for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Route {
        method: Method,
        url_contains: String,
        queue: VecDeque<Result<HttpResponse, HttpError>>,
    }

    /// Scripted responses keyed by method plus a URL fragment. Each expected
    /// response is consumed exactly once, in enqueue order per route.
    #[derive(Default)]
    pub(crate) struct MockHttpClient {
        routes: Mutex<Vec<Route>>,
        log: Mutex<Vec<HttpRequest>>,
    }

    impl MockHttpClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn expect(
            &self,
            method: Method,
            url_contains: &str,
            response: Result<HttpResponse, HttpError>,
        ) {
            let mut routes = self.routes.lock().unwrap();
            if let Some(route) = routes
                .iter_mut()
                .find(|r| r.method == method && r.url_contains == url_contains)
            {
                route.queue.push_back(response);
            } else {
                routes.push(Route {
                    method,
                    url_contains: url_contains.to_string(),
                    queue: VecDeque::from([response]),
                });
            }
        }

        pub fn expect_json(&self, method: Method, url_contains: &str, status: u16, body: serde_json::Value) {
            self.expect(method, url_contains, Ok(json_response(status, body)));
        }

        /// Every request the adapter actually made.
        pub fn requests(&self) -> Vec<HttpRequest> {
            self.log.lock().unwrap().clone()
        }

        pub fn request_count(&self, method: Method, url_contains: &str) -> usize {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.method == method && r.url.contains(url_contains))
                .count()
        }
    }

    pub(crate) fn json_response(status: u16, body: serde_json::Value) -> HttpResponse {
        HttpResponse {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: body.to_string().into_bytes(),
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            self.log.lock().unwrap().push(request.clone());
            let mut routes = self.routes.lock().unwrap();
            let route = routes
                .iter_mut()
                .find(|r| {
                    r.method == request.method
                        && request.url.contains(&r.url_contains)
                        && !r.queue.is_empty()
                })
                .unwrap_or_else(|| {
                    panic!("unexpected request: {} {}", request.method, request.url)
                });
            route.queue.pop_front().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = HttpResponse {
            status: 200,
            headers: vec![("Retry-After".into(), "30".into())],
            body: Vec::new(),
        };
        assert_eq!(response.header("retry-after"), Some("30"));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn form_body_is_urlencoded() {
        let request = HttpRequest::post("https://example.test/token")
            .form(&[("grant_type", "refresh_token"), ("refresh_token", "a b&c")]);
        let body = String::from_utf8(request.body.unwrap()).unwrap();
        assert_eq!(body, "grant_type=refresh_token&refresh_token=a+b%26c");
    }
}
