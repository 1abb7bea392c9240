//! # Feed HTTP Transport
//!
//! One GET per call, in one of two modes:
//!
//! - **Conditional**: sends `If-Modified-Since` with the last observed content
//!   time and reuses pooled keep-alive connections. A 304 is a normal answer.
//! - **Full**: no precondition, a non-pooling client and `Connection: close`,
//!   so every hard republish gets a fresh connection and a full body.
//!
//! The polling worker talks to the [`FeedTransport`] trait so tests can
//! script responses without a network.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, CONNECTION, CONTENT_TYPE, DATE, IF_MODIFIED_SINCE, LAST_MODIFIED};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::configs::{HttpEncoding, PsychConfig};
use crate::retrieve::dns_cache::CachingResolver;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Request mode for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// `If-Modified-Since` plus connection reuse.
    Conditional,
    /// Unconditional, fresh connection.
    Full,
}

/// What to fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Resource name, for logging.
    pub resource: String,
    /// Target URL.
    pub url: Url,
    /// Request mode.
    pub mode: FetchMode,
    /// Last content modification time seen for this resource.
    pub if_modified_since: Option<DateTime<Utc>>,
}

/// A completed HTTP exchange, whatever its status.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Decoded body bytes.
    pub body: Vec<u8>,
    /// `Content-Type` header.
    pub content_type: Option<String>,
    /// `Date` header: the server's clock.
    pub server_date: Option<DateTime<Utc>>,
    /// `Last-Modified` header: the content's modification time.
    pub last_modified: Option<DateTime<Utc>>,
}

impl FetchResponse {
    /// A response with a status and body and no headers.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            ..Default::default()
        }
    }

    /// Sets the content type.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    /// Sets the server date.
    pub fn with_server_date(mut self, date: DateTime<Utc>) -> Self {
        self.server_date = Some(date);
        self
    }

    /// Sets the content modification time.
    pub fn with_last_modified(mut self, date: DateTime<Utc>) -> Self {
        self.last_modified = Some(date);
        self
    }
}

/// Failures before a complete response was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Request or connect timeout.
    #[error("request timed out")]
    Timeout,
    /// TCP, TLS or DNS failure.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The body exceeded the configured maximum.
    #[error("response larger than {limit} bytes")]
    TooLarge {
        /// Configured maximum response size.
        limit: usize,
    },
    /// Any other request failure.
    #[error("request failed: {0}")]
    Request(String),
    /// The HTTP client could not be built.
    #[error("client setup failed: {0}")]
    Client(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// The seam between the polling worker and the network.
pub trait FeedTransport: Send + Sync {
    /// Performs one GET. The future owns everything it needs; dropping it
    /// cancels the transfer.
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, TransportError>>;
}

/// Static transport settings shared by every request.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Whole-request timeout.
    pub timeout: Duration,
    /// Connection phase timeout.
    pub connect_timeout: Duration,
    /// Proxy URL.
    pub proxy: Option<String>,
    /// DNS answer lifetime; zero disables caching.
    pub dns_cache_timeout: Duration,
    /// Requested content encoding.
    pub encoding: HttpEncoding,
    /// Allow HTTP/2 multiplexing.
    pub pipelining: bool,
    /// Largest accepted body; zero disables the limit.
    pub max_response_size: usize,
}

impl TransportOptions {
    /// Extracts the transport settings from the provider configuration.
    pub fn from_config(config: &PsychConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            proxy: config.http_proxy.clone(),
            dns_cache_timeout: Duration::from_secs(config.dns_cache_timeout),
            encoding: config.request_http_encoding,
            pipelining: config.enable_http_pipelining,
            max_response_size: config.maximum_response_size,
        }
    }
}

/// # HTTP Feed Client
///
/// Two `reqwest` clients with identical settings: `pooled` keeps idle
/// connections for conditional polls, `fresh` never does.
#[derive(Debug, Clone)]
pub struct HttpFeedClient {
    pooled: reqwest::Client,
    fresh: reqwest::Client,
    max_response_size: usize,
}

impl HttpFeedClient {
    /// Builds both clients.
    ///
    /// # Errors
    /// Returns [`TransportError::Client`] for an unusable proxy URL or a TLS
    /// backend that fails to initialise.
    pub fn new(options: &TransportOptions) -> Result<Self, TransportError> {
        Ok(Self {
            pooled: build_client(options, true)?,
            fresh: build_client(options, false)?,
            max_response_size: options.max_response_size,
        })
    }
}

fn build_client(options: &TransportOptions, keep_alive: bool) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .timeout(options.timeout)
        .connect_timeout(options.connect_timeout)
        .user_agent(USER_AGENT);

    builder = match options.encoding {
        HttpEncoding::Identity => builder.gzip(false).deflate(false),
        HttpEncoding::Gzip => builder.gzip(true).deflate(false),
        HttpEncoding::Deflate => builder.gzip(false).deflate(true),
    };
    if !options.pipelining {
        builder = builder.http1_only();
    }
    if !keep_alive {
        builder = builder.pool_max_idle_per_host(0);
    }
    if let Some(proxy) = &options.proxy {
        let proxy = reqwest::Proxy::all(proxy.as_str()).map_err(|e| TransportError::Client(e.to_string()))?;
        builder = builder.proxy(proxy);
    }
    if !options.dns_cache_timeout.is_zero() {
        builder = builder.dns_resolver(Arc::new(CachingResolver::new(options.dns_cache_timeout)));
    }

    builder.build().map_err(|e| TransportError::Client(e.to_string()))
}

impl FeedTransport for HttpFeedClient {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, TransportError>> {
        let client = match request.mode {
            FetchMode::Conditional => self.pooled.clone(),
            FetchMode::Full => self.fresh.clone(),
        };
        let limit = self.max_response_size;

        Box::pin(fetch_once(client, request, limit))
    }
}

async fn fetch_once(
    client: reqwest::Client,
    request: FetchRequest,
    limit: usize,
) -> Result<FetchResponse, TransportError> {
    // --- Phase 1: Build the request for the mode ---
    let mut builder = client.get(request.url.clone());
    match request.mode {
        FetchMode::Conditional => {
            if let Some(since) = request.if_modified_since {
                builder = builder.header(IF_MODIFIED_SINCE, format_http_date(since));
            }
        }
        FetchMode::Full => {
            builder = builder.header(CONNECTION, "close");
        }
    }

    // --- Phase 2: Send and capture header metadata ---
    let mut response = builder.send().await?;
    let status = response.status().as_u16();
    let (content_type, server_date, last_modified) = {
        let headers = response.headers();
        (
            header_text(headers, &CONTENT_TYPE),
            header_text(headers, &DATE).and_then(|v| parse_http_date(&v)),
            header_text(headers, &LAST_MODIFIED).and_then(|v| parse_http_date(&v)),
        )
    };

    // --- Phase 3: Read the body under the size limit ---
    if limit > 0 {
        if let Some(length) = response.content_length() {
            if length > limit as u64 {
                log::warn!("Aborted HTTP transfer {} on content length {}", request.url, length);
                return Err(TransportError::TooLarge { limit });
            }
        }
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if limit > 0 && body.len() + chunk.len() > limit {
            log::warn!("Aborted HTTP transfer {} past {} bytes", request.url, limit);
            return Err(TransportError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }

    log::debug!(
        "HTTP {} {} status {} ({} bytes)",
        request.resource,
        request.url,
        status,
        body.len()
    );
    Ok(FetchResponse {
        status,
        body,
        content_type,
        server_date,
        last_modified,
    })
}

fn header_text(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Formats an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses an HTTP date header.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn options() -> TransportOptions {
        TransportOptions {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            proxy: None,
            dns_cache_timeout: Duration::ZERO,
            encoding: HttpEncoding::Identity,
            pipelining: false,
            max_response_size: 1024,
        }
    }

    /// Serves one canned response and hands back the raw request text.
    fn one_shot_server(response: String) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://127.0.0.1:{}/feed.txt", port), handle)
    }

    #[test]
    fn test_http_date_round_trip() {
        let date = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(format_http_date(date), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"), Some(date));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[tokio::test]
    async fn test_conditional_request_sends_if_modified_since() {
        let body = "RIC,bid\nA,1\n";
        let (url, server) = one_shot_server(format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nLast-Modified: Sun, 06 Nov 1994 08:49:37 GMT\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ));
        let client = HttpFeedClient::new(&options()).unwrap();
        let since = Utc.with_ymd_and_hms(1994, 11, 6, 8, 0, 0).unwrap();

        let response = client
            .fetch(FetchRequest {
                resource: "fx".to_string(),
                url: Url::parse(&url).unwrap(),
                mode: FetchMode::Conditional,
                if_modified_since: Some(since),
            })
            .await
            .unwrap();
        let request = server.join().unwrap().to_lowercase();

        assert!(request.contains("if-modified-since: sun, 06 nov 1994 08:00:00 gmt"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, body.as_bytes());
        assert_eq!(response.content_type.as_deref(), Some("text/plain"));
        assert_eq!(
            response.last_modified,
            Some(Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap())
        );
    }

    #[tokio::test]
    async fn test_full_request_closes_connection() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 304 Not Modified\r\nContent-Length: 0\r\n\r\n".to_string(),
        );
        let client = HttpFeedClient::new(&options()).unwrap();

        let response = client
            .fetch(FetchRequest {
                resource: "fx".to_string(),
                url: Url::parse(&url).unwrap(),
                mode: FetchMode::Full,
                if_modified_since: Some(Utc::now()),
            })
            .await
            .unwrap();
        let request = server.join().unwrap().to_lowercase();

        assert!(request.contains("connection: close"));
        assert!(!request.contains("if-modified-since"));
        assert_eq!(response.status, 304);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let body = "x".repeat(2048);
        let (url, server) = one_shot_server(format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ));
        let client = HttpFeedClient::new(&options()).unwrap();

        let result = client
            .fetch(FetchRequest {
                resource: "fx".to_string(),
                url: Url::parse(&url).unwrap(),
                mode: FetchMode::Conditional,
                if_modified_since: None,
            })
            .await;
        let _ = server.join();

        assert_eq!(result.unwrap_err(), TransportError::TooLarge { limit: 1024 });
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = HttpFeedClient::new(&options()).unwrap();
        let result = client
            .fetch(FetchRequest {
                resource: "fx".to_string(),
                url: Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap(),
                mode: FetchMode::Conditional,
                if_modified_since: None,
            })
            .await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
