//! Shared HTTP client for proxying requests to workers
//!
//! Workers listen on loopback ports that change with every spawn, so the pool
//! is keyed by port. The client never follows redirects and waits up to the
//! configured response window for headers, which keeps long-polling and SSE
//! responses working.

use crate::error::ProxyError;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests handed to the client
    pub total_requests: AtomicU64,
    /// Requests that failed before response headers arrived
    pub failed_requests: AtomicU64,
    /// Requests that hit the response window
    pub timed_out_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn get_timed_out_requests(&self) -> u64 {
        self.timed_out_requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per worker port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// How long to wait for response headers
    pub response_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            response_timeout: Duration::from_secs(300),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.response_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            response_timeout_secs = config.response_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to the worker on `port`. Resolves once response
    /// headers arrive; the body streams from the worker as it is read.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<Incoming>, ProxyError> {
        let uri = format!(
            "http://127.0.0.1:{}{}",
            port,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let forwarded_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        let mut builder = Request::builder().method(parts.method).uri(&uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = parts.headers;
            apply_forwarded_headers(headers, forwarded_host);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| ProxyError::DialFailed(e.to_string()))?;

        self.stats.record_request();

        match tokio::time::timeout(self.config.response_timeout, self.client.request(backend_req))
            .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.stats.record_failure();
                Err(ProxyError::DialFailed(e.to_string()))
            }
            Err(_) => {
                self.stats.record_timeout();
                Err(ProxyError::UpstreamTimeout(self.config.response_timeout))
            }
        }
    }
}

/// Set `X-Forwarded-Host`/`X-Forwarded-Proto` unless the client already did
pub fn apply_forwarded_headers(headers: &mut HeaderMap, host: Option<HeaderValue>) {
    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = host {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
}
