//! Error taxonomies for the worker lifecycle and JSON error responses for the router

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Failure to bring a worker to the running state
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("sandbox runtime executable not found")]
    ExecutableNotFound,
    #[error("could not allocate a free port: {0}")]
    PortAllocationFailed(#[source] std::io::Error),
    #[error("could not spawn sandbox runtime: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("could not install sandbox script at {path}: {source}")]
    SandboxInstall {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker did not report READY within {0:?}")]
    StartupTimeout(Duration),
    #[error("worker exited before reporting READY")]
    StartupFailed,
    #[error("worker has already been started")]
    AlreadyStarted,
}

/// Failure while proxying a single request to a worker
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("could not reach worker: {0}")]
    DialFailed(String),
    #[error("worker did not respond within {0:?}")]
    UpstreamTimeout(Duration),
    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Failure while stopping a worker. Logged only.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("failed to send interrupt signal: {0}")]
    SignalFailed(#[source] std::io::Error),
    #[error("failed to kill process: {0}")]
    KillFailed(#[source] std::io::Error),
    #[error("process did not exit within {0:?}")]
    ShutdownTimeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("could not watch {path}: {source}")]
    WatchSetupFailed {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("app not found")]
    NotFound,
    #[error("invalid app {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Failure to obtain a running worker for an app
#[derive(Debug, thiserror::Error)]
pub enum GetWorkerError {
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Startup(#[from] StartupError),
}

/// Error codes for router responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No app directory matches the host
    UnknownHost,
    /// Host resolved but the app could not be loaded
    AppNotFound,
    /// Worker failed to start
    WorkerStartFailed,
    /// Worker did not answer the proxied request
    UpstreamFailed,
    /// Worker did not send response headers in time
    UpstreamTimeout,
    /// WebSocket upgrade could not be completed
    UpgradeFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::AppNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::WorkerStartFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::UpstreamFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::UpgradeFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::AppNotFound => "APP_NOT_FOUND",
            ProxyErrorCode::WorkerStartFailed => "WORKER_START_FAILED",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::UpgradeFailed => "UPGRADE_FAILED",
        }
    }
}

impl From<&ProxyError> for ProxyErrorCode {
    fn from(err: &ProxyError) -> Self {
        match err {
            ProxyError::DialFailed(_) => ProxyErrorCode::UpstreamFailed,
            ProxyError::UpstreamTimeout(_) => ProxyErrorCode::UpstreamTimeout,
            ProxyError::UpgradeFailed(_) => ProxyErrorCode::UpgradeFailed,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
