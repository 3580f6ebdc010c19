//! Error taxonomy for the lifecycle core and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors surfaced by the catalog, lifecycle manager and registry
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Invalid or ambiguous configuration, fatal at load time
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Request addressed to a service that is not declared
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Container could not be built, created or started
    #[error("failed to start service '{service}': {reason}")]
    StartFailed { service: String, reason: String },

    /// Container started but never signalled readiness
    #[error("service '{service}' did not become ready within {}s", .timeout.as_secs())]
    ReadinessTimeout { service: String, timeout: Duration },

    /// Container could not be stopped; it stays tracked
    #[error("failed to stop service '{service}': {reason}")]
    StopFailed { service: String, reason: String },

    /// Port range exhausted
    #[error("no free port in range {start}..={end}")]
    NoFreePort { start: u16, end: u16 },
}

impl Error {
    pub(crate) fn start_failed(service: &str, reason: impl std::fmt::Display) -> Self {
        Error::StartFailed {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Proxy error code used when this error reaches an HTTP caller
    pub fn proxy_code(&self) -> ProxyErrorCode {
        match self {
            Error::UnknownService(_) => ProxyErrorCode::UnknownService,
            Error::StartFailed { .. } | Error::NoFreePort { .. } => {
                ProxyErrorCode::BackendStartFailed
            }
            Error::ReadinessTimeout { .. } => ProxyErrorCode::ReadinessTimeout,
            Error::Configuration(_) | Error::StopFailed { .. } => ProxyErrorCode::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Service is not declared in the catalog
    UnknownService,
    /// Backend container failed to launch
    BackendStartFailed,
    /// Backend container did not become ready in time
    ReadinessTimeout,
    /// Backend did not answer within the request timeout
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownService => StatusCode::NOT_FOUND,
            ProxyErrorCode::BackendStartFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ReadinessTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownService => "UNKNOWN_SERVICE",
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::ReadinessTimeout => "READINESS_TIMEOUT",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::UnknownService.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::BackendStartFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::ReadinessTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_domain_errors_map_to_proxy_codes() {
        assert_eq!(
            Error::UnknownService("x".into()).proxy_code(),
            ProxyErrorCode::UnknownService
        );
        assert_eq!(
            Error::start_failed("x", "boom").proxy_code(),
            ProxyErrorCode::BackendStartFailed
        );
        assert_eq!(
            Error::ReadinessTimeout {
                service: "x".into(),
                timeout: Duration::from_secs(3)
            }
            .proxy_code(),
            ProxyErrorCode::ReadinessTimeout
        );
        assert_eq!(
            Error::NoFreePort { start: 1, end: 2 }.proxy_code(),
            ProxyErrorCode::BackendStartFailed
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::ReadinessTimeout {
            service: "echo".into(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "service 'echo' did not become ready within 30s"
        );
        let err = Error::NoFreePort { start: 9000, end: 9001 };
        assert_eq!(err.to_string(), "no free port in range 9000..=9001");
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownService, "Unknown service: nope");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_SERVICE\""));
        assert!(json.contains("\"message\":\"Unknown service: nope\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }
}
