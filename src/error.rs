//! Gateway errors and the plain-text responses served when routing fails

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors raised while configuring the gateway or supervising its services
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or missing configuration (bad mapping, bad URL, bad port)
    #[error("config error: {0}")]
    Config(String),

    /// A service command or directory could not be resolved to a runnable file
    #[error("service error: {0}")]
    ServiceResolution(String),

    /// Every launch attempt for a service failed
    #[error("service {service} failed to start after {attempts} attempts: {source}")]
    LaunchRetryExhausted {
        service: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// The reload watcher could not observe the executable
    #[error("cannot watch {path} for service {service}: {source}")]
    Watch {
        service: String,
        path: String,
        #[source]
        source: notify::Error,
    },

    /// Certificate or key could not be loaded
    #[error("tls error: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn config(message: impl Into<String>) -> Self {
        GatewayError::Config(message.into())
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        GatewayError::ServiceResolution(message.into())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Body returned when no mapping prefix matches the request path
pub fn unknown_gateway_message(path: &str) -> String {
    format!("Unknown Gateway for prefix: {}", path)
}

/// Create a plain-text response
pub fn text_response(
    status: StatusCode,
    body: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(body.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

/// 502 for a request path no mapping covers
pub fn unknown_gateway_response(path: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    text_response(StatusCode::BAD_GATEWAY, unknown_gateway_message(path))
}

/// 502 for a backend that could not be reached
pub fn bad_gateway_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_gateway_response() {
        let response = unknown_gateway_response("/unknown");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_unknown_gateway_message_names_path() {
        assert_eq!(
            unknown_gateway_message("/nope/deeper"),
            "Unknown Gateway for prefix: /nope/deeper"
        );
    }

    #[test]
    fn test_error_messages() {
        let err = GatewayError::config("mapping path not found at element 2");
        assert_eq!(
            err.to_string(),
            "config error: mapping path not found at element 2"
        );

        let err = GatewayError::LaunchRetryExhausted {
            service: "api".to_string(),
            attempts: 10,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.to_string().contains("api"));
        assert!(err.to_string().contains("10 attempts"));
        assert!(err.to_string().contains("no such file"));
    }
}
