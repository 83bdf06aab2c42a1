//! Pooled HTTP client shared by every HTTP mapping
//!
//! Keep-alive connections to a backend are reused across requests and
//! across prefixes pointing at the same service.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Connecting to or talking with the backend failed
    #[error("backend request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("backend request URI must be absolute, got {0}")]
    RelativeUri(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    /// Bound on the TCP connect to a backend; a service that is not
    /// listening yet fails fast instead of hanging the request
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_secs = config.connect_timeout.as_secs(),
            "Backend connection pool ready"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Send a request already rewritten onto its backend
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        if req.uri().authority().is_none() {
            return Err(PoolError::RelativeUri(req.uri().to_string()));
        }

        let (parts, body) = self.client.request(req).await?.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
