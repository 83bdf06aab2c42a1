//! Prefix routing for HTTP and WebSocket traffic
//!
//! Entries are kept in two lists, one per protocol, in mapping order. A
//! request is dispatched to the first entry of its protocol whose prefix
//! starts the request path. Order is priority: `/a` listed before `/ab`
//! captures `/ab/x`. The lists are built once and never mutated, so every
//! connection task reads them through a shared `Arc` without locking.

use crate::config::Mapping;
use crate::error::{unknown_gateway_response, GatewayError, Result};
use crate::forward::{HttpProxy, ProxyResponse, WsProxy};
use crate::pool::ConnectionPool;
use crate::ports::PortTable;
use hyper::body::Incoming;
use hyper::Request;
use std::net::SocketAddr;
use tracing::{debug, info, warn};
use url::Url;

const HTTP_SCHEME: &str = "http";
const WS_SCHEME: &str = "ws";

/// Protocol-specific handler behind a prefix
#[derive(Debug, Clone)]
pub enum ProxyHandler {
    Http(HttpProxy),
    Ws(WsProxy),
}

impl ProxyHandler {
    pub fn destination(&self) -> &Url {
        match self {
            ProxyHandler::Http(proxy) => proxy.target(),
            ProxyHandler::Ws(proxy) => proxy.target(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyEntry {
    pub prefix: String,
    pub handler: ProxyHandler,
}

/// Routing table built from the configured mappings
pub struct ProxyRouter {
    http: Vec<ProxyEntry>,
    ws: Vec<ProxyEntry>,
    pool: ConnectionPool,
}

impl ProxyRouter {
    /// Build the router with a default connection pool
    pub fn build(mappings: &[Mapping], ports: &PortTable) -> Result<Self> {
        Self::with_pool(mappings, ports, ConnectionPool::default())
    }

    /// Validate every mapping, resolve port placeholders in its destination
    /// and create the matching proxy. Fails on the first invalid mapping.
    pub fn with_pool(mappings: &[Mapping], ports: &PortTable, pool: ConnectionPool) -> Result<Self> {
        let mut http = Vec::new();
        let mut ws = Vec::new();

        for (i, mapping) in mappings.iter().enumerate() {
            if mapping.path.is_empty() {
                return Err(GatewayError::config(format!(
                    "mapping path not found at element {}",
                    i + 1
                )));
            }

            if mapping.destination.is_empty() {
                return Err(GatewayError::config(format!(
                    "mapping destination not found at element {}",
                    i + 1
                )));
            }

            let destination = ports.resolve(&mapping.destination);
            let url = Url::parse(&destination).map_err(|e| {
                GatewayError::config(format!("invalid url {}: {}", destination, e))
            })?;

            let entry = match url.scheme() {
                HTTP_SCHEME => {
                    let entry = ProxyEntry {
                        prefix: mapping.path.clone(),
                        handler: ProxyHandler::Http(HttpProxy::new(url)),
                    };
                    http.push(entry.clone());
                    entry
                }
                WS_SCHEME => {
                    let entry = ProxyEntry {
                        prefix: mapping.path.clone(),
                        handler: ProxyHandler::Ws(WsProxy::new(url)),
                    };
                    ws.push(entry.clone());
                    entry
                }
                other => {
                    return Err(GatewayError::config(format!(
                        "invalid mapping type {} for {} -> {}",
                        other, mapping.path, destination
                    )));
                }
            };

            info!(
                prefix = %entry.prefix,
                destination = %entry.handler.destination(),
                "Mapping registered"
            );
        }

        Ok(Self { http, ws, pool })
    }

    pub fn http_entries(&self) -> &[ProxyEntry] {
        &self.http
    }

    pub fn ws_entries(&self) -> &[ProxyEntry] {
        &self.ws
    }

    /// First entry of the given protocol whose prefix starts `path`
    pub fn match_entry(&self, websocket: bool, path: &str) -> Option<&ProxyEntry> {
        let entries = if websocket { &self.ws } else { &self.http };
        entries.iter().find(|entry| path.starts_with(entry.prefix.as_str()))
    }

    /// Forward the request to the matching entry, or answer 502
    pub async fn route(&self, req: Request<Incoming>, client_addr: SocketAddr) -> ProxyResponse {
        let websocket = is_upgrade_request(&req);
        let path = req.uri().path().to_string();

        let Some(entry) = self.match_entry(websocket, &path) else {
            warn!(path = %path, websocket, "No mapping for request path");
            return unknown_gateway_response(&path);
        };

        debug!(path = %path, prefix = %entry.prefix, websocket, "Route matched");

        match &entry.handler {
            ProxyHandler::Http(proxy) => proxy.forward(req, &self.pool, client_addr).await,
            ProxyHandler::Ws(proxy) => proxy.forward(req, client_addr).await,
        }
    }
}

/// Check if a request is a WebSocket (or other protocol) upgrade request
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Service;

    fn router(mappings: &[Mapping]) -> Result<ProxyRouter> {
        ProxyRouter::build(mappings, &PortTable::default())
    }

    fn api_and_ws_mappings() -> Vec<Mapping> {
        vec![
            Mapping::new("/api", "http://localhost:9001"),
            Mapping::new("/ws", "ws://localhost:9002"),
        ]
    }

    #[tokio::test]
    async fn test_build_classifies_by_scheme() {
        let router = router(&api_and_ws_mappings()).unwrap();

        assert_eq!(router.http_entries().len(), 1);
        assert_eq!(router.ws_entries().len(), 1);
        assert_eq!(router.http_entries()[0].prefix, "/api");
        assert!(matches!(router.ws_entries()[0].handler, ProxyHandler::Ws(_)));
    }

    #[tokio::test]
    async fn test_match_by_protocol() {
        let router = router(&api_and_ws_mappings()).unwrap();

        let entry = router.match_entry(false, "/api/foo").unwrap();
        assert_eq!(entry.handler.destination().as_str(), "http://localhost:9001/");

        let entry = router.match_entry(true, "/ws/chat").unwrap();
        assert_eq!(entry.handler.destination().as_str(), "ws://localhost:9002/");

        assert!(router.match_entry(false, "/unknown").is_none());
        // WebSocket prefixes never serve plain HTTP and vice versa
        assert!(router.match_entry(false, "/ws/chat").is_none());
        assert!(router.match_entry(true, "/api/foo").is_none());
    }

    #[tokio::test]
    async fn test_first_match_wins_over_longest_prefix() {
        let router = router(&[
            Mapping::new("/a", "http://localhost:9001"),
            Mapping::new("/ab", "http://localhost:9002"),
        ])
        .unwrap();

        let entry = router.match_entry(false, "/ab/x").unwrap();
        assert_eq!(entry.prefix, "/a");
        assert_eq!(entry.handler.destination().port(), Some(9001));
    }

    #[tokio::test]
    async fn test_order_decides_priority() {
        let router = router(&[
            Mapping::new("/ab", "http://localhost:9002"),
            Mapping::new("/a", "http://localhost:9001"),
        ])
        .unwrap();

        assert_eq!(router.match_entry(false, "/ab/x").unwrap().prefix, "/ab");
        assert_eq!(router.match_entry(false, "/ac").unwrap().prefix, "/a");
    }

    #[tokio::test]
    async fn test_root_prefix_catches_all() {
        let router = router(&[
            Mapping::new("/api", "http://localhost:9001"),
            Mapping::new("/", "http://localhost:9000"),
        ])
        .unwrap();

        assert_eq!(router.match_entry(false, "/api/v1").unwrap().prefix, "/api");
        assert_eq!(router.match_entry(false, "/index.html").unwrap().prefix, "/");
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let err = router(&[Mapping::new("/files", "ftp://localhost:21")])
            .err()
            .unwrap();

        assert!(matches!(err, GatewayError::Config(_)));
        let message = err.to_string();
        assert!(message.contains("invalid mapping type ftp"));
        assert!(message.contains("/files"));
        assert!(message.contains("ftp://localhost:21"));
    }

    #[tokio::test]
    async fn test_missing_fields_name_element() {
        let err = router(&[
            Mapping::new("/ok", "http://localhost:9001"),
            Mapping::new("", "http://localhost:9002"),
        ])
        .err()
        .unwrap();
        assert!(err.to_string().contains("mapping path not found at element 2"));

        let err = router(&[Mapping::new("/x", "")]).err().unwrap();
        assert!(err
            .to_string()
            .contains("mapping destination not found at element 1"));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = router(&[Mapping::new("/x", "not a url")]).err().unwrap();
        assert!(err.to_string().contains("invalid url not a url"));
    }

    #[tokio::test]
    async fn test_destination_placeholders_resolved() {
        let services = vec![
            Service::command("api").with_args("-port {PORT1}"),
            Service::command("chat").with_env("PORT={PORT2}"),
        ];
        let ports = PortTable::scan(8000, &services).unwrap();
        let router = ProxyRouter::build(
            &[
                Mapping::new("/api", "http://localhost:{PORT1}"),
                Mapping::new("/chat", "ws://localhost:{PORT2}/socket"),
            ],
            &ports,
        )
        .unwrap();

        assert_eq!(
            router.http_entries()[0].handler.destination().port(),
            Some(8002)
        );
        assert_eq!(
            router.ws_entries()[0].handler.destination().as_str(),
            "ws://localhost:8003/socket"
        );
    }

    #[tokio::test]
    async fn test_unknown_placeholder_is_invalid_url() {
        let err = router(&[Mapping::new("/x", "http://localhost:{PORT9}")])
            .err()
            .unwrap();
        assert!(err.to_string().contains("{PORT9}"));
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .uri("/ws/chat")
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder()
            .uri("/ws/chat")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));

        let req = Request::builder().uri("/api").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }
}
