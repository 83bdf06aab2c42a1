//! Single-host reverse proxies for plain HTTP and WebSocket traffic
//!
//! An [`HttpProxy`] rewrites the request URI onto its destination and sends
//! it through the shared [`ConnectionPool`]. A [`WsProxy`] replays the
//! upgrade handshake on a raw TCP connection to the destination and, once
//! the backend answers `101 Switching Protocols`, copies bytes in both
//! directions until either side closes.

use crate::error::bad_gateway_response;
use crate::pool::ConnectionPool;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use url::{Position, Url};

pub type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest upgrade response head accepted from a backend
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Largest non-101 body relayed back from a rejected upgrade
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Join two URL paths with exactly one slash between them
pub fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Path and query of the upstream request: destination path joined with the
/// request path, destination query joined with the request query
fn upstream_path_and_query(target: &Url, uri: &Uri) -> String {
    let path = join_paths(target.path(), uri.path());
    let target_query = target.query().filter(|q| !q.is_empty());
    let request_query = uri.query().filter(|q| !q.is_empty());

    match (target_query, request_query) {
        (Some(a), Some(b)) => format!("{}?{}&{}", path, a, b),
        (Some(q), None) | (None, Some(q)) => format!("{}?{}", path, q),
        (None, None) => path,
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Append the client IP to `X-Forwarded-For`
fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let ip = client_addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Reverse proxy for plain HTTP requests to a single backend
#[derive(Debug, Clone)]
pub struct HttpProxy {
    target: Url,
    authority: String,
}

impl HttpProxy {
    pub fn new(target: Url) -> Self {
        let authority = target[Position::BeforeHost..Position::AfterPort].to_string();
        Self { target, authority }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Absolute URI the request is sent to
    pub fn upstream_uri(&self, uri: &Uri) -> Result<Uri, hyper::http::uri::InvalidUri> {
        format!(
            "http://{}{}",
            self.authority,
            upstream_path_and_query(&self.target, uri)
        )
        .parse()
    }

    pub async fn forward(
        &self,
        req: Request<Incoming>,
        pool: &ConnectionPool,
        client_addr: SocketAddr,
    ) -> ProxyResponse {
        let (mut parts, body) = req.into_parts();

        parts.uri = match self.upstream_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                error!(destination = %self.target, uri = %parts.uri, error = %e, "Cannot build upstream URI");
                return bad_gateway_response();
            }
        };
        // The pooled client speaks HTTP/1.1 to backends whatever the client used
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        append_forwarded_for(&mut parts.headers, client_addr);

        debug!(uri = %parts.uri, method = %parts.method, "Forwarding request");

        match pool.send_request(Request::from_parts(parts, body)).await {
            Ok(mut response) => {
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(e) => {
                error!(destination = %self.target, error = %e, "Backend request failed");
                bad_gateway_response()
            }
        }
    }
}

/// Reverse proxy for WebSocket upgrades to a single backend
#[derive(Debug, Clone)]
pub struct WsProxy {
    target: Url,
    /// `host:port` to dial, port defaulting to 80
    address: String,
}

impl WsProxy {
    pub fn new(target: Url) -> Self {
        let host = target.host_str().unwrap_or("localhost");
        let port = target.port_or_known_default().unwrap_or(80);
        let address = format!("{}:{}", host, port);
        Self { target, address }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Serialize the client's upgrade request for the backend
    pub fn build_upgrade_request(
        &self,
        req: &Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Vec<u8> {
        let mut headers = req.headers().clone();
        headers.remove(hyper::header::HOST);
        append_forwarded_for(&mut headers, client_addr);

        let mut request = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\n",
            req.method(),
            upstream_path_and_query(&self.target, req.uri()),
            self.address
        );
        for (name, value) in &headers {
            if let Ok(v) = value.to_str() {
                request.push_str(&format!("{}: {}\r\n", name, v));
            }
        }
        request.push_str("\r\n");

        request.into_bytes()
    }

    pub async fn forward(&self, req: Request<Incoming>, client_addr: SocketAddr) -> ProxyResponse {
        let raw_request = self.build_upgrade_request(&req, client_addr);

        let mut backend = match TcpStream::connect(&self.address).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(address = %self.address, error = %e, "Failed to connect to backend for upgrade");
                return bad_gateway_response();
            }
        };

        if let Err(e) = backend.write_all(&raw_request).await {
            error!(address = %self.address, error = %e, "Failed to send upgrade request to backend");
            return bad_gateway_response();
        }

        let (head, leftover) = match read_response_head(&mut backend).await {
            Ok(read) => read,
            Err(e) => {
                error!(address = %self.address, error = %e, "Failed to read upgrade response from backend");
                return bad_gateway_response();
            }
        };

        let Some((status, response_headers)) = parse_upgrade_response(&head) else {
            error!(address = %self.address, "Invalid upgrade response from backend");
            return bad_gateway_response();
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(address = %self.address, status = %status, "Backend rejected upgrade request");
            let body = read_rejection_body(&mut backend, &response_headers, leftover).await;
            return relay_response(status, &response_headers, body);
        }

        info!(address = %self.address, path = %req.uri().path(), "WebSocket upgrade successful");

        let response = relay_response(status, &response_headers, Vec::new());

        let address = self.address.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    if !leftover.is_empty() {
                        if let Err(e) = client.write_all(&leftover).await {
                            debug!(address = %address, error = %e, "WebSocket connection closed early");
                            return;
                        }
                    }
                    forward_bidirectional(client, backend, &address).await;
                }
                Err(e) => {
                    error!(address = %address, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(mut client: TokioIo<Upgraded>, mut backend: TcpStream, address: &str) {
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                address,
                client_to_backend,
                backend_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(address, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Read until the end of the response head; bytes past it are returned separately
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse the status line and headers of a backend response head
pub fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Body of a rejected upgrade, when its length is announced
async fn read_rejection_body(
    backend: &mut TcpStream,
    headers: &[(String, String)],
    mut body: Vec<u8>,
) -> Vec<u8> {
    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok());

    let Some(len) = content_length.filter(|len| *len <= MAX_REJECTION_BODY) else {
        return Vec::new();
    };

    let mut chunk = [0u8; 4096];
    while body.len() < len {
        match backend.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
        }
    }
    body.truncate(len);
    body
}

fn relay_response(status: StatusCode, headers: &[(String, String)], body: Vec<u8>) -> ProxyResponse {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        // hyper frames the body itself
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    response
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/api/foo"), "/api/foo");
        assert_eq!(join_paths("/base", "/api"), "/base/api");
        assert_eq!(join_paths("/base/", "api"), "/base/api");
        assert_eq!(join_paths("/base", "api"), "/base/api");
    }

    #[test]
    fn test_http_upstream_uri() {
        let proxy = HttpProxy::new(Url::parse("http://localhost:9001").unwrap());
        assert_eq!(
            proxy.upstream_uri(&uri("/api/foo?x=1")).unwrap(),
            "http://localhost:9001/api/foo?x=1"
        );

        let proxy = HttpProxy::new(Url::parse("http://127.0.0.1:9001/base?k=v").unwrap());
        assert_eq!(
            proxy.upstream_uri(&uri("/api?x=1")).unwrap(),
            "http://127.0.0.1:9001/base/api?k=v&x=1"
        );
        assert_eq!(
            proxy.upstream_uri(&uri("/api")).unwrap(),
            "http://127.0.0.1:9001/base/api?k=v"
        );
    }

    #[test]
    fn test_http_upstream_uri_default_port() {
        let proxy = HttpProxy::new(Url::parse("http://backend.local/").unwrap());
        assert_eq!(
            proxy.upstream_uri(&uri("/x")).unwrap(),
            "http://backend.local/x"
        );
    }

    #[test]
    fn test_ws_address() {
        let proxy = WsProxy::new(Url::parse("ws://localhost:9002").unwrap());
        assert_eq!(proxy.address(), "localhost:9002");

        let proxy = WsProxy::new(Url::parse("ws://chat.local/socket").unwrap());
        assert_eq!(proxy.address(), "chat.local:80");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("secret"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn test_append_forwarded_for() {
        let addr: SocketAddr = "10.0.0.7:5555".parse().unwrap();

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, addr);
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.7");

        append_forwarded_for(&mut headers, addr);
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.7, 10.0.0.7");
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();

        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 101 OK\r\n\r\nframe"), Some(19));
        assert_eq!(find_head_end(b"HTTP/1.1 101 OK\r\n"), None);
    }
}
