use crate::forward::ProxyResponse;
use crate::router::ProxyRouter;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// The gateway's front door: accepts connections and hands every request
/// to the shared router
pub struct ProxyServer {
    router: Arc<ProxyRouter>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(router: Arc<ProxyRouter>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            router,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    fn protocol(&self) -> &'static str {
        if self.tls_enabled() {
            "HTTPS"
        } else {
            "HTTP"
        }
    }

    /// Serve on a bound listener until shutdown is signalled or its sender
    /// goes away
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = self.protocol();
        info!(addr = %local_addr, protocol, "Gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(self.connection(stream, peer));
                }
                Err(e) => warn!(addr = %local_addr, protocol, error = %e, "Accept failed"),
            }
        }

        info!(addr = %local_addr, protocol, "Gateway listener closed");
        Ok(())
    }

    /// One accepted connection, TLS-wrapped when this listener is HTTPS
    fn connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl Future<Output = ()> + Send + 'static {
        let router = Arc::clone(&self.router);
        let tls_acceptor = self.tls_acceptor.clone();

        async move {
            let served = match tls_acceptor {
                None => handle_connection(stream, peer, router).await,
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => handle_connection(tls_stream, peer, router).await,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "TLS handshake failed");
                        return;
                    }
                },
            };

            if let Err(e) = served {
                debug!(peer = %peer, error = %e, "Connection ended with an error");
            }
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    router: Arc<ProxyRouter>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<ProxyResponse, hyper::Error>(router.route(req, addr).await) }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection with {} failed: {}", addr, e))?;

    Ok(())
}
