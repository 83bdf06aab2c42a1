//! The HTTP and HTTPS listeners in front of the router

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::proxy::ProxyServer;
use crate::router::ProxyRouter;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// Which addresses the gateway binds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerPlan {
    pub http: Option<SocketAddr>,
    pub https: Option<SocketAddr>,
}

impl ListenerPlan {
    pub fn new(http: Option<SocketAddr>, https: Option<SocketAddr>) -> Self {
        Self { http, https }
    }

    /// HTTP on the base port unless `nohttp` is set with HTTPS enabled;
    /// HTTPS one port above when enabled. Both bind every interface.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::for_host(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config)
    }

    pub fn for_host(host: IpAddr, config: &Config) -> Result<Self> {
        let http = config
            .https
            .serves_http()
            .then(|| SocketAddr::new(host, config.http_port()));

        let https = if config.https.enabled {
            Some(SocketAddr::new(host, config.https_port()?))
        } else {
            None
        };

        Ok(Self { http, https })
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }
}

/// Runs one [`ProxyServer`] per planned address and waits for all of them
pub struct ListenerManager {
    plan: ListenerPlan,
    router: Arc<ProxyRouter>,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ListenerManager {
    pub fn new(
        plan: ListenerPlan,
        router: Arc<ProxyRouter>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            plan,
            router,
            tls_acceptor: None,
            shutdown_rx,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Bind every planned address up front, so a taken port fails before
    /// anything is served. Returns the servers ready to run with their
    /// listeners.
    pub async fn bind(self) -> Result<Vec<(ProxyServer, TcpListener)>> {
        if self.plan.is_empty() {
            return Err(GatewayError::config("no listener to start"));
        }

        let mut bound = Vec::new();

        if let Some(addr) = self.plan.http {
            let listener = bind(addr, "HTTP").await?;
            let server = ProxyServer::new(Arc::clone(&self.router), self.shutdown_rx.clone());
            bound.push((server, listener));
        }

        if let Some(addr) = self.plan.https {
            let acceptor = self.tls_acceptor.clone().ok_or_else(|| {
                GatewayError::Tls("HTTPS listener planned without a certificate".to_string())
            })?;
            let listener = bind(addr, "HTTPS").await?;
            let server = ProxyServer::new(Arc::clone(&self.router), self.shutdown_rx.clone())
                .with_tls(acceptor);
            bound.push((server, listener));
        }

        Ok(bound)
    }

    /// Serve bound listeners and return once every one has stopped
    pub async fn serve(bound: Vec<(ProxyServer, TcpListener)>) -> Result<()> {
        let mut servers = JoinSet::new();
        for (server, listener) in bound {
            servers.spawn(server.serve(listener));
        }

        let mut first_error = None;
        while let Some(joined) = servers.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("listener task failed: {}", e),
                ))
            });
            if let Err(e) = result {
                error!(error = %e, "Listener stopped with an error");
                first_error.get_or_insert(GatewayError::Io(e));
            }
        }

        info!("All listeners stopped");
        first_error.map_or(Ok(()), Err)
    }
}

async fn bind(addr: SocketAddr, protocol: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        error!(addr = %addr, protocol, error = %e, "Failed to bind listener");
        GatewayError::Io(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpsConfig;
    use crate::ports::PortTable;

    fn config(port: u16, https: HttpsConfig) -> Config {
        Config {
            port,
            https,
            ..Config::default()
        }
    }

    #[test]
    fn test_plan_http_only() {
        let plan = ListenerPlan::from_config(&config(8000, HttpsConfig::default())).unwrap();
        assert_eq!(plan.http, Some("0.0.0.0:8000".parse().unwrap()));
        assert_eq!(plan.https, None);
    }

    #[test]
    fn test_plan_http_and_https() {
        let https = HttpsConfig {
            enabled: true,
            ..HttpsConfig::default()
        };
        let plan = ListenerPlan::from_config(&config(8000, https)).unwrap();
        assert_eq!(plan.http, Some("0.0.0.0:8000".parse().unwrap()));
        assert_eq!(plan.https, Some("0.0.0.0:8001".parse().unwrap()));
    }

    #[test]
    fn test_plan_nohttp() {
        let https = HttpsConfig {
            enabled: true,
            no_http: true,
            ..HttpsConfig::default()
        };
        let plan = ListenerPlan::from_config(&config(8000, https)).unwrap();
        assert_eq!(plan.http, None);
        assert_eq!(plan.https, Some("0.0.0.0:8001".parse().unwrap()));
    }

    #[test]
    fn test_plan_nohttp_without_https_keeps_http() {
        let https = HttpsConfig {
            no_http: true,
            ..HttpsConfig::default()
        };
        let plan = ListenerPlan::from_config(&config(8000, https)).unwrap();
        assert_eq!(plan.http, Some("0.0.0.0:8000".parse().unwrap()));
        assert_eq!(plan.https, None);
    }

    #[test]
    fn test_plan_https_port_overflow() {
        let https = HttpsConfig {
            enabled: true,
            ..HttpsConfig::default()
        };
        assert!(ListenerPlan::from_config(&config(u16::MAX, https)).is_err());
    }

    #[tokio::test]
    async fn test_https_without_acceptor_fails() {
        let router = Arc::new(ProxyRouter::build(&[], &PortTable::default()).unwrap());
        let (_tx, rx) = watch::channel(false);
        let plan = ListenerPlan::new(None, Some("127.0.0.1:0".parse().unwrap()));

        let err = ListenerManager::new(plan, router, rx).bind().await.err().unwrap();
        assert!(matches!(err, GatewayError::Tls(_)));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let router = Arc::new(ProxyRouter::build(&[], &PortTable::default()).unwrap());
        let (tx, rx) = watch::channel(false);
        let plan = ListenerPlan::new(Some("127.0.0.1:0".parse().unwrap()), None);

        let bound = ListenerManager::new(plan, router, rx).bind().await.unwrap();
        assert_eq!(bound.len(), 1);
        let handle = tokio::spawn(ListenerManager::serve(bound));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
