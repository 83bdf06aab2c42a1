//! Startup and shutdown of the whole gateway
//!
//! Everything that can be checked without side effects is checked in
//! [`Gateway::prepare`]. [`Gateway::start`] then launches the services and
//! binds the listeners, stopping every launched service if either step
//! fails.

use crate::config::{Config, Service};
use crate::error::{GatewayError, Result};
use crate::listener::{ListenerManager, ListenerPlan};
use crate::ports::PortTable;
use crate::router::ProxyRouter;
use crate::supervisor::{RetryPolicy, ServiceSupervisor, StartMode};
use crate::tls;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// How long shutdown waits for the listeners to close
pub const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A validated gateway, nothing launched or bound yet
pub struct Gateway {
    services: Vec<Service>,
    mode: StartMode,
    ports: Arc<PortTable>,
    silent: bool,
    router: Arc<ProxyRouter>,
    plan: ListenerPlan,
    tls_acceptor: Option<TlsAcceptor>,
    supervisor: Arc<ServiceSupervisor>,
}

impl Gateway {
    pub fn prepare(config: &Config) -> Result<Self> {
        config.validate().map_err(|e| {
            error!(error = %e, "Invalid configuration");
            e
        })?;

        let ports = Arc::new(PortTable::scan(config.port, &config.services).map_err(|e| {
            error!(error = %e, "Failed to allocate service ports");
            e
        })?);

        // Every mapping is checked before any service is launched
        let router = Arc::new(ProxyRouter::build(&config.mappings, &ports).map_err(|e| {
            error!(error = %e, "Invalid mapping");
            e
        })?);

        let plan = ListenerPlan::from_config(config)?;
        let tls_acceptor = if config.https.enabled {
            Some(tls::acceptor(&config.https).map_err(|e| {
                error!(error = %e, "Failed to configure TLS");
                e
            })?)
        } else {
            None
        };

        let supervisor = ServiceSupervisor::new(Arc::clone(&ports), config.silent);

        Ok(Self {
            services: config.services.clone(),
            mode: StartMode::from_parallel(config.parallel),
            ports,
            silent: config.silent,
            router,
            plan,
            tls_acceptor,
            supervisor,
        })
    }

    /// Replace the launch retry policy of the services
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.supervisor = ServiceSupervisor::with_retry_policy(Arc::clone(&self.ports), self.silent, retry);
        self
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    pub fn plan(&self) -> ListenerPlan {
        self.plan
    }

    pub fn supervisor(&self) -> &Arc<ServiceSupervisor> {
        &self.supervisor
    }

    /// Launch every service, then bind and serve the listeners
    pub async fn start(self) -> Result<RunningGateway> {
        let Self {
            services,
            mode,
            router,
            plan,
            tls_acceptor,
            supervisor,
            ..
        } = self;

        if let Err(e) = supervisor.start_all(&services, mode).await {
            error!(error = %e, "Failed to start services");
            supervisor.stop_all().await;
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut listeners = ListenerManager::new(plan, router, shutdown_rx);
        if let Some(acceptor) = tls_acceptor {
            listeners = listeners.with_tls(acceptor);
        }

        let bound = match listeners.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                error!(error = %e, "Failed to start listeners");
                supervisor.stop_all().await;
                return Err(e);
            }
        };

        let local_addrs = bound
            .iter()
            .filter_map(|(_, listener)| listener.local_addr().ok())
            .collect();
        let listeners = tokio::spawn(ListenerManager::serve(bound));

        Ok(RunningGateway {
            supervisor,
            shutdown_tx,
            listeners: Some(listeners),
            local_addrs,
        })
    }
}

/// A started gateway: services running, listeners serving
pub struct RunningGateway {
    supervisor: Arc<ServiceSupervisor>,
    shutdown_tx: watch::Sender<bool>,
    listeners: Option<JoinHandle<Result<()>>>,
    local_addrs: Vec<std::net::SocketAddr>,
}

impl RunningGateway {
    pub fn supervisor(&self) -> &Arc<ServiceSupervisor> {
        &self.supervisor
    }

    /// Addresses actually bound, HTTP first
    pub fn local_addrs(&self) -> &[std::net::SocketAddr] {
        &self.local_addrs
    }

    /// Resolve once every listener has stopped on its own. Cancel safe.
    pub async fn listeners_stopped(&mut self) -> Result<()> {
        let Some(handle) = self.listeners.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        self.listeners = None;

        joined.unwrap_or_else(|e| {
            Err(GatewayError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("listener task failed: {}", e),
            )))
        })
    }

    /// Close the listeners and stop every service
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);

        info!("Stopping all services...");
        self.supervisor.stop_all().await;

        if let Some(handle) = self.listeners.take() {
            if tokio::time::timeout(LISTENER_SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!(
                    timeout_secs = LISTENER_SHUTDOWN_TIMEOUT.as_secs(),
                    "Listeners did not close in time"
                );
            }
        }
    }
}
