//! MITM proxy server.
//!
//! [`MitmProxyFactory`] builds [`MitmProxyService`]s that run a hudsucker
//! proxy on a runtime owned by the caller. The service is driven from
//! blocking threads, so `run` and `stop` are synchronous and must not be
//! called from inside an async task.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use warden_storage::{Database, StorageError};

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::{ExchangeHandler, PluginList};
use crate::resolver::{ClientResolver, HostResolver};
use crate::service::{ProxyFactory, ProxyPlugin, ProxyService};

/// How long `stop` waits for the server task.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts made to confirm the listener is accepting.
const READY_ATTEMPTS: u32 = 50;
const READY_INTERVAL: Duration = Duration::from_millis(20);

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
}

impl ProxyConfig {
    /// Listens on `port`, on all interfaces if `listen_non_local`.
    pub fn new(port: u16, listen_non_local: bool, ca_manager: CaManager) -> Self {
        let ip = if listen_non_local {
            [0, 0, 0, 0]
        } else {
            [127, 0, 0, 1]
        };

        Self {
            addr: SocketAddr::from((ip, port)),
            ca_manager,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port, keeping the host.
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }
}

/// Builds hudsucker-backed proxies.
#[derive(Debug, Clone)]
pub struct MitmProxyFactory {
    config: ProxyConfig,
    runtime: Handle,
}

impl MitmProxyFactory {
    /// Creates a factory whose proxies run on `runtime`.
    pub fn new(config: ProxyConfig, runtime: Handle) -> Self {
        Self { config, runtime }
    }

    /// The configuration handed to every proxy.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

impl ProxyFactory for MitmProxyFactory {
    fn construct(
        &self,
        hosts: Arc<dyn HostResolver>,
        clients: Arc<dyn ClientResolver>,
    ) -> Result<Box<dyn ProxyService>> {
        Ok(Box::new(MitmProxyService::new(
            self.config.clone(),
            self.runtime.clone(),
            hosts,
            clients,
        )))
    }
}

/// A hudsucker proxy instance.
pub struct MitmProxyService {
    config: ProxyConfig,
    runtime: Handle,
    hosts: Arc<dyn HostResolver>,
    clients: Arc<dyn ClientResolver>,
    plugins: PluginList,
    sessions: Vec<(String, Database)>,
    handle: Option<ProxyHandle>,
}

impl std::fmt::Debug for MitmProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmProxyService")
            .field("config", &self.config)
            .field("plugins", &self.plugins.read().len())
            .field("sessions", &self.sessions.len())
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl MitmProxyService {
    /// Creates a stopped proxy.
    pub fn new(
        config: ProxyConfig,
        runtime: Handle,
        hosts: Arc<dyn HostResolver>,
        clients: Arc<dyn ClientResolver>,
    ) -> Self {
        Self {
            config,
            runtime,
            hosts,
            clients,
            plugins: Arc::new(RwLock::new(Vec::new())),
            sessions: Vec::new(),
            handle: None,
        }
    }

    /// Store attached under `namespace`.
    pub fn session(&self, namespace: &str) -> Option<&Database> {
        self.sessions
            .iter()
            .find(|(ns, _)| ns == namespace)
            .map(|(_, db)| db)
    }

    /// Address the proxy is listening on, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.as_ref().map(ProxyHandle::addr)
    }

    /// Names of the registered plugins.
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Binds and immediately releases the configured address, resolving port 0.
    fn check_bind(&self) -> Result<SocketAddr> {
        let listener =
            TcpListener::bind(self.config.addr).map_err(|source| ProxyError::Spawn {
                addr: self.config.addr,
                source,
            })?;
        Ok(listener.local_addr()?)
    }
}

impl ProxyService for MitmProxyService {
    fn set_session(
        &mut self,
        namespace: &str,
        store: Database,
        credentials: &str,
    ) -> std::result::Result<(), StorageError> {
        store.attach_session(namespace, credentials)?;
        self.sessions.retain(|(ns, _)| ns != namespace);
        self.sessions.push((namespace.to_string(), store));
        tracing::debug!("Attached store as session {}", namespace);
        Ok(())
    }

    fn add_plugin(&mut self, plugin: Arc<dyn ProxyPlugin>) {
        tracing::info!("Registered plugin {}", plugin.name());
        self.plugins.write().push(plugin);
    }

    fn run(&mut self) -> Result<SocketAddr> {
        if let Some(handle) = &self.handle {
            return Ok(handle.addr());
        }

        let authority = self.config.ca_manager.ensure_ca()?;
        let addr = self.check_bind()?;

        let handler = ExchangeHandler::new(
            self.plugins.clone(),
            self.hosts.clone(),
            self.clients.clone(),
        );

        let proxy = {
            let _guard = self.runtime.enter();
            Proxy::builder()
                .with_addr(addr)
                .with_ca(authority)
                .with_rustls_connector(default_provider())
                .with_http_handler(handler)
                .build()
                .map_err(|e| ProxyError::Proxy(e.to_string()))?
        };

        tracing::info!("Starting MITM proxy on {}", addr);
        tracing::info!("CA certificate: {:?}", self.config.ca_manager.cert_path());

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let task = self.runtime.spawn(async move {
            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };
        });

        wait_until_listening(addr);

        self.handle = Some(ProxyHandle {
            shutdown_tx,
            addr,
            handle: task,
        });

        Ok(addr)
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let addr = handle.addr();
        let finished = self
            .runtime
            .block_on(async { tokio::time::timeout(STOP_TIMEOUT, handle.stop()).await });

        match finished {
            Ok(()) => tracing::info!("Proxy on {} stopped", addr),
            Err(_) => tracing::warn!("Proxy on {} did not stop within {:?}", addr, STOP_TIMEOUT),
        }

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for MitmProxyService {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.shutdown();
        }
    }
}

/// Polls until `addr` accepts connections or the attempts run out.
fn wait_until_listening(addr: SocketAddr) {
    let target = if addr.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    } else {
        addr
    };

    for _ in 0..READY_ATTEMPTS {
        if TcpStream::connect_timeout(&target, READY_INTERVAL).is_ok() {
            return;
        }
        std::thread::sleep(READY_INTERVAL);
    }

    tracing::warn!("Proxy on {} is not accepting connections yet", addr);
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
