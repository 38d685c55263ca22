//! Proxy subsystem boundary.
//!
//! The lifecycle controller only sees these traits. [`crate::MitmProxyFactory`]
//! is the implementation shipped with Warden; tests substitute their own.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Bytes;
use warden_storage::{Database, StorageError};

use crate::error::ProxyError;
use crate::resolver::{ClientInfo, ClientResolver, HostResolver};

/// Request half of an intercepted exchange.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Request method.
    pub method: String,
    /// Full request URI.
    pub uri: String,
    /// Target host, if known.
    pub host: Option<String>,
    /// Declared request body size.
    pub body_len: u64,
    /// Address of the connecting client.
    pub peer: SocketAddr,
    /// Local process behind the connection, if resolvable.
    pub client: Option<ClientInfo>,
}

/// A completed exchange.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    /// The request that was answered.
    pub request: RequestInfo,
    /// Response status code.
    pub status: u16,
    /// Response body. Empty when the body was too large to buffer.
    pub body: Bytes,
    /// Response body size, declared or read.
    pub body_len: u64,
}

impl ResponseInfo {
    /// Returns true if the body was forwarded without being buffered.
    pub fn is_truncated(&self) -> bool {
        self.body.len() as u64 != self.body_len
    }
}

/// Observer of intercepted traffic.
pub trait ProxyPlugin: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Called as a request is forwarded.
    fn on_request(&self, _request: &RequestInfo) {}

    /// Called after a response has been read. Runs off the connection task.
    fn on_response(&self, _response: &ResponseInfo) {}
}

/// A constructed proxy instance.
///
/// Methods are synchronous; the lifecycle calls them from a blocking thread.
pub trait ProxyService: Send {
    /// Attaches `store` under `namespace`.
    fn set_session(
        &mut self,
        namespace: &str,
        store: Database,
        credentials: &str,
    ) -> std::result::Result<(), StorageError>;

    /// Registers a plugin. Plugins added after `run` see later exchanges only.
    fn add_plugin(&mut self, plugin: Arc<dyn ProxyPlugin>);

    /// Starts listening and returns the bound address.
    fn run(&mut self) -> std::result::Result<SocketAddr, ProxyError>;

    /// Stops listening and waits for the server task.
    fn stop(&mut self) -> std::result::Result<(), ProxyError>;

    /// Returns true between a successful `run` and `stop`.
    fn is_running(&self) -> bool;
}

/// Builds proxy instances.
pub trait ProxyFactory: Send + Sync {
    /// Constructs a proxy that uses the given resolvers.
    fn construct(
        &self,
        hosts: Arc<dyn HostResolver>,
        clients: Arc<dyn ClientResolver>,
    ) -> std::result::Result<Box<dyn ProxyService>, ProxyError>;
}
