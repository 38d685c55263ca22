//! HTTP handler that feeds intercepted exchanges to plugins.
//!
//! hudsucker clones the handler for every request, so the request summary
//! kept between `handle_request` and `handle_response` belongs to exactly
//! one exchange.

use std::net::IpAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::{Body as HttpBody, Bytes};
use hyper::Method;
use parking_lot::RwLock;

use crate::resolver::{ClientResolver, HostResolver};
use crate::service::{ProxyPlugin, RequestInfo, ResponseInfo};

/// Plugins shared between the service and every handler clone.
pub type PluginList = Arc<RwLock<Vec<Arc<dyn ProxyPlugin>>>>;

/// Largest response body buffered for plugins. Larger responses are
/// forwarded untouched and reported without content.
pub const MAX_BUFFERED_BODY: u64 = 16 * 1024 * 1024;

fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// HTTP handler for the MITM proxy.
#[derive(Clone)]
pub struct ExchangeHandler {
    plugins: PluginList,
    hosts: Arc<dyn HostResolver>,
    clients: Arc<dyn ClientResolver>,
    pending: Option<RequestInfo>,
}

impl std::fmt::Debug for ExchangeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeHandler")
            .field("plugins", &self.plugins.read().len())
            .field("hosts", &"HostResolver")
            .field("clients", &"ClientResolver")
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl ExchangeHandler {
    /// Creates a handler dispatching to `plugins`.
    pub fn new(
        plugins: PluginList,
        hosts: Arc<dyn HostResolver>,
        clients: Arc<dyn ClientResolver>,
    ) -> Self {
        Self {
            plugins,
            hosts,
            clients,
            pending: None,
        }
    }

    /// Extracts host from request URI or Host header.
    fn extract_host(req: &Request<Body>) -> Option<String> {
        if let Some(host) = req.uri().host() {
            return Some(host.to_string());
        }

        req.headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.split(':').next().unwrap_or(s).to_string())
    }

    fn content_length(req: &Request<Body>) -> u64 {
        req.headers()
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Response body size from `Content-Length`, or the body's exact size hint.
    fn declared_length(res: &Response<Body>) -> Option<u64> {
        res.headers()
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .or_else(|| HttpBody::size_hint(res.body()).exact())
    }

    /// Names an IP-literal host from the resolver cache, and teaches the
    /// resolver about named hosts it has not seen yet in the background.
    fn label_host(&self, host: String) -> String {
        match host.parse::<IpAddr>() {
            Ok(ip) => self.hosts.resolve(ip).unwrap_or(host),
            Err(_) if self.hosts.knows(&host) => host,
            Err(_) => {
                let hosts = self.hosts.clone();
                let name = host.clone();
                tokio::task::spawn_blocking(move || hosts.learn(&name));
                host
            }
        }
    }
}

impl ExchangeHandler {
    fn notify(plugins: Vec<Arc<dyn ProxyPlugin>>, info: ResponseInfo) {
        tokio::task::spawn_blocking(move || {
            for plugin in &plugins {
                plugin.on_response(&info);
            }
        });
    }
}

impl HttpHandler for ExchangeHandler {
    async fn handle_request(
        &mut self,
        ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        // Tunnels are decrypted and seen again as plain requests
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let host = Self::extract_host(&req).map(|h| self.label_host(h));

        // Reads the kernel TCP tables
        let clients = self.clients.clone();
        let peer = ctx.client_addr;
        let client = tokio::task::spawn_blocking(move || clients.resolve(peer))
            .await
            .ok()
            .flatten();

        let info = RequestInfo {
            method: req.method().to_string(),
            uri: req.uri().to_string(),
            host,
            body_len: Self::content_length(&req),
            peer,
            client,
        };

        tracing::debug!("{} {}", info.method, info.uri);

        for plugin in self.plugins.read().iter() {
            plugin.on_request(&info);
        }

        self.pending = Some(info);
        RequestOrResponse::Request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some(request) = self.pending.take() else {
            return res;
        };

        let plugins: Vec<Arc<dyn ProxyPlugin>> = self.plugins.read().clone();
        if plugins.is_empty() {
            return res;
        }

        if let Some(len) = Self::declared_length(&res).filter(|&n| n > MAX_BUFFERED_BODY) {
            tracing::debug!("Not buffering {} byte response for {}", len, request.uri);
            let info = ResponseInfo {
                request,
                status: res.status().as_u16(),
                body: Bytes::new(),
                body_len: len,
            };
            Self::notify(plugins, info);
            return res;
        }

        let (parts, body) = res.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read response body for {}: {}", request.uri, e);
                return Response::from_parts(parts, Body::empty());
            }
        };

        let info = ResponseInfo {
            request,
            status: parts.status.as_u16(),
            body_len: body_bytes.len() as u64,
            body: body_bytes.clone(),
        };
        Self::notify(plugins, info);

        Response::from_parts(parts, bytes_to_body(body_bytes))
    }
}
