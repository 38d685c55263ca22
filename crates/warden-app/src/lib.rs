//! Warden - toggles a local intercepting proxy and its redirect rules.
//!
//! This crate provides the application layer:
//!
//! - [`lifecycle`]: the start/stop state machine around the proxy subsystem
//! - [`log_layer`]: a tracing layer feeding the bounded log view
//! - [`purge`]: deletion of captured data
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use warden_app::lifecycle::{ServiceContext, ServiceController};
//! use warden_proxy::{CaManager, MitmProxyFactory, ProxyConfig, TransparentProxyController};
//!
//! let ca = CaManager::new(data_dir.join("ca"));
//! let factory = MitmProxyFactory::new(ProxyConfig::new(9008, true, ca), runtime.clone());
//! let context = ServiceContext::new(&data_dir, Arc::new(factory), transparent);
//!
//! let controller = ServiceController::new(context, runtime);
//! controller.start().wait().await?;
//! ```

pub mod lifecycle;
pub mod log_layer;
pub mod purge;

pub use lifecycle::{
    LifecycleError, ServiceContext, ServiceController, Transition, CAPTURE_NAMESPACE,
};
pub use log_layer::{LogBufferLayer, PANIC_TARGET};
pub use purge::{delete_captured_data, PurgeReport};
