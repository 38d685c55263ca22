//! Warden Proxy - elevated shell, redirect rules and the intercepting proxy.
//!
//! ## Pieces
//!
//! - [`PrivilegedShell`] starts a root command interpreter and runs commands
//!   in it one at a time, returning exit status and output.
//! - [`TransparentProxyController`] feeds the rule batch built by
//!   [`warden_core::RuleSetBuilder`] through that shell.
//! - [`ProxyFactory`] / [`ProxyService`] are the boundary the lifecycle
//!   drives; [`MitmProxyFactory`] is the hudsucker implementation.
//! - [`CapturePlugin`] records exchanges into a [`warden_storage::Database`].
//!
//! ## Architecture
//!
//! ```text
//! App traffic ─► netfilter nat (spplugin chains) ─► redirect port
//!                                                       │
//!                                        MitmProxyService (hudsucker)
//!                                                       │
//!                                  ExchangeHandler ─► plugins ─► Database
//! ```

mod ca;
mod capture;
mod error;
mod handler;
mod proxy;
pub mod resolver;
mod service;
pub mod shell;
mod transparent;

pub use ca::CaManager;
pub use capture::CapturePlugin;
pub use error::{CaManagerError, PrivilegeError, ProxyError, Result, TransparentProxyError};
pub use handler::{ExchangeHandler, PluginList};
pub use proxy::{MitmProxyFactory, MitmProxyService, ProxyConfig, ProxyHandle};
pub use resolver::{
    ClientInfo, ClientResolver, HostResolver, NetworkHostResolver, ProcNetClientResolver,
};
pub use service::{ProxyFactory, ProxyPlugin, ProxyService, RequestInfo, ResponseInfo};
pub use shell::{CommandOutput, PrivilegedShell, ShellSession, DEFAULT_SHELL};
pub use transparent::{
    process_identity, RuleBatchReport, RuleOutcome, TransparentProxyController,
};
