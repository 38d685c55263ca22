//! Warden Core - rule synthesis, log buffering and lifecycle state.
//!
//! This crate holds the pieces of Warden that do not touch the network or
//! spawn processes:
//!
//! - [`rules`]: the ordered transparent-proxy rule set
//! - [`log_buffer`]: the bounded display log
//! - [`privilege`]: rooted-device detection
//! - [`state`]: the lifecycle state machine cell

pub mod log_buffer;
pub mod privilege;
pub mod rules;
pub mod state;

pub use log_buffer::{LogBuffer, LogSink, DEFAULT_CAPACITY, DEFAULT_FRAGMENT_CEILING};
pub use privilege::{is_device_rooted, RootDetector};
pub use rules::{ChainSet, Direction, PortRedirect, RulePolicy, RuleSetBuilder, RuleSpec, Table};
pub use state::{ServiceState, StateCell};
