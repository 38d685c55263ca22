//! Service lifecycle state.
//!
//! ## States
//!
//! - **Stopped**: no proxy, no rules (initial)
//! - **Starting**: start work in flight
//! - **Running**: proxy constructed and listening
//! - **Stopping**: stop work in flight
//!
//! Transitions out of a terminal state are claimed with a compare-and-swap,
//! so two concurrent start requests can never both enter `Starting`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the proxy service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Nothing is running.
    #[default]
    Stopped,
    /// Start work is in flight.
    Starting,
    /// The proxy is running.
    Running,
    /// Stop work is in flight.
    Stopping,
}

impl ServiceState {
    /// Returns the state as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    /// Returns true for `Stopped` and `Running`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Running)
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared atomic holder for a [`ServiceState`].
#[derive(Debug, Clone, Default)]
pub struct StateCell {
    inner: Arc<AtomicU8>,
}

impl StateCell {
    /// Creates a cell in the `Stopped` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    pub fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.inner.load(Ordering::SeqCst))
    }

    /// Unconditionally sets the state.
    pub fn set(&self, state: ServiceState) {
        self.inner.store(state.to_u8(), Ordering::SeqCst);
    }

    /// Moves from `from` to `to` only if the current state is exactly `from`.
    ///
    /// On failure returns the state that was observed instead.
    pub fn transition(&self, from: ServiceState, to: ServiceState) -> Result<(), ServiceState> {
        self.inner
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ServiceState::from_u8)
    }
}
