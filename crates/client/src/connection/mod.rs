//! Connection Core: the single push-channel transport and its status.
//!
//! This module provides:
//! - The transport boundary ([`Transport`], [`TransportFactory`])
//! - Connection status and the status-change stream
//! - Reaction to network and visibility signals
//! - Rate-limited transport recreation
//!
//! # Architecture
//!
//! ```text
//!   environment signals          explicit calls
//!   (network, visibility)        (recreate_client)
//!              │                        │
//!              └──────────┬─────────────┘
//!                         ▼
//!              ┌─────────────────────┐
//!              │   ConnectionCore    │──── owns Arc<dyn Transport>
//!              └─────────────────────┘
//!                         │ StatusChange
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!   ┌────────────┐ ┌────────────┐ ┌────────────┐
//!   │  Recovery  │ │   Global   │ │   Scoped   │
//!   │  Manager   │ │  streams   │ │  streams   │
//!   └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! Managers never keep the transport beyond one operation: a recreation
//! replaces it and bumps the generation carried by every [`StatusChange`].

mod lifecycle;
mod limiter;

pub use lifecycle::{ConnectionCore, StatusListener};
pub use limiter::RecreateLimiter;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agora_shared::{ChangeEvent, SubscriptionSpec, TransportError};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;

/// Network-level state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkState {
    Offline,
    Online,
    Reconnecting,
}

/// Connection status owned by [`ConnectionCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: NetworkState,
    /// Set when the transport is known or suspected to be unusable and a
    /// reconnect/recreate should happen on the next qualifying event.
    pub needs_reconnect: bool,
}

impl ConnectionStatus {
    pub fn offline() -> Self {
        Self {
            state: NetworkState::Offline,
            needs_reconnect: false,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == NetworkState::Online
    }
}

/// Why a [`StatusChange`] was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusCause {
    /// Initial connection established.
    Connected,
    /// A connect or reconnect attempt failed.
    ConnectFailed,
    NetworkLost,
    /// Network came back; reconnect in progress.
    Reconnecting,
    /// Network came back and the transport is up again.
    Reconnected,
    /// App returned to the foreground while online.
    Resumed,
    /// Window regained focus while online.
    Focused,
    /// The transport reported that its channel dropped.
    TransportLost,
    /// A fresh transport instance replaced the previous one.
    TransportReplaced,
}

/// Delivered to every status listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub previous: ConnectionStatus,
    pub status: ConnectionStatus,
    pub cause: StatusCause,
    /// Transport generation; increments on every recreation.
    pub generation: u64,
}

/// Inputs from the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentSignal {
    NetworkOnline,
    NetworkOffline,
    Foreground,
    Background,
    Focus,
    /// Raised by a transport adapter when its channel dropped.
    TransportLost,
}

/// Result of [`ConnectionCore::recreate_client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecreateOutcome {
    Recreated { generation: u64 },
    /// Dropped because the previous recreation was too recent.
    RateLimited { retry_in: Duration },
    /// The fresh transport could not connect; the old one stays in place.
    Failed { reason: String },
}

/// Handler invoked for every delivered change event. Transports await it
/// before delivering the next event of the same subscription.
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Revokes one transport subscription. Calling it more than once is a no-op.
pub struct Unsubscribe {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Unsubscribe {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn noop() -> Self {
        Self {
            action: Mutex::new(None),
        }
    }

    pub fn call(&self) {
        let action = self
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(action) = action {
            action();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe").finish_non_exhaustive()
    }
}

/// The push-channel transport boundary.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Whether `SubscriptionSpec::row_filter` is applied server-side. When
    /// false, subscribers must filter rows themselves.
    fn supports_row_filters(&self) -> bool {
        false
    }

    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        handler: ChangeHandler,
    ) -> Result<Unsubscribe, TransportError>;
}

/// Builds fresh transport instances for the core.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unsubscribe_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let unsubscribe = Unsubscribe::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        unsubscribe.call();
        unsubscribe.call();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Unsubscribe::noop().call();
    }
}
