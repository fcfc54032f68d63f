//! Agora Client - connection resilience and reactive cache sync
//!
//! This crate keeps a client-side query cache consistent with a remote
//! database over a single push channel. It owns the connection lifecycle,
//! recovers the cache in priority order after interruptions, and maps
//! database change events onto precise cache invalidations.

pub mod logging;

pub mod cache;
pub mod clock;
pub mod config;
pub mod connection;
pub mod engine;
pub mod guard;
pub mod memory;
pub mod recovery;
pub mod stores;
pub mod streams;

#[cfg(test)]
mod testing;

pub use cache::{CachePolicy, InvalidationMap, KeyMatch, QueryCache, QueryPriority};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{KeyTimeouts, SyncConfig};
pub use connection::{
    ConnectionCore, ConnectionStatus, EnvironmentSignal, NetworkState, StatusCause, StatusChange,
    Transport, TransportFactory,
};
pub use engine::{EngineSnapshot, SyncEngine};
pub use guard::{CancelSignal, GuardOptions, OperationGuard};
pub use recovery::{BatchMetrics, BatchResult, RecoveryManager, RecoveryStrategy};
pub use stores::QueryStore;
pub use streams::{GlobalStreams, InitReport, ScopedCallbacks, ScopedStreams};
