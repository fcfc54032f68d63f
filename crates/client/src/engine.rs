//! Composition of the sync components into one engine.
//!
//! ```text
//!  handle_signal ──► ConnectionCore ──StatusChange──► mpsc ──► driver task
//!                                                               │
//!                             TransportReplaced: rebind streams ┤
//!                             Reconnected: ensure global streams┤
//!                                         graduated recovery ◄──┘
//! ```
//!
//! The engine is constructed once by the application's composition root.
//! Tests construct isolated engines over a [`crate::memory::MemoryBackend`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use agora_shared::{SyncError, Table};
use futures_channel::mpsc::{unbounded, UnboundedReceiver};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{InvalidationMap, QueryCache};
use crate::clock::{SharedClock, SystemClock};
use crate::config::SyncConfig;
use crate::connection::{
    ConnectionCore, ConnectionStatus, EnvironmentSignal, StatusCause, StatusChange,
    StatusListener, TransportFactory,
};
use crate::guard::{OperationGuard, PendingOperation};
use crate::recovery::{BatchMetrics, BreakerStatus, RecoveryManager};
use crate::streams::{GlobalStreams, InitReport, ScopedStreams};

/// Serializable debug/operator view of the whole engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub status: ConnectionStatus,
    pub generation: u64,
    pub pending: Vec<PendingOperation>,
    pub metrics: BatchMetrics,
    pub circuit_breaker: BreakerStatus,
    pub global_tables: Vec<Table>,
    pub failed_tables: Vec<Table>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    pub scoped_tables: Vec<Table>,
    pub scoped_failed_tables: Vec<Table>,
    pub scoped_consumers: usize,
    pub events_processed: u64,
}

struct Driver {
    listener: StatusListener,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SyncEngine {
    config: SyncConfig,
    guard: OperationGuard,
    core: Arc<ConnectionCore>,
    recovery: Arc<RecoveryManager>,
    global: Arc<GlobalStreams>,
    scoped: Arc<ScopedStreams>,
    driver: Mutex<Option<Driver>>,
    emitted: Arc<AtomicU64>,
    handled: watch::Receiver<u64>,
    handled_tx: Arc<watch::Sender<u64>>,
}

impl SyncEngine {
    /// Build an engine with the standard invalidation map and system clock.
    pub fn new(
        config: SyncConfig,
        factory: Arc<dyn TransportFactory>,
        cache: Arc<dyn QueryCache>,
    ) -> Result<Self, SyncError> {
        Self::with_parts(
            config,
            factory,
            cache,
            InvalidationMap::standard(),
            Arc::new(SystemClock),
        )
    }

    /// Build an engine from explicit parts. Fails when `map` is incomplete.
    pub fn with_parts(
        config: SyncConfig,
        factory: Arc<dyn TransportFactory>,
        cache: Arc<dyn QueryCache>,
        map: InvalidationMap,
        clock: SharedClock,
    ) -> Result<Self, SyncError> {
        map.validate()?;
        let map = Arc::new(map);

        let guard = OperationGuard::new(config.default_timeout);
        let core = Arc::new(ConnectionCore::new(
            &config,
            factory,
            guard.clone(),
            clock.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            &config,
            cache.clone(),
            guard.clone(),
            clock,
        ));
        let global = Arc::new(GlobalStreams::new(
            &config,
            core.clone(),
            cache.clone(),
            map.clone(),
        ));
        let scoped = Arc::new(ScopedStreams::new(&config, core.clone(), cache, map));
        let (handled_tx, handled) = watch::channel(0);

        Ok(Self {
            config,
            guard,
            core,
            recovery,
            global,
            scoped,
            driver: Mutex::new(None),
            emitted: Arc::new(AtomicU64::new(0)),
            handled,
            handled_tx: Arc::new(handled_tx),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn guard(&self) -> &OperationGuard {
        &self.guard
    }

    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn global_streams(&self) -> &Arc<GlobalStreams> {
        &self.global
    }

    pub fn scoped_streams(&self) -> &Arc<ScopedStreams> {
        &self.scoped
    }

    /// Start the driver, connect, and subscribe the global streams.
    ///
    /// A failed connect is returned, but the driver stays up: the next
    /// network-online signal reconnects and initializes the streams.
    pub async fn start(&self) -> Result<InitReport, SyncError> {
        self.spawn_driver();
        self.core.connect().await?;
        Ok(self.global.initialize().await)
    }

    /// Subscribe the per-user streams for `principal`.
    pub async fn sign_in(&self, principal: &str) -> InitReport {
        self.scoped.initialize(principal).await
    }

    pub fn sign_out(&self) {
        self.scoped.cleanup();
    }

    pub async fn handle_signal(&self, signal: EnvironmentSignal) {
        self.core.handle_signal(signal).await;
    }

    /// Wait until the driver has handled every status change emitted so far.
    pub async fn settle(&self) {
        let target = self.emitted.load(Ordering::SeqCst);
        let mut handled = self.handled.clone();
        // An error means the driver is gone; nothing left to wait for.
        let _ = handled.wait_for(|count| *count >= target).await;
    }

    /// Stop the driver, drop every subscription and pending operation, and
    /// disconnect the transport.
    pub async fn shutdown(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.listener.unsubscribe();
            driver.shutdown.cancel();
            if let Err(err) = driver.task.await {
                crate::log_warn!("connection"; "engine driver ended abnormally: {}", err);
            }
        }
        self.global.cleanup();
        self.scoped.cleanup();
        self.guard.cancel_all("engine shutdown");
        self.core.transport().disconnect().await;
        crate::log_info!("connection"; "sync engine stopped");
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            status: self.core.status(),
            generation: self.core.generation(),
            pending: self.guard.pending_operations(),
            metrics: self.recovery.get_batch_metrics(),
            circuit_breaker: self.recovery.get_circuit_breaker_status(),
            global_tables: self.global.active_tables(),
            failed_tables: self.global.failed_tables(),
            principal: self.scoped.principal(),
            scoped_tables: self.scoped.active_tables(),
            scoped_failed_tables: self.scoped.failed_tables(),
            scoped_consumers: self.scoped.consumer_count(),
            events_processed: self.global.events_processed(),
        }
    }

    fn spawn_driver(&self) {
        let mut slot = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let (tx, rx) = unbounded::<StatusChange>();
        let emitted = self.emitted.clone();
        let listener = self.core.on_status_change(move |change| {
            emitted.fetch_add(1, Ordering::SeqCst);
            if tx.unbounded_send(*change).is_err() {
                crate::log_debug!("connection"; "engine driver gone, dropping {:?}", change.cause);
            }
        });

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(drive(
            rx,
            shutdown.clone(),
            self.recovery.clone(),
            self.global.clone(),
            self.scoped.clone(),
            self.handled_tx.clone(),
        ));
        *slot = Some(Driver {
            listener,
            shutdown,
            task,
        });
    }
}

async fn drive(
    mut changes: UnboundedReceiver<StatusChange>,
    shutdown: CancellationToken,
    recovery: Arc<RecoveryManager>,
    global: Arc<GlobalStreams>,
    scoped: Arc<ScopedStreams>,
    handled: Arc<watch::Sender<u64>>,
) {
    loop {
        let change = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = changes.next() => match next {
                Some(change) => change,
                None => break,
            },
        };

        match change.cause {
            StatusCause::TransportReplaced => {
                let report = global.rebind().await;
                scoped.rebind().await;
                crate::log_info!(
                    "streams";
                    "rebound to transport generation {} ({} global table(s))",
                    change.generation,
                    report.subscribed.len()
                );
            }
            StatusCause::Reconnected => {
                global.initialize().await;
                global.resubscribe_failed().await;
                scoped.resubscribe_failed().await;
            }
            _ => {}
        }

        if let Some(results) = recovery.handle_status_change(&change).await {
            crate::log_debug!("recovery"; "{:?} recovery ran {} batch(es)", change.cause, results.len());
        }
        handled.send_modify(|count| *count += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, MemoryTransportFactory};
    use crate::testing::RecordingCache;
    use agora_shared::ChangeKind;

    #[test]
    fn test_incomplete_map_is_rejected() {
        let mut map = InvalidationMap::empty();
        map.insert(Table::Posts, ChangeKind::Insert, Vec::new());
        let result = SyncEngine::with_parts(
            SyncConfig::fast(),
            Arc::new(MemoryTransportFactory::new(MemoryBackend::new())),
            Arc::new(RecordingCache::default()),
            map,
            Arc::new(SystemClock),
        );
        assert!(matches!(
            result,
            Err(SyncError::IncompleteInvalidationMap { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let backend = MemoryBackend::new();
        let engine = SyncEngine::new(
            SyncConfig::fast(),
            Arc::new(MemoryTransportFactory::new(backend.clone())),
            Arc::new(RecordingCache::default()),
        )
        .unwrap();

        let report = engine.start().await.unwrap();
        assert!(report.is_complete());
        engine.sign_in("u1").await;
        assert_eq!(
            backend.total_subscriptions(),
            Table::GLOBAL.len() + Table::SCOPED.len()
        );
        assert_eq!(engine.core().listener_count(), 1);

        engine.shutdown().await;
        assert_eq!(backend.total_subscriptions(), 0);
        assert_eq!(engine.core().listener_count(), 0);
        assert!(!engine.core().transport().is_connected());
    }

    #[tokio::test]
    async fn test_start_twice_keeps_one_driver() {
        let engine = SyncEngine::new(
            SyncConfig::fast(),
            Arc::new(MemoryTransportFactory::new(MemoryBackend::new())),
            Arc::new(RecordingCache::default()),
        )
        .unwrap();
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.core().listener_count(), 1);
        engine.settle().await;
        engine.shutdown().await;
    }
}
