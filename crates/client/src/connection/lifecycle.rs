//! Status state machine and transport ownership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use agora_shared::SyncError;

use super::{
    ConnectionStatus, EnvironmentSignal, NetworkState, RecreateLimiter, RecreateOutcome,
    StatusCause, StatusChange, Transport, TransportFactory,
};
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::guard::{GuardOptions, OperationGuard};

const CONNECT_KEY: &str = "connection:connect";
const RECREATE_KEY: &str = "connection:recreate";
const BACKGROUND_REASON: &str = "app moved to background";

type Listener = Arc<dyn Fn(&StatusChange) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Listener>>,
}

impl ListenerRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by [`ConnectionCore::on_status_change`].
///
/// Dropping the handle keeps the listener registered; call
/// [`StatusListener::unsubscribe`] to remove it.
pub struct StatusListener {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl StatusListener {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
    }
}

struct CoreState {
    status: ConnectionStatus,
    generation: u64,
    foreground: bool,
}

/// Owns the single transport instance and the connection status.
///
/// Only the core replaces the transport. Everyone else borrows it through
/// [`ConnectionCore::transport`] for the duration of one operation and
/// rebinds when a [`StatusCause::TransportReplaced`] change arrives.
pub struct ConnectionCore {
    factory: Arc<dyn TransportFactory>,
    transport: RwLock<Arc<dyn Transport>>,
    state: Mutex<CoreState>,
    listeners: Arc<ListenerRegistry>,
    limiter: RecreateLimiter,
    guard: OperationGuard,
    connect_timeout: Duration,
}

impl ConnectionCore {
    pub fn new(
        config: &SyncConfig,
        factory: Arc<dyn TransportFactory>,
        guard: OperationGuard,
        clock: SharedClock,
    ) -> Self {
        let transport = factory.create();
        Self {
            factory,
            transport: RwLock::new(transport),
            state: Mutex::new(CoreState {
                status: ConnectionStatus::offline(),
                generation: 0,
                foreground: true,
            }),
            listeners: Arc::new(ListenerRegistry::default()),
            limiter: RecreateLimiter::new(config.recreate_min_interval, clock),
            guard,
            connect_timeout: config.backend_timeout,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock_state().status
    }

    /// Number of transport swaps so far.
    pub fn generation(&self) -> u64 {
        self.lock_state().generation
    }

    pub fn is_foreground(&self) -> bool {
        self.lock_state().foreground
    }

    /// The current transport. Do not hold on to it across a status change.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn guard(&self) -> &OperationGuard {
        &self.guard
    }

    /// Register a listener for every status transition and transport swap.
    /// Listeners run synchronously on the emitting task and must not block.
    pub fn on_status_change(
        &self,
        listener: impl Fn(&StatusChange) + Send + Sync + 'static,
    ) -> StatusListener {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(listener));
        StatusListener {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Establish the initial connection.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.bring_up(StatusCause::Connected).await
    }

    /// React to a network or visibility signal from the host environment.
    pub async fn handle_signal(&self, signal: EnvironmentSignal) {
        match signal {
            EnvironmentSignal::NetworkOffline => {
                self.transition_if(StatusCause::NetworkLost, |state| {
                    if state.status.state == NetworkState::Offline {
                        return false;
                    }
                    state.status = ConnectionStatus {
                        state: NetworkState::Offline,
                        needs_reconnect: true,
                    };
                    true
                });
            }
            EnvironmentSignal::NetworkOnline => {
                let current = self.status();
                match current.state {
                    NetworkState::Offline => {
                        let claimed = self.transition_if(StatusCause::Reconnecting, |state| {
                            if state.status.state != NetworkState::Offline {
                                return false;
                            }
                            state.status.state = NetworkState::Reconnecting;
                            true
                        });
                        if claimed {
                            // Failure is already logged and reflected in the status.
                            let _ = self.bring_up(StatusCause::Reconnected).await;
                        }
                    }
                    NetworkState::Online if current.needs_reconnect => {
                        self.recreate_client().await;
                    }
                    _ => {
                        crate::log_debug!("connection"; "ignoring network online while {:?}", current.state);
                    }
                }
            }
            EnvironmentSignal::Background => {
                self.lock_state().foreground = false;
                self.guard.cancel_all(BACKGROUND_REASON);
            }
            EnvironmentSignal::Foreground => {
                let current = {
                    let mut state = self.lock_state();
                    state.foreground = true;
                    state.status
                };
                if !current.is_online() {
                    return;
                }
                if current.needs_reconnect {
                    if let RecreateOutcome::Recreated { .. } = self.recreate_client().await {
                        return;
                    }
                }
                self.transition_if(StatusCause::Resumed, |_| true);
            }
            EnvironmentSignal::Focus => {
                self.transition_if(StatusCause::Focused, |state| state.status.is_online());
            }
            EnvironmentSignal::TransportLost => {
                crate::log_warn!("connection"; "transport reported a dropped channel");
                self.transition_if(StatusCause::TransportLost, |state| {
                    state.status.needs_reconnect = true;
                    true
                });
            }
        }
    }

    /// Replace the transport with a fresh instance.
    ///
    /// At most one recreation per `recreate_min_interval`; calls inside the
    /// window are dropped. Failures are logged and reported in the outcome,
    /// never raised.
    pub async fn recreate_client(&self) -> RecreateOutcome {
        if let Err(err) = self.limiter.try_acquire() {
            return match err {
                SyncError::RecreateRateLimited { retry_in } => {
                    crate::log_warn!("connection"; "recreate dropped, retry in {:?}", retry_in);
                    RecreateOutcome::RateLimited { retry_in }
                }
                other => RecreateOutcome::Failed {
                    reason: other.to_string(),
                },
            };
        }

        let fresh = self.factory.create();
        let candidate = fresh.clone();
        let result = self
            .guard
            .with_timeout(
                GuardOptions::keyed(RECREATE_KEY, self.connect_timeout)
                    .with_message("fresh transport did not connect"),
                move |_| async move { candidate.connect().await },
            )
            .await;

        if let Err(err) = result {
            crate::log_error!("connection"; "recreate failed: {}", err);
            self.transition_if(StatusCause::ConnectFailed, |state| {
                state.status.needs_reconnect = true;
                true
            });
            return RecreateOutcome::Failed {
                reason: err.to_string(),
            };
        }

        let previous = {
            let mut slot = self.transport.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, fresh)
        };

        let mut generation = 0;
        self.transition_if(StatusCause::TransportReplaced, |state| {
            state.generation += 1;
            generation = state.generation;
            state.status = ConnectionStatus {
                state: NetworkState::Online,
                needs_reconnect: false,
            };
            true
        });
        crate::log_info!("connection"; "transport replaced (generation {})", generation);

        previous.disconnect().await;
        RecreateOutcome::Recreated { generation }
    }

    async fn bring_up(&self, cause: StatusCause) -> Result<(), SyncError> {
        let transport = self.transport();
        let result = self
            .guard
            .with_timeout(
                GuardOptions::keyed(CONNECT_KEY, self.connect_timeout)
                    .with_message("transport connect timed out"),
                move |_| async move { transport.connect().await },
            )
            .await;

        match result {
            Ok(()) => {
                self.transition_if(cause, |state| {
                    state.status = ConnectionStatus {
                        state: NetworkState::Online,
                        needs_reconnect: false,
                    };
                    true
                });
                Ok(())
            }
            Err(err) => {
                crate::log_error!("connection"; "connect failed: {}", err);
                self.transition_if(StatusCause::ConnectFailed, |state| {
                    state.status = ConnectionStatus {
                        state: NetworkState::Offline,
                        needs_reconnect: true,
                    };
                    true
                });
                Err(match err.upstream() {
                    Some(transport_err) => SyncError::Transport(transport_err.clone()),
                    None => SyncError::from(err),
                })
            }
        }
    }

    /// Apply `update` under the state lock and emit a change when it
    /// returns true. Listeners run after the lock is released.
    fn transition_if(
        &self,
        cause: StatusCause,
        update: impl FnOnce(&mut CoreState) -> bool,
    ) -> bool {
        let change = {
            let mut state = self.lock_state();
            let previous = state.status;
            if !update(&mut state) {
                return false;
            }
            StatusChange {
                previous,
                status: state.status,
                cause,
                generation: state.generation,
            }
        };
        self.emit(&change);
        true
    }

    fn emit(&self, change: &StatusChange) {
        crate::log_debug!(
            "connection";
            "{:?} -> {:?} ({:?}, generation {})",
            change.previous.state,
            change.status.state,
            change.cause,
            change.generation
        );
        let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(change);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("status", &self.status())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{MemoryBackend, MemoryTransportFactory};
    use agora_shared::TransportError;

    struct Harness {
        core: ConnectionCore,
        factory: Arc<MemoryTransportFactory>,
        clock: ManualClock,
        changes: Arc<Mutex<Vec<StatusChange>>>,
    }

    fn harness() -> Harness {
        let factory = Arc::new(MemoryTransportFactory::new(MemoryBackend::new()));
        let clock = ManualClock::new();
        let core = ConnectionCore::new(
            &SyncConfig::fast(),
            factory.clone(),
            OperationGuard::new(Duration::from_millis(500)),
            Arc::new(clock.clone()),
        );
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        // Intentionally kept registered for the whole test.
        let _listener = core.on_status_change(move |change| sink.lock().unwrap().push(*change));
        Harness {
            core,
            factory,
            clock,
            changes,
        }
    }

    fn causes(changes: &Arc<Mutex<Vec<StatusChange>>>) -> Vec<StatusCause> {
        changes.lock().unwrap().iter().map(|c| c.cause).collect()
    }

    #[tokio::test]
    async fn test_starts_offline_and_connects() {
        let h = harness();
        assert_eq!(h.core.status(), ConnectionStatus::offline());

        h.core.connect().await.unwrap();
        assert!(h.core.status().is_online());
        assert!(h.core.transport().is_connected());
        assert_eq!(causes(&h.changes), vec![StatusCause::Connected]);
    }

    #[tokio::test]
    async fn test_failed_connect_is_offline_and_needs_reconnect() {
        let h = harness();
        h.factory.backend().fail_next_connects(1);

        let err = h.core.connect().await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::Connect(_))));
        let status = h.core.status();
        assert_eq!(status.state, NetworkState::Offline);
        assert!(status.needs_reconnect);
    }

    #[tokio::test]
    async fn test_network_flap_walks_offline_reconnecting_online() {
        let h = harness();
        h.core.connect().await.unwrap();

        h.core.handle_signal(EnvironmentSignal::NetworkOffline).await;
        h.core.handle_signal(EnvironmentSignal::NetworkOffline).await;
        h.core.handle_signal(EnvironmentSignal::NetworkOnline).await;
        h.core.handle_signal(EnvironmentSignal::NetworkOnline).await;

        let states: Vec<NetworkState> =
            h.changes.lock().unwrap().iter().map(|c| c.status.state).collect();
        assert_eq!(
            states,
            vec![
                NetworkState::Online,
                NetworkState::Offline,
                NetworkState::Reconnecting,
                NetworkState::Online,
            ]
        );
        assert_eq!(
            causes(&h.changes),
            vec![
                StatusCause::Connected,
                StatusCause::NetworkLost,
                StatusCause::Reconnecting,
                StatusCause::Reconnected,
            ]
        );
        assert!(!h.core.status().needs_reconnect);
    }

    #[tokio::test]
    async fn test_foreground_while_online_notifies_resumed() {
        let h = harness();
        h.core.connect().await.unwrap();
        h.core.handle_signal(EnvironmentSignal::Background).await;
        assert!(!h.core.is_foreground());

        h.core.handle_signal(EnvironmentSignal::Foreground).await;
        assert!(h.core.is_foreground());
        assert_eq!(
            causes(&h.changes),
            vec![StatusCause::Connected, StatusCause::Resumed]
        );
        assert_eq!(h.core.generation(), 0);
    }

    #[tokio::test]
    async fn test_focus_ignored_while_offline() {
        let h = harness();
        h.core.handle_signal(EnvironmentSignal::Focus).await;
        assert!(h.changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transport_loss_recreates_on_foreground() {
        let h = harness();
        h.core.connect().await.unwrap();
        let before = h.core.transport();

        h.core.handle_signal(EnvironmentSignal::TransportLost).await;
        assert!(h.core.status().needs_reconnect);
        h.core.handle_signal(EnvironmentSignal::Foreground).await;

        assert_eq!(h.core.generation(), 1);
        assert_eq!(h.factory.created(), 2);
        assert!(!before.is_connected());
        assert!(h.core.transport().is_connected());
        assert_eq!(
            causes(&h.changes),
            vec![
                StatusCause::Connected,
                StatusCause::TransportLost,
                StatusCause::TransportReplaced,
            ]
        );
    }

    #[tokio::test]
    async fn test_recreate_is_rate_limited() {
        let h = harness();
        h.core.connect().await.unwrap();

        assert_eq!(
            h.core.recreate_client().await,
            RecreateOutcome::Recreated { generation: 1 }
        );
        h.clock.advance(Duration::from_millis(200));
        match h.core.recreate_client().await {
            RecreateOutcome::RateLimited { retry_in } => {
                assert_eq!(retry_in, Duration::from_millis(300))
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
        assert_eq!(h.factory.created(), 2);

        h.clock.advance(Duration::from_millis(300));
        assert_eq!(
            h.core.recreate_client().await,
            RecreateOutcome::Recreated { generation: 2 }
        );
    }

    #[tokio::test]
    async fn test_recreate_failure_is_swallowed_and_keeps_old_transport() {
        let h = harness();
        h.core.connect().await.unwrap();
        let before = h.core.transport();
        h.factory.backend().fail_next_connects(1);

        let outcome = h.core.recreate_client().await;
        assert!(matches!(outcome, RecreateOutcome::Failed { .. }));
        assert_eq!(h.core.generation(), 0);
        assert!(Arc::ptr_eq(&before, &h.core.transport()));
        assert!(h.core.status().needs_reconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cancels_pending_connect() {
        let h = Arc::new(harness());
        h.factory
            .backend()
            .set_connect_delay(Some(Duration::from_millis(300)));

        let task = {
            let h = h.clone();
            tokio::spawn(async move { h.core.connect().await })
        };
        while !h.core.guard().is_pending(CONNECT_KEY) {
            tokio::task::yield_now().await;
        }
        h.core.handle_signal(EnvironmentSignal::Background).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains(BACKGROUND_REASON));
        assert!(h.core.guard().pending_keys().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_stops_receiving() {
        let h = harness();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let listener = h.core.on_status_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(h.core.listener_count(), 2);

        h.core.connect().await.unwrap();
        listener.unsubscribe();
        h.core.handle_signal(EnvironmentSignal::NetworkOffline).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(h.core.listener_count(), 1);
    }
}
