//! In-process transport backed by a shared [`MemoryBackend`].
//!
//! Every transport created by a [`MemoryTransportFactory`] talks to the same
//! backend, so a recreated transport sees the same change stream. Published
//! events reach only subscriptions of currently connected transports, in
//! subscription order, and each handler is awaited before the next one runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agora_shared::{ChangeEvent, SubscriptionSpec, Table, TransportError};
use async_trait::async_trait;

use crate::connection::{ChangeHandler, Transport, TransportFactory, Unsubscribe};

struct SubscriptionRecord {
    id: u64,
    transport_id: u64,
    spec: SubscriptionSpec,
    handler: ChangeHandler,
}

#[derive(Default)]
struct BackendState {
    subscriptions: Vec<SubscriptionRecord>,
    connected: HashSet<u64>,
    next_subscription: u64,
    failing_connects: u32,
    failing_tables: HashSet<Table>,
    connect_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    row_filters: bool,
    connect_attempts: HashMap<u64, u32>,
}

/// Shared fake backend. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `SubscriptionSpec::row_filter` before delivery.
    pub fn with_row_filters(self) -> Self {
        self.lock().row_filters = true;
        self
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Make subscriptions to `table` fail until cleared.
    pub fn fail_subscriptions(&self, table: Table) {
        self.lock().failing_tables.insert(table);
    }

    pub fn clear_subscription_failures(&self) {
        self.lock().failing_tables.clear();
    }

    /// Delay every connect attempt, e.g. to exercise connect timeouts.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.lock().connect_delay = delay;
    }

    /// Delay every subscribe call before the backend accepts it.
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        self.lock().subscribe_delay = delay;
    }

    /// Simulate the server dropping every channel.
    pub fn drop_all_connections(&self) {
        self.lock().connected.clear();
    }

    /// Deliver `event` to every matching subscription of a connected
    /// transport, returning the number of handlers invoked.
    pub async fn publish(&self, event: ChangeEvent) -> usize {
        let handlers: Vec<ChangeHandler> = {
            let state = self.lock();
            state
                .subscriptions
                .iter()
                .filter(|record| state.connected.contains(&record.transport_id))
                .filter(|record| {
                    if state.row_filters {
                        record.spec.accepts(&event)
                    } else {
                        record.spec.table == event.table && record.spec.events.matches(event.kind)
                    }
                })
                .map(|record| record.handler.clone())
                .collect()
        };

        for handler in &handlers {
            handler(event.clone()).await;
        }
        handlers.len()
    }

    /// Live subscriptions for `table` across all transports.
    pub fn subscription_count(&self, table: Table) -> usize {
        self.lock()
            .subscriptions
            .iter()
            .filter(|record| record.spec.table == table)
            .count()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn connect_attempts(&self, transport_id: u64) -> u32 {
        self.lock()
            .connect_attempts
            .get(&transport_id)
            .copied()
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One client-side connection to a [`MemoryBackend`].
pub struct MemoryTransport {
    id: u64,
    backend: MemoryBackend,
}

impl MemoryTransport {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.backend.lock();
            *state.connect_attempts.entry(self.id).or_default() += 1;
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.backend.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Connect(format!(
                "transport {} refused by backend",
                self.id
            )));
        }
        state.connected.insert(self.id);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.backend.lock();
        state.connected.remove(&self.id);
        let id = self.id;
        state.subscriptions.retain(|record| record.transport_id != id);
    }

    fn is_connected(&self) -> bool {
        self.backend.lock().connected.contains(&self.id)
    }

    fn supports_row_filters(&self) -> bool {
        self.backend.lock().row_filters
    }

    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        handler: ChangeHandler,
    ) -> Result<Unsubscribe, TransportError> {
        let delay = self.backend.lock().subscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.backend.lock();
        if !state.connected.contains(&self.id) {
            return Err(TransportError::Closed);
        }
        if state.failing_tables.contains(&spec.table) {
            return Err(TransportError::Subscribe {
                table: spec.table,
                reason: "backend rejected subscription".to_string(),
            });
        }

        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscriptions.push(SubscriptionRecord {
            id,
            transport_id: self.id,
            spec,
            handler,
        });

        let backend = self.backend.clone();
        Ok(Unsubscribe::new(move || {
            backend.lock().subscriptions.retain(|record| record.id != id);
        }))
    }
}

/// Creates [`MemoryTransport`]s bound to one backend.
pub struct MemoryTransportFactory {
    backend: MemoryBackend,
    created: AtomicU64,
}

impl MemoryTransportFactory {
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            backend,
            created: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    /// Number of transports created so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self) -> Arc<dyn Transport> {
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(MemoryTransport {
            id,
            backend: self.backend.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_shared::RowFilter;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> ChangeHandler {
        Arc::new(move |_event: ChangeEvent| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_connected_subscribers_only() {
        let factory = MemoryTransportFactory::new(MemoryBackend::new());
        let first = factory.create();
        let second = factory.create();
        first.connect().await.unwrap();
        second.connect().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        first
            .subscribe(SubscriptionSpec::all_events(Table::Posts), counting_handler(hits.clone()))
            .await
            .unwrap();
        second
            .subscribe(SubscriptionSpec::all_events(Table::Posts), counting_handler(hits.clone()))
            .await
            .unwrap();

        second.disconnect().await;
        let delivered = factory
            .backend()
            .publish(ChangeEvent::insert(Table::Posts, json!({"id": "p1"})))
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(factory.backend().subscription_count(Table::Posts), 1);
    }

    #[tokio::test]
    async fn test_row_filters_only_apply_when_supported() {
        let backend = MemoryBackend::new();
        let factory = MemoryTransportFactory::new(backend.clone());
        let transport = factory.create();
        transport.connect().await.unwrap();
        assert!(!transport.supports_row_filters());

        let hits = Arc::new(AtomicUsize::new(0));
        let spec = SubscriptionSpec::all_events(Table::Messages)
            .with_row_filter(RowFilter::eq("recipient_id", "u1"));
        transport
            .subscribe(spec, counting_handler(hits.clone()))
            .await
            .unwrap();

        backend
            .publish(ChangeEvent::insert(Table::Messages, json!({"recipient_id": "u2"})))
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_injectable() {
        let backend = MemoryBackend::new();
        let factory = MemoryTransportFactory::new(backend.clone());
        let transport = factory.create();

        backend.fail_next_connects(1);
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());

        backend.fail_subscriptions(Table::Likes);
        let result = transport
            .subscribe(
                SubscriptionSpec::all_events(Table::Likes),
                counting_handler(Arc::new(AtomicUsize::new(0))),
            )
            .await;
        assert!(matches!(result, Err(TransportError::Subscribe { table: Table::Likes, .. })));
    }
}
