use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agora_shared::{ChangeEvent, EventFilter, RowFilter, SubscriptionSpec, Table};
use futures_util::FutureExt;

use super::{apply_invalidations, subscribe_guarded, InitReport, SubscriptionInfo, SubscriptionRegistry};
use crate::cache::{InvalidationMap, QueryCache};
use crate::config::SyncConfig;
use crate::connection::{ChangeHandler, ConnectionCore};

/// Called with each change that concerns the current principal.
pub type EventCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Callbacks one UI consumer registers with [`ScopedStreams`].
#[derive(Clone, Default)]
pub struct ScopedCallbacks {
    pub on_message: Option<EventCallback>,
    pub on_read_receipt: Option<EventCallback>,
}

impl ScopedCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, callback: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(callback));
        self
    }

    pub fn on_read_receipt(
        mut self,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_read_receipt = Some(Arc::new(callback));
        self
    }

    fn for_table(&self, table: Table) -> Option<&EventCallback> {
        match table {
            Table::Messages => self.on_message.as_ref(),
            Table::MessageReads => self.on_read_receipt.as_ref(),
            _ => None,
        }
    }
}

type ConsumerMap = Arc<Mutex<BTreeMap<String, ScopedCallbacks>>>;

/// Columns that tie a scoped row to a principal.
fn principal_columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::Messages => &["sender_id", "recipient_id"],
        Table::MessageReads => &["user_id", "sender_id"],
        _ => &[],
    }
}

/// Per-principal streams shared by many UI consumers.
///
/// Exactly one transport subscription exists per scoped table, however many
/// consumers are registered. Consumers come and go without touching the
/// transport.
pub struct ScopedStreams {
    core: Arc<ConnectionCore>,
    cache: Arc<dyn QueryCache>,
    map: Arc<InvalidationMap>,
    registry: SubscriptionRegistry,
    consumers: ConsumerMap,
    principal: Mutex<Option<String>>,
    failed: Mutex<BTreeSet<Table>>,
    subscribe_timeout: Duration,
}

impl ScopedStreams {
    pub fn new(
        config: &SyncConfig,
        core: Arc<ConnectionCore>,
        cache: Arc<dyn QueryCache>,
        map: Arc<InvalidationMap>,
    ) -> Self {
        Self {
            core,
            cache,
            map,
            registry: SubscriptionRegistry::default(),
            consumers: Arc::new(Mutex::new(BTreeMap::new())),
            principal: Mutex::new(None),
            failed: Mutex::new(BTreeSet::new()),
            subscribe_timeout: config.subscribe_timeout,
        }
    }

    /// Subscribe the scoped tables for `principal`.
    ///
    /// Same principal again only retries tables that are not subscribed. A
    /// different principal tears down the previous subscriptions and drops
    /// its consumers first.
    pub async fn initialize(&self, principal: &str) -> InitReport {
        let previous = {
            let mut current = self.lock_principal();
            if current.as_deref() == Some(principal) {
                None
            } else {
                Some(current.replace(principal.to_string()))
            }
        };

        match previous {
            None => crate::log_debug!("scoped"; "already initialized for {}", principal),
            Some(Some(previous)) => {
                crate::log_info!("scoped"; "principal changed from {} to {}", previous, principal);
                self.registry.clear();
                self.lock_failed().clear();
                self.lock_consumers().clear();
            }
            Some(None) => {}
        }

        self.subscribe_tables(principal, Table::SCOPED.to_vec()).await
    }

    /// Retry the scoped tables whose subscription failed. A no-op without a
    /// principal.
    pub async fn resubscribe_failed(&self) -> InitReport {
        let Some(principal) = self.principal() else {
            return InitReport::default();
        };
        let pending: Vec<Table> = std::mem::take(&mut *self.lock_failed())
            .into_iter()
            .collect();
        if pending.is_empty() {
            return InitReport::default();
        }
        crate::log_info!("scoped"; "retrying {} scoped table(s) for {}", pending.len(), principal);
        self.subscribe_tables(&principal, pending).await
    }

    /// Drop every subscription and forget the principal. Registered
    /// consumers stay. Safe to call repeatedly.
    pub fn cleanup(&self) {
        let removed = self.registry.clear();
        self.lock_failed().clear();
        if self.lock_principal().take().is_some() {
            crate::log_info!("scoped"; "scoped streams cleaned up ({} subscription(s))", removed);
        }
    }

    /// Resubscribe the current principal on the current transport.
    pub async fn rebind(&self) -> InitReport {
        let Some(principal) = self.principal() else {
            return InitReport::default();
        };
        self.registry.clear();
        self.lock_failed().clear();
        self.subscribe_tables(&principal, Table::SCOPED.to_vec()).await
    }

    pub fn register_callbacks(&self, consumer_id: impl Into<String>, callbacks: ScopedCallbacks) {
        let consumer_id = consumer_id.into();
        crate::log_debug!("scoped"; "registering consumer {}", consumer_id);
        self.lock_consumers().insert(consumer_id, callbacks);
    }

    /// Returns false when `consumer_id` was not registered.
    pub fn unregister_callbacks(&self, consumer_id: &str) -> bool {
        self.lock_consumers().remove(consumer_id).is_some()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock_consumers().len()
    }

    pub fn principal(&self) -> Option<String> {
        self.lock_principal().clone()
    }

    pub fn active_tables(&self) -> Vec<Table> {
        self.registry.tables()
    }

    pub fn failed_tables(&self) -> Vec<Table> {
        self.lock_failed().iter().copied().collect()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.info()
    }

    /// Subscribe `tables` for `principal`, skipping tables already held.
    /// A pass stops once a teardown supersedes it.
    async fn subscribe_tables(&self, principal: &str, tables: Vec<Table>) -> InitReport {
        let epoch = self.registry.epoch();
        let server_side = self.core.transport().supports_row_filters();
        let mut report = InitReport::default();

        for table in tables {
            if self.registry.epoch() != epoch {
                crate::log_debug!("scoped"; "subscribe pass for {} superseded", principal);
                break;
            }
            if self.registry.contains(table) {
                report.subscribed.push(table);
                continue;
            }

            let filter = RowFilter::any_of(principal_columns(table).iter().copied(), principal);
            let mut spec = SubscriptionSpec::all_events(table);
            if server_side {
                spec = spec.with_row_filter(filter.clone());
            }

            let result = subscribe_guarded(
                &self.core,
                format!("scoped:{}:{}:{}", table, principal, epoch),
                self.subscribe_timeout,
                spec,
                self.handler(principal, filter),
            )
            .await;
            match result {
                Ok(unsubscribe) => {
                    if self.registry.insert(epoch, table, EventFilter::All, unsubscribe)
                        || self.registry.epoch() == epoch
                    {
                        self.lock_failed().remove(&table);
                        report.subscribed.push(table);
                    }
                }
                Err(err) => {
                    crate::log_error!("scoped"; "{}", err);
                    if self.registry.epoch() == epoch {
                        self.lock_failed().insert(table);
                    }
                    report.failed.push(table);
                }
            }
        }
        report
    }

    fn handler(&self, principal: &str, filter: RowFilter) -> ChangeHandler {
        let cache = self.cache.clone();
        let map = self.map.clone();
        let consumers = self.consumers.clone();
        let principal = principal.to_string();
        Arc::new(move |event: ChangeEvent| {
            let cache = cache.clone();
            let map = map.clone();
            let consumers = consumers.clone();
            let principal = principal.clone();
            let relevant = filter.matches(&event);
            async move {
                // Without server-side filtering every row arrives here.
                if !relevant {
                    return;
                }
                apply_invalidations(cache.as_ref(), &map, &event, Some(&principal)).await;

                let callbacks: Vec<EventCallback> = consumers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter_map(|c| c.for_table(event.table).cloned())
                    .collect();
                for callback in callbacks {
                    callback(&event);
                }
            }
            .boxed()
        })
    }

    fn lock_consumers(&self) -> MutexGuard<'_, BTreeMap<String, ScopedCallbacks>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_principal(&self) -> MutexGuard<'_, Option<String>> {
        self.principal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_failed(&self) -> MutexGuard<'_, BTreeSet<Table>> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
