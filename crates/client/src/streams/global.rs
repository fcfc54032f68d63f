use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agora_shared::{ChangeEvent, EventFilter, SubscriptionSpec, Table};
use futures_util::FutureExt;

use super::{apply_invalidations, subscribe_guarded, InitReport, SubscriptionInfo, SubscriptionRegistry};
use crate::cache::{InvalidationMap, QueryCache};
use crate::config::SyncConfig;
use crate::connection::{ChangeHandler, ConnectionCore};

/// Shared-table change streams mapped to cache invalidations.
pub struct GlobalStreams {
    core: Arc<ConnectionCore>,
    cache: Arc<dyn QueryCache>,
    map: Arc<InvalidationMap>,
    registry: SubscriptionRegistry,
    failed: Mutex<BTreeSet<Table>>,
    active: AtomicBool,
    subscribe_timeout: Duration,
    events: Arc<AtomicU64>,
}

impl GlobalStreams {
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
            failed: Mutex::new(BTreeSet::new()),
            active: AtomicBool::new(false),
            subscribe_timeout: config.subscribe_timeout,
            events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe once per shared table to every event type.
    ///
    /// A no-op while already active. Tables that fail to subscribe are
    /// reported and left for [`GlobalStreams::resubscribe_failed`].
    pub async fn initialize(&self) -> InitReport {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            crate::log_debug!("streams"; "global streams already active");
            return InitReport {
                subscribed: self.registry.tables(),
                failed: self.failed_tables(),
            };
        }

        let report = self.subscribe_tables(Table::GLOBAL.to_vec()).await;
        crate::log_info!(
            "streams";
            "global streams initialized: {} subscribed, {} failed",
            report.subscribed.len(),
            report.failed.len()
        );
        report
    }

    /// Retry only the tables whose subscription failed. Called on the
    /// caller's own schedule, never in a loop.
    pub async fn resubscribe_failed(&self) -> InitReport {
        if !self.is_active() {
            return InitReport::default();
        }
        let pending: Vec<Table> = std::mem::take(&mut *self.lock_failed())
            .into_iter()
            .collect();
        self.subscribe_tables(pending).await
    }

    /// Unsubscribe everything. Safe to call repeatedly.
    pub fn cleanup(&self) {
        let removed = self.registry.clear();
        self.lock_failed().clear();
        if self.active.swap(false, Ordering::AcqRel) {
            crate::log_info!("streams"; "global streams cleaned up ({} subscription(s))", removed);
        }
    }

    /// Tear down and subscribe again on the current transport.
    pub async fn rebind(&self) -> InitReport {
        self.cleanup();
        self.initialize().await
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
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

    /// Change events handled since construction.
    pub fn events_processed(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Subscribe `tables` on the current transport. A pass stops as soon as
    /// a `cleanup` supersedes it; handles it obtained afterwards are revoked.
    async fn subscribe_tables(&self, tables: Vec<Table>) -> InitReport {
        let epoch = self.registry.epoch();
        let mut report = InitReport::default();
        for table in tables {
            if self.registry.epoch() != epoch {
                crate::log_debug!("streams"; "subscribe pass superseded by cleanup");
                break;
            }
            if self.registry.contains(table) {
                report.subscribed.push(table);
                continue;
            }
            let result = subscribe_guarded(
                &self.core,
                format!("streams:{}:{}", table, epoch),
                self.subscribe_timeout,
                SubscriptionSpec::all_events(table),
                self.handler(),
            )
            .await;
            match result {
                Ok(unsubscribe) => {
                    if self.registry.insert(epoch, table, EventFilter::All, unsubscribe)
                        || self.registry.epoch() == epoch
                    {
                        report.subscribed.push(table);
                    } else {
                        crate::log_debug!("streams"; "dropped {} subscription from a superseded pass", table);
                    }
                }
                Err(err) => {
                    crate::log_error!("streams"; "{}", err);
                    if self.registry.epoch() == epoch {
                        self.lock_failed().insert(table);
                    }
                    report.failed.push(table);
                }
            }
        }
        report
    }

    fn handler(&self) -> ChangeHandler {
        let cache = self.cache.clone();
        let map = self.map.clone();
        let events = self.events.clone();
        Arc::new(move |event: ChangeEvent| {
            let cache = cache.clone();
            let map = map.clone();
            let events = events.clone();
            async move {
                events.fetch_add(1, Ordering::Relaxed);
                apply_invalidations(cache.as_ref(), &map, &event, None).await;
            }
            .boxed()
        })
    }

    fn lock_failed(&self) -> MutexGuard<'_, BTreeSet<Table>> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
