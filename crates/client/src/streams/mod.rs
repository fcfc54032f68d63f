//! Change-stream subscription managers.
//!
//! [`GlobalStreams`] holds one subscription per shared table and turns every
//! change into cache invalidations. [`ScopedStreams`] holds one subscription
//! per principal-scoped table and fans each change out to any number of
//! registered UI consumers.
//!
//! Each manager owns a [`SubscriptionRegistry`]; nothing else keeps a
//! subscription handle. Managers borrow the transport from the
//! [`ConnectionCore`] only while subscribing.

mod global;
mod scoped;

pub use global::GlobalStreams;
pub use scoped::{EventCallback, ScopedCallbacks, ScopedStreams};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agora_shared::{ChangeEvent, EventFilter, SubscriptionSpec, SyncError, Table};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::cache::{InvalidationMap, QueryCache};
use crate::connection::{ChangeHandler, ConnectionCore, Unsubscribe};
use crate::guard::GuardOptions;

/// One live transport subscription.
pub struct SubscriptionEntry {
    pub id: Uuid,
    pub table: Table,
    pub filter: EventFilter,
    pub created_at: DateTime<Utc>,
    unsubscribe: Arc<Unsubscribe>,
}

/// Debug view of a [`SubscriptionEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: Uuid,
    pub table: Table,
    pub filter: EventFilter,
    pub created_at: DateTime<Utc>,
}

/// Result of initializing or resubscribing a manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub subscribed: Vec<Table>,
    pub failed: Vec<Table>,
}

impl InitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<SubscriptionEntry>,
    /// Bumped by every `clear`; subscribe passes started under an older
    /// epoch may no longer register handles.
    epoch: u64,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    /// Current epoch. A subscribe pass captures it before its first await.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Keep a handle obtained during `epoch`. When the registry was cleared
    /// since, or `table` is already registered under a different handle, the
    /// handle is revoked instead and `false` is returned.
    fn insert(
        &self,
        epoch: u64,
        table: Table,
        filter: EventFilter,
        unsubscribe: Arc<Unsubscribe>,
    ) -> bool {
        {
            let mut state = self.lock();
            if state.epoch == epoch {
                let held = state
                    .entries
                    .iter()
                    .find(|entry| entry.table == table)
                    .map(|entry| Arc::ptr_eq(&entry.unsubscribe, &unsubscribe));
                match held {
                    // Joined passes of one epoch receive the same shared handle.
                    Some(true) => return true,
                    Some(false) => {}
                    None => {
                        state.entries.push(SubscriptionEntry {
                            id: Uuid::new_v4(),
                            table,
                            filter,
                            created_at: Utc::now(),
                            unsubscribe,
                        });
                        return true;
                    }
                }
            }
        }
        unsubscribe.call();
        false
    }

    pub fn contains(&self, table: Table) -> bool {
        self.lock().entries.iter().any(|entry| entry.table == table)
    }

    pub fn tables(&self) -> Vec<Table> {
        let mut tables: Vec<Table> = self.lock().entries.iter().map(|entry| entry.table).collect();
        tables.sort();
        tables.dedup();
        tables
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn info(&self) -> Vec<SubscriptionInfo> {
        self.lock()
            .entries
            .iter()
            .map(|entry| SubscriptionInfo {
                id: entry.id,
                table: entry.table,
                filter: entry.filter,
                created_at: entry.created_at,
            })
            .collect()
    }

    /// Revoke and forget every entry and start a new epoch. Returns how many
    /// entries were removed.
    fn clear(&self) -> usize {
        let drained: Vec<SubscriptionEntry> = {
            let mut state = self.lock();
            state.epoch += 1;
            state.entries.drain(..).collect()
        };
        for entry in &drained {
            entry.unsubscribe.call();
        }
        drained.len()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Subscribe on the core's current transport under a guard timeout.
async fn subscribe_guarded(
    core: &ConnectionCore,
    guard_key: String,
    timeout: Duration,
    spec: SubscriptionSpec,
    handler: ChangeHandler,
) -> Result<Arc<Unsubscribe>, SyncError> {
    let table = spec.table;
    let transport = core.transport();
    core.guard()
        .with_timeout(
            GuardOptions::keyed(guard_key, timeout)
                .with_message(format!("subscribing to {} timed out", table)),
            move |_| async move { transport.subscribe(spec, handler).await.map(Arc::new) },
        )
        .await
        .map_err(|err| SyncError::SubscriptionFailed {
            table,
            reason: err.to_string(),
        })
}

/// Resolve and apply the invalidations for one event, in rule order.
/// Returns the number of targets invalidated.
async fn apply_invalidations(
    cache: &dyn QueryCache,
    map: &InvalidationMap,
    event: &ChangeEvent,
    principal: Option<&str>,
) -> usize {
    let targets = map.resolve(event, principal);
    let mut applied = 0;
    for target in &targets {
        match cache.invalidate(target).await {
            Ok(()) => applied += 1,
            Err(err) => {
                crate::log_warn!("streams"; "invalidating {} after {} {} failed: {}", target, event.table, event.kind, err);
            }
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(calls: &Arc<AtomicUsize>) -> Arc<Unsubscribe> {
        let calls = calls.clone();
        Arc::new(Unsubscribe::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_handles_from_a_cleared_epoch_are_revoked() {
        let registry = SubscriptionRegistry::default();
        let revoked = Arc::new(AtomicUsize::new(0));
        let stale = registry.epoch();

        registry.clear();
        assert!(!registry.insert(stale, Table::Posts, EventFilter::All, counted(&revoked)));
        assert_eq!(revoked.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());

        let current = registry.epoch();
        assert!(registry.insert(current, Table::Posts, EventFilter::All, counted(&revoked)));
        assert_eq!(registry.tables(), vec![Table::Posts]);
    }

    #[test]
    fn test_second_handle_for_a_table_is_revoked() {
        let registry = SubscriptionRegistry::default();
        let revoked = Arc::new(AtomicUsize::new(0));
        let epoch = registry.epoch();

        assert!(registry.insert(epoch, Table::Likes, EventFilter::All, counted(&revoked)));
        assert!(!registry.insert(epoch, Table::Likes, EventFilter::All, counted(&revoked)));
        assert_eq!(registry.len(), 1);
        assert_eq!(revoked.load(Ordering::SeqCst), 1);

        let held = registry.lock().entries[0].unsubscribe.clone();
        assert!(registry.insert(epoch, Table::Likes, EventFilter::All, held));
        assert_eq!(revoked.load(Ordering::SeqCst), 1);

        assert_eq!(registry.clear(), 1);
        assert_eq!(revoked.load(Ordering::SeqCst), 2);
    }
}
