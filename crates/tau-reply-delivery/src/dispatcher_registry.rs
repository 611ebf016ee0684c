//! Gateway-owned registry of live reply dispatchers.
//!
//! Restart and shutdown sequencing uses it to wait until every conversation
//! has flushed its outbound replies.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::lock_unpoisoned;

/// View of one dispatcher exposed to the registry.
#[async_trait]
pub trait DispatcherHandle: Send + Sync {
    /// Outstanding work including the completion reservation.
    fn pending(&self) -> usize;

    /// Resolves once no accepted payload is still in flight.
    async fn wait_for_idle(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DispatcherId(u64);

impl DispatcherId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatcher-{}", self.0)
    }
}

#[derive(Default)]
struct DispatcherRegistryInner {
    next_id: AtomicU64,
    dispatchers: Mutex<BTreeMap<DispatcherId, Weak<dyn DispatcherHandle>>>,
}

/// Cheaply cloneable registry handle passed to dispatcher constructors.
#[derive(Clone, Default)]
pub struct DispatcherRegistry {
    inner: Arc<DispatcherRegistryInner>,
}

impl fmt::Debug for DispatcherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherRegistry")
            .field("active_dispatchers", &self.active_dispatchers())
            .finish()
    }
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: &Arc<dyn DispatcherHandle>) -> DispatcherId {
        let id = DispatcherId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        lock_unpoisoned(&self.inner.dispatchers).insert(id, Arc::downgrade(handle));
        id
    }

    /// Returns false when `id` was not registered.
    pub fn unregister(&self, id: DispatcherId) -> bool {
        lock_unpoisoned(&self.inner.dispatchers).remove(&id).is_some()
    }

    /// Live dispatchers; entries whose dispatcher was dropped are pruned.
    pub fn active_dispatchers(&self) -> usize {
        self.live_handles().len()
    }

    pub fn total_pending(&self) -> usize {
        self.live_handles()
            .iter()
            .map(|handle| handle.pending())
            .fold(0_usize, usize::saturating_add)
    }

    /// Waits until every registered dispatcher is idle.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_all_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let handles = self.live_handles();
            if handles.is_empty() {
                return true;
            }
            let waits = join_all(handles.iter().map(|handle| handle.wait_for_idle()));
            if tokio::time::timeout_at(deadline, waits).await.is_err() {
                tracing::warn!(
                    active_dispatchers = handles.len(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "timed out waiting for reply dispatchers to go idle"
                );
                return false;
            }
            // Dispatchers registered while waiting get their own round.
            let current = self.live_handles();
            let settled = current.len() == handles.len()
                && current
                    .iter()
                    .zip(handles.iter())
                    .all(|(left, right)| Arc::ptr_eq(left, right));
            if settled {
                return true;
            }
        }
    }

    fn live_handles(&self) -> Vec<Arc<dyn DispatcherHandle>> {
        let mut dispatchers = lock_unpoisoned(&self.inner.dispatchers);
        dispatchers.retain(|_, handle| handle.strong_count() > 0);
        dispatchers.values().filter_map(Weak::upgrade).collect()
    }
}
