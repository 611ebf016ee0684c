//! Outbound reply delivery for Tau channel conversations.
//!
//! Provides per-conversation ordered reply dispatch with dedup, failure
//! classification, bounded inline retries, a write-ahead delivery store, and a
//! background recovery loop that replays deliveries left pending by a crash.

use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod channel_sender;
pub mod delivery_classifier;
pub mod delivery_config;
pub mod delivery_recovery;
pub mod delivery_retry;
pub mod delivery_store;
pub mod dispatcher_registry;
pub mod human_delay;
pub mod reply_dispatcher;
pub mod reply_normalize;
pub mod reply_payload;

pub use channel_sender::*;
pub use delivery_classifier::*;
pub use delivery_config::*;
pub use delivery_recovery::*;
pub use delivery_retry::*;
pub use delivery_store::*;
pub use dispatcher_registry::*;
pub use human_delay::*;
pub use reply_dispatcher::*;
pub use reply_normalize::*;
pub use reply_payload::*;

/// Milliseconds since the Unix epoch; 0 if the clock is before the epoch.
pub fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
