//! Durable delivery store contract and lifecycle records.
//!
//! A record is written before a payload is handed to a sender and advanced as
//! the attempt resolves. Anything left in a pending state after a crash is
//! picked up by the recovery loop.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reply_payload::{DispatchKind, DurableRoute, ReplyPayload};
use crate::{current_unix_timestamp_ms, lock_unpoisoned};

mod file_store;

pub use file_store::{FileDeliveryStore, FileDeliveryStoreConfig};

pub const DELIVERY_RECORD_SCHEMA_VERSION: u32 = 1;
const DELIVERY_QUEUE_ID_PREFIX: &str = "dlv";

static DELIVERY_QUEUE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn delivery_record_schema_version() -> u32 {
    DELIVERY_RECORD_SCHEMA_VERSION
}

/// Lifecycle state of one persisted delivery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Enqueued,
    /// Sender reported success; acknowledgement not yet recorded.
    DeliveredUnconfirmed,
    Acked,
    Failed,
    /// Outcome unknown; left for the recovery loop.
    Uncertain,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::DeliveredUnconfirmed => "delivered_unconfirmed",
            Self::Acked => "acked",
            Self::Failed => "failed",
            Self::Uncertain => "uncertain",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::Failed)
    }

    /// States the recovery loop must revisit.
    pub fn is_pending(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: DeliveryState) -> bool {
        match self {
            Self::Enqueued => next != Self::Enqueued,
            Self::DeliveredUnconfirmed => next == Self::Acked,
            Self::Uncertain => matches!(
                next,
                Self::Uncertain | Self::DeliveredUnconfirmed | Self::Acked | Self::Failed
            ),
            Self::Acked | Self::Failed => false,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for [`DeliveryStore::enqueue_delivery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeliveryRecord {
    pub route: DurableRoute,
    pub kind: DispatchKind,
    pub payload: ReplyPayload,
}

/// Persisted lifecycle record for one payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryRecord {
    #[serde(default = "delivery_record_schema_version")]
    pub schema_version: u32,
    pub queue_id: String,
    pub route: DurableRoute,
    pub kind: DispatchKind,
    pub payload: ReplyPayload,
    pub state: DeliveryState,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Recovery attempts started for this record.
    #[serde(default)]
    pub attempt_count: u32,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
    #[serde(default)]
    pub last_attempt_unix_ms: Option<u64>,
}

impl DeliveryRecord {
    pub(crate) fn from_new(queue_id: String, record: NewDeliveryRecord) -> Self {
        let now = current_unix_timestamp_ms();
        Self {
            schema_version: DELIVERY_RECORD_SCHEMA_VERSION,
            queue_id,
            route: record.route,
            kind: record.kind,
            payload: record.payload,
            state: DeliveryState::Enqueued,
            last_error: None,
            attempt_count: 0,
            created_unix_ms: now,
            updated_unix_ms: now,
            last_attempt_unix_ms: None,
        }
    }

    /// Applies a validated state transition.
    pub(crate) fn transition(
        &mut self,
        next: DeliveryState,
        error: Option<&str>,
    ) -> Result<(), DeliveryStoreError> {
        if !self.state.can_transition_to(next) {
            return Err(DeliveryStoreError::InvalidTransition {
                queue_id: self.queue_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if let Some(error) = error {
            self.last_error = Some(error.to_string());
        }
        self.updated_unix_ms = current_unix_timestamp_ms();
        Ok(())
    }

    pub(crate) fn begin_attempt(&mut self) -> Result<(), DeliveryStoreError> {
        if self.state.is_terminal() {
            return Err(DeliveryStoreError::InvalidTransition {
                queue_id: self.queue_id.clone(),
                from: self.state,
                to: self.state,
            });
        }
        let now = current_unix_timestamp_ms();
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_unix_ms = Some(now);
        self.updated_unix_ms = now;
        Ok(())
    }

    /// Refreshes `updated_unix_ms` so recovery treats the record as owned.
    pub(crate) fn touch(&mut self) -> Result<(), DeliveryStoreError> {
        if self.state.is_terminal() {
            return Err(DeliveryStoreError::InvalidTransition {
                queue_id: self.queue_id.clone(),
                from: self.state,
                to: self.state,
            });
        }
        self.updated_unix_ms = current_unix_timestamp_ms();
        Ok(())
    }

    pub(crate) fn note_error(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
        self.updated_unix_ms = current_unix_timestamp_ms();
    }
}

#[derive(Debug, Error)]
pub enum DeliveryStoreError {
    #[error("delivery record '{0}' not found")]
    NotFound(String),
    #[error("delivery record '{queue_id}' cannot transition from {from} to {to}")]
    InvalidTransition {
        queue_id: String,
        from: DeliveryState,
        to: DeliveryState,
    },
    #[error("delivery store io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("delivery store serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Task(String),
}

/// Write-ahead store consumed by the dispatcher and the recovery loop.
///
/// Every mutation is a single-record read-modify-write. Implementations may
/// discard acknowledged records.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn enqueue_delivery(&self, record: NewDeliveryRecord)
        -> Result<String, DeliveryStoreError>;

    async fn mark_delivery_delivered(&self, queue_id: &str) -> Result<(), DeliveryStoreError>;

    async fn ack_delivery(&self, queue_id: &str) -> Result<(), DeliveryStoreError>;

    async fn fail_delivery(&self, queue_id: &str, error: &str) -> Result<(), DeliveryStoreError>;

    async fn mark_delivery_uncertain(
        &self,
        queue_id: &str,
        error: &str,
    ) -> Result<(), DeliveryStoreError>;

    /// Bumps the recovery attempt counter before a replay is sent.
    async fn begin_recovery_attempt(
        &self,
        queue_id: &str,
    ) -> Result<DeliveryRecord, DeliveryStoreError>;

    /// Renews a live dispatcher's claim on a record. Recovery leaves
    /// never-attempted records alone until the claim is older than its grace.
    async fn touch_delivery(&self, queue_id: &str) -> Result<(), DeliveryStoreError>;

    /// Records an error without changing the lifecycle state.
    async fn note_delivery_error(&self, queue_id: &str, error: &str)
        -> Result<(), DeliveryStoreError>;

    /// Returns every non-terminal record, oldest first.
    async fn load_pending_deliveries(&self) -> Result<Vec<DeliveryRecord>, DeliveryStoreError>;

    async fn get_delivery(
        &self,
        queue_id: &str,
    ) -> Result<Option<DeliveryRecord>, DeliveryStoreError>;
}

pub(crate) fn next_delivery_queue_id() -> String {
    let now = current_unix_timestamp_ms();
    let suffix = DELIVERY_QUEUE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let salt = rand::thread_rng().gen::<u16>();
    format!("{DELIVERY_QUEUE_ID_PREFIX}-{now}-{suffix:04}-{salt:04x}")
}

pub(crate) fn sort_oldest_first(records: &mut [DeliveryRecord]) {
    records.sort_by(|left, right| {
        left.created_unix_ms
            .cmp(&right.created_unix_ms)
            .then_with(|| left.queue_id.cmp(&right.queue_id))
    });
}

/// In-process store; keeps acknowledged and failed records for inspection.
#[derive(Debug, Default)]
pub struct MemoryDeliveryStore {
    records: Mutex<BTreeMap<String, DeliveryRecord>>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record as-is; used to seed crash-recovery scenarios.
    pub fn insert_record(&self, record: DeliveryRecord) {
        lock_unpoisoned(&self.records).insert(record.queue_id.clone(), record);
    }

    pub fn records(&self) -> Vec<DeliveryRecord> {
        let mut records = lock_unpoisoned(&self.records)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sort_oldest_first(&mut records);
        records
    }

    fn update<F>(&self, queue_id: &str, mutate: F) -> Result<DeliveryRecord, DeliveryStoreError>
    where
        F: FnOnce(&mut DeliveryRecord) -> Result<(), DeliveryStoreError>,
    {
        let mut records = lock_unpoisoned(&self.records);
        let record = records
            .get_mut(queue_id)
            .ok_or_else(|| DeliveryStoreError::NotFound(queue_id.to_string()))?;
        let mut updated = record.clone();
        mutate(&mut updated)?;
        *record = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    async fn enqueue_delivery(
        &self,
        record: NewDeliveryRecord,
    ) -> Result<String, DeliveryStoreError> {
        let queue_id = next_delivery_queue_id();
        let record = DeliveryRecord::from_new(queue_id.clone(), record);
        lock_unpoisoned(&self.records).insert(queue_id.clone(), record);
        Ok(queue_id)
    }

    async fn mark_delivery_delivered(&self, queue_id: &str) -> Result<(), DeliveryStoreError> {
        self.update(queue_id, |record| {
            record.transition(DeliveryState::DeliveredUnconfirmed, None)
        })
        .map(|_| ())
    }

    async fn ack_delivery(&self, queue_id: &str) -> Result<(), DeliveryStoreError> {
        self.update(queue_id, |record| record.transition(DeliveryState::Acked, None))
            .map(|_| ())
    }

    async fn fail_delivery(&self, queue_id: &str, error: &str) -> Result<(), DeliveryStoreError> {
        self.update(queue_id, |record| {
            record.transition(DeliveryState::Failed, Some(error))
        })
        .map(|_| ())
    }

    async fn mark_delivery_uncertain(
        &self,
        queue_id: &str,
        error: &str,
    ) -> Result<(), DeliveryStoreError> {
        self.update(queue_id, |record| {
            record.transition(DeliveryState::Uncertain, Some(error))
        })
        .map(|_| ())
    }

    async fn begin_recovery_attempt(
        &self,
        queue_id: &str,
    ) -> Result<DeliveryRecord, DeliveryStoreError> {
        self.update(queue_id, DeliveryRecord::begin_attempt)
    }

    async fn touch_delivery(&self, queue_id: &str) -> Result<(), DeliveryStoreError> {
        self.update(queue_id, DeliveryRecord::touch).map(|_| ())
    }

    async fn note_delivery_error(
        &self,
        queue_id: &str,
        error: &str,
    ) -> Result<(), DeliveryStoreError> {
        self.update(queue_id, |record| {
            record.note_error(error);
            Ok(())
        })
        .map(|_| ())
    }

    async fn load_pending_deliveries(&self) -> Result<Vec<DeliveryRecord>, DeliveryStoreError> {
        let mut pending = lock_unpoisoned(&self.records)
            .values()
            .filter(|record| record.state.is_pending())
            .cloned()
            .collect::<Vec<_>>();
        sort_oldest_first(&mut pending);
        Ok(pending)
    }

    async fn get_delivery(
        &self,
        queue_id: &str,
    ) -> Result<Option<DeliveryRecord>, DeliveryStoreError> {
        Ok(lock_unpoisoned(&self.records).get(queue_id).cloned())
    }
}
