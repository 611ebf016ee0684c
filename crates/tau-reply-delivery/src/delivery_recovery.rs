//! Replay of durable deliveries left pending by a crash or an ambiguous failure.
//!
//! [`recover_pending_deliveries`] runs one bounded pass over the store.
//! [`DeliveryRecoveryLoop`] schedules passes on an interval and guarantees
//! that at most one pass is scanning the store at any time.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel_sender::{
    deliver_with_timeout, ChannelSender, DeliveryAttemptContext, DeliveryCancellation,
};
use crate::delivery_classifier::DeliveryErrorClass;
use crate::delivery_store::{DeliveryRecord, DeliveryState, DeliveryStore, DeliveryStoreError};
use crate::{current_unix_timestamp_ms, lock_unpoisoned};

pub const DEFAULT_RECOVERY_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_RECOVERY_PASS_BUDGET_MS: u64 = 8_000;
pub const DEFAULT_RECOVERY_ATTEMPT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 5;
pub const DEFAULT_FRESH_RECORD_GRACE_MS: u64 = 60_000;
/// Wait before recovery attempt n+1, indexed by attempts already made.
const RECOVERY_BACKOFF_MS: [u64; 4] = [5_000, 25_000, 120_000, 600_000];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    Startup,
    Interval,
    #[default]
    Manual,
}

impl RecoveryTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Interval => "interval",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for RecoveryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOptions {
    /// Wall-clock budget for one pass; records not reached are left untouched.
    pub pass_budget: Duration,
    pub attempt_timeout: Duration,
    /// Records that already used this many attempts are failed without a send.
    pub max_recovery_attempts: u32,
    /// Never-attempted `enqueued` records younger than this may still belong to
    /// a live dispatcher and are skipped.
    pub fresh_record_grace: Duration,
    pub trigger: RecoveryTrigger,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            pass_budget: Duration::from_millis(DEFAULT_RECOVERY_PASS_BUDGET_MS),
            attempt_timeout: Duration::from_millis(DEFAULT_RECOVERY_ATTEMPT_TIMEOUT_MS),
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            fresh_record_grace: Duration::from_millis(DEFAULT_FRESH_RECORD_GRACE_MS),
            trigger: RecoveryTrigger::Manual,
        }
    }
}

impl RecoveryOptions {
    pub fn with_trigger(mut self, trigger: RecoveryTrigger) -> Self {
        self.trigger = trigger;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RecoverySummary {
    pub recovered: usize,
    pub failed: usize,
    pub skipped: usize,
    pub trigger: RecoveryTrigger,
}

impl RecoverySummary {
    pub fn is_empty(&self) -> bool {
        self.recovered == 0 && self.failed == 0 && self.skipped == 0
    }
}

/// Delay required after `attempt_count` recovery attempts before the next one.
pub fn recovery_backoff(attempt_count: u32) -> Duration {
    if attempt_count == 0 {
        return Duration::ZERO;
    }
    let index = usize::try_from(attempt_count - 1)
        .unwrap_or(usize::MAX)
        .min(RECOVERY_BACKOFF_MS.len() - 1);
    Duration::from_millis(RECOVERY_BACKOFF_MS[index])
}

enum RecordOutcome {
    Recovered,
    Failed,
    Skipped,
}

/// Runs one recovery pass over every non-terminal record in `store`.
pub async fn recover_pending_deliveries(
    store: &dyn DeliveryStore,
    sender: &dyn ChannelSender,
    options: &RecoveryOptions,
) -> Result<RecoverySummary, DeliveryStoreError> {
    let deadline = Instant::now() + options.pass_budget;
    let records = store.load_pending_deliveries().await?;
    let mut summary = RecoverySummary {
        trigger: options.trigger,
        ..RecoverySummary::default()
    };

    let total = records.len();
    for (index, record) in records.into_iter().enumerate() {
        let now = Instant::now();
        if now >= deadline {
            let remaining = total - index;
            summary.skipped += remaining;
            tracing::debug!(
                trigger = options.trigger.as_str(),
                remaining,
                "delivery recovery budget exhausted"
            );
            break;
        }
        let queue_id = record.queue_id.clone();
        let outcome = match recover_record(store, sender, options, record, deadline - now).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(
                    queue_id = queue_id.as_str(),
                    error = %error,
                    "delivery recovery store update failed"
                );
                RecordOutcome::Skipped
            }
        };
        match outcome {
            RecordOutcome::Recovered => summary.recovered += 1,
            RecordOutcome::Failed => summary.failed += 1,
            RecordOutcome::Skipped => summary.skipped += 1,
        }
    }

    if !summary.is_empty() {
        tracing::info!(
            trigger = summary.trigger.as_str(),
            recovered = summary.recovered,
            failed = summary.failed,
            skipped = summary.skipped,
            "delivery recovery pass finished"
        );
    }
    Ok(summary)
}

async fn recover_record(
    store: &dyn DeliveryStore,
    sender: &dyn ChannelSender,
    options: &RecoveryOptions,
    record: DeliveryRecord,
    budget_left: Duration,
) -> Result<RecordOutcome, DeliveryStoreError> {
    let queue_id = record.queue_id.as_str();
    // The sender already reported success for this record; only the ack was
    // lost, so a resend would deliver the reply twice.
    if record.state == DeliveryState::DeliveredUnconfirmed {
        store.ack_delivery(queue_id).await?;
        tracing::debug!(queue_id, "acked delivered record without resend");
        return Ok(RecordOutcome::Recovered);
    }
    if record.attempt_count >= options.max_recovery_attempts {
        let reason = format!(
            "recovery attempts exhausted after {}: {}",
            record.attempt_count,
            record.last_error.as_deref().unwrap_or("unknown error")
        );
        store.fail_delivery(queue_id, &reason).await?;
        tracing::warn!(queue_id, attempts = record.attempt_count, "delivery recovery gave up");
        return Ok(RecordOutcome::Failed);
    }

    let now_ms = current_unix_timestamp_ms();
    let backoff_ms = u64::try_from(recovery_backoff(record.attempt_count).as_millis())
        .unwrap_or(u64::MAX);
    if let Some(last_attempt) = record.last_attempt_unix_ms {
        if now_ms < last_attempt.saturating_add(backoff_ms) {
            tracing::debug!(queue_id, attempts = record.attempt_count, "recovery backoff pending");
            return Ok(RecordOutcome::Skipped);
        }
    }
    let grace_ms = u64::try_from(options.fresh_record_grace.as_millis()).unwrap_or(u64::MAX);
    if record.state == DeliveryState::Enqueued
        && record.attempt_count == 0
        && now_ms < record.updated_unix_ms.saturating_add(grace_ms)
    {
        tracing::debug!(queue_id, "record may belong to a live dispatcher");
        return Ok(RecordOutcome::Skipped);
    }

    let record = store.begin_recovery_attempt(queue_id).await?;
    let queue_id = record.queue_id.as_str();
    let context = DeliveryAttemptContext {
        kind: record.kind,
        route: Some(Arc::new(record.route.clone())),
        queue_id: Some(record.queue_id.clone()),
        attempt: usize::try_from(record.attempt_count).unwrap_or(usize::MAX),
        cancellation: DeliveryCancellation::new(),
    };
    let timeout = if options.attempt_timeout.is_zero() {
        budget_left
    } else {
        options.attempt_timeout.min(budget_left)
    };
    match deliver_with_timeout(sender, &record.payload, &context, timeout).await {
        Ok(()) => {
            store.mark_delivery_delivered(queue_id).await?;
            store.ack_delivery(queue_id).await?;
            tracing::debug!(queue_id, route = %record.route.describe(), "recovered delivery");
            Ok(RecordOutcome::Recovered)
        }
        Err(error) => {
            let class = error.classify();
            let detail = error.detail();
            tracing::debug!(
                queue_id,
                class = class.as_str(),
                error = %detail,
                "delivery recovery attempt failed"
            );
            match class {
                DeliveryErrorClass::Permanent => {
                    store.fail_delivery(queue_id, &detail).await?;
                    Ok(RecordOutcome::Failed)
                }
                DeliveryErrorClass::TransientAmbiguous => {
                    store.mark_delivery_uncertain(queue_id, &detail).await?;
                    Ok(RecordOutcome::Skipped)
                }
                DeliveryErrorClass::TransientDefinitive => {
                    store.note_delivery_error(queue_id, &detail).await?;
                    Ok(RecordOutcome::Skipped)
                }
            }
        }
    }
}

type PassResult = Result<RecoverySummary, Arc<DeliveryStoreError>>;
type SharedPass = Shared<BoxFuture<'static, PassResult>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecoveryLoopConfig {
    pub poll_interval: Duration,
    pub recovery: RecoveryOptions,
}

impl Default for DeliveryRecoveryLoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_RECOVERY_POLL_INTERVAL_MS),
            recovery: RecoveryOptions::default(),
        }
    }
}

struct RecoveryLoopInner {
    store: Arc<dyn DeliveryStore>,
    sender: Arc<dyn ChannelSender>,
    recovery: RecoveryOptions,
    in_flight: Mutex<Option<SharedPass>>,
    last_summary: Mutex<Option<RecoverySummary>>,
}

impl RecoveryLoopInner {
    /// Starts a pass, or joins the one already scanning the store.
    fn trigger(self: &Arc<Self>, trigger: RecoveryTrigger) -> SharedPass {
        let mut in_flight = lock_unpoisoned(&self.in_flight);
        if let Some(pass) = in_flight.as_ref() {
            if pass.peek().is_none() {
                tracing::debug!(trigger = trigger.as_str(), "joining in-flight recovery pass");
                return pass.clone();
            }
        }
        let inner = Arc::clone(self);
        let pass = async move {
            let options = inner.recovery.clone().with_trigger(trigger);
            let result =
                recover_pending_deliveries(inner.store.as_ref(), inner.sender.as_ref(), &options)
                    .await;
            match result {
                Ok(summary) => {
                    *lock_unpoisoned(&inner.last_summary) = Some(summary);
                    Ok(summary)
                }
                Err(error) => {
                    tracing::warn!(
                        trigger = trigger.as_str(),
                        error = %error,
                        "delivery recovery pass failed"
                    );
                    Err(Arc::new(error))
                }
            }
        }
        .boxed()
        .shared();
        *in_flight = Some(pass.clone());
        pass
    }

    fn pending_pass(&self) -> Option<SharedPass> {
        lock_unpoisoned(&self.in_flight)
            .as_ref()
            .filter(|pass| pass.peek().is_none())
            .cloned()
    }
}

struct RecoveryLoopTask {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Background scheduler for recovery passes.
pub struct DeliveryRecoveryLoop {
    inner: Arc<RecoveryLoopInner>,
    poll_interval: Duration,
    task: Mutex<Option<RecoveryLoopTask>>,
}

impl fmt::Debug for DeliveryRecoveryLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryRecoveryLoop")
            .field("poll_interval", &self.poll_interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl DeliveryRecoveryLoop {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        sender: Arc<dyn ChannelSender>,
        config: DeliveryRecoveryLoopConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RecoveryLoopInner {
                store,
                sender,
                recovery: config.recovery,
                in_flight: Mutex::new(None),
                last_summary: Mutex::new(None),
            }),
            poll_interval: config.poll_interval,
            task: Mutex::new(None),
        }
    }

    /// Starts the timer and an immediate startup pass. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            anyhow::bail!("delivery recovery poll interval must be greater than zero");
        }
        let mut task = lock_unpoisoned(&self.task);
        if task.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .context("delivery recovery loop requires an active tokio runtime")?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let poll_interval = self.poll_interval;
        let handle = runtime.spawn(run_recovery_loop(inner, poll_interval, shutdown_rx));
        *task = Some(RecoveryLoopTask {
            shutdown_tx,
            task: handle,
        });
        tracing::debug!(
            poll_interval_ms = u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX),
            "delivery recovery loop started"
        );
        Ok(())
    }

    /// Runs a manual pass, or waits for the pass already in flight.
    pub async fn run_now(&self) -> Result<RecoverySummary> {
        self.inner
            .trigger(RecoveryTrigger::Manual)
            .await
            .map_err(|error| anyhow::anyhow!("delivery recovery pass failed: {error}"))
    }

    /// Stops the timer and waits for any in-flight pass to finish.
    pub async fn stop(&self) {
        let task = lock_unpoisoned(&self.task).take();
        if let Some(RecoveryLoopTask { shutdown_tx, task }) = task {
            let _ = shutdown_tx.send(());
            if let Err(error) = task.await {
                tracing::warn!(error = %error, "delivery recovery loop task failed");
            }
        }
        if let Some(pass) = self.inner.pending_pass() {
            let _ = pass.await;
        }
    }

    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.task).is_some()
    }

    pub fn last_summary(&self) -> Option<RecoverySummary> {
        *lock_unpoisoned(&self.inner.last_summary)
    }
}

async fn run_recovery_loop(
    inner: Arc<RecoveryLoopInner>,
    poll_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut trigger = RecoveryTrigger::Startup;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let _ = inner.trigger(trigger).await;
                trigger = RecoveryTrigger::Interval;
            }
            _ = &mut shutdown_rx => {
                tracing::debug!("delivery recovery loop stopped");
                break;
            }
        }
    }
}
