//! Per-conversation reply dispatcher.
//!
//! Each dispatcher owns one worker task that drains an ordered job channel, so
//! payload N is fully settled (sent, skipped, or failed) before payload N+1 is
//! attempted. Work is counted against a pending counter that starts with a
//! single reservation; the reservation is released by [`ReplyDispatcher::mark_complete`].

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};

use crate::channel_sender::{
    deliver_with_timeout, ChannelSender, DeliveryAttemptContext, DeliveryCancellation,
};
use crate::delivery_classifier::{ChannelDeliveryError, DeliveryErrorClass};
use crate::delivery_retry::{retry_async, RetryAttempt, RetryPolicy};
use crate::delivery_store::{DeliveryStore, NewDeliveryRecord};
use crate::dispatcher_registry::{DispatcherHandle, DispatcherId, DispatcherRegistry};
use crate::human_delay::HumanDelayConfig;
use crate::lock_unpoisoned;
use crate::reply_normalize::{
    DefaultReplyNormalizer, NormalizeOutcome, ReplyNormalizer, SkipReason,
};
use crate::reply_payload::{DispatchKind, DurableRoute, ReplyPayload};

pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 30_000;
const LOG_PREVIEW_CHARS: usize = 80;

/// Observer callbacks invoked by the dispatcher worker. All methods default to no-ops.
pub trait DispatcherHooks: Send + Sync {
    fn on_reply_start(&self, _kind: DispatchKind, _payload: &ReplyPayload) {}

    fn on_skip(&self, _kind: DispatchKind, _payload: &ReplyPayload, _reason: SkipReason) {}

    fn on_error(&self, _kind: DispatchKind, _failure: &DispatchFailure) {}

    /// Called once, when the pending counter reaches zero.
    fn on_idle(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDispatcherHooks;

impl DispatcherHooks for NoopDispatcherHooks {}

/// Failure settled for one payload after the retry engine gave up.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub class: DeliveryErrorClass,
    pub error: ChannelDeliveryError,
    /// Sender calls made for this payload.
    pub attempts: usize,
    pub queue_id: Option<String>,
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.class.as_str(),
            self.attempts,
            self.error.detail()
        )
    }
}

/// Terminal result of one enqueued payload.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Sent,
    Skipped(SkipReason),
    Failed(DispatchFailure),
}

impl DispatchOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Payloads accepted into the queue since the dispatcher was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuedCounts {
    pub tool: usize,
    pub block: usize,
    pub final_: usize,
}

impl QueuedCounts {
    pub fn get(&self, kind: DispatchKind) -> usize {
        match kind {
            DispatchKind::Tool => self.tool,
            DispatchKind::Block => self.block,
            DispatchKind::Final => self.final_,
        }
    }

    pub fn total(&self) -> usize {
        self.tool + self.block + self.final_
    }

    fn bump(&mut self, kind: DispatchKind) {
        let slot = match kind {
            DispatchKind::Tool => &mut self.tool,
            DispatchKind::Block => &mut self.block,
            DispatchKind::Final => &mut self.final_,
        };
        *slot = slot.saturating_add(1);
    }
}

pub struct ReplyDispatcherOptions {
    pub sender: Arc<dyn ChannelSender>,
    pub route: Option<DurableRoute>,
    pub store: Option<Arc<dyn DeliveryStore>>,
    pub normalizer: Arc<dyn ReplyNormalizer>,
    pub retry: RetryPolicy,
    /// Bound for each sender call; zero disables the bound.
    pub attempt_timeout: Duration,
    pub human_delay: HumanDelayConfig,
    pub registry: Option<DispatcherRegistry>,
    pub hooks: Arc<dyn DispatcherHooks>,
}

impl ReplyDispatcherOptions {
    pub fn new(sender: Arc<dyn ChannelSender>) -> Self {
        Self {
            sender,
            route: None,
            store: None,
            normalizer: Arc::new(DefaultReplyNormalizer::default()),
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_millis(DEFAULT_ATTEMPT_TIMEOUT_MS),
            human_delay: HumanDelayConfig::off(),
            registry: None,
            hooks: Arc::new(NoopDispatcherHooks),
        }
    }

    /// Persists every payload to `store` before sending it to `route`.
    pub fn with_durable_route(mut self, route: DurableRoute, store: Arc<dyn DeliveryStore>) -> Self {
        self.route = Some(route);
        self.store = Some(store);
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn ReplyNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_human_delay(mut self, human_delay: HumanDelayConfig) -> Self {
        self.human_delay = human_delay;
        self
    }

    pub fn with_registry(mut self, registry: DispatcherRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn DispatcherHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

#[derive(Debug)]
struct DispatcherState {
    /// In-flight payloads plus one while the reservation is held.
    pending: usize,
    reservation_held: bool,
    complete: bool,
    in_flight: usize,
    queued: QueuedCounts,
    pending_keys: HashSet<String>,
    sent_keys: HashSet<String>,
    blocks_sent: usize,
    did_stream: bool,
    delivery_failed: bool,
    registry_id: Option<DispatcherId>,
}

impl Default for DispatcherState {
    fn default() -> Self {
        Self {
            pending: 1,
            reservation_held: true,
            complete: false,
            in_flight: 0,
            queued: QueuedCounts::default(),
            pending_keys: HashSet::new(),
            sent_keys: HashSet::new(),
            blocks_sent: 0,
            did_stream: false,
            delivery_failed: false,
            registry_id: None,
        }
    }
}

impl DispatcherState {
    /// Drops the reservation once only it remains; returns true when pending hits zero.
    fn release_reservation_if_drained(&mut self) -> bool {
        if self.complete && self.reservation_held && self.pending == 1 {
            self.reservation_held = false;
            self.pending = 0;
            return true;
        }
        false
    }
}

struct DispatcherShared {
    state: Mutex<DispatcherState>,
    idle: watch::Sender<bool>,
    registry: Option<DispatcherRegistry>,
    hooks: Arc<dyn DispatcherHooks>,
}

impl DispatcherShared {
    /// Must be called with `state` locked so idle updates stay ordered.
    fn publish_idle(&self, state: &DispatcherState) {
        self.idle.send_replace(state.in_flight == 0);
    }

    fn finish_job(&self, kind: DispatchKind, key: &str, outcome: &DispatchOutcome) {
        let drained = {
            let mut state = lock_unpoisoned(&self.state);
            state.pending_keys.remove(key);
            match outcome {
                DispatchOutcome::Sent => {
                    state.sent_keys.insert(key.to_string());
                    state.did_stream = true;
                    if kind == DispatchKind::Block {
                        state.blocks_sent = state.blocks_sent.saturating_add(1);
                    }
                }
                DispatchOutcome::Failed(_) => state.delivery_failed = true,
                DispatchOutcome::Skipped(_) => {}
            }
            state.in_flight = state.in_flight.saturating_sub(1);
            state.pending = state.pending.saturating_sub(1);
            let drained = state.release_reservation_if_drained();
            if drained {
                self.unregister_locked(&mut state);
            }
            self.publish_idle(&state);
            drained
        };
        if drained {
            self.hooks.on_idle();
        }
    }

    fn unregister_locked(&self, state: &mut DispatcherState) {
        if let (Some(registry), Some(id)) = (self.registry.as_ref(), state.registry_id.take()) {
            registry.unregister(id);
        }
    }

    fn blocks_sent(&self) -> usize {
        lock_unpoisoned(&self.state).blocks_sent
    }
}

#[async_trait]
impl DispatcherHandle for DispatcherShared {
    fn pending(&self) -> usize {
        lock_unpoisoned(&self.state).pending
    }

    async fn wait_for_idle(&self) {
        let mut idle = self.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }
}

struct DispatchJob {
    kind: DispatchKind,
    payload: ReplyPayload,
    key: String,
    result_tx: Option<oneshot::Sender<DispatchOutcome>>,
}

/// Ordered reply queue for one conversation.
pub struct ReplyDispatcher {
    shared: Arc<DispatcherShared>,
    normalizer: Arc<dyn ReplyNormalizer>,
    jobs_tx: mpsc::UnboundedSender<DispatchJob>,
}

impl fmt::Debug for ReplyDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_unpoisoned(&self.shared.state);
        f.debug_struct("ReplyDispatcher")
            .field("pending", &state.pending)
            .field("queued", &state.queued)
            .field("complete", &state.complete)
            .finish()
    }
}

impl ReplyDispatcher {
    /// Spawns the dispatcher worker on the current tokio runtime.
    pub fn new(options: ReplyDispatcherOptions) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("reply dispatcher requires an active tokio runtime")?;
        if options.route.is_some() != options.store.is_some() {
            anyhow::bail!("durable reply delivery requires both a route and a store");
        }
        let (idle, _) = watch::channel(true);
        let shared = Arc::new(DispatcherShared {
            state: Mutex::new(DispatcherState::default()),
            idle,
            registry: options.registry.clone(),
            hooks: Arc::clone(&options.hooks),
        });
        if let Some(registry) = options.registry.as_ref() {
            let handle: Arc<dyn DispatcherHandle> = shared.clone();
            let id = registry.register(&handle);
            lock_unpoisoned(&shared.state).registry_id = Some(id);
        }

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let worker = DispatchWorker {
            shared: Arc::clone(&shared),
            sender: options.sender,
            route: options.route.map(Arc::new),
            store: options.store,
            retry: options.retry,
            attempt_timeout: options.attempt_timeout,
            human_delay: options.human_delay,
        };
        runtime.spawn(worker.run(jobs_rx));

        Ok(Self {
            shared,
            normalizer: options.normalizer,
            jobs_tx,
        })
    }

    /// Queues a payload without waiting for delivery. Returns true when accepted.
    pub fn enqueue(&self, kind: DispatchKind, payload: ReplyPayload) -> bool {
        self.submit(kind, payload, None).is_ok()
    }

    /// Queues a payload and waits for its terminal outcome.
    pub async fn enqueue_and_wait(
        &self,
        kind: DispatchKind,
        payload: ReplyPayload,
    ) -> DispatchOutcome {
        let (result_tx, result_rx) = oneshot::channel();
        if let Err(outcome) = self.submit(kind, payload, Some(result_tx)) {
            return outcome;
        }
        match result_rx.await {
            Ok(outcome) => outcome,
            Err(_) => DispatchOutcome::Failed(worker_stopped_failure()),
        }
    }

    pub fn send_tool_result(&self, payload: ReplyPayload) -> bool {
        self.enqueue(DispatchKind::Tool, payload)
    }

    pub fn send_block_reply(&self, payload: ReplyPayload) -> bool {
        self.enqueue(DispatchKind::Block, payload)
    }

    pub fn send_final_reply(&self, payload: ReplyPayload) -> bool {
        self.enqueue(DispatchKind::Final, payload)
    }

    /// Resolves once nothing accepted is still in flight.
    pub async fn wait_for_idle(&self) {
        DispatcherHandle::wait_for_idle(self.shared.as_ref()).await;
    }

    pub fn queued_counts(&self) -> QueuedCounts {
        lock_unpoisoned(&self.shared.state).queued
    }

    /// Declares that no further payloads will be enqueued.
    ///
    /// The reservation is released as soon as the queue has drained; later
    /// enqueues settle as `skipped(dispatcher-complete)`.
    pub fn mark_complete(&self) {
        let drained = {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.complete = true;
            let drained = state.release_reservation_if_drained();
            if drained {
                self.shared.unregister_locked(&mut state);
            }
            drained
        };
        if drained {
            tracing::debug!("reply dispatcher drained");
            self.shared.hooks.on_idle();
        }
    }

    pub fn pending(&self) -> usize {
        DispatcherHandle::pending(self.shared.as_ref())
    }

    /// True once any payload was delivered.
    pub fn did_stream(&self) -> bool {
        lock_unpoisoned(&self.shared.state).did_stream
    }

    /// True once any payload settled as failed.
    pub fn delivery_failed(&self) -> bool {
        lock_unpoisoned(&self.shared.state).delivery_failed
    }

    fn submit(
        &self,
        kind: DispatchKind,
        payload: ReplyPayload,
        result_tx: Option<oneshot::Sender<DispatchOutcome>>,
    ) -> Result<(), DispatchOutcome> {
        if lock_unpoisoned(&self.shared.state).complete {
            return Err(self.skip(kind, &payload, SkipReason::DispatcherComplete));
        }
        let payload = match self.normalizer.normalize(kind, payload.clone()) {
            NormalizeOutcome::Accept(normalized) => normalized,
            NormalizeOutcome::Skip(reason) => return Err(self.skip(kind, &payload, reason)),
        };
        let key = payload.identity_key();

        let mut state = lock_unpoisoned(&self.shared.state);
        if state.complete {
            drop(state);
            return Err(self.skip(kind, &payload, SkipReason::DispatcherComplete));
        }
        if state.sent_keys.contains(&key) || state.pending_keys.contains(&key) {
            drop(state);
            return Err(self.skip(kind, &payload, SkipReason::DuplicateSeen));
        }
        let job = DispatchJob {
            kind,
            payload,
            key: key.clone(),
            result_tx,
        };
        // Pushed under the lock so channel order matches acceptance order.
        if let Err(mpsc::error::SendError(job)) = self.jobs_tx.send(job) {
            drop(state);
            let failure = worker_stopped_failure();
            self.shared.hooks.on_error(kind, &failure);
            let outcome = DispatchOutcome::Failed(failure);
            log_settled(kind, &job.payload, &outcome);
            return Err(outcome);
        }
        state.pending_keys.insert(key);
        state.queued.bump(kind);
        state.pending = state.pending.saturating_add(1);
        state.in_flight = state.in_flight.saturating_add(1);
        self.shared.publish_idle(&state);
        Ok(())
    }

    fn skip(&self, kind: DispatchKind, payload: &ReplyPayload, reason: SkipReason) -> DispatchOutcome {
        self.shared.hooks.on_skip(kind, payload, reason);
        let outcome = DispatchOutcome::Skipped(reason);
        log_settled(kind, payload, &outcome);
        outcome
    }
}

struct DispatchWorker {
    shared: Arc<DispatcherShared>,
    sender: Arc<dyn ChannelSender>,
    route: Option<Arc<DurableRoute>>,
    store: Option<Arc<dyn DeliveryStore>>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    human_delay: HumanDelayConfig,
}

impl DispatchWorker {
    async fn run(self, mut jobs_rx: mpsc::UnboundedReceiver<DispatchJob>) {
        while let Some(job) = jobs_rx.recv().await {
            let outcome = match AssertUnwindSafe(self.dispatch(job.kind, &job.payload))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => self.settle_panic(job.kind, panic.as_ref()),
            };
            log_settled(job.kind, &job.payload, &outcome);
            // The waiter sees its outcome before idle hooks run.
            if let Some(result_tx) = job.result_tx {
                let _ = result_tx.send(outcome.clone());
            }
            self.shared.finish_job(job.kind, &job.key, &outcome);
        }
    }

    /// A panicking sender fails its own payload; the worker keeps draining.
    fn settle_panic(&self, kind: DispatchKind, panic: &(dyn Any + Send)) -> DispatchOutcome {
        let message = panic
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::warn!(kind = kind.as_str(), panic = %message, "reply sender panicked");
        let failure = DispatchFailure {
            class: DeliveryErrorClass::Permanent,
            error: ChannelDeliveryError::permanent(format!("reply sender panicked: {message}")),
            attempts: 1,
            queue_id: None,
        };
        self.shared.hooks.on_error(kind, &failure);
        DispatchOutcome::Failed(failure)
    }

    async fn dispatch(&self, kind: DispatchKind, payload: &ReplyPayload) -> DispatchOutcome {
        if kind == DispatchKind::Block && self.shared.blocks_sent() > 0 {
            if let Some(delay) = self.human_delay.sample() {
                tokio::time::sleep(delay).await;
            }
        }
        self.shared.hooks.on_reply_start(kind, payload);

        let payload = match self.route.as_deref() {
            Some(route) => route.apply_defaults(payload),
            None => payload.clone(),
        };
        let queue_id = self.persist(kind, &payload).await;

        let mut retries = 0_usize;
        let sender = self.sender.as_ref();
        let route = self.route.as_ref();
        let attempt_timeout = self.attempt_timeout;
        let payload_ref = &payload;
        let queue_id_ref = queue_id.as_ref();
        let lease = self.store.as_deref().zip(queue_id.as_deref());
        let result = retry_async(
            &self.retry,
            kind.as_str(),
            |attempt| {
                let context = DeliveryAttemptContext {
                    kind,
                    route: route.cloned(),
                    queue_id: queue_id_ref.cloned(),
                    attempt,
                    cancellation: DeliveryCancellation::new(),
                };
                async move {
                    if attempt > 1 {
                        renew_lease(lease).await;
                    }
                    let result =
                        deliver_with_timeout(sender, payload_ref, &context, attempt_timeout).await;
                    if let Err(error) = &result {
                        // Held across the backoff sleep that follows.
                        if error.classify().should_retry_inline() {
                            renew_lease(lease).await;
                        }
                    }
                    result
                }
            },
            |error: &ChannelDeliveryError, _attempt| error.classify().should_retry_inline(),
            |error: &ChannelDeliveryError| error.retry_after,
            |observation: &RetryAttempt, error: &ChannelDeliveryError| {
                retries += 1;
                tracing::debug!(
                    kind = observation.label.as_str(),
                    attempt = observation.attempt,
                    delay_ms = u64::try_from(observation.delay.as_millis()).unwrap_or(u64::MAX),
                    reason = error.classify().as_str(),
                    "retrying reply delivery"
                );
            },
        )
        .await;

        match result {
            Ok(()) => {
                if let Some(queue_id) = queue_id.as_deref() {
                    self.confirm(queue_id).await;
                }
                DispatchOutcome::Sent
            }
            Err(error) => {
                let class = error.classify();
                let detail = error.detail();
                if let Some(queue_id) = queue_id.as_deref() {
                    self.record_failure(queue_id, class, &detail).await;
                }
                let failure = DispatchFailure {
                    class,
                    error,
                    attempts: retries + 1,
                    queue_id,
                };
                self.shared.hooks.on_error(kind, &failure);
                DispatchOutcome::Failed(failure)
            }
        }
    }

    /// Best-effort write-ahead record; delivery proceeds without it on failure.
    async fn persist(&self, kind: DispatchKind, payload: &ReplyPayload) -> Option<String> {
        let route = self.route.as_deref()?;
        let store = self.store.as_ref()?;
        let record = NewDeliveryRecord {
            route: route.clone(),
            kind,
            payload: payload.clone(),
        };
        match store.enqueue_delivery(record).await {
            Ok(queue_id) => Some(queue_id),
            Err(error) => {
                tracing::warn!(
                    route = %route.describe(),
                    kind = kind.as_str(),
                    error = %error,
                    "failed to persist reply before delivery"
                );
                None
            }
        }
    }

    async fn confirm(&self, queue_id: &str) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let result = match store.mark_delivery_delivered(queue_id).await {
            Ok(()) => store.ack_delivery(queue_id).await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            tracing::warn!(queue_id, error = %error, "failed to acknowledge delivered reply");
        }
    }

    async fn record_failure(&self, queue_id: &str, class: DeliveryErrorClass, detail: &str) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let result = if class == DeliveryErrorClass::TransientAmbiguous {
            store.mark_delivery_uncertain(queue_id, detail).await
        } else {
            store.fail_delivery(queue_id, detail).await
        };
        if let Err(error) = result {
            tracing::warn!(
                queue_id,
                class = class.as_str(),
                error = %error,
                "failed to record reply delivery failure"
            );
        }
    }
}

/// Refreshes the durable record so recovery keeps treating it as owned.
async fn renew_lease(lease: Option<(&dyn DeliveryStore, &str)>) {
    let Some((store, queue_id)) = lease else {
        return;
    };
    if let Err(error) = store.touch_delivery(queue_id).await {
        tracing::debug!(queue_id, error = %error, "failed to renew reply delivery lease");
    }
}

fn worker_stopped_failure() -> DispatchFailure {
    DispatchFailure {
        class: DeliveryErrorClass::Permanent,
        error: ChannelDeliveryError::permanent("reply dispatcher worker stopped"),
        attempts: 0,
        queue_id: None,
    }
}

fn log_settled(kind: DispatchKind, payload: &ReplyPayload, outcome: &DispatchOutcome) {
    match outcome {
        DispatchOutcome::Sent => tracing::info!(
            status = "sent",
            kind = kind.as_str(),
            reason = "delivered",
            preview = %payload.preview(LOG_PREVIEW_CHARS),
            "reply dispatch settled"
        ),
        DispatchOutcome::Skipped(reason) => tracing::info!(
            status = "skipped",
            kind = kind.as_str(),
            reason = reason.as_str(),
            "reply dispatch settled"
        ),
        DispatchOutcome::Failed(failure) => {
            if failure.class == DeliveryErrorClass::TransientAmbiguous {
                tracing::info!(
                    status = "failed",
                    kind = kind.as_str(),
                    reason = failure.class.as_str(),
                    attempts = failure.attempts,
                    error = %failure.error.detail(),
                    "reply dispatch settled"
                );
            } else {
                tracing::warn!(
                    status = "failed",
                    kind = kind.as_str(),
                    reason = failure.class.as_str(),
                    attempts = failure.attempts,
                    error = %failure.error.detail(),
                    "reply dispatch settled"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests;
