//! Reply dispatcher ordering, dedup, classification, and lifecycle tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use super::{
    DispatchFailure, DispatchOutcome, DispatcherHooks, QueuedCounts, ReplyDispatcher,
    ReplyDispatcherOptions,
};
use crate::channel_sender::{ChannelSender, DeliveryAttemptContext};
use crate::delivery_classifier::{ChannelDeliveryError, DeliveryErrorClass};
use crate::delivery_recovery::{recover_pending_deliveries, RecoveryOptions};
use crate::delivery_retry::RetryPolicy;
use crate::delivery_store::{DeliveryState, MemoryDeliveryStore};
use crate::dispatcher_registry::DispatcherRegistry;
use crate::human_delay::HumanDelayConfig;
use crate::reply_normalize::SkipReason;
use crate::reply_payload::{DispatchKind, DurableRoute, ReplyPayload};

#[derive(Default)]
struct ScriptedSender {
    calls: Mutex<Vec<(DispatchKind, String, Instant)>>,
    failures: Mutex<HashMap<String, VecDeque<ChannelDeliveryError>>>,
    stall: Option<Duration>,
}

impl ScriptedSender {
    fn stalling(stall: Duration) -> Self {
        Self {
            stall: Some(stall),
            ..Self::default()
        }
    }

    fn fail_times(self, text: &str, error: ChannelDeliveryError, times: usize) -> Self {
        self.failures
            .lock()
            .expect("failures lock")
            .entry(text.to_string())
            .or_default()
            .extend(std::iter::repeat(error).take(times));
        self
    }

    fn call_texts(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, text, _)| text.clone())
            .collect()
    }

    fn call_instants(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, _, at)| *at)
            .collect()
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    async fn deliver(
        &self,
        payload: &ReplyPayload,
        context: &DeliveryAttemptContext,
    ) -> Result<(), ChannelDeliveryError> {
        let text = payload.text.clone().unwrap_or_default();
        self.calls
            .lock()
            .expect("calls lock")
            .push((context.kind, text.clone(), Instant::now()));
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        let next_failure = self
            .failures
            .lock()
            .expect("failures lock")
            .get_mut(&text)
            .and_then(VecDeque::pop_front);
        match next_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct RecordingHooks {
    starts: AtomicUsize,
    skips: Mutex<Vec<SkipReason>>,
    errors: Mutex<Vec<DeliveryErrorClass>>,
    idle_count: AtomicUsize,
    idle: Notify,
}

impl DispatcherHooks for RecordingHooks {
    fn on_reply_start(&self, _kind: DispatchKind, _payload: &ReplyPayload) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_skip(&self, _kind: DispatchKind, _payload: &ReplyPayload, reason: SkipReason) {
        self.skips.lock().expect("skips lock").push(reason);
    }

    fn on_error(&self, _kind: DispatchKind, failure: &DispatchFailure) {
        self.errors.lock().expect("errors lock").push(failure.class);
    }

    fn on_idle(&self) {
        self.idle_count.fetch_add(1, Ordering::SeqCst);
        self.idle.notify_one();
    }
}

fn fast_retry(attempts: usize) -> RetryPolicy {
    RetryPolicy {
        attempts,
        min_delay_ms: 10,
        max_delay_ms: 10,
        factor: 2.0,
        jitter: 0.0,
    }
}

fn connection_refused() -> ChannelDeliveryError {
    ChannelDeliveryError::new("connect failed").with_code("ECONNREFUSED")
}

fn build_dispatcher(sender: &Arc<ScriptedSender>, retry: RetryPolicy) -> ReplyDispatcher {
    ReplyDispatcher::new(ReplyDispatcherOptions::new(sender.clone()).with_retry(retry))
        .expect("dispatcher")
}

fn build_durable_dispatcher(
    sender: &Arc<ScriptedSender>,
    store: &Arc<MemoryDeliveryStore>,
    retry: RetryPolicy,
) -> ReplyDispatcher {
    ReplyDispatcher::new(
        ReplyDispatcherOptions::new(sender.clone())
            .with_durable_route(DurableRoute::new("telegram", "chat-42"), store.clone())
            .with_retry(retry),
    )
    .expect("dispatcher")
}

fn expect_failure(outcome: DispatchOutcome) -> DispatchFailure {
    match outcome {
        DispatchOutcome::Failed(failure) => failure,
        other => panic!("expected failure, got {}", other.status()),
    }
}

#[tokio::test(start_paused = true)]
async fn functional_block_retries_finish_before_final_reply_starts() {
    let sender = Arc::new(ScriptedSender::default().fail_times("A", connection_refused(), 3));
    let dispatcher = build_dispatcher(&sender, fast_retry(4));

    assert!(dispatcher.send_block_reply(ReplyPayload::text("A")));
    let outcome = dispatcher
        .enqueue_and_wait(DispatchKind::Final, ReplyPayload::text("B"))
        .await;

    assert!(outcome.is_sent());
    assert_eq!(sender.call_texts(), vec!["A", "A", "A", "A", "B"]);
}

#[tokio::test]
async fn functional_sender_observes_enqueue_order_across_kinds() {
    let sender = Arc::new(ScriptedSender::default());
    let dispatcher = build_dispatcher(&sender, fast_retry(1));
    dispatcher.send_tool_result(ReplyPayload::text("tool output"));
    dispatcher.send_block_reply(ReplyPayload::text("first block"));
    dispatcher.send_block_reply(ReplyPayload::text("second block"));
    dispatcher.send_final_reply(ReplyPayload::text("done"));
    dispatcher.mark_complete();
    dispatcher.wait_for_idle().await;

    assert_eq!(
        sender.call_texts(),
        vec!["tool output", "first block", "second block", "done"]
    );
    assert_eq!(dispatcher.pending(), 0);
    assert!(dispatcher.did_stream());
    assert!(!dispatcher.delivery_failed());
}

#[tokio::test]
async fn functional_duplicate_payload_is_skipped_as_duplicate_seen() {
    let sender = Arc::new(ScriptedSender::default());
    let dispatcher = build_dispatcher(&sender, fast_retry(1));

    assert!(dispatcher.send_block_reply(ReplyPayload::text("hello world")));
    let pending_duplicate = dispatcher
        .enqueue_and_wait(DispatchKind::Block, ReplyPayload::text("hello   world"))
        .await;
    assert!(matches!(
        pending_duplicate,
        DispatchOutcome::Skipped(SkipReason::DuplicateSeen)
    ));

    dispatcher.wait_for_idle().await;
    let sent_duplicate = dispatcher
        .enqueue_and_wait(DispatchKind::Final, ReplyPayload::text(" hello world "))
        .await;
    assert!(matches!(
        sent_duplicate,
        DispatchOutcome::Skipped(SkipReason::DuplicateSeen)
    ));
    assert_eq!(sender.call_texts(), vec!["hello world"]);
}

#[tokio::test]
async fn functional_permanent_failure_calls_sender_once_and_fails_record() {
    let sender = Arc::new(ScriptedSender::default().fail_times(
        "hi",
        ChannelDeliveryError::from_status(400, "chat not found"),
        1,
    ));
    let store = Arc::new(MemoryDeliveryStore::new());
    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(sender.clone())
            .with_durable_route(DurableRoute::new("telegram", "chat-42"), store.clone())
            .with_retry(fast_retry(3))
            .with_hooks(hooks.clone()),
    )
    .expect("dispatcher");

    let failure = expect_failure(
        dispatcher
            .enqueue_and_wait(DispatchKind::Final, ReplyPayload::text("hi"))
            .await,
    );
    assert_eq!(failure.class, DeliveryErrorClass::Permanent);
    assert_eq!(failure.attempts, 1);
    assert_eq!(sender.call_texts().len(), 1);
    assert!(dispatcher.delivery_failed());
    assert_eq!(
        *hooks.errors.lock().expect("errors lock"),
        vec![DeliveryErrorClass::Permanent]
    );

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, DeliveryState::Failed);
    assert_eq!(Some(records[0].queue_id.clone()), failure.queue_id);
    assert!(records[0]
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("status=400")));
}

#[tokio::test(start_paused = true)]
async fn functional_definitive_failures_stop_after_policy_attempts() {
    let sender = Arc::new(ScriptedSender::default().fail_times("hi", connection_refused(), 5));
    let store = Arc::new(MemoryDeliveryStore::new());
    let dispatcher = build_durable_dispatcher(&sender, &store, fast_retry(3));

    let failure = expect_failure(
        dispatcher
            .enqueue_and_wait(DispatchKind::Final, ReplyPayload::text("hi"))
            .await,
    );
    assert_eq!(failure.class, DeliveryErrorClass::TransientDefinitive);
    assert_eq!(failure.attempts, 3);
    assert_eq!(sender.call_texts().len(), 3);
    assert_eq!(store.records()[0].state, DeliveryState::Failed);
}

#[tokio::test(start_paused = true)]
async fn integration_connection_refused_then_success_acks_record() {
    let sender = Arc::new(ScriptedSender::default().fail_times("hi", connection_refused(), 2));
    let store = Arc::new(MemoryDeliveryStore::new());
    let dispatcher = build_durable_dispatcher(&sender, &store, fast_retry(3));

    let outcome = dispatcher
        .enqueue_and_wait(DispatchKind::Final, ReplyPayload::text("hi"))
        .await;
    assert!(outcome.is_sent());
    assert_eq!(sender.call_texts().len(), 3);
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, DeliveryState::Acked);
    assert_eq!(records[0].route.to, "chat-42");
}

#[tokio::test(start_paused = true)]
async fn regression_local_timeout_marks_record_uncertain_without_inline_retry() {
    let sender = Arc::new(ScriptedSender::stalling(Duration::from_secs(60)));
    let store = Arc::new(MemoryDeliveryStore::new());
    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(sender.clone())
            .with_durable_route(DurableRoute::new("discord", "channel-1"), store.clone())
            .with_retry(fast_retry(3))
            .with_attempt_timeout(Duration::from_millis(5_000)),
    )
    .expect("dispatcher");

    let failure = expect_failure(
        dispatcher
            .enqueue_and_wait(DispatchKind::Final, ReplyPayload::text("slow"))
            .await,
    );
    assert_eq!(failure.class, DeliveryErrorClass::TransientAmbiguous);
    assert!(failure.error.timed_out_locally);
    assert_eq!(sender.call_texts().len(), 1);
    let records = store.records();
    assert_eq!(records[0].state, DeliveryState::Uncertain);
    assert!(records[0]
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("timed out after 5000ms")));
}

#[tokio::test]
async fn functional_mark_complete_before_enqueue_resolves_idle_without_sender() {
    let sender = Arc::new(ScriptedSender::default());
    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(sender.clone()).with_hooks(hooks.clone()),
    )
    .expect("dispatcher");
    assert_eq!(dispatcher.pending(), 1);

    dispatcher.mark_complete();
    dispatcher.wait_for_idle().await;
    assert_eq!(dispatcher.pending(), 0);
    assert_eq!(hooks.idle_count.load(Ordering::SeqCst), 1);

    let late = dispatcher
        .enqueue_and_wait(DispatchKind::Final, ReplyPayload::text("too late"))
        .await;
    assert!(matches!(
        late,
        DispatchOutcome::Skipped(SkipReason::DispatcherComplete)
    ));
    assert!(sender.call_texts().is_empty());
    assert_eq!(hooks.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn functional_mark_complete_with_work_in_flight_drains_then_goes_idle() {
    let sender = Arc::new(ScriptedSender::default());
    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(sender.clone()).with_hooks(hooks.clone()),
    )
    .expect("dispatcher");

    dispatcher.send_block_reply(ReplyPayload::text("one"));
    dispatcher.send_final_reply(ReplyPayload::text("two"));
    dispatcher.mark_complete();
    assert!(dispatcher.pending() >= 1);

    tokio::time::timeout(Duration::from_secs(5), hooks.idle.notified())
        .await
        .expect("idle hook fired");
    assert_eq!(dispatcher.pending(), 0);
    assert_eq!(hooks.idle_count.load(Ordering::SeqCst), 1);
    assert_eq!(sender.call_texts(), vec!["one", "two"]);
}

#[tokio::test(start_paused = true)]
async fn functional_human_delay_applies_between_block_replies_only() {
    let sender = Arc::new(ScriptedSender::default());
    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(sender.clone())
            .with_retry(fast_retry(1))
            .with_human_delay(HumanDelayConfig::custom(1_500, 1_500)),
    )
    .expect("dispatcher");
    let started = Instant::now();

    dispatcher.send_block_reply(ReplyPayload::text("block one"));
    dispatcher.send_block_reply(ReplyPayload::text("block two"));
    dispatcher.send_final_reply(ReplyPayload::text("final"));
    dispatcher.mark_complete();
    dispatcher.wait_for_idle().await;

    let instants = sender.call_instants();
    assert_eq!(instants.len(), 3);
    assert!(instants[0].duration_since(started) < Duration::from_millis(1_500));
    assert!(instants[1].duration_since(instants[0]) >= Duration::from_millis(1_500));
    assert!(instants[2].duration_since(instants[1]) < Duration::from_millis(1_500));
}

#[tokio::test]
async fn unit_queued_counts_track_accepted_payloads_per_kind() {
    let sender = Arc::new(ScriptedSender::default());
    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(sender.clone()).with_hooks(hooks.clone()),
    )
    .expect("dispatcher");

    assert!(dispatcher.send_tool_result(ReplyPayload::text("ran tests")));
    assert!(dispatcher.send_block_reply(ReplyPayload::text("partial")));
    assert!(!dispatcher.send_block_reply(ReplyPayload::text("partial")));
    assert!(!dispatcher.send_block_reply(ReplyPayload::text("   ")));
    assert!(!dispatcher.send_final_reply(ReplyPayload::text("NO_REPLY")));
    assert!(dispatcher.send_final_reply(ReplyPayload::text("all done")));

    assert_eq!(
        dispatcher.queued_counts(),
        QueuedCounts {
            tool: 1,
            block: 1,
            final_: 1,
        }
    );
    assert_eq!(dispatcher.queued_counts().total(), 3);
    assert_eq!(
        *hooks.skips.lock().expect("skips lock"),
        vec![
            SkipReason::DuplicateSeen,
            SkipReason::Empty,
            SkipReason::MarkerOnly
        ]
    );
    dispatcher.wait_for_idle().await;
}

#[tokio::test]
async fn regression_failed_payload_does_not_block_following_payloads() {
    let sender = Arc::new(ScriptedSender::default().fail_times(
        "broken",
        ChannelDeliveryError::permanent("bot was blocked by the user"),
        1,
    ));
    let dispatcher = build_dispatcher(&sender, fast_retry(3));

    dispatcher.send_block_reply(ReplyPayload::text("broken"));
    let outcome = dispatcher
        .enqueue_and_wait(DispatchKind::Final, ReplyPayload::text("still here"))
        .await;
    assert!(outcome.is_sent());
    assert!(dispatcher.delivery_failed());
    assert!(dispatcher.did_stream());

    // A failed payload leaves the dedup set, so it can be queued again.
    let retried = dispatcher
        .enqueue_and_wait(DispatchKind::Block, ReplyPayload::text("broken"))
        .await;
    assert!(retried.is_sent());
    assert_eq!(sender.call_texts(), vec!["broken", "still here", "broken"]);
}

#[tokio::test]
async fn integration_registry_tracks_dispatcher_until_drained() {
    let registry = DispatcherRegistry::new();
    let sender = Arc::new(ScriptedSender::default());
    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(sender.clone()).with_registry(registry.clone()),
    )
    .expect("dispatcher");
    assert_eq!(registry.active_dispatchers(), 1);
    assert!(registry.total_pending() >= 1);

    dispatcher.send_final_reply(ReplyPayload::text("bye"));
    dispatcher.mark_complete();
    assert!(registry.wait_for_all_idle(Duration::from_secs(5)).await);
    dispatcher.wait_for_idle().await;

    assert_eq!(dispatcher.pending(), 0);
    assert_eq!(registry.active_dispatchers(), 0);
    assert_eq!(registry.total_pending(), 0);
}

#[test]
fn regression_dispatcher_requires_tokio_runtime() {
    let sender: Arc<dyn ChannelSender> = Arc::new(ScriptedSender::default());
    let error = ReplyDispatcher::new(ReplyDispatcherOptions::new(sender)).expect_err("no runtime");
    assert!(error.to_string().contains("active tokio runtime"));
}

/// Delivers everything except the payload text `boom`, which panics.
#[derive(Default)]
struct PanickingSender {
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl ChannelSender for PanickingSender {
    async fn deliver(
        &self,
        payload: &ReplyPayload,
        _context: &DeliveryAttemptContext,
    ) -> Result<(), ChannelDeliveryError> {
        let text = payload.text.clone().unwrap_or_default();
        if text == "boom" {
            panic!("sender exploded");
        }
        self.delivered.lock().expect("delivered lock").push(text);
        Ok(())
    }
}

#[tokio::test]
async fn regression_sender_panic_fails_payload_and_worker_keeps_draining() {
    let sender = Arc::new(PanickingSender::default());
    let hooks = Arc::new(RecordingHooks::default());
    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(sender.clone())
            .with_retry(fast_retry(3))
            .with_hooks(hooks.clone()),
    )
    .expect("dispatcher");

    let failure = expect_failure(
        dispatcher
            .enqueue_and_wait(DispatchKind::Block, ReplyPayload::text("boom"))
            .await,
    );
    assert_eq!(failure.class, DeliveryErrorClass::Permanent);
    assert!(failure.error.detail().contains("sender exploded"));

    let after = dispatcher
        .enqueue_and_wait(DispatchKind::Final, ReplyPayload::text("after"))
        .await;
    assert!(after.is_sent());
    dispatcher.mark_complete();
    tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_for_idle())
        .await
        .expect("dispatcher idles after a panicking send");

    assert_eq!(dispatcher.pending(), 0);
    assert!(dispatcher.delivery_failed());
    assert_eq!(hooks.idle_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        *hooks.errors.lock().expect("errors lock"),
        vec![DeliveryErrorClass::Permanent]
    );
    assert_eq!(
        *sender.delivered.lock().expect("delivered lock"),
        vec!["after".to_string()]
    );
}

#[tokio::test]
async fn regression_recovery_skips_record_while_dispatcher_is_retrying() {
    let sender = Arc::new(
        ScriptedSender::stalling(Duration::from_millis(200)).fail_times(
            "slow upstream",
            ChannelDeliveryError::from_status(503, "service unavailable"),
            2,
        ),
    );
    let store = Arc::new(MemoryDeliveryStore::new());
    let retry = RetryPolicy {
        attempts: 3,
        min_delay_ms: 50,
        max_delay_ms: 50,
        factor: 1.0,
        jitter: 0.0,
    };
    let dispatcher = build_durable_dispatcher(&sender, &store, retry);
    let recovery_sender = ScriptedSender::default();
    let options = RecoveryOptions {
        fresh_record_grace: Duration::from_millis(300),
        ..RecoveryOptions::default()
    };

    // The record is older than the grace by the time recovery runs, but the
    // dispatcher renewed it between attempts.
    let (outcome, summary) = tokio::join!(
        dispatcher.enqueue_and_wait(DispatchKind::Final, ReplyPayload::text("slow upstream")),
        async {
            tokio::time::sleep(Duration::from_millis(450)).await;
            recover_pending_deliveries(store.as_ref(), &recovery_sender, &options).await
        }
    );
    let summary = summary.expect("recovery pass");
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.recovered, 0);
    assert!(recovery_sender.call_texts().is_empty());

    assert!(outcome.is_sent());
    assert_eq!(sender.call_texts().len(), 3);
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, DeliveryState::Acked);
    assert_eq!(records[0].attempt_count, 0);
}

/// Captures whether the waiter's outcome was already delivered when idle fired.
#[derive(Default)]
struct OutcomeAtIdleHooks {
    result_rx: Mutex<Option<oneshot::Receiver<DispatchOutcome>>>,
    status_at_idle: Mutex<Option<&'static str>>,
    idle: Notify,
}

impl DispatcherHooks for OutcomeAtIdleHooks {
    fn on_idle(&self) {
        let status = self
            .result_rx
            .lock()
            .expect("result lock")
            .take()
            .and_then(|mut result_rx| result_rx.try_recv().ok())
            .map_or("not-ready", |outcome| outcome.status());
        *self.status_at_idle.lock().expect("status lock") = Some(status);
        self.idle.notify_one();
    }
}

#[tokio::test(start_paused = true)]
async fn regression_waiter_receives_outcome_before_idle_hooks_run() {
    let sender = Arc::new(ScriptedSender::stalling(Duration::from_secs(1)));
    let hooks = Arc::new(OutcomeAtIdleHooks::default());
    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(sender.clone()).with_hooks(hooks.clone()),
    )
    .expect("dispatcher");

    let (result_tx, result_rx) = oneshot::channel();
    *hooks.result_rx.lock().expect("result lock") = Some(result_rx);
    dispatcher
        .submit(DispatchKind::Final, ReplyPayload::text("last words"), Some(result_tx))
        .expect("payload accepted");
    dispatcher.mark_complete();

    hooks.idle.notified().await;
    assert_eq!(
        *hooks.status_at_idle.lock().expect("status lock"),
        Some("sent")
    );
    assert_eq!(dispatcher.pending(), 0);
}
