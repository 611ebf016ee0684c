use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use tau_reply_delivery::{
    recover_pending_deliveries, ChannelDeliveryError, ChannelSender, DeliveryAttemptContext,
    DeliveryErrorClass, DeliveryRecoveryLoop, DeliveryRecoveryLoopConfig, DeliveryState,
    DeliveryStore, DispatchKind, DispatchOutcome, DispatcherRegistry, DurableRoute,
    FileDeliveryStore, FileDeliveryStoreConfig, RecoveryOptions, ReplyDispatcher,
    ReplyDispatcherOptions, ReplyPayload,
};
use tau_reply_gateway::reply_senders::DryRunChannelSender;
use tau_reply_gateway::{execute_cli, Cli};
use tempfile::tempdir;
use tokio::sync::Notify;

/// Signals when a send starts and then never completes.
#[derive(Default)]
struct StallingSender {
    started: Notify,
}

#[async_trait]
impl ChannelSender for StallingSender {
    async fn deliver(
        &self,
        _payload: &ReplyPayload,
        _context: &DeliveryAttemptContext,
    ) -> Result<(), ChannelDeliveryError> {
        self.started.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[derive(Default)]
struct ResetSender {
    calls: AtomicUsize,
}

#[async_trait]
impl ChannelSender for ResetSender {
    async fn deliver(
        &self,
        _payload: &ReplyPayload,
        _context: &DeliveryAttemptContext,
    ) -> Result<(), ChannelDeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ChannelDeliveryError::new("connection reset by peer").with_code("ECONNRESET"))
    }
}

fn route() -> DurableRoute {
    DurableRoute::new("telegram", "chat-42").with_thread("topic-1")
}

fn open_store(state_dir: &std::path::Path) -> Arc<FileDeliveryStore> {
    Arc::new(FileDeliveryStore::open(FileDeliveryStoreConfig::new(state_dir)).expect("open store"))
}

#[test]
fn integration_crash_mid_send_is_replayed_after_restart() {
    let temp = tempdir().expect("tempdir");
    let state_dir = temp.path().join("replies");

    let crashed = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("first runtime");
    crashed.block_on(async {
        let store = open_store(&state_dir);
        let sender = Arc::new(StallingSender::default());
        let dispatcher = ReplyDispatcher::new(
            ReplyDispatcherOptions::new(sender.clone()).with_durable_route(route(), store),
        )
        .expect("dispatcher");
        assert!(dispatcher.send_final_reply(ReplyPayload::text("survives the crash")));
        sender.started.notified().await;
    });
    crashed.shutdown_background();

    let restarted = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("second runtime");
    restarted.block_on(async {
        let store = open_store(&state_dir);
        let pending = store.load_pending_deliveries().await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, DeliveryState::Enqueued);
        assert_eq!(pending[0].route, route());
        let queue_id = pending[0].queue_id.clone();

        let log_path = temp.path().join("replayed.jsonl");
        let sender = DryRunChannelSender::new(Some(log_path.clone()));
        let options = RecoveryOptions {
            fresh_record_grace: Duration::ZERO,
            ..RecoveryOptions::default()
        };
        let summary = recover_pending_deliveries(store.as_ref(), &sender, &options)
            .await
            .expect("recover");
        assert_eq!(summary.recovered, 1);
        assert_eq!(summary.failed, 0);
        assert!(store
            .load_pending_deliveries()
            .await
            .expect("pending after recovery")
            .is_empty());

        let logged = std::fs::read_to_string(&log_path).expect("dry-run log");
        let line: Value = serde_json::from_str(logged.trim()).expect("json line");
        assert_eq!(line["queue_id"], queue_id.as_str());
        assert_eq!(line["payload"]["text"], "survives the crash");
        assert_eq!(line["route"]["thread_id"], "topic-1");
    });
}

#[tokio::test]
async fn integration_ambiguous_failure_is_left_for_the_recovery_loop() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let registry = DispatcherRegistry::new();
    let reset_sender = Arc::new(ResetSender::default());

    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(reset_sender.clone())
            .with_durable_route(route(), store.clone())
            .with_registry(registry.clone()),
    )
    .expect("dispatcher");
    let outcome = dispatcher
        .enqueue_and_wait(DispatchKind::Final, ReplyPayload::text("maybe delivered"))
        .await;
    dispatcher.mark_complete();
    assert!(registry.wait_for_all_idle(Duration::from_secs(5)).await);
    assert_eq!(registry.active_dispatchers(), 0);

    let failure = match outcome {
        DispatchOutcome::Failed(failure) => failure,
        other => panic!("expected failure, got {}", other.status()),
    };
    assert_eq!(failure.class, DeliveryErrorClass::TransientAmbiguous);
    assert_eq!(reset_sender.calls.load(Ordering::SeqCst), 1);
    let queue_id = failure.queue_id.expect("durable queue id");
    let record = store
        .get_delivery(&queue_id)
        .await
        .expect("read")
        .expect("record");
    assert_eq!(record.state, DeliveryState::Uncertain);

    let recovery_loop = DeliveryRecoveryLoop::new(
        store.clone(),
        Arc::new(DryRunChannelSender::new(None)),
        DeliveryRecoveryLoopConfig::default(),
    );
    let summary = recovery_loop.run_now().await.expect("recovery pass");
    assert_eq!(summary.recovered, 1);
    assert!(store.get_delivery(&queue_id).await.expect("read").is_none());
    assert_eq!(recovery_loop.last_summary(), Some(summary));
}

#[tokio::test]
async fn integration_gateway_lists_uncertain_records_left_by_a_dispatcher() {
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let dispatcher = ReplyDispatcher::new(
        ReplyDispatcherOptions::new(Arc::new(ResetSender::default()))
            .with_durable_route(route(), store.clone()),
    )
    .expect("dispatcher");
    let outcome = dispatcher
        .enqueue_and_wait(DispatchKind::Block, ReplyPayload::text("partial answer"))
        .await;
    assert_eq!(outcome.status(), "failed");

    let state_dir = temp.path().display().to_string();
    let cli = Cli::try_parse_from([
        "tau-reply-gateway",
        "--state-dir",
        state_dir.as_str(),
        "queue",
        "list",
    ])
    .expect("parse cli");
    let listed = execute_cli(&cli).await.expect("queue list");
    assert!(listed.contains("records=1"));
    assert!(listed.contains("state=uncertain kind=block"));
    assert!(listed.contains("route=telegram:chat-42 thread=topic-1"));
}
