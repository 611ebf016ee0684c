use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tau_reply_delivery::{
    recover_pending_deliveries, ChannelSender, DeliveryErrorClass, DeliveryRecoveryLoop,
    DispatchKind, DispatchOutcome, DispatcherRegistry, DurableRoute, FileDeliveryStore,
    ReplyDeliveryConfig, ReplyDispatcher, ReplyPayload,
};

use crate::cli_args::{Cli, CliCommand, CliDispatchKind, CliQueueCommand, CliReplySender};
use crate::gateway_config::resolve_gateway_config;
use crate::queue_commands::{render_queue_list, render_queue_show, render_recovery_summary};
use crate::reply_senders::{DryRunChannelSender, WebhookChannelSender};

/// Extra time granted on top of the retry schedule before `send` stops waiting.
const SEND_DRAIN_GRACE: Duration = Duration::from_secs(5);

pub async fn run_cli(cli: Cli) -> Result<()> {
    let output = execute_cli(&cli).await?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

pub async fn execute_cli(cli: &Cli) -> Result<String> {
    let config = resolve_gateway_config(cli)?;
    let store = Arc::new(
        FileDeliveryStore::open(config.file_store_config()).with_context(|| {
            format!(
                "failed to open reply delivery store {}",
                config.state_dir.display()
            )
        })?,
    );

    match &cli.command {
        CliCommand::Queue {
            command: CliQueueCommand::List { json, failed },
        } => render_queue_list(&store, *json, *failed).await,
        CliCommand::Queue {
            command: CliQueueCommand::Show { queue_id },
        } => render_queue_show(&store, queue_id).await,
        CliCommand::Recover { json } => {
            let sender = build_sender(cli)?;
            let summary =
                recover_pending_deliveries(store.as_ref(), sender.as_ref(), &config.recovery_options())
                    .await
                    .context("reply delivery recovery pass failed")?;
            render_recovery_summary(&summary, *json)
        }
        CliCommand::Run => {
            let sender = build_sender(cli)?;
            run_recovery_until_interrupted(&config, store, sender).await
        }
        CliCommand::Send {
            channel,
            to,
            thread,
            kind,
            media,
            text,
        } => {
            let mut route = DurableRoute::new(channel.as_str(), to.as_str());
            if let Some(thread) = thread.as_deref() {
                route = route.with_thread(thread);
            }
            let payload = media
                .iter()
                .fold(ReplyPayload::text(text.join(" ")), |payload, url| {
                    payload.with_media(url.as_str())
                });
            let sender = build_sender(cli)?;
            send_one_reply(&config, store, sender, route, dispatch_kind(*kind), payload).await
        }
    }
}

pub fn build_sender(cli: &Cli) -> Result<Arc<dyn ChannelSender>> {
    match cli.sender {
        CliReplySender::DryRun => Ok(Arc::new(DryRunChannelSender::new(cli.dry_run_log.clone()))),
        CliReplySender::Webhook => {
            let Some(url) = cli.webhook_url.as_deref() else {
                bail!("--webhook-url is required when --sender webhook");
            };
            let sender =
                WebhookChannelSender::new(url, Duration::from_millis(cli.webhook_timeout_ms))?;
            Ok(Arc::new(sender))
        }
    }
}

fn dispatch_kind(kind: CliDispatchKind) -> DispatchKind {
    match kind {
        CliDispatchKind::Tool => DispatchKind::Tool,
        CliDispatchKind::Block => DispatchKind::Block,
        CliDispatchKind::Final => DispatchKind::Final,
    }
}

async fn run_recovery_until_interrupted(
    config: &ReplyDeliveryConfig,
    store: Arc<FileDeliveryStore>,
    sender: Arc<dyn ChannelSender>,
) -> Result<String> {
    let recovery_loop = DeliveryRecoveryLoop::new(store, sender, config.recovery_loop_config());
    recovery_loop.start()?;
    tracing::info!(
        state_dir = %config.state_dir.display(),
        poll_interval_ms = config.recovery.poll_interval_ms,
        "reply delivery recovery loop running; press ctrl-c to stop"
    );
    let interrupted = tokio::signal::ctrl_c().await;
    recovery_loop.stop().await;
    interrupted.context("failed to listen for ctrl-c")?;

    Ok(match recovery_loop.last_summary() {
        Some(summary) => render_recovery_summary(&summary, false)?,
        None => "reply delivery recovery: no pass completed".to_string(),
    })
}

async fn send_one_reply(
    config: &ReplyDeliveryConfig,
    store: Arc<FileDeliveryStore>,
    sender: Arc<dyn ChannelSender>,
    route: DurableRoute,
    kind: DispatchKind,
    payload: ReplyPayload,
) -> Result<String> {
    let route_label = route.describe();
    let registry = DispatcherRegistry::new();
    let dispatcher = ReplyDispatcher::new(
        config
            .dispatcher_options(sender)
            .with_durable_route(route, store)
            .with_registry(registry.clone()),
    )?;
    let outcome = dispatcher.enqueue_and_wait(kind, payload).await;
    dispatcher.mark_complete();

    let drain_timeout = config
        .attempt_timeout()
        .saturating_mul(u32::try_from(config.retry.max_attempts()).unwrap_or(u32::MAX))
        .saturating_add(SEND_DRAIN_GRACE);
    if !registry.wait_for_all_idle(drain_timeout).await {
        tracing::warn!(route = %route_label, "reply dispatcher did not drain before exit");
    }

    match outcome {
        DispatchOutcome::Sent => Ok(format!(
            "reply dispatch: status=sent kind={} route={}",
            kind.as_str(),
            route_label
        )),
        DispatchOutcome::Skipped(reason) => Ok(format!(
            "reply dispatch: status=skipped kind={} route={} reason={}",
            kind.as_str(),
            route_label,
            reason.as_str()
        )),
        DispatchOutcome::Failed(failure) if failure.class == DeliveryErrorClass::TransientAmbiguous => {
            Ok(format!(
                "reply dispatch: status=uncertain kind={} route={} queue_id={} error={}",
                kind.as_str(),
                route_label,
                failure.queue_id.as_deref().unwrap_or("none"),
                failure.error.detail()
            ))
        }
        DispatchOutcome::Failed(failure) => {
            bail!("reply dispatch to {route_label} failed: {failure}")
        }
    }
}
