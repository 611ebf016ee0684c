//! Injected channel sender contract and per-attempt timeout handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::delivery_classifier::ChannelDeliveryError;
use crate::reply_payload::{DispatchKind, DurableRoute, ReplyPayload};

/// Cooperative cancellation signal handed to senders for each attempt.
#[derive(Debug, Clone, Default)]
pub struct DeliveryCancellation {
    cancelled: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl DeliveryCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the attempt as cancelled and wakes pending waiters.
    pub fn cancel(&self) {
        let already_cancelled = self.cancelled.swap(true, Ordering::SeqCst);
        if !already_cancelled {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`DeliveryCancellation::cancel`] has been called.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Metadata describing one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryAttemptContext {
    pub kind: DispatchKind,
    pub route: Option<Arc<DurableRoute>>,
    /// Durable queue id when the payload was persisted before sending.
    pub queue_id: Option<String>,
    /// 1-based attempt number within the current retry sequence.
    pub attempt: usize,
    pub cancellation: DeliveryCancellation,
}

impl DeliveryAttemptContext {
    pub fn new(kind: DispatchKind) -> Self {
        Self {
            kind,
            route: None,
            queue_id: None,
            attempt: 1,
            cancellation: DeliveryCancellation::new(),
        }
    }
}

/// Channel-specific transport (Telegram, Discord, WhatsApp, webhooks, ...).
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn deliver(
        &self,
        payload: &ReplyPayload,
        context: &DeliveryAttemptContext,
    ) -> Result<(), ChannelDeliveryError>;
}

/// Runs one sender attempt bounded by `timeout`.
///
/// On expiry the attempt's cancellation token fires and the failure carries
/// the local-timeout marker so it classifies as ambiguous.
pub async fn deliver_with_timeout(
    sender: &dyn ChannelSender,
    payload: &ReplyPayload,
    context: &DeliveryAttemptContext,
    timeout: Duration,
) -> Result<(), ChannelDeliveryError> {
    if timeout.is_zero() {
        return sender.deliver(payload, context).await;
    }
    match tokio::time::timeout(timeout, sender.deliver(payload, context)).await {
        Ok(result) => result,
        Err(_) => {
            context.cancellation.cancel();
            Err(ChannelDeliveryError::local_timeout(timeout))
        }
    }
}
