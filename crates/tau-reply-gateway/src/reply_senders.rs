//! Channel senders available to the gateway binary.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde::Serialize;
use tau_reply_delivery::{
    current_unix_timestamp_ms, ChannelDeliveryError, ChannelSender, DeliveryAttemptContext,
    DurableRoute, ReplyPayload,
};

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a> {
    kind: &'a str,
    attempt: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    route: Option<&'a DurableRoute>,
    payload: &'a ReplyPayload,
}

impl<'a> OutboundEnvelope<'a> {
    fn new(payload: &'a ReplyPayload, context: &'a DeliveryAttemptContext) -> Self {
        Self {
            kind: context.kind.as_str(),
            attempt: context.attempt,
            queue_id: context.queue_id.as_deref(),
            route: context.route.as_deref(),
            payload,
        }
    }
}

/// Posts each delivery as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct WebhookChannelSender {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookChannelSender {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into();
        reqwest::Url::parse(&endpoint)
            .with_context(|| format!("invalid webhook url '{endpoint}'"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook http client")?;
        Ok(Self { client, endpoint })
    }

    async fn post(&self, envelope: &OutboundEnvelope<'_>) -> Result<(), ChannelDeliveryError> {
        let response = self
            .client
            .post(self.endpoint.as_str())
            .json(envelope)
            .send()
            .await
            .map_err(|error| map_transport_error(&error))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        let body = body.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
        let mut error = ChannelDeliveryError::from_status(status.as_u16(), body);
        if let Some(retry_after) = retry_after {
            error = error.with_retry_after(retry_after);
        }
        Err(error)
    }
}

#[async_trait]
impl ChannelSender for WebhookChannelSender {
    async fn deliver(
        &self,
        payload: &ReplyPayload,
        context: &DeliveryAttemptContext,
    ) -> Result<(), ChannelDeliveryError> {
        let envelope = OutboundEnvelope::new(payload, context);
        tokio::select! {
            result = self.post(&envelope) => result,
            _ = context.cancellation.cancelled() => Err(
                ChannelDeliveryError::new("webhook delivery aborted").with_code("ABORT_ERR"),
            ),
        }
    }
}

/// Maps reqwest transport failures onto errno-style codes understood by the classifier.
fn map_transport_error(error: &reqwest::Error) -> ChannelDeliveryError {
    let message = format!("webhook transport error: {error}");
    let code = if error.is_connect() && error.is_timeout() {
        Some("UND_ERR_CONNECT_TIMEOUT")
    } else if error.is_connect() {
        Some("ECONNREFUSED")
    } else if error.is_timeout() {
        Some("ETIMEDOUT")
    } else if error.is_request() || error.is_body() {
        Some("ECONNRESET")
    } else {
        None
    };
    match code {
        Some(code) => ChannelDeliveryError::new(message).with_code(code),
        None => ChannelDeliveryError::new(message),
    }
}

#[derive(Debug, Serialize)]
struct DryRunLine<'a> {
    timestamp_unix_ms: u64,
    #[serde(flatten)]
    envelope: OutboundEnvelope<'a>,
}

/// Records deliveries locally instead of contacting a channel.
#[derive(Debug, Default)]
pub struct DryRunChannelSender {
    log_path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl DryRunChannelSender {
    pub fn new(log_path: Option<PathBuf>) -> Self {
        Self {
            log_path,
            write_lock: Mutex::new(()),
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let Some(path) = self.log_path.as_ref() else {
            return Ok(());
        };
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")
    }
}

#[async_trait]
impl ChannelSender for DryRunChannelSender {
    async fn deliver(
        &self,
        payload: &ReplyPayload,
        context: &DeliveryAttemptContext,
    ) -> Result<(), ChannelDeliveryError> {
        let line = DryRunLine {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            envelope: OutboundEnvelope::new(payload, context),
        };
        let rendered = serde_json::to_string(&line).map_err(|error| {
            ChannelDeliveryError::permanent(format!("failed to encode dry-run delivery: {error}"))
        })?;
        tracing::info!(
            kind = context.kind.as_str(),
            route = %context.route.as_ref().map(|route| route.describe()).unwrap_or_default(),
            preview = %payload.preview(80),
            "dry-run reply delivery"
        );
        self.append(&rendered).map_err(|error| {
            ChannelDeliveryError::new(format!("failed to append dry-run log: {error}"))
                .with_code("EPIPE")
        })
    }
}
