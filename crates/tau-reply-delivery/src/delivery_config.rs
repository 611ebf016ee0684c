//! Serializable configuration for reply dispatch and delivery recovery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::channel_sender::ChannelSender;
use crate::delivery_recovery::{
    DeliveryRecoveryLoopConfig, RecoveryOptions, RecoveryTrigger, DEFAULT_FRESH_RECORD_GRACE_MS,
    DEFAULT_MAX_RECOVERY_ATTEMPTS, DEFAULT_RECOVERY_ATTEMPT_TIMEOUT_MS,
    DEFAULT_RECOVERY_PASS_BUDGET_MS, DEFAULT_RECOVERY_POLL_INTERVAL_MS,
};
use crate::delivery_retry::RetryPolicy;
use crate::delivery_store::FileDeliveryStoreConfig;
use crate::human_delay::HumanDelayConfig;
use crate::reply_dispatcher::{ReplyDispatcherOptions, DEFAULT_ATTEMPT_TIMEOUT_MS};
use crate::reply_normalize::{DefaultReplyNormalizer, DEFAULT_HEARTBEAT_TOKEN, DEFAULT_SILENT_TOKEN};

const DEFAULT_STATE_DIR: &str = ".tau/reply-delivery";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub poll_interval_ms: u64,
    pub pass_budget_ms: u64,
    pub max_recovery_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub fresh_record_grace_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_RECOVERY_POLL_INTERVAL_MS,
            pass_budget_ms: DEFAULT_RECOVERY_PASS_BUDGET_MS,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            attempt_timeout_ms: DEFAULT_RECOVERY_ATTEMPT_TIMEOUT_MS,
            fresh_record_grace_ms: DEFAULT_FRESH_RECORD_GRACE_MS,
        }
    }
}

/// Top-level reply delivery settings (the `[reply_delivery]`-style TOML document).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyDeliveryConfig {
    pub retry: RetryPolicy,
    pub attempt_timeout_ms: u64,
    pub human_delay: HumanDelayConfig,
    pub response_prefix: Option<String>,
    pub heartbeat_token: String,
    pub silent_token: String,
    pub recovery: RecoveryConfig,
    pub state_dir: PathBuf,
}

impl Default for ReplyDeliveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
            human_delay: HumanDelayConfig::default(),
            response_prefix: None,
            heartbeat_token: DEFAULT_HEARTBEAT_TOKEN.to_string(),
            silent_token: DEFAULT_SILENT_TOKEN.to_string(),
            recovery: RecoveryConfig::default(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

impl ReplyDeliveryConfig {
    pub fn validate(&self) -> Result<()> {
        if let Err(reason) = self.retry.validate() {
            bail!("invalid reply delivery retry policy: {reason}");
        }
        if self.attempt_timeout_ms == 0 {
            bail!("attempt_timeout_ms must be greater than 0");
        }
        if self.recovery.poll_interval_ms == 0 {
            bail!("recovery.poll_interval_ms must be greater than 0");
        }
        if self.recovery.pass_budget_ms == 0 {
            bail!("recovery.pass_budget_ms must be greater than 0");
        }
        if self.recovery.max_recovery_attempts == 0 {
            bail!("recovery.max_recovery_attempts must be greater than 0");
        }
        if self.recovery.attempt_timeout_ms == 0 {
            bail!("recovery.attempt_timeout_ms must be greater than 0");
        }
        // A live dispatcher renews its record at least this often.
        let lease_gap_ms = self.attempt_timeout_ms.max(self.retry.max_delay_ms);
        if self.recovery.fresh_record_grace_ms <= lease_gap_ms {
            bail!(
                "recovery.fresh_record_grace_ms ({}) must exceed the longest dispatcher lease gap ({lease_gap_ms} ms from attempt_timeout_ms and retry.max_delay_ms)",
                self.recovery.fresh_record_grace_ms
            );
        }
        if self.state_dir.as_os_str().is_empty() {
            bail!("state_dir must not be empty");
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn normalizer(&self) -> DefaultReplyNormalizer {
        let normalizer = DefaultReplyNormalizer {
            heartbeat_token: self.heartbeat_token.clone(),
            silent_token: self.silent_token.clone(),
            ..DefaultReplyNormalizer::default()
        };
        match self.response_prefix.as_deref() {
            Some(prefix) => normalizer.with_response_prefix(prefix),
            None => normalizer,
        }
    }

    /// Dispatcher options seeded from this config; route, store, and registry are left to the caller.
    pub fn dispatcher_options(&self, sender: Arc<dyn ChannelSender>) -> ReplyDispatcherOptions {
        ReplyDispatcherOptions::new(sender)
            .with_normalizer(Arc::new(self.normalizer()))
            .with_retry(self.retry.clone())
            .with_attempt_timeout(self.attempt_timeout())
            .with_human_delay(self.human_delay.clone())
    }

    pub fn recovery_options(&self) -> RecoveryOptions {
        RecoveryOptions {
            pass_budget: Duration::from_millis(self.recovery.pass_budget_ms),
            attempt_timeout: Duration::from_millis(self.recovery.attempt_timeout_ms),
            max_recovery_attempts: self.recovery.max_recovery_attempts,
            fresh_record_grace: Duration::from_millis(self.recovery.fresh_record_grace_ms),
            trigger: RecoveryTrigger::Manual,
        }
    }

    pub fn recovery_loop_config(&self) -> DeliveryRecoveryLoopConfig {
        DeliveryRecoveryLoopConfig {
            poll_interval: Duration::from_millis(self.recovery.poll_interval_ms),
            recovery: self.recovery_options(),
        }
    }

    pub fn file_store_config(&self) -> FileDeliveryStoreConfig {
        FileDeliveryStoreConfig::new(&self.state_dir).with_env_rotation()
    }
}
