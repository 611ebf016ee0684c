//! Resolves [`ReplyDeliveryConfig`] from an optional TOML file plus CLI overrides.

use std::path::Path;

use anyhow::{Context, Result};
use tau_reply_delivery::ReplyDeliveryConfig;

use crate::cli_args::Cli;

pub fn load_reply_delivery_config(path: Option<&Path>) -> Result<ReplyDeliveryConfig> {
    let Some(path) = path else {
        return Ok(ReplyDeliveryConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read reply delivery config {}", path.display()))?;
    toml::from_str::<ReplyDeliveryConfig>(&raw)
        .with_context(|| format!("failed to parse reply delivery config {}", path.display()))
}

/// Flags and `TAU_REPLY_*` env vars take precedence over file values.
pub fn resolve_gateway_config(cli: &Cli) -> Result<ReplyDeliveryConfig> {
    let mut config = load_reply_delivery_config(cli.config.as_deref())?;
    if let Some(state_dir) = cli.state_dir.as_ref() {
        config.state_dir = state_dir.clone();
    }
    if let Some(poll_interval_ms) = cli.poll_interval_ms {
        config.recovery.poll_interval_ms = poll_interval_ms;
    }
    if let Some(pass_budget_ms) = cli.pass_budget_ms {
        config.recovery.pass_budget_ms = pass_budget_ms;
    }
    if let Some(attempt_timeout_ms) = cli.attempt_timeout_ms {
        config.attempt_timeout_ms = attempt_timeout_ms;
        config.recovery.attempt_timeout_ms = attempt_timeout_ms;
    }
    config
        .validate()
        .context("invalid reply delivery configuration")?;
    Ok(config)
}
