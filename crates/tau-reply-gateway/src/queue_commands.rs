//! Operator views of the durable delivery queue.

use anyhow::{Context, Result};
use tau_reply_delivery::{
    current_unix_timestamp_ms, DeliveryRecord, DeliveryStore, FileDeliveryStore, RecoverySummary,
};

pub async fn render_queue_list(store: &FileDeliveryStore, json: bool, failed: bool) -> Result<String> {
    let records = if failed {
        store
            .load_failed_deliveries()
            .context("failed to load archived deliveries")?
    } else {
        store
            .load_pending_deliveries()
            .await
            .context("failed to load pending deliveries")?
    };
    if json {
        return serde_json::to_string_pretty(&records).context("failed to encode delivery records");
    }
    let now_unix_ms = current_unix_timestamp_ms();
    let mut lines = vec![format!(
        "reply delivery queue: state_dir={} view={} records={}",
        store.state_dir().display(),
        if failed { "failed" } else { "pending" },
        records.len()
    )];
    lines.extend(
        records
            .iter()
            .map(|record| render_delivery_record_row(record, now_unix_ms)),
    );
    Ok(lines.join("\n"))
}

pub async fn render_queue_show(store: &FileDeliveryStore, queue_id: &str) -> Result<String> {
    let record = store
        .get_delivery(queue_id)
        .await
        .with_context(|| format!("failed to read delivery {queue_id}"))?
        .with_context(|| format!("delivery {queue_id} not found"))?;
    serde_json::to_string_pretty(&record).context("failed to encode delivery record")
}

pub fn render_recovery_summary(summary: &RecoverySummary, json: bool) -> Result<String> {
    if json {
        return serde_json::to_string_pretty(summary).context("failed to encode recovery summary");
    }
    Ok(format!(
        "reply delivery recovery: trigger={} recovered={} failed={} skipped={}",
        summary.trigger, summary.recovered, summary.failed, summary.skipped
    ))
}

fn render_delivery_record_row(record: &DeliveryRecord, now_unix_ms: u64) -> String {
    format!(
        "delivery: queue_id={} state={} kind={} route={} attempts={} age_ms={} last_error={} preview={:?}",
        record.queue_id,
        record.state,
        record.kind.as_str(),
        record.route.describe(),
        record.attempt_count,
        now_unix_ms.saturating_sub(record.created_unix_ms),
        record.last_error.as_deref().unwrap_or("none"),
        record.payload.preview(60),
    )
}
