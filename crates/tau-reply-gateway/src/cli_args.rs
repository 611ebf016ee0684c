use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliReplySender {
    /// Log deliveries instead of sending them.
    DryRun,
    /// POST each delivery as JSON to `--webhook-url`.
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliDispatchKind {
    Tool,
    Block,
    Final,
}

#[derive(Debug, Parser)]
#[command(
    name = "tau-reply-gateway",
    about = "Durable outbound reply delivery: queue inspection, recovery, and test sends",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "TAU_REPLY_CONFIG",
        global = true,
        help = "Optional TOML file with reply delivery settings"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "state-dir",
        env = "TAU_REPLY_STATE_DIR",
        global = true,
        help = "Delivery queue directory (overrides state_dir from --config)"
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "TAU_REPLY_SENDER",
        value_enum,
        default_value_t = CliReplySender::DryRun,
        global = true,
        help = "Channel sender used for recovery and test sends"
    )]
    pub sender: CliReplySender,

    #[arg(
        long = "webhook-url",
        env = "TAU_REPLY_WEBHOOK_URL",
        global = true,
        help = "Endpoint used by --sender webhook"
    )]
    pub webhook_url: Option<String>,

    #[arg(
        long = "webhook-timeout-ms",
        env = "TAU_REPLY_WEBHOOK_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        global = true,
        help = "HTTP client timeout for webhook deliveries"
    )]
    pub webhook_timeout_ms: u64,

    #[arg(
        long = "dry-run-log",
        env = "TAU_REPLY_DRY_RUN_LOG",
        global = true,
        help = "Optional JSONL file receiving dry-run deliveries"
    )]
    pub dry_run_log: Option<PathBuf>,

    #[arg(
        long = "poll-interval-ms",
        env = "TAU_REPLY_POLL_INTERVAL_MS",
        value_parser = parse_positive_u64,
        global = true,
        help = "Recovery loop interval"
    )]
    pub poll_interval_ms: Option<u64>,

    #[arg(
        long = "pass-budget-ms",
        env = "TAU_REPLY_PASS_BUDGET_MS",
        value_parser = parse_positive_u64,
        global = true,
        help = "Time budget for one recovery pass"
    )]
    pub pass_budget_ms: Option<u64>,

    #[arg(
        long = "attempt-timeout-ms",
        env = "TAU_REPLY_ATTEMPT_TIMEOUT_MS",
        value_parser = parse_positive_u64,
        global = true,
        help = "Per-attempt delivery timeout for dispatch and recovery"
    )]
    pub attempt_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Inspect the durable delivery queue.
    Queue {
        #[command(subcommand)]
        command: CliQueueCommand,
    },
    /// Run one recovery pass and print its summary.
    Recover {
        #[arg(long, help = "Print the summary as JSON")]
        json: bool,
    },
    /// Run the recovery loop until interrupted.
    Run,
    /// Dispatch one reply through a durable dispatcher.
    Send {
        #[arg(long, help = "Channel name recorded on the delivery route")]
        channel: String,
        #[arg(long, help = "Recipient or conversation id")]
        to: String,
        #[arg(long, help = "Optional thread id")]
        thread: Option<String>,
        #[arg(long, value_enum, default_value_t = CliDispatchKind::Final)]
        kind: CliDispatchKind,
        #[arg(long = "media", help = "Media URL to attach (repeatable)")]
        media: Vec<String>,
        #[arg(required = true, num_args = 1.., help = "Reply text")]
        text: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum CliQueueCommand {
    /// List pending deliveries, oldest first.
    List {
        #[arg(long, help = "Print records as JSON")]
        json: bool,
        #[arg(long, help = "List archived failed deliveries instead")]
        failed: bool,
    },
    /// Print one delivery record as JSON.
    Show { queue_id: String },
}
