//! Operator binary for the reply delivery subsystem: inspects the durable
//! queue, runs recovery passes, and sends test replies through a dispatcher.

pub mod bootstrap;
pub mod cli_args;
pub mod gateway_config;
pub mod gateway_runtime;
pub mod queue_commands;
pub mod reply_senders;

pub use bootstrap::init_tracing;
pub use cli_args::Cli;
pub use gateway_runtime::{execute_cli, run_cli};
