//! Session worker binary
//!
//! Spawned by the bridge, one instance per session. Speaks line-delimited
//! JSON on stdio (or a TCP loopback port); logs go to stderr, which the
//! bridge captures into the session's data dir.

use clap::Parser;
use std::process::ExitCode;

use mt5_bridge::worker::{run, WorkerArgs};

fn main() -> ExitCode {
    let args = WorkerArgs::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    run(args)
}
