//! Watchdog + application pool helper process.
//!
//! This binary plays both roles the embedding web server talks to: it
//! supervises a helper generation (`helper::start`) hosting the pool RPC
//! socket, and it watches `--feedback-fd` to know when to restart or tear
//! the whole thing down (`watchdog::run`).

mod cli;
mod feedback;
mod helper;
mod password;
mod watchdog;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Args;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_logging(&args.log_level);

    let code = watchdog::run(args).await;
    std::process::exit(code);
}

fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
