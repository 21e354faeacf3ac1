//! wsrelay - Resumable TCP-over-WebSocket relay tunnel.

use clap::Parser;
use tracing_subscriber::EnvFilter;
use wsrelay::{run_listen, run_probe, BuildInfo, Cli, Command};

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Listen(args) => {
            tracing::debug!(?args, "Listen arguments");

            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            if let Err(e) = runtime.block_on(run_listen(&args)) {
                tracing::error!(error = %e, "listen error");
                std::process::exit(e.exit_code().into());
            }
        }
        Command::Probe(args) => {
            tracing::debug!(?args, "Probe arguments");

            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            if let Err(e) = runtime.block_on(run_probe(&args)) {
                tracing::error!(error = %e, "probe error");
                std::process::exit(e.exit_code().into());
            }
        }
        Command::Version => {
            let info = BuildInfo::get();
            println!("{}", info.format());
        }
    }
}
