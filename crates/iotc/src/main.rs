mod cli;
mod commands;
mod config;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    tracing::debug!(command = ?cli.command, "dispatching command");
    match cli.command {
        Command::DeriveKey {
            device_id,
            group_key,
        } => commands::keys::derive(&device_id, &group_key, &cli.global),
        Command::Sas(args) => commands::keys::sas(args, &cli.global),
        Command::Profile(args) => commands::profile::handle(args, &cli.global),
        Command::Upload(args) => commands::upload::handle(args, &cli.global).await,
        Command::DecodeCredentials(args) => commands::credentials::decode(args, &cli.global),
        Command::Send(args) => commands::send::handle(args, &cli.global).await,
    }
}
