//! Relay - monorepo task runner

mod cli;
mod exit_codes;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.execute() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{} {err:#}", console::style("error:").red().bold());
            std::process::exit(exit_codes::ERROR);
        }
    }
}
