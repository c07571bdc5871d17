//! CLI definition and command handling

pub mod commands;

use clap::{Parser, Subcommand};

use commands::{CacheCommand, RunCommand};

/// Relay - monorepo task runner
#[derive(Debug, Parser)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run tasks across the workspace
    Run(RunCommand),

    /// Local task cache management
    Cache(CacheCommand),
}

impl Cli {
    pub fn execute(&self) -> anyhow::Result<i32> {
        match &self.command {
            Commands::Run(cmd) => cmd.execute(self),
            Commands::Cache(cmd) => cmd.execute(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["relay", "run", "build", "--concurrency", "4"]).unwrap();
        match cli.command {
            Commands::Run(run) => {
                assert_eq!(run.tasks, vec!["build"]);
                assert_eq!(run.concurrency, 4);
            }
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_pass_through_args() {
        let cli =
            Cli::try_parse_from(["relay", "run", "test", "--", "--watch", "--bail"]).unwrap();
        match cli.command {
            Commands::Run(run) => {
                assert_eq!(run.tasks, vec!["test"]);
                assert_eq!(run.pass_through, vec!["--watch", "--bail"]);
            }
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_dry_run_variants() {
        let bare = Cli::try_parse_from(["relay", "run", "build", "--dry-run"]).unwrap();
        match bare.command {
            Commands::Run(run) => assert_eq!(run.dry_run.as_deref(), Some("text")),
            other => panic!("expected run command, got {other:?}"),
        }

        let json = Cli::try_parse_from(["relay", "run", "build", "--dry-run=json"]).unwrap();
        match json.command {
            Commands::Run(run) => assert_eq!(run.dry_run.as_deref(), Some("json")),
            other => panic!("expected run command, got {other:?}"),
        }
    }
}
