//! Cache management command

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use console::style;

use relay_cache::{default_cache_location, FsCache};
use relay_core::config;
use relay_core::paths::AbsolutePath;

use crate::cli::Cli;
use crate::exit_codes;

/// Local task cache management
#[derive(Debug, Args)]
pub struct CacheCommand {
    /// Override the local cache directory
    #[arg(long, value_name = "DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show cache statistics
    Status,
    /// Remove cache entries older than the given age
    Prune(CachePruneCommand),
    /// Remove every cached artifact
    Clean,
}

/// Prune old cache entries
#[derive(Debug, Args)]
pub struct CachePruneCommand {
    /// Maximum artifact age in days
    #[arg(long, default_value_t = 7)]
    pub max_age_days: u64,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let cache = FsCache::new(self.resolve_cache_dir(cli)?);
        match &self.action {
            CacheAction::Status => {
                let stats = cache.status()?;
                println!(
                    "{} entries, {}",
                    style(stats.entries).bold(),
                    stats.formatted_size()
                );
            }
            CacheAction::Prune(prune) => {
                let max_age = Duration::from_secs(prune.max_age_days * 24 * 60 * 60);
                let stats = cache.prune(max_age)?;
                if !cli.quiet {
                    println!(
                        "{} Pruned {} of {} entries ({} kept)",
                        style("✓").green(),
                        stats.removed,
                        stats.total,
                        stats.kept
                    );
                }
            }
            CacheAction::Clean => {
                cache.clean_all()?;
                if !cli.quiet {
                    println!("{} Cache cleared", style("✓").green());
                }
            }
        }
        Ok(exit_codes::SUCCESS)
    }

    /// The cache lives relative to the workspace root (where
    /// relay.json is), falling back to the working directory when no
    /// config is present.
    fn resolve_cache_dir(&self, cli: &Cli) -> anyhow::Result<AbsolutePath> {
        let cwd = match &cli.directory {
            Some(dir) if dir.is_absolute() => AbsolutePath::new_unchecked(dir.clone()),
            Some(dir) => AbsolutePath::cwd()?.join(dir),
            None => AbsolutePath::cwd()?,
        };
        let root = config::find_config(cwd.as_path())
            .and_then(|path| path.parent().map(|p| AbsolutePath::new_unchecked(p)))
            .unwrap_or(cwd);

        Ok(match &self.cache_dir {
            Some(dir) if dir.is_absolute() => AbsolutePath::new_unchecked(dir.clone()),
            Some(dir) => root.join(dir),
            None => default_cache_location(&root),
        })
    }
}
