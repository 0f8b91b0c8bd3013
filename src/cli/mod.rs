pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to the default log file
    #[arg(long, global = true)]
    log_to_file: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn log_to_file(&self) -> bool {
        self.log_to_file
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl every configured source
    CrawlAll {
        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Maximum postings per source
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Crawl a single source on demand
    Crawl {
        /// Source name to crawl
        #[arg(required = true)]
        source: String,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Maximum postings to crawl
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Check status of a crawl job
    Status {
        /// Job ID to check status for
        #[arg(required = true)]
        job_id: String,
    },

    /// List recent crawl jobs
    History {
        /// Only show jobs for this source
        #[arg(short, long)]
        source: Option<String>,

        /// Maximum jobs to list
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show duplicate-detection statistics
    Stats,

    /// List the configured sources
    Sources,

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::CrawlAll { profile, limit } => {
            info!("Starting batch crawl across all sources");
            commands::crawl_all(profile, limit).await
        },
        Commands::Crawl { source, profile, limit } => {
            info!("Starting crawl for source {}", source);
            commands::crawl_one(source, profile, limit).await
        },
        Commands::Status { job_id } => {
            info!("Checking status for job {}", job_id);
            commands::status(job_id).await
        },
        Commands::History { source, limit } => {
            commands::history(source, limit).await
        },
        Commands::Stats => {
            commands::stats().await
        },
        Commands::Sources => {
            commands::sources().await
        },
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name).await
            } else {
                info!("Showing current configuration");
                commands::show_config().await
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }
}
