use anyhow::Result;
use tracing::{info, error};

mod cli;
mod crawler;
mod dedup;
mod fetch;
mod storage;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Initialize logging
    let log_file = args.log_to_file().then(utils::default_log_file);
    utils::init_logging(args.verbose(), log_file)?;

    info!("Starting Job Harvester v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {}", e);
            Err(e)
        }
    }
}
