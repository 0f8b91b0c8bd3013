pub mod browser;
pub mod chain;
pub mod challenge;
pub mod direct;
pub mod fingerprint;
pub mod interactive;
pub mod solver;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use crate::cli::config::FetchSettings;

// Re-export common types
pub use chain::{FetchChain, FetchContext, FetchError, FetchStrategy, FetchedPage};
pub use challenge::ChallengeDetector;

/// Assemble the strategy chain in the configured priority order.
pub fn build_chain(settings: &FetchSettings) -> Result<FetchChain> {
    let detector = ChallengeDetector::from_settings(&settings.challenge);
    let mut strategies: Vec<Arc<dyn FetchStrategy>> = Vec::new();

    for name in &settings.order {
        match name.as_str() {
            "direct" => {
                let pool = fingerprint::ProfilePool::new(settings.profiles.clone());
                let strategy = direct::DirectStrategy::new(&settings.direct, pool)
                    .context("Failed to build direct fetch strategy")?;
                strategies.push(Arc::new(strategy));
            }
            "browser" => {
                let pool = fingerprint::ProfilePool::new(settings.profiles.clone());
                strategies.push(Arc::new(browser::BrowserStrategy::new(
                    &settings.browser,
                    pool,
                )));
            }
            "solver" => {
                let strategy = solver::SolverStrategy::new(&settings.solver)
                    .context("Failed to build solver fetch strategy")?;
                strategies.push(Arc::new(strategy));
            }
            "interactive" => {
                let pool = fingerprint::ProfilePool::new(settings.profiles.clone());
                strategies.push(Arc::new(interactive::InteractiveStrategy::new(
                    &settings.interactive,
                    &settings.browser.webdriver_url,
                    pool,
                    ChallengeDetector::from_settings(&settings.challenge),
                )));
            }
            other => {
                warn!("unknown fetch strategy '{}' in configuration, skipping", other);
            }
        }
    }

    if strategies.is_empty() {
        anyhow::bail!("fetch strategy order resolved to an empty chain");
    }

    Ok(FetchChain::new(strategies, detector))
}
