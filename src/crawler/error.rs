use thiserror::Error;

use crate::fetch::chain::FetchError;

/// Errors surfaced by the crawl pipeline.
///
/// Posting-level errors (`Validation`) are absorbed and counted by the step
/// that hits them; step-level errors (`Fetch`, `Persistence`) terminate the
/// job early; source-level errors (`NotAvailable`) are isolated by the
/// orchestrator and never abort sibling sources.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The source failed its availability probe before any fetch budget was
    /// spent.
    #[error("source '{0}' is not available")]
    NotAvailable(String),

    /// The fetch strategy chain gave up, either exhausted or blocked by an
    /// unresolved challenge.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// An extracted posting is missing a required field.
    #[error("posting is missing required field '{field}'")]
    Validation { field: &'static str },

    /// A write to the search index or history store failed.
    #[error("persistence failure: {context}")]
    Persistence { context: String },
}

impl CrawlError {
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence {
            context: err.to_string(),
        }
    }
}
