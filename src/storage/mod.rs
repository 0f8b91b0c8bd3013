pub mod history;
pub mod index;

use std::sync::Arc;

use anyhow::Result;

use crate::cli::config::{HistorySettings, IndexSettings};

// Re-export common types
pub use history::{HistoryStore, MemoryHistory, PostgresHistory};
pub use index::{HttpSearchIndex, InsertOutcome, MemoryIndex, SearchIndex, StoredPosting};

/// Create a SearchIndex backend from the settings.
pub fn create_index(settings: &IndexSettings) -> Result<Arc<dyn SearchIndex>> {
    match settings.backend.as_str() {
        "http" => {
            let index = HttpSearchIndex::new(settings)?;
            Ok(Arc::new(index))
        }
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        other => {
            anyhow::bail!("Unsupported search index backend: {}", other);
        }
    }
}

/// Create a HistoryStore backend from the settings.
pub async fn create_history(settings: &HistorySettings) -> Result<Arc<dyn HistoryStore>> {
    match settings.backend.as_str() {
        "postgres" => {
            let store = PostgresHistory::new(settings).await?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(MemoryHistory::new())),
        other => {
            anyhow::bail!("Unsupported history store backend: {}", other);
        }
    }
}
