use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cli::config::DedupSettings;
use crate::crawler::error::CrawlError;
use crate::crawler::posting::Posting;
use crate::dedup::fingerprint::{canonical_identity, content_hash, fingerprints_for, Fingerprint};
use crate::dedup::similarity::posting_similarity;
use crate::storage::history::HistoryStore;
use crate::storage::index::{InsertOutcome, SearchIndex, StoredPosting};

/// How a duplicate was detected. Ordered by check cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMethod {
    NativeId,
    Url,
    Hash,
    Fuzzy,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NativeId => "id-match",
            Self::Url => "url-match",
            Self::Hash => "hash-match",
            Self::Fuzzy => "fuzzy-match",
        };
        f.write_str(s)
    }
}

/// Append-only evidence of a rejected duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateRecord {
    /// Id of the stored posting the candidate duplicated
    pub original_id: String,
    pub method: DetectionMethod,
    /// Similarity score, for fuzzy matches
    pub score: Option<f64>,
    pub source: String,
    pub title: String,
    pub company: String,
    pub url: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Outcome of running a posting through the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The posting was new; it has been persisted and its fingerprints
    /// recorded under `id`.
    New { id: String },
    /// The posting duplicates an existing entry and was not persisted.
    Duplicate {
        method: DetectionMethod,
        score: Option<f64>,
    },
}

/// Multi-tier duplicate detection in increasing cost order:
/// native-id, canonical URL, content hash, then fuzzy title/company match.
///
/// The upfront checks are an optimization; the index's uniqueness
/// constraint is the final arbiter when concurrent callers race on the
/// same posting.
pub struct DedupEngine {
    index: Arc<dyn SearchIndex>,
    history: Arc<dyn HistoryStore>,
    fuzzy_threshold: f64,
    candidate_limit: usize,
}

impl DedupEngine {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        history: Arc<dyn HistoryStore>,
        settings: &DedupSettings,
    ) -> Self {
        Self {
            index,
            history,
            fuzzy_threshold: settings.fuzzy_threshold,
            candidate_limit: settings.candidate_limit,
        }
    }

    /// Check a posting against everything already stored; persist it when
    /// new, record a `DuplicateRecord` when not.
    pub async fn ingest(&self, posting: &Posting) -> Result<IngestOutcome, CrawlError> {
        // Tier 1: stable per-source id
        if let Some(id) = posting
            .source_native_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        {
            let fp = Fingerprint::NativeId {
                source: posting.source.clone(),
                id: id.to_string(),
            };
            if let Some(existing) = self.lookup(&fp).await? {
                return Ok(self
                    .reject(posting, &existing, DetectionMethod::NativeId, None)
                    .await);
            }
        }

        // Tier 2: canonical URL (surrogate when the posting has none)
        let canonical = canonical_identity(posting);
        let url_fp = Fingerprint::CanonicalUrl(canonical);
        if let Some(existing) = self.lookup(&url_fp).await? {
            return Ok(self
                .reject(posting, &existing, DetectionMethod::Url, None)
                .await);
        }

        // Tier 3: content hash
        let hash_fp = Fingerprint::ContentHash(content_hash(posting));
        if let Some(existing) = self.lookup(&hash_fp).await? {
            return Ok(self
                .reject(posting, &existing, DetectionMethod::Hash, None)
                .await);
        }

        // Tier 4: fuzzy match over same-company candidates
        let candidates = self
            .index
            .find_candidates(&posting.company, &posting.title, self.candidate_limit)
            .await
            .map_err(CrawlError::persistence)?;
        for candidate in &candidates {
            let score = posting_similarity(
                &posting.title,
                &posting.company,
                &candidate.posting.title,
                &candidate.posting.company,
            );
            if score > self.fuzzy_threshold {
                return Ok(self
                    .reject(posting, candidate, DetectionMethod::Fuzzy, Some(score))
                    .await);
            }
        }

        // New posting: persist it with its fingerprints. A constraint
        // violation here means a concurrent caller won the race - that is a
        // duplicate outcome, not an error.
        let fingerprints = fingerprints_for(posting);
        match self
            .index
            .insert(posting, &fingerprints)
            .await
            .map_err(CrawlError::persistence)?
        {
            InsertOutcome::Inserted { id } => {
                debug!("accepted new posting '{}' as {}", posting.title, id);
                Ok(IngestOutcome::New { id })
            }
            InsertOutcome::DuplicateConflict => {
                let original_id = self
                    .lookup(&url_fp)
                    .await
                    .ok()
                    .flatten()
                    .map(|existing| existing.id)
                    .unwrap_or_else(|| "unknown".to_string());
                self.log_duplicate(posting, &original_id, DetectionMethod::Url, None)
                    .await;
                Ok(IngestOutcome::Duplicate {
                    method: DetectionMethod::Url,
                    score: None,
                })
            }
        }
    }

    async fn lookup(&self, fp: &Fingerprint) -> Result<Option<StoredPosting>, CrawlError> {
        self.index.lookup(fp).await.map_err(CrawlError::persistence)
    }

    async fn reject(
        &self,
        posting: &Posting,
        existing: &StoredPosting,
        method: DetectionMethod,
        score: Option<f64>,
    ) -> IngestOutcome {
        debug!(
            "rejected '{}' from {} as {} of {}",
            posting.title, posting.source, method, existing.id
        );
        self.log_duplicate(posting, &existing.id, method, score).await;
        IngestOutcome::Duplicate { method, score }
    }

    async fn log_duplicate(
        &self,
        posting: &Posting,
        original_id: &str,
        method: DetectionMethod,
        score: Option<f64>,
    ) {
        let record = DuplicateRecord {
            original_id: original_id.to_string(),
            method,
            score,
            source: posting.source.clone(),
            title: posting.title.clone(),
            company: posting.company.clone(),
            url: posting.url.clone(),
            detected_at: Utc::now(),
        };
        // The audit trail must never turn a duplicate into a failed step
        if let Err(err) = self.history.log_duplicate(&record).await {
            warn!("failed to record duplicate audit entry: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::history::MemoryHistory;
    use crate::storage::index::MemoryIndex;
    use chrono::Utc;

    fn engine() -> (DedupEngine, Arc<MemoryIndex>, Arc<MemoryHistory>) {
        let index = Arc::new(MemoryIndex::new());
        let history = Arc::new(MemoryHistory::new());
        let engine = DedupEngine::new(
            index.clone(),
            history.clone(),
            &DedupSettings::default(),
        );
        (engine, index, history)
    }

    fn posting(title: &str, company: &str, url: Option<&str>) -> Posting {
        Posting {
            title: title.to_string(),
            company: company.to_string(),
            description: format!("{} role at {}", title, company),
            url: url.map(str::to_string),
            location: Some("Hanoi".to_string()),
            salary: None,
            job_type: None,
            experience_level: None,
            posted_at: Utc::now(),
            source: "exampleboard".to_string(),
            source_native_id: None,
        }
    }

    #[tokio::test]
    async fn test_ingest_is_new_then_duplicate() {
        let (engine, _, _) = engine();
        let p = posting("IT Lead", "Example Co", Some("https://x.example/job/1"));

        assert!(matches!(
            engine.ingest(&p).await.unwrap(),
            IngestOutcome::New { .. }
        ));
        assert!(matches!(
            engine.ingest(&p).await.unwrap(),
            IngestOutcome::Duplicate { .. }
        ));
    }

    #[tokio::test]
    async fn test_native_id_match_wins_first() {
        let (engine, _, _) = engine();
        let mut first = posting("IT Lead", "Example Co", Some("https://x.example/job/1"));
        first.source_native_id = Some("1833111".to_string());
        engine.ingest(&first).await.unwrap();

        // Same native id, everything else different
        let mut second = posting("Platform Lead", "Example Company", Some("https://x.example/job/other"));
        second.source_native_id = Some("1833111".to_string());
        match engine.ingest(&second).await.unwrap() {
            IngestOutcome::Duplicate { method, .. } => {
                assert_eq!(method, DetectionMethod::NativeId)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tracking_params_rejected_by_url_match() {
        let (engine, _, _) = engine();
        let first = posting("IT Lead", "Example Co", Some("https://x.example/job/1?utm=abc"));
        engine.ingest(&first).await.unwrap();

        let mut second = posting("IT Lead (updated)", "Example Co", Some("https://x.example/job/1"));
        second.description = "refreshed description".to_string();
        match engine.ingest(&second).await.unwrap() {
            IngestOutcome::Duplicate { method, .. } => assert_eq!(method, DetectionMethod::Url),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_content_different_url_rejected_by_hash() {
        let (engine, _, _) = engine();
        let first = posting("IT Lead", "Example Co", Some("https://x.example/job/1"));
        engine.ingest(&first).await.unwrap();

        // Re-listed under a new URL with identical content
        let second = posting("IT Lead", "Example Co", Some("https://x.example/job/2"));
        match engine.ingest(&second).await.unwrap() {
            IngestOutcome::Duplicate { method, .. } => assert_eq!(method, DetectionMethod::Hash),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_near_identical_rejected_by_fuzzy() {
        let (engine, _, history) = engine();
        let first = posting("Senior Backend Engineer", "Acme Corp", Some("https://x.example/1"));
        engine.ingest(&first).await.unwrap();

        let mut second = posting("Senior Backend Engineer II", "Acme Corp", Some("https://x.example/2"));
        second.description = "completely different description text".to_string();
        match engine.ingest(&second).await.unwrap() {
            IngestOutcome::Duplicate { method, score } => {
                assert_eq!(method, DetectionMethod::Fuzzy);
                assert!(score.unwrap() > 0.85);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let stats = history.duplicate_stats().await.unwrap();
        assert_eq!(stats.get("fuzzy-match"), Some(&1));
    }

    #[tokio::test]
    async fn test_no_url_identical_fields_rejected_via_surrogate() {
        let (engine, _, _) = engine();
        let first = posting("IT Lead", "Example Co", None);
        engine.ingest(&first).await.unwrap();

        // No native id, no URL; same title/company/location but different
        // description so the content hash differs too
        let mut second = posting("IT Lead", "Example Co", None);
        second.description = "different body".to_string();
        match engine.ingest(&second).await.unwrap() {
            IngestOutcome::Duplicate { method, .. } => assert_eq!(method, DetectionMethod::Url),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    /// Index that misses every upfront lookup but loses the insert race -
    /// the shape of two concurrent callers passing the checks for the same
    /// posting.
    struct RacingIndex;

    #[async_trait::async_trait]
    impl SearchIndex for RacingIndex {
        async fn insert(
            &self,
            _posting: &Posting,
            _fingerprints: &[Fingerprint],
        ) -> anyhow::Result<InsertOutcome> {
            Ok(InsertOutcome::DuplicateConflict)
        }

        async fn lookup(&self, _fp: &Fingerprint) -> anyhow::Result<Option<StoredPosting>> {
            Ok(None)
        }

        async fn find_candidates(
            &self,
            _company: &str,
            _title: &str,
            _limit: usize,
        ) -> anyhow::Result<Vec<StoredPosting>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _id: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_insert_conflict_reported_as_url_duplicate() {
        let history = Arc::new(MemoryHistory::new());
        let engine = DedupEngine::new(
            Arc::new(RacingIndex),
            history.clone(),
            &DedupSettings::default(),
        );

        let p = posting("IT Lead", "Example Co", Some("https://x.example/job/1"));
        match engine.ingest(&p).await.unwrap() {
            IngestOutcome::Duplicate { method, score } => {
                assert_eq!(method, DetectionMethod::Url);
                assert!(score.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The lost race still leaves an audit entry
        let stats = history.duplicate_stats().await.unwrap();
        assert_eq!(stats.get("url-match"), Some(&1));
    }

    #[tokio::test]
    async fn test_distinct_postings_both_accepted() {
        let (engine, index, _) = engine();
        let a = posting("Senior Rust Engineer", "Acme", Some("https://x.example/1"));
        let b = posting("Head Chef", "Bistro Nine", Some("https://x.example/2"));

        assert!(matches!(
            engine.ingest(&a).await.unwrap(),
            IngestOutcome::New { .. }
        ));
        assert!(matches!(
            engine.ingest(&b).await.unwrap(),
            IngestOutcome::New { .. }
        ));
        assert_eq!(index.len().await, 2);
    }
}
