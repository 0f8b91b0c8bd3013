use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::cli::config::IndexSettings;
use crate::crawler::posting::Posting;
use crate::dedup::fingerprint::Fingerprint;
use crate::dedup::similarity::title_prefix;

/// A posting as stored in the search index, with its assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPosting {
    pub id: String,
    #[serde(flatten)]
    pub posting: Posting,
}

/// Explicit result of a persistence attempt. A conflict on the uniqueness
/// constraint is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { id: String },
    DuplicateConflict,
}

/// The serving-side document index the core persists postings into.
///
/// The core depends only on this contract; ranking and indexing internals
/// stay behind it.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert a posting together with its fingerprints.
    ///
    /// The backend enforces uniqueness on canonical-URL/content-hash keys
    /// atomically with the insert - this is the final arbiter for
    /// concurrent callers that both passed the upfront check.
    async fn insert(&self, posting: &Posting, fingerprints: &[Fingerprint])
        -> Result<InsertOutcome>;

    /// Look up the stored posting a fingerprint resolves to, if any.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<StoredPosting>>;

    /// Fast existence probe for a fingerprint.
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.lookup(fingerprint).await?.is_some())
    }

    /// Candidate postings for fuzzy matching: same company, overlapping
    /// leading title words.
    async fn find_candidates(
        &self,
        company: &str,
        title: &str,
        limit: usize,
    ) -> Result<Vec<StoredPosting>>;

    /// Remove a posting by id. Returns whether anything was deleted.
    async fn delete(&self, id: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory index. Uniqueness is arbitrated under a single lock, which
/// makes it an exact stand-in for the HTTP backend's constraint semantics
/// in tests and standalone runs.
#[derive(Default)]
pub struct MemoryIndex {
    inner: Mutex<MemoryIndexInner>,
}

#[derive(Default)]
struct MemoryIndexInner {
    postings: HashMap<String, Posting>,
    keys: HashMap<String, String>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.postings.len()
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn insert(
        &self,
        posting: &Posting,
        fingerprints: &[Fingerprint],
    ) -> Result<InsertOutcome> {
        let mut inner = self.inner.lock().await;

        // Check-and-insert under one lock: the unique keys either all land
        // or the whole insert is rejected.
        if fingerprints
            .iter()
            .filter(|f| f.is_unique_key())
            .any(|f| inner.keys.contains_key(&f.key()))
        {
            return Ok(InsertOutcome::DuplicateConflict);
        }

        let id = Uuid::new_v4().to_string();
        for fingerprint in fingerprints {
            inner.keys.insert(fingerprint.key(), id.clone());
        }
        inner.postings.insert(id.clone(), posting.clone());
        debug!("indexed posting {} from {}", id, posting.source);
        Ok(InsertOutcome::Inserted { id })
    }

    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<StoredPosting>> {
        let inner = self.inner.lock().await;
        let found = inner.keys.get(&fingerprint.key()).and_then(|id| {
            inner.postings.get(id).map(|posting| StoredPosting {
                id: id.clone(),
                posting: posting.clone(),
            })
        });
        Ok(found)
    }

    async fn find_candidates(
        &self,
        company: &str,
        title: &str,
        limit: usize,
    ) -> Result<Vec<StoredPosting>> {
        let company = company.to_lowercase();
        let prefix = title_prefix(title, 3);
        let inner = self.inner.lock().await;

        let mut candidates: Vec<StoredPosting> = inner
            .postings
            .iter()
            .filter(|(_, p)| {
                p.company.to_lowercase().contains(&company)
                    && (prefix.is_empty() || p.title.to_lowercase().contains(&prefix))
            })
            .map(|(id, p)| StoredPosting {
                id: id.clone(),
                posting: p.clone(),
            })
            .collect();
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let removed = inner.postings.remove(id).is_some();
        if removed {
            inner.keys.retain(|_, v| v != id);
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct InsertRequest<'a> {
    document: &'a Posting,
    keys: Vec<String>,
    unique_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct CandidateRequest<'a> {
    company: &'a str,
    title_prefix: String,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct CandidateResponse {
    results: Vec<StoredPosting>,
}

/// Client for the document-index service that serves search queries.
pub struct HttpSearchIndex {
    client: Client,
    base_url: String,
    index_name: String,
}

impl HttpSearchIndex {
    pub fn new(settings: &IndexSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to create index HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            index_name: settings.index_name.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/indexes/{}/{}", self.base_url, self.index_name, path)
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn insert(
        &self,
        posting: &Posting,
        fingerprints: &[Fingerprint],
    ) -> Result<InsertOutcome> {
        let request = InsertRequest {
            document: posting,
            keys: fingerprints.iter().map(Fingerprint::key).collect(),
            unique_keys: fingerprints
                .iter()
                .filter(|f| f.is_unique_key())
                .map(Fingerprint::key)
                .collect(),
        };

        let response = self
            .client
            .post(self.endpoint("documents"))
            .json(&request)
            .send()
            .await
            .context("Failed to send insert request to search index")?;

        // The service signals a lost uniqueness race with 409
        if response.status() == StatusCode::CONFLICT {
            return Ok(InsertOutcome::DuplicateConflict);
        }
        if !response.status().is_success() {
            anyhow::bail!("search index insert failed with status {}", response.status());
        }

        let body: InsertResponse = response
            .json()
            .await
            .context("Failed to parse search index insert response")?;

        debug!("indexed posting {} from {}", body.id, posting.source);
        Ok(InsertOutcome::Inserted { id: body.id })
    }

    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<StoredPosting>> {
        let response = self
            .client
            .get(self.endpoint("documents/lookup"))
            .query(&[("key", fingerprint.key())])
            .send()
            .await
            .context("Failed to query search index")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("search index lookup failed with status {}", response.status());
        }

        let stored: StoredPosting = response
            .json()
            .await
            .context("Failed to parse search index lookup response")?;
        Ok(Some(stored))
    }

    async fn find_candidates(
        &self,
        company: &str,
        title: &str,
        limit: usize,
    ) -> Result<Vec<StoredPosting>> {
        let request = CandidateRequest {
            company,
            title_prefix: title_prefix(title, 3),
            limit,
        };

        let response = self
            .client
            .post(self.endpoint("search"))
            .json(&request)
            .send()
            .await
            .context("Failed to query search index for candidates")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "search index candidate query failed with status {}",
                response.status()
            );
        }

        let body: CandidateResponse = response
            .json()
            .await
            .context("Failed to parse candidate response")?;
        Ok(body.results)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let response = self
            .client
            .delete(self.endpoint(&format!("documents/{}", id)))
            .send()
            .await
            .context("Failed to send delete request to search index")?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => anyhow::bail!("search index delete failed with status {}", status),
        }
    }
}
