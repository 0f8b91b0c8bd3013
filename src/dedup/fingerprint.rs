use sha2::{Digest, Sha256};
use url::Url;

use crate::crawler::posting::Posting;

/// Derived identity of a posting, used for existence lookups.
///
/// Created at persistence time and immutable afterwards; a fingerprint maps
/// to at most one stored posting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// Stable per-posting id supplied by the source
    NativeId { source: String, id: String },
    /// Listing URL with query string and fragment stripped
    CanonicalUrl(String),
    /// Hash of normalized title|company|description
    ContentHash(String),
}

impl Fingerprint {
    /// Storage key under which this fingerprint is indexed.
    pub fn key(&self) -> String {
        match self {
            Self::NativeId { source, id } => format!("native:{}:{}", source, id),
            Self::CanonicalUrl(url) => format!("url:{}", url),
            Self::ContentHash(hash) => format!("hash:{}", hash),
        }
    }

    /// Whether this fingerprint participates in the uniqueness constraint
    /// that arbitrates concurrent inserts.
    pub fn is_unique_key(&self) -> bool {
        matches!(self, Self::CanonicalUrl(_) | Self::ContentHash(_))
    }
}

/// Strip query string and fragment from a listing URL.
///
/// Tracking parameters are the most common reason the same listing shows up
/// under many URLs. Idempotent: `clean_url(clean_url(u)) == clean_url(u)`.
pub fn clean_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut url = Url::parse(trimmed).ok()?;
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

/// Deterministic stand-in URL for postings the source exposes no link for.
pub fn surrogate_url(source: &str, title: &str, company: &str, location: Option<&str>) -> String {
    let identity = format!(
        "{}|{}|{}|{}",
        normalize(source),
        normalize(title),
        normalize(company),
        normalize(location.unwrap_or("")),
    );
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    format!("synthetic://{}/{}", source, hex::encode(hasher.finalize()))
}

/// Canonical URL identity of a posting: its cleaned URL, or a synthesized
/// surrogate when no URL is present.
pub fn canonical_identity(posting: &Posting) -> String {
    posting
        .url
        .as_deref()
        .and_then(clean_url)
        .unwrap_or_else(|| {
            surrogate_url(
                &posting.source,
                &posting.title,
                &posting.company,
                posting.location.as_deref(),
            )
        })
}

/// SHA-256 hex digest of case/whitespace-normalized title|company|description.
pub fn content_hash(posting: &Posting) -> String {
    let content = format!(
        "{}|{}|{}",
        normalize(&posting.title),
        normalize(&posting.company),
        normalize(&posting.description),
    );
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// All fingerprints recorded for a posting at insert time.
pub fn fingerprints_for(posting: &Posting) -> Vec<Fingerprint> {
    let mut fingerprints = Vec::with_capacity(3);
    if let Some(id) = posting
        .source_native_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
    {
        fingerprints.push(Fingerprint::NativeId {
            source: posting.source.clone(),
            id: id.to_string(),
        });
    }
    fingerprints.push(Fingerprint::CanonicalUrl(canonical_identity(posting)));
    fingerprints.push(Fingerprint::ContentHash(content_hash(posting)));
    fingerprints
}

pub(crate) fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn posting(url: Option<&str>) -> Posting {
        Posting {
            title: "IT Lead".to_string(),
            company: "Example Co".to_string(),
            description: "Lead the platform team".to_string(),
            url: url.map(str::to_string),
            location: Some("Da Nang".to_string()),
            salary: None,
            job_type: None,
            experience_level: None,
            posted_at: Utc::now(),
            source: "exampleboard".to_string(),
            source_native_id: None,
        }
    }

    #[test]
    fn test_clean_url_strips_query_and_fragment() {
        let cleaned = clean_url(
            "https://www.example.com/viec-lam/it-lead/1833111.html?ta_source=Search&u_sr_id=abc#apply",
        )
        .unwrap();
        assert_eq!(cleaned, "https://www.example.com/viec-lam/it-lead/1833111.html");
    }

    #[test]
    fn test_clean_url_is_idempotent() {
        for raw in [
            "https://x.example/job/1?utm=abc",
            "https://x.example/",
            "https://x.example/a/b#frag",
        ] {
            let once = clean_url(raw).unwrap();
            let twice = clean_url(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_clean_url_rejects_garbage() {
        assert_eq!(clean_url(""), None);
        assert_eq!(clean_url("not a url"), None);
    }

    #[test]
    fn test_surrogate_is_deterministic_and_field_sensitive() {
        let a = surrogate_url("board", "IT Lead", "Example Co", Some("Da Nang"));
        let b = surrogate_url("board", "it  lead", "EXAMPLE CO", Some("da nang"));
        assert_eq!(a, b, "normalization makes case/spacing irrelevant");

        let c = surrogate_url("board", "IT Lead", "Other Co", Some("Da Nang"));
        assert_ne!(a, c);
    }

    #[test]
    fn test_canonical_identity_falls_back_to_surrogate() {
        let with_url = posting(Some("https://x.example/job/1?utm=abc"));
        assert_eq!(canonical_identity(&with_url), "https://x.example/job/1");

        let without = posting(None);
        assert!(canonical_identity(&without).starts_with("synthetic://exampleboard/"));
    }

    #[test]
    fn test_content_hash_ignores_case_and_whitespace() {
        let a = posting(None);
        let mut b = posting(None);
        b.title = "  it   LEAD ".to_string();
        b.description = "LEAD THE   platform team".to_string();
        assert_eq!(content_hash(&a), content_hash(&b));

        let mut c = posting(None);
        c.description = "Different work entirely".to_string();
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn test_fingerprints_include_native_id_only_when_present() {
        let mut p = posting(Some("https://x.example/job/1"));
        assert_eq!(fingerprints_for(&p).len(), 2);

        p.source_native_id = Some("1833111".to_string());
        let fps = fingerprints_for(&p);
        assert_eq!(fps.len(), 3);
        assert!(fps.iter().any(|f| matches!(f, Fingerprint::NativeId { .. })));
    }
}
