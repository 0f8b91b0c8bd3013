use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::crawler::error::CrawlError;

/// A candidate job listing extracted from a source page.
///
/// Transient until the deduplication engine accepts it; the search index
/// assigns the durable id at insert time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    /// Job title
    pub title: String,

    /// Hiring company
    pub company: String,

    /// Job description text
    pub description: String,

    /// Link to the original listing (absolute), if the page exposed one
    pub url: Option<String>,

    /// Location text as shown on the listing
    pub location: Option<String>,

    /// Salary text as shown on the listing
    pub salary: Option<String>,

    /// Employment type ("Full-time", "Contract", ...)
    pub job_type: Option<String>,

    /// Experience level text
    pub experience_level: Option<String>,

    /// When the listing was posted
    pub posted_at: DateTime<Utc>,

    /// Name of the source this posting was crawled from
    pub source: String,

    /// Stable per-posting id supplied by the source, when one exists
    pub source_native_id: Option<String>,
}

impl Posting {
    /// Check required fields, reporting the first one that is missing.
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.title.trim().is_empty() {
            return Err(CrawlError::Validation { field: "title" });
        }
        if self.company.trim().is_empty() {
            return Err(CrawlError::Validation { field: "company" });
        }
        if self.description.trim().is_empty() {
            return Err(CrawlError::Validation { field: "description" });
        }
        Ok(())
    }
}

/// Parse a posted-date phrase from a listing into a timestamp.
///
/// Handles relative phrases ("today", "yesterday", "3 days ago", "2 weeks
/// ago") and a few common absolute formats. Anything unparseable falls back
/// to `now` so a sloppy source never drops a posting over its date text.
pub fn parse_posted_date(text: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let text = text.trim().to_lowercase();

    if text.contains("today") || text.contains("just now") || text.contains("hour") {
        return now;
    }
    if text.contains("yesterday") {
        return now - Duration::days(1);
    }

    if let Ok(re) = Regex::new(r"(\d+)\s*day") {
        if let Some(caps) = re.captures(&text) {
            if let Ok(days) = caps[1].parse::<i64>() {
                return now - Duration::days(days);
            }
        }
    }
    if let Ok(re) = Regex::new(r"(\d+)\s*week") {
        if let Some(caps) = re.captures(&text) {
            if let Ok(weeks) = caps[1].parse::<i64>() {
                return now - Duration::weeks(weeks);
            }
        }
    }

    for fmt in ["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(text.trim(), fmt) {
            if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                return DateTime::from_naive_utc_and_offset(dt, Utc);
            }
        }
    }

    now
}
