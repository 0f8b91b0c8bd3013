use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::SelectorSettings;
use crate::crawler::error::CrawlError;
use crate::crawler::job::StepPlan;
use crate::crawler::posting::{parse_posted_date, Posting};
use crate::crawler::tracker::JobHandle;

/// One job board. All site-specific DOM and selector logic stays behind
/// this boundary; the orchestrator only sees postings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceCrawler: Send + Sync {
    fn name(&self) -> &str;

    /// The fixed step list a run of this source walks through.
    fn step_plan(&self) -> StepPlan {
        StepPlan::Simple
    }

    /// Cheap pre-crawl reachability probe. Runs before any fetch budget is
    /// spent.
    async fn is_available(&self) -> bool;

    /// Crawl up to `max_postings` listings, reporting internal pipeline
    /// progress through the job handle.
    async fn crawl(
        &self,
        max_postings: usize,
        progress: &JobHandle,
    ) -> Result<Vec<Posting>, CrawlError>;
}

/// Lookup table of registered sources. Registration order is the order
/// `crawl_all` fans out in.
#[derive(Default)]
pub struct SourceRegistry {
    crawlers: Vec<Arc<dyn SourceCrawler>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, crawler: Arc<dyn SourceCrawler>) {
        debug!("registered source crawler: {}", crawler.name());
        self.crawlers.push(crawler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceCrawler>> {
        self.crawlers
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.crawlers.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SourceCrawler>> {
        self.crawlers.iter()
    }

    pub fn len(&self) -> usize {
        self.crawlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crawlers.is_empty()
    }
}

/// Turns fetched HTML into candidate postings.
pub trait Extractor: Send + Sync {
    fn extract(&self, html: &str) -> Vec<Posting>;
}

/// Selector-driven extractor.
///
/// Field selectors are ordered fallbacks: board markups drift, so each
/// field carries the current selector first and older ones behind it.
pub struct SelectorExtractor {
    source: String,
    base_url: Url,
    listing: Selector,
    title: Vec<Selector>,
    company: Vec<Selector>,
    link: Vec<Selector>,
    location: Vec<Selector>,
    salary: Vec<Selector>,
    job_type: Vec<Selector>,
    experience: Vec<Selector>,
    posted: Vec<Selector>,
    description: Vec<Selector>,
    id_patterns: Vec<Regex>,
    max_description: usize,
}

impl SelectorExtractor {
    pub fn new(
        source: &str,
        base_url: Url,
        settings: &SelectorSettings,
        id_patterns: &[String],
    ) -> anyhow::Result<Self> {
        let listing = Selector::parse(&settings.listing)
            .map_err(|e| anyhow::anyhow!("invalid listing selector '{}': {:?}", settings.listing, e))?;

        let id_patterns = id_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("invalid native-id pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Ok(Self {
            source: source.to_string(),
            base_url,
            listing,
            title: compile(&settings.title),
            company: compile(&settings.company),
            link: compile(&settings.url),
            location: compile(&settings.location),
            salary: compile(&settings.salary),
            job_type: compile(&settings.job_type),
            experience: compile(&settings.experience),
            posted: compile(&settings.posted),
            description: compile(&settings.description),
            id_patterns,
            max_description: settings.max_description_length,
        })
    }

    fn extract_one(&self, element: ElementRef<'_>) -> Option<Posting> {
        let title = first_text(element, &self.title)?;
        let company = first_text(element, &self.company)?;
        let href = first_attr(element, &self.link, "href");

        let url = href.and_then(|href| self.absolute_url(&href));
        let description = first_text(element, &self.description)
            .map(|text| truncate(&text, self.max_description))
            .unwrap_or_else(|| format!("Position: {} at {}", title, company));

        let now = chrono::Utc::now();
        let posted_at = first_text(element, &self.posted)
            .map(|text| parse_posted_date(&text, now))
            .unwrap_or(now);

        Some(Posting {
            source_native_id: url.as_deref().and_then(|u| self.extract_native_id(u)),
            title,
            company,
            description,
            location: first_text(element, &self.location),
            salary: first_text(element, &self.salary),
            job_type: first_text(element, &self.job_type),
            experience_level: first_text(element, &self.experience),
            posted_at,
            source: self.source.clone(),
            url,
        })
    }

    fn absolute_url(&self, href: &str) -> Option<String> {
        let href = href.trim();
        if href.is_empty() {
            return None;
        }
        match Url::parse(href) {
            Ok(absolute) => Some(absolute.to_string()),
            Err(_) => self.base_url.join(href).ok().map(|u| u.to_string()),
        }
    }

    fn extract_native_id(&self, url: &str) -> Option<String> {
        for pattern in &self.id_patterns {
            if let Some(caps) = pattern.captures(url) {
                if let Some(id) = caps.get(1) {
                    return Some(id.as_str().to_string());
                }
            }
        }
        None
    }
}

impl Extractor for SelectorExtractor {
    fn extract(&self, html: &str) -> Vec<Posting> {
        let document = Html::parse_document(html);
        let mut postings = Vec::new();

        for element in document.select(&self.listing) {
            match self.extract_one(element) {
                Some(posting) => postings.push(posting),
                None => debug!("skipping listing card without title/company"),
            }
        }

        debug!("extracted {} postings for {}", postings.len(), self.source);
        postings
    }
}

fn compile(raw: &[String]) -> Vec<Selector> {
    raw.iter()
        .filter_map(|selector| match Selector::parse(selector) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                warn!("invalid selector '{}': {:?}", selector, e);
                None
            }
        })
        .collect()
}

fn first_text(element: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    for selector in selectors {
        if let Some(found) = element.select(selector).next() {
            let text = found.text().collect::<String>();
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn first_attr(element: ElementRef<'_>, selectors: &[Selector], attr: &str) -> Option<String> {
    for selector in selectors {
        if let Some(found) = element.select(selector).next() {
            if let Some(value) = found.value().attr(attr) {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_HTML: &str = r#"
        <html><body>
          <div class="job-item">
            <h3 class="title"><a href="/viec-lam/it-lead/1833111.html?ta_source=Search">IT Lead</a></h3>
            <span class="company-name">Example Co</span>
            <span class="address">Da Nang</span>
            <span class="title-salary">$2000</span>
            <label class="exp">3 years</label>
            <span class="posted-date">3 days ago</span>
            <div class="job-description">Lead the platform team across two offices.</div>
          </div>
          <div class="job-item">
            <h3 class="title"><a href="https://jobs.example.com/viec-lam/chef/99.html">Head Chef</a></h3>
            <span class="company-name">Bistro Nine</span>
          </div>
          <div class="job-item">
            <h3 class="title"><a href="/viec-lam/broken/1.html">Untitled</a></h3>
          </div>
        </body></html>"#;

    fn extractor() -> SelectorExtractor {
        SelectorExtractor::new(
            "exampleboard",
            Url::parse("https://jobs.example.com").unwrap(),
            &SelectorSettings::default(),
            &[r"/viec-lam/.*?/(\d+)\.html".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_extracts_fields_and_resolves_relative_urls() {
        let postings = extractor().extract(LISTING_HTML);
        assert_eq!(postings.len(), 2, "card without company is dropped");

        let lead = &postings[0];
        assert_eq!(lead.title, "IT Lead");
        assert_eq!(lead.company, "Example Co");
        assert_eq!(
            lead.url.as_deref(),
            Some("https://jobs.example.com/viec-lam/it-lead/1833111.html?ta_source=Search")
        );
        assert_eq!(lead.source_native_id.as_deref(), Some("1833111"));
        assert_eq!(lead.location.as_deref(), Some("Da Nang"));
        assert_eq!(lead.salary.as_deref(), Some("$2000"));
        assert_eq!(lead.experience_level.as_deref(), Some("3 years"));
        assert!(lead.description.contains("platform team"));
    }

    #[test]
    fn test_missing_description_gets_synthesized() {
        let postings = extractor().extract(LISTING_HTML);
        let chef = &postings[1];
        assert_eq!(chef.description, "Position: Head Chef at Bistro Nine");
        assert_eq!(chef.source_native_id.as_deref(), Some("99"));
    }

    #[test]
    fn test_empty_page_extracts_nothing() {
        assert!(extractor().extract("<html><body></body></html>").is_empty());
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let mut registry = SourceRegistry::new();
        let mut mock = MockSourceCrawler::new();
        mock.expect_name().return_const("ExampleBoard".to_string());
        registry.register(Arc::new(mock));

        assert!(registry.get("exampleboard").is_some());
        assert!(registry.get("EXAMPLEBOARD").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.names(), vec!["ExampleBoard".to_string()]);
    }
}
