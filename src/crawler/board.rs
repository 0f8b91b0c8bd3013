use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::config::SourceSettings;
use crate::crawler::error::CrawlError;
use crate::crawler::job::{StepKind, StepPlan};
use crate::crawler::posting::Posting;
use crate::crawler::source::{Extractor, SelectorExtractor, SourceCrawler};
use crate::crawler::tracker::JobHandle;
use crate::fetch::{FetchChain, FetchContext};

/// Generic job-board crawler: walks configured listing pages through the
/// fetch strategy chain and runs the selector extractor over each page.
///
/// Everything site-specific - base URL, listing paths, selectors, native-id
/// patterns - comes in as configuration, so adding a board is data, not
/// code.
pub struct BoardCrawler {
    name: String,
    base_url: Url,
    listing_urls: Vec<String>,
    positive_selectors: Vec<String>,
    chain: Arc<FetchChain>,
    extractor: SelectorExtractor,
    page_delay: Duration,
    probe: Client,
}

impl BoardCrawler {
    pub fn new(
        settings: &SourceSettings,
        chain: Arc<FetchChain>,
        page_delay: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = Url::parse(&settings.base_url)
            .map_err(|e| anyhow::anyhow!("invalid base URL for {}: {}", settings.name, e))?;

        let listing_urls = settings
            .listing_paths
            .iter()
            .filter_map(|path| match base_url.join(path) {
                Ok(url) => Some(url.to_string()),
                Err(e) => {
                    warn!("invalid listing path '{}' for {}: {}", path, settings.name, e);
                    None
                }
            })
            .collect::<Vec<_>>();
        if listing_urls.is_empty() {
            anyhow::bail!("source {} has no usable listing paths", settings.name);
        }

        let extractor = SelectorExtractor::new(
            &settings.name,
            base_url.clone(),
            &settings.selectors,
            &settings.native_id_patterns,
        )?;

        let probe = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build probe client: {}", e))?;

        Ok(Self {
            name: settings.name.clone(),
            base_url,
            listing_urls,
            positive_selectors: settings.positive_selectors.clone(),
            chain,
            extractor,
            page_delay,
            probe,
        })
    }

    fn fetch_context(&self) -> FetchContext {
        FetchContext {
            base_url: Some(self.base_url.to_string()),
            positive_selectors: self.positive_selectors.clone(),
        }
    }

    async fn pause_between_pages(&self) {
        // Humanized pacing: the configured delay plus up to half again
        let jitter = thread_rng().gen_range(0..=self.page_delay.as_millis() as u64 / 2);
        tokio::time::sleep(self.page_delay + Duration::from_millis(jitter)).await;
    }
}

#[async_trait]
impl SourceCrawler for BoardCrawler {
    fn name(&self) -> &str {
        &self.name
    }

    fn step_plan(&self) -> StepPlan {
        StepPlan::Chain
    }

    async fn is_available(&self) -> bool {
        match self.probe.get(self.base_url.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                // 403 means the site is up but defended - that is exactly
                // what the strategy chain is for
                status.is_success() || status.as_u16() == 403
            }
            Err(e) => {
                warn!("{} availability probe failed: {}", self.name, e);
                false
            }
        }
    }

    async fn crawl(
        &self,
        max_postings: usize,
        progress: &JobHandle,
    ) -> Result<Vec<Posting>, CrawlError> {
        let ctx = self.fetch_context();

        // Establish a session against the site root so later listing
        // fetches reuse whatever cookies the winning strategy picked up
        progress.start_step(StepKind::EstablishSession).await
            .map_err(CrawlError::persistence)?;
        let landing = self.chain.fetch(self.base_url.as_str(), &ctx).await?;
        progress
            .complete_step(
                StepKind::EstablishSession,
                format!("session established via '{}' strategy", landing.strategy),
            )
            .await;

        progress.start_step(StepKind::EnumerateTargets).await
            .map_err(CrawlError::persistence)?;
        progress
            .merge_details(StepKind::EnumerateTargets, |details| {
                details.pages = Some(self.listing_urls.len() as u64);
            })
            .await;
        progress
            .complete_step(
                StepKind::EnumerateTargets,
                format!("{} listing pages queued", self.listing_urls.len()),
            )
            .await;

        progress.start_step(StepKind::FetchAndExtract).await
            .map_err(CrawlError::persistence)?;
        let mut postings: Vec<Posting> = Vec::new();
        let mut last_error: Option<CrawlError> = None;
        let mut failed_pages = 0usize;

        for (index, url) in self.listing_urls.iter().enumerate() {
            if postings.len() >= max_postings {
                break;
            }
            if index > 0 {
                self.pause_between_pages().await;
            }

            debug!("fetching listing page {}/{}: {}", index + 1, self.listing_urls.len(), url);
            match self.chain.fetch(url, &ctx).await {
                Ok(page) => {
                    let extracted = self.extractor.extract(&page.html);
                    info!("{}: {} postings on {}", self.name, extracted.len(), url);
                    progress.add_found(extracted.len() as u64).await;
                    postings.extend(extracted);
                }
                Err(err) => {
                    // One blocked page should not forfeit the others
                    warn!("{}: listing page failed: {}", self.name, err);
                    progress.push_error(err.to_string()).await;
                    failed_pages += 1;
                    last_error = Some(err.into());
                }
            }

            let percent =
                (((index + 1) * 100) / self.listing_urls.len().max(1)).min(100) as u8;
            progress
                .progress(
                    StepKind::FetchAndExtract,
                    percent,
                    format!("{} postings after {} pages", postings.len(), index + 1),
                )
                .await;
        }

        if postings.is_empty() {
            if let Some(err) = last_error {
                // Every page was blocked; surface the real reason
                return Err(err);
            }
        }

        postings.truncate(max_postings);
        progress
            .merge_details(StepKind::FetchAndExtract, |details| {
                details.found = Some(postings.len() as u64);
                if failed_pages > 0 {
                    details.extra.insert(
                        "failed_pages".to_string(),
                        serde_json::json!(failed_pages),
                    );
                }
            })
            .await;
        progress
            .complete_step(
                StepKind::FetchAndExtract,
                format!("extracted {} postings", postings.len()),
            )
            .await;

        Ok(postings)
    }
}
